//! Output format handling and content type inference

use std::str::FromStr;

use crate::error::ImageHandlerError;

/// Encodable output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Gif => "image/gif",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        match media_type.to_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::WebP),
            "image/gif" => Some(Self::Gif),
            _ => None,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ImageHandlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::WebP),
            "gif" => Ok(OutputFormat::Gif),
            _ => Err(ImageHandlerError::bad_request(
                "OutputFormat::Unsupported",
                format!("The output format '{}' is not supported", s),
            )),
        }
    }
}

/// Detect an encodable format from magic bytes
pub fn detect_format(data: &[u8]) -> Option<OutputFormat> {
    match image::guess_format(data).ok()? {
        image::ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        image::ImageFormat::Png => Some(OutputFormat::Png),
        image::ImageFormat::WebP => Some(OutputFormat::WebP),
        image::ImageFormat::Gif => Some(OutputFormat::Gif),
        _ => None,
    }
}

/// Infer a content type from magic bytes.
///
/// Covers the encodable formats plus the common pass-through ones.
pub fn infer_content_type(data: &[u8]) -> Option<&'static str> {
    if let Some(format) = detect_format(data) {
        return Some(format.content_type());
    }
    match image::guess_format(data).ok()? {
        image::ImageFormat::Tiff => Some("image/tiff"),
        image::ImageFormat::Bmp => Some("image/bmp"),
        image::ImageFormat::Ico => Some("image/x-icon"),
        image::ImageFormat::Avif => Some("image/avif"),
        _ => None,
    }
}

/// Whether a stored content type carries no usable information
pub fn is_generic_content_type(content_type: &str) -> bool {
    matches!(
        content_type.trim().to_lowercase().as_str(),
        "" | "binary/octet-stream" | "application/octet-stream"
    )
}

/// Whether an Accept header lists WebP with a non-zero quality
pub fn accepts_webp(accept_header: Option<&str>) -> bool {
    let accept = match accept_header {
        Some(h) => h,
        None => return false,
    };

    accept.split(',').any(|part| {
        let (media_type, params) = match part.split_once(';') {
            Some((mt, params)) => (mt.trim(), Some(params)),
            None => (part.trim(), None),
        };
        media_type.eq_ignore_ascii_case("image/webp") && params.map(parse_quality).unwrap_or(1.0) > 0.0
    })
}

/// Parse quality value from parameters (e.g., "q=0.8")
fn parse_quality(params: &str) -> f32 {
    for param in params.split(';') {
        if let Some(q) = param.trim().strip_prefix("q=") {
            if let Ok(quality) = q.parse::<f32>() {
                return quality.clamp(0.0, 1.0);
            }
        }
    }
    1.0
}

/// Choose the format to encode to.
///
/// Precedence: explicit request format, then a `toFormat` edit, then WebP
/// when auto-WebP is on and the client accepts it, then the source format.
/// `None` means the source format is kept as-is.
pub fn select_output_format(
    requested: Option<OutputFormat>,
    to_format_edit: Option<OutputFormat>,
    auto_webp: bool,
    accept_header: Option<&str>,
    source: Option<OutputFormat>,
) -> Option<OutputFormat> {
    requested
        .or(to_format_edit)
        .or_else(|| (auto_webp && accepts_webp(accept_header)).then_some(OutputFormat::WebP))
        .or(source)
}
