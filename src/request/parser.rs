//! Request path and query parsing
//!
//! Two front ends produce the same `ParsedRequest`:
//!
//! - default: the path is base64 (standard or URL-safe) encoded JSON,
//!   `{"bucket", "key", "tenantId", "edits", "outputFormat", "effort", "headers"}`
//! - query: the path is the object key and edits come from short query
//!   parameters (`w`, `h`, `fit`, `r`, `flip`, ...) plus an optional
//!   URL-encoded `edits` JSON document merged after them

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::ImageHandlerEvent;
use crate::error::ImageHandlerError;
use crate::image_handler::edits::{
    parse_color, CropRegion, Edit, EditSpecification, FitMode, ResizeOptions,
};
use crate::image_handler::OutputFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Default,
    Query,
}

/// Request shape shared by both front ends, before the object is fetched
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub request_type: RequestType,
    pub bucket: Option<String>,
    pub key: String,
    pub tenant_id: Option<String>,
    pub edits: EditSpecification,
    pub output_format: Option<OutputFormat>,
    pub effort: Option<u8>,
    /// Extra response headers requested by the caller
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefaultRequestPayload {
    #[serde(default)]
    bucket: Option<String>,
    key: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    edits: Option<Value>,
    #[serde(default)]
    output_format: Option<String>,
    #[serde(default)]
    effort: Option<u8>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
}

fn cannot_decode(detail: impl std::fmt::Display) -> ImageHandlerError {
    ImageHandlerError::bad_request(
        "DecodeRequest::CannotDecodeRequest",
        format!(
            "The image request you provided could not be decoded. Please check that your request is base64 encoded properly and refer to the documentation for additional guidance. ({})",
            detail
        ),
    )
}

fn invalid_edit(message: impl Into<String>) -> ImageHandlerError {
    ImageHandlerError::bad_request("InvalidEdit", message)
}

/// Decode a base64 path segment into bytes, accepting both alphabets.
fn decode_base64(encoded: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .ok()
}

/// Parse an event into a `ParsedRequest`.
///
/// A path that base64-decodes to something starting with `{` is a default
/// request and must be valid request JSON; anything else is a query request.
pub fn parse_request(
    event: &ImageHandlerEvent,
    tenant_in_path: bool,
) -> Result<ParsedRequest, ImageHandlerError> {
    let encoded = event.path.trim_start_matches('/');
    if encoded.is_empty() {
        return Err(cannot_decode("empty path"));
    }

    match decode_base64(encoded) {
        Some(bytes) if bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') => {
            parse_default_request(&bytes)
        }
        _ => parse_query_request(event, tenant_in_path),
    }
}

fn parse_default_request(bytes: &[u8]) -> Result<ParsedRequest, ImageHandlerError> {
    let payload: DefaultRequestPayload = serde_json::from_slice(bytes).map_err(cannot_decode)?;
    if payload.key.is_empty() {
        return Err(cannot_decode("missing key"));
    }

    let edits = match &payload.edits {
        Some(value) => EditSpecification::from_json(value)?,
        None => EditSpecification::default(),
    };
    let output_format = match payload.output_format.as_deref() {
        Some(format) => Some(format.parse::<OutputFormat>()?),
        None => None,
    };

    Ok(ParsedRequest {
        request_type: RequestType::Default,
        bucket: payload.bucket.filter(|b| !b.is_empty()),
        key: payload.key,
        tenant_id: payload.tenant_id.filter(|t| !t.is_empty()),
        edits,
        output_format,
        effort: payload.effort,
        headers: payload.headers.unwrap_or_default(),
    })
}

fn parse_query_request(
    event: &ImageHandlerEvent,
    tenant_in_path: bool,
) -> Result<ParsedRequest, ImageHandlerError> {
    let path = urlencoding::decode(event.path.trim_start_matches('/'))
        .map_err(cannot_decode)?
        .into_owned();

    let (tenant_id, key) = if tenant_in_path {
        match path.split_once('/') {
            Some((tenant, key)) if !tenant.is_empty() => (Some(tenant.to_string()), key.to_string()),
            _ => (None, path),
        }
    } else {
        (None, path)
    };
    if key.is_empty() {
        return Err(cannot_decode("missing key"));
    }

    let output_format = match event.query_param("format") {
        Some(format) => Some(format.parse::<OutputFormat>()?),
        None => None,
    };
    let effort = match event.query_param("effort") {
        Some(effort) => Some(
            effort
                .parse::<u8>()
                .map_err(|_| invalid_edit("effort must be an integer between 0 and 9"))?,
        ),
        None => None,
    };

    let mut edits = query_edits(event, output_format)?;
    if let Some(raw) = event.query_param("edits") {
        let value: Value = serde_json::from_str(raw).map_err(cannot_decode)?;
        edits.extend(EditSpecification::from_json(&value)?);
    }

    Ok(ParsedRequest {
        request_type: RequestType::Query,
        bucket: event.query_param("bucket").filter(|b| !b.is_empty()).map(str::to_string),
        key,
        tenant_id,
        edits,
        output_format,
        effort,
        headers: BTreeMap::new(),
    })
}

fn number<T: std::str::FromStr>(event: &ImageHandlerEvent, name: &str) -> Result<Option<T>, ImageHandlerError> {
    match event.query_param(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid_edit(format!("Query parameter '{}' must be a number", name))),
        None => Ok(None),
    }
}

fn truthy(event: &ImageHandlerEvent, names: &[&str]) -> bool {
    names.iter().any(|name| {
        matches!(
            event.query_param(name).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("" | "1" | "true")
        )
    })
}

fn sigma(event: &ImageHandlerEvent, name: &str) -> Result<Option<f32>, ImageHandlerError> {
    match number::<f32>(event, name)? {
        Some(sigma) if !(0.3..=1000.0).contains(&sigma) => Err(invalid_edit(format!(
            "{} sigma must be between 0.3 and 1000",
            name
        ))),
        other => Ok(other),
    }
}

/// Short query keys, in this order: crop, resize, rotate, flip, color,
/// quality.
fn query_edits(
    event: &ImageHandlerEvent,
    output_format: Option<OutputFormat>,
) -> Result<EditSpecification, ImageHandlerError> {
    let mut edits = EditSpecification::default();

    let crop = [
        number::<u32>(event, "cx")?,
        number::<u32>(event, "cy")?,
        number::<u32>(event, "cw")?,
        number::<u32>(event, "ch")?,
    ];
    match crop {
        [None, None, None, None] => {}
        [Some(left), Some(top), Some(width), Some(height)] if width > 0 && height > 0 => {
            edits.push(Edit::Crop(CropRegion {
                left,
                top,
                width,
                height,
            }))
        }
        _ => return Err(invalid_edit("Crop requires cx, cy, cw and ch with a non-empty area")),
    }

    let width = number::<u32>(event, "w")?.filter(|w| *w > 0);
    let height = number::<u32>(event, "h")?.filter(|h| *h > 0);
    if width.is_some() || height.is_some() {
        let fit = match event.query_param("fit") {
            Some(fit) => FitMode::parse(fit)?,
            None => FitMode::default(),
        };
        let background = match event.query_param("bg") {
            Some(bg) => {
                let hex = if bg.starts_with('#') { bg.to_string() } else { format!("#{}", bg) };
                Some(parse_color("bg", &Value::String(hex))?)
            }
            None => None,
        };
        edits.push(Edit::Resize(ResizeOptions {
            width,
            height,
            fit,
            background,
        }));
    }

    if let Some(degrees) = number::<i64>(event, "r")? {
        let spec = EditSpecification::from_json(&serde_json::json!({ "rotate": degrees }))?;
        edits.extend(spec);
    }

    match event.query_param("flip").map(|f| f.to_ascii_lowercase()).as_deref() {
        None => {}
        Some("h") => edits.push(Edit::Flop),
        Some("v") => edits.push(Edit::Flip),
        Some("hv" | "vh" | "both") => {
            edits.push(Edit::Flip);
            edits.push(Edit::Flop);
        }
        Some(other) => return Err(invalid_edit(format!("Unknown flip '{}'", other))),
    }

    if truthy(event, &["gray", "grayscale"]) {
        edits.push(Edit::Grayscale);
    }
    if truthy(event, &["negate"]) {
        edits.push(Edit::Negate);
    }
    if let Some(sigma) = sigma(event, "blur")? {
        edits.push(Edit::Blur(sigma));
    }
    if let Some(sigma) = sigma(event, "sharpen")? {
        edits.push(Edit::Sharpen(sigma));
    }

    if let Some(quality) = number::<u8>(event, "q")? {
        let quality = quality.clamp(1, 100);
        match output_format {
            Some(format) => edits.push(Edit::Quality { format, quality }),
            None => {
                for format in [OutputFormat::Jpeg, OutputFormat::WebP] {
                    edits.push(Edit::Quality { format, quality });
                }
            }
        }
    }

    Ok(edits)
}
