//! Edit specification parsing
//!
//! An edit specification is a JSON object whose keys name operations, e.g.
//! `{"resize": {"width": 200}, "grayscale": true}`. Each key becomes one
//! typed `Edit`. Unknown operation names are rejected up front.

use image::Rgba;
use serde_json::{Map, Value};

use super::format::OutputFormat;
use crate::error::ImageHandlerError;

pub const DEFAULT_BLUR_SIGMA: f32 = 1.0;
pub const DEFAULT_SHARPEN_SIGMA: f32 = 1.0;
pub const DEFAULT_MODERATION_CONFIDENCE: f32 = 75.0;
pub const DEFAULT_MODERATION_BLUR: f32 = 50.0;

/// How a resize fits the requested box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// Fill the box, cropping the overflow
    #[default]
    Cover,
    /// Fit inside the box, padding with the background
    Contain,
    /// Stretch to the exact box
    Fill,
    /// Fit inside the box without padding
    Inside,
    /// Cover the box without cropping
    Outside,
}

impl FitMode {
    pub fn parse(value: &str) -> Result<Self, ImageHandlerError> {
        match value.to_lowercase().as_str() {
            "cover" => Ok(FitMode::Cover),
            "contain" => Ok(FitMode::Contain),
            "fill" => Ok(FitMode::Fill),
            "inside" => Ok(FitMode::Inside),
            "outside" => Ok(FitMode::Outside),
            _ => Err(invalid_edit(format!("Unknown resize fit '{}'", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResizeOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: FitMode,
    pub background: Option<Rgba<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Overlay request as written by the caller; offsets are resolved later
/// against the actual image sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub bucket: String,
    pub key: String,
    pub w_ratio: Option<u32>,
    pub h_ratio: Option<u32>,
    pub alpha: Option<u32>,
    pub left: Option<String>,
    pub top: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmartCropOptions {
    pub face_index: usize,
    pub padding: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModerationOptions {
    pub min_confidence: f32,
    pub blur: f32,
    pub labels: Vec<String>,
}

impl Default for ModerationOptions {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MODERATION_CONFIDENCE,
            blur: DEFAULT_MODERATION_BLUR,
            labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    Resize(ResizeOptions),
    Crop(CropRegion),
    /// Quarter-turn rotation in degrees; `None` keeps the stored orientation
    Rotate(Option<u16>),
    /// Mirror top to bottom
    Flip,
    /// Mirror left to right
    Flop,
    Overlay(OverlaySpec),
    SmartCrop(SmartCropOptions),
    ContentModeration(ModerationOptions),
    Grayscale,
    Negate,
    Tint(Rgba<u8>),
    Flatten(Rgba<u8>),
    Blur(f32),
    Sharpen(f32),
    ToFormat(OutputFormat),
    Quality { format: OutputFormat, quality: u8 },
}

/// Processing phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EditPhase {
    Geometric,
    Overlay,
    ContentAware,
    Color,
    Encoding,
}

impl Edit {
    pub fn phase(&self) -> EditPhase {
        match self {
            Edit::Resize(_) | Edit::Crop(_) | Edit::Rotate(_) | Edit::Flip | Edit::Flop => {
                EditPhase::Geometric
            }
            Edit::Overlay(_) => EditPhase::Overlay,
            Edit::SmartCrop(_) | Edit::ContentModeration(_) => EditPhase::ContentAware,
            Edit::Grayscale
            | Edit::Negate
            | Edit::Tint(_)
            | Edit::Flatten(_)
            | Edit::Blur(_)
            | Edit::Sharpen(_) => EditPhase::Color,
            Edit::ToFormat(_) | Edit::Quality { .. } => EditPhase::Encoding,
        }
    }
}

/// Ordered list of edits for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditSpecification {
    edits: Vec<Edit>,
}

impl EditSpecification {
    pub fn new(edits: Vec<Edit>) -> Self {
        Self { edits }
    }

    /// Parse a JSON object of `name -> payload` pairs.
    ///
    /// `null` is an empty specification. Boolean operations set to `false`
    /// are dropped.
    pub fn from_json(value: &Value) -> Result<Self, ImageHandlerError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Self::from_map(map),
            _ => Err(invalid_edit("Edits must be a JSON object")),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ImageHandlerError> {
        let mut edits = Vec::with_capacity(map.len());
        for (name, payload) in map {
            if let Some(edit) = parse_edit(name, payload)? {
                edits.push(edit);
            }
        }
        Ok(Self { edits })
    }

    pub fn push(&mut self, edit: Edit) {
        self.edits.push(edit);
    }

    /// Append the edits of `other`, keeping their order.
    pub fn extend(&mut self, other: EditSpecification) {
        self.edits.extend(other.edits);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edit> {
        self.edits.iter()
    }

    /// Edits of one phase, in caller order
    pub fn in_phase(&self, phase: EditPhase) -> impl Iterator<Item = &Edit> {
        self.edits.iter().filter(move |e| e.phase() == phase)
    }

    pub fn overlays(&self) -> impl Iterator<Item = &OverlaySpec> {
        self.edits.iter().filter_map(|e| match e {
            Edit::Overlay(spec) => Some(spec),
            _ => None,
        })
    }

    /// Last `toFormat` edit, if any
    pub fn to_format(&self) -> Option<OutputFormat> {
        self.edits.iter().rev().find_map(|e| match e {
            Edit::ToFormat(format) => Some(*format),
            _ => None,
        })
    }

    pub fn quality_for(&self, format: OutputFormat) -> Option<u8> {
        self.edits.iter().rev().find_map(|e| match e {
            Edit::Quality { format: f, quality } if *f == format => Some(*quality),
            _ => None,
        })
    }
}

fn invalid_edit(message: impl Into<String>) -> ImageHandlerError {
    ImageHandlerError::bad_request("InvalidEdit", message)
}

fn parse_edit(name: &str, payload: &Value) -> Result<Option<Edit>, ImageHandlerError> {
    let edit = match name {
        "resize" => Some(Edit::Resize(parse_resize(payload)?)),
        "crop" | "extract" => Some(Edit::Crop(parse_crop(name, payload)?)),
        "rotate" => Some(Edit::Rotate(parse_rotation(payload)?)),
        "flip" => flag(name, payload)?.then_some(Edit::Flip),
        "flop" => flag(name, payload)?.then_some(Edit::Flop),
        "overlayWith" => Some(Edit::Overlay(parse_overlay(payload)?)),
        "smartCrop" => parse_smart_crop(payload)?.map(Edit::SmartCrop),
        "contentModeration" => parse_moderation(payload)?.map(Edit::ContentModeration),
        "grayscale" | "greyscale" => flag(name, payload)?.then_some(Edit::Grayscale),
        "negate" => flag(name, payload)?.then_some(Edit::Negate),
        "tint" => Some(Edit::Tint(parse_color(name, payload)?)),
        "flatten" => match payload {
            Value::Bool(false) => None,
            Value::Bool(true) | Value::Null => Some(Edit::Flatten(Rgba([0, 0, 0, 255]))),
            Value::Object(obj) => Some(Edit::Flatten(match obj.get("background") {
                Some(bg) => parse_color(name, bg)?,
                None => Rgba([0, 0, 0, 255]),
            })),
            _ => return Err(invalid_edit("flatten expects a boolean or an object")),
        },
        "blur" => sigma(name, payload, DEFAULT_BLUR_SIGMA)?.map(Edit::Blur),
        "sharpen" => sigma(name, payload, DEFAULT_SHARPEN_SIGMA)?.map(Edit::Sharpen),
        "toFormat" => match payload.as_str() {
            Some(format) => Some(Edit::ToFormat(format.parse()?)),
            None => return Err(invalid_edit("toFormat expects a format name")),
        },
        "jpeg" | "png" | "webp" | "gif" => {
            let format: OutputFormat = name.parse()?;
            match payload.get("quality") {
                Some(q) => Some(Edit::Quality {
                    format,
                    quality: integer(name, "quality", q)?.clamp(1, 100) as u8,
                }),
                None => None,
            }
        }
        _ => {
            return Err(invalid_edit(format!(
                "The edit '{}' is not supported",
                name
            )))
        }
    };
    Ok(edit)
}

fn flag(name: &str, payload: &Value) -> Result<bool, ImageHandlerError> {
    match payload {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(true),
        _ => Err(invalid_edit(format!("{} expects a boolean", name))),
    }
}

fn sigma(name: &str, payload: &Value, default: f32) -> Result<Option<f32>, ImageHandlerError> {
    match payload {
        Value::Bool(false) => Ok(None),
        Value::Bool(true) | Value::Null => Ok(Some(default)),
        Value::Number(n) => {
            let value = n.as_f64().unwrap_or_default() as f32;
            if !(0.3..=1000.0).contains(&value) {
                return Err(invalid_edit(format!(
                    "{} sigma must be between 0.3 and 1000",
                    name
                )));
            }
            Ok(Some(value))
        }
        _ => Err(invalid_edit(format!("{} expects a boolean or a sigma", name))),
    }
}

fn integer(edit: &str, field: &str, value: &Value) -> Result<i64, ImageHandlerError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| invalid_edit(format!("{}.{} must be a number", edit, field))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid_edit(format!("{}.{} must be a number", edit, field))),
        _ => Err(invalid_edit(format!("{}.{} must be a number", edit, field))),
    }
}

fn non_negative(edit: &str, field: &str, value: &Value) -> Result<u32, ImageHandlerError> {
    let n = integer(edit, field, value)?;
    u32::try_from(n).map_err(|_| invalid_edit(format!("{}.{} must not be negative", edit, field)))
}

fn optional_dimension(
    obj: &Map<String, Value>,
    field: &str,
) -> Result<Option<u32>, ImageHandlerError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let n = non_negative("resize", field, value)?;
            if n == 0 {
                return Err(ImageHandlerError::bad_request(
                    "Resize::InvalidDimensions",
                    format!("resize.{} must be greater than 0", field),
                ));
            }
            Ok(Some(n))
        }
    }
}

fn parse_resize(payload: &Value) -> Result<ResizeOptions, ImageHandlerError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| invalid_edit("resize expects an object"))?;
    let fit = match obj.get("fit").and_then(Value::as_str) {
        Some(fit) => FitMode::parse(fit)?,
        None => FitMode::default(),
    };
    let background = match obj.get("background") {
        Some(bg) => Some(parse_color("resize.background", bg)?),
        None => None,
    };
    Ok(ResizeOptions {
        width: optional_dimension(obj, "width")?,
        height: optional_dimension(obj, "height")?,
        fit,
        background,
    })
}

fn parse_crop(name: &str, payload: &Value) -> Result<CropRegion, ImageHandlerError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| invalid_edit(format!("{} expects an object", name)))?;
    let field = |f: &str| -> Result<u32, ImageHandlerError> {
        let value = obj
            .get(f)
            .ok_or_else(|| invalid_edit(format!("{}.{} is required", name, f)))?;
        non_negative(name, f, value)
    };
    let region = CropRegion {
        left: field("left")?,
        top: field("top")?,
        width: field("width")?,
        height: field("height")?,
    };
    if region.width == 0 || region.height == 0 {
        return Err(invalid_edit(format!("{} area must not be empty", name)));
    }
    Ok(region)
}

fn parse_rotation(payload: &Value) -> Result<Option<u16>, ImageHandlerError> {
    if payload.is_null() {
        return Ok(None);
    }
    let degrees = integer("rotate", "angle", payload)?;
    if degrees % 90 != 0 {
        return Err(ImageHandlerError::bad_request(
            "Rotate::UnsupportedAngle",
            format!("Rotation must be a multiple of 90 degrees, got {}", degrees),
        ));
    }
    Ok(Some(degrees.rem_euclid(360) as u16))
}

fn ratio(obj: &Map<String, Value>, field: &str) -> Option<u32> {
    obj.get(field)
        .and_then(Value::as_u64)
        .filter(|r| *r <= 100)
        .map(|r| r as u32)
}

/// Offsets may be numbers or strings such as `"-10"` or `"25p"`.
fn offset(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_overlay(payload: &Value) -> Result<OverlaySpec, ImageHandlerError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| invalid_edit("overlayWith expects an object"))?;
    let text = |f: &str| -> Result<String, ImageHandlerError> {
        obj.get(f)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| invalid_edit(format!("overlayWith.{} is required", f)))
    };
    let options = obj.get("options").and_then(Value::as_object);
    Ok(OverlaySpec {
        bucket: text("bucket")?,
        key: text("key")?,
        w_ratio: ratio(obj, "wRatio"),
        h_ratio: ratio(obj, "hRatio"),
        alpha: ratio(obj, "alpha"),
        left: options.and_then(|o| offset(o, "left")),
        top: options.and_then(|o| offset(o, "top")),
    })
}

fn parse_smart_crop(payload: &Value) -> Result<Option<SmartCropOptions>, ImageHandlerError> {
    match payload {
        Value::Bool(false) => Ok(None),
        Value::Bool(true) | Value::Null => Ok(Some(SmartCropOptions::default())),
        Value::Object(obj) => Ok(Some(SmartCropOptions {
            face_index: match obj.get("faceIndex") {
                Some(v) => non_negative("smartCrop", "faceIndex", v)? as usize,
                None => 0,
            },
            padding: match obj.get("padding") {
                Some(v) => non_negative("smartCrop", "padding", v)?,
                None => 0,
            },
        })),
        _ => Err(invalid_edit("smartCrop expects a boolean or an object")),
    }
}

fn parse_moderation(payload: &Value) -> Result<Option<ModerationOptions>, ImageHandlerError> {
    match payload {
        Value::Bool(false) => Ok(None),
        Value::Bool(true) | Value::Null => Ok(Some(ModerationOptions::default())),
        Value::Object(obj) => {
            let defaults = ModerationOptions::default();
            let number = |f: &str, default: f32| {
                obj.get(f)
                    .and_then(Value::as_f64)
                    .map(|v| v as f32)
                    .unwrap_or(default)
            };
            let labels = obj
                .get("moderationLabels")
                .and_then(Value::as_array)
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(ModerationOptions {
                min_confidence: number("minConfidence", defaults.min_confidence),
                blur: number("blur", defaults.blur).max(0.3),
                labels,
            }))
        }
        _ => Err(invalid_edit(
            "contentModeration expects a boolean or an object",
        )),
    }
}

/// Parse `#rgb`, `#rrggbb`, `#rrggbbaa` or `{r, g, b, alpha}` (alpha 0-1).
pub fn parse_color(edit: &str, value: &Value) -> Result<Rgba<u8>, ImageHandlerError> {
    match value {
        Value::String(s) => parse_hex_color(s)
            .ok_or_else(|| invalid_edit(format!("{} has an invalid color '{}'", edit, s))),
        Value::Object(obj) => {
            let channel = |f: &str| -> Result<u8, ImageHandlerError> {
                match obj.get(f) {
                    Some(v) => Ok(integer(edit, f, v)?.clamp(0, 255) as u8),
                    None => Ok(0),
                }
            };
            let alpha = obj
                .get("alpha")
                .and_then(Value::as_f64)
                .map(|a| (a.clamp(0.0, 1.0) * 255.0).round() as u8)
                .unwrap_or(255);
            Ok(Rgba([channel("r")?, channel("g")?, channel("b")?, alpha]))
        }
        _ => Err(invalid_edit(format!("{} expects a color", edit))),
    }
}

fn parse_hex_color(value: &str) -> Option<Rgba<u8>> {
    let hex = value.trim().strip_prefix('#')?;
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        3 => {
            let nibble = |i: usize| {
                u8::from_str_radix(hex.get(i..i + 1)?, 16)
                    .ok()
                    .map(|n| n * 17)
            };
            Some(Rgba([nibble(0)?, nibble(1)?, nibble(2)?, 255]))
        }
        6 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => None,
    }
}
