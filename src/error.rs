// Error types module

use serde::Serialize;
use std::fmt;

/// Message returned in place of the real one for every 5xx response.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error. Please contact the system administrator.";

/// Message used for overlay images that do not fit inside the base image.
pub const OVERLAY_TOO_LARGE_MESSAGE: &str =
    "Image to overlay must have same dimensions or smaller";

/// Message emitted by compositing backends for the same condition.
pub const CODEC_COMPOSITE_SIZE_MESSAGE: &str =
    "Image to composite must have same dimensions or smaller";

/// Typed error for the whole origin path.
///
/// Every failure that reaches a caller is one of these: `status` is the HTTP
/// status, `code` a stable machine-readable identifier and `message` the
/// human-readable detail. Field order matches the JSON envelope
/// `{"message", "code", "status"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHandlerError {
    pub message: String,
    pub code: String,
    pub status: u16,
}

impl ImageHandlerError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            status,
        }
    }

    /// Generic internal failure with a 500 status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "InternalError", message)
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    /// The object (or the tenant owning it) does not exist.
    pub fn no_such_key(key: &str) -> Self {
        Self::new(
            404,
            "NoSuchKey",
            format!(
                "The image {} does not exist or the request may not be base64 encoded properly.",
                key
            ),
        )
    }

    pub fn overlay_too_large() -> Self {
        Self::new(400, "BadRequest", OVERLAY_TOO_LARGE_MESSAGE)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            504,
            "RequestTimeout",
            format!("Request processing exceeded {}ms", timeout_ms),
        )
    }

    /// Maps a codec failure message, recognising the composite size error.
    pub fn from_codec_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(CODEC_COMPOSITE_SIZE_MESSAGE) {
            Self::overlay_too_large()
        } else {
            Self::internal(message)
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// The error as it is shown to callers. Server errors are replaced by
    /// the generic internal envelope while keeping their status.
    pub fn to_public(&self) -> ImageHandlerError {
        if self.is_server_error() {
            ImageHandlerError::new(self.status, "InternalError", INTERNAL_ERROR_MESSAGE)
        } else {
            self.clone()
        }
    }

    /// JSON envelope `{"message","code","status"}` for the public view.
    pub fn to_json_body(&self) -> String {
        let public = self.to_public();
        serde_json::to_string(&public).unwrap_or_else(|_| {
            format!(
                r#"{{"message":"{}","code":"{}","status":{}}}"#,
                INTERNAL_ERROR_MESSAGE, "InternalError", public.status
            )
        })
    }
}

impl fmt::Display for ImageHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ImageHandlerError {}
