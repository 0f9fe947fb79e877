//! Edit pipeline
//!
//! Turns source bytes plus an edit specification into re-encoded bytes.
//! Edits run in a fixed phase order regardless of how the caller listed
//! them: geometric, overlay, content-aware, color, then encoding.

pub mod detection;
pub mod edits;
pub mod encoder;
pub mod format;
pub mod overlay;
pub mod processor;

pub use detection::{BoundingBox, DetectionError, DetectionService, HttpDetectionService, ModerationLabel};
pub use edits::{Edit, EditPhase, EditSpecification, FitMode, OverlaySpec};
pub use format::{select_output_format, OutputFormat};
pub use overlay::{resolve_overlay_offset, OverlayFetcher};
pub use processor::{EditPipeline, OverlaySet, ProcessedImage};
