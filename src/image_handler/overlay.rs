//! Overlay geometry, compositing and the overlay image cache.
//!
//! Offsets follow these rules per axis, where `base` and `overlay` are the
//! sizes on that axis:
//!
//! | value   | n >= 0                 | n < 0                                      |
//! |---------|------------------------|--------------------------------------------|
//! | `"<n>p"`| `floor(base * n / 100)`| `floor(base + base * n / 100 - overlay)`   |
//! | `"<n>"` | `n`                    | `base + n - overlay`                       |
//!
//! An absent offset centres the overlay on that axis.

use image::{DynamicImage, Rgba, RgbaImage};
use moka::future::Cache;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use super::processor::resize_rgba;
use crate::config::OverlayCacheConfig;
use crate::error::ImageHandlerError;
use crate::metrics::Metrics;
use crate::s3::ObjectStore;

/// Resolve one axis of an overlay offset.
///
/// Returns `None` when no offset was given or its numeric part does not
/// parse.
pub fn resolve_overlay_offset(edit_value: Option<&str>, base: u32, overlay: u32) -> Option<i64> {
    let raw = edit_value?.trim();
    let base = base as f64;
    let overlay = overlay as f64;

    let resolved = match raw.strip_suffix('p') {
        Some(percent) => {
            let n: f64 = percent.trim().parse().ok()?;
            if n >= 0.0 {
                base * n / 100.0
            } else {
                base + base * n / 100.0 - overlay
            }
        }
        None => {
            let n: f64 = raw.parse().ok()?;
            if n >= 0.0 {
                n
            } else {
                base + n - overlay
            }
        }
    };

    if resolved.is_finite() {
        Some(resolved.floor() as i64)
    } else {
        None
    }
}

/// Top-left placement of an overlay on a base image.
pub fn overlay_position(
    base: (u32, u32),
    overlay: (u32, u32),
    left: Option<&str>,
    top: Option<&str>,
) -> (i64, i64) {
    let centred = |b: u32, o: u32| (b as i64 - o as i64) / 2;
    let x = resolve_overlay_offset(left, base.0, overlay.0).unwrap_or_else(|| centred(base.0, overlay.0));
    let y = resolve_overlay_offset(top, base.1, overlay.1).unwrap_or_else(|| centred(base.1, overlay.1));
    (x, y)
}

/// Scale an overlay to fit inside a percentage of the base size.
///
/// Ratios are percentages (0-100) of the base width and height. A missing
/// ratio leaves that axis unconstrained; aspect ratio is always preserved.
pub fn scale_overlay(
    overlay: &RgbaImage,
    base: (u32, u32),
    w_ratio: Option<u32>,
    h_ratio: Option<u32>,
) -> Result<RgbaImage, ImageHandlerError> {
    if w_ratio.is_none() && h_ratio.is_none() {
        return Ok(overlay.clone());
    }

    let (ow, oh) = overlay.dimensions();
    let bound = |size: u32, ratio: Option<u32>| {
        ratio.map(|r| ((size as u64 * r as u64) / 100).max(1) as f64)
    };
    let max_w = bound(base.0, w_ratio).unwrap_or(f64::INFINITY);
    let max_h = bound(base.1, h_ratio).unwrap_or(f64::INFINITY);

    let scale = (max_w / ow as f64).min(max_h / oh as f64);
    let target_w = ((ow as f64 * scale).round() as u32).max(1);
    let target_h = ((oh as f64 * scale).round() as u32).max(1);

    if (target_w, target_h) == (ow, oh) {
        return Ok(overlay.clone());
    }
    resize_rgba(overlay, target_w, target_h)
}

/// Composite `overlay` onto `base` at `position` with extra opacity.
///
/// The overlay must not be larger than the base in either dimension. Parts
/// that fall outside the base after positioning are clipped.
pub fn composite_overlay(
    base: &mut RgbaImage,
    overlay: &RgbaImage,
    position: (i64, i64),
    opacity: f32,
) -> Result<(), ImageHandlerError> {
    if overlay.width() > base.width() || overlay.height() > base.height() {
        return Err(ImageHandlerError::overlay_too_large());
    }

    let base_w = base.width() as i64;
    let base_h = base.height() as i64;
    let (px, py) = position;

    let x_start = px.max(0);
    let y_start = py.max(0);
    let x_end = (px + overlay.width() as i64).min(base_w);
    let y_end = (py + overlay.height() as i64).min(base_h);

    for ty in y_start..y_end {
        for tx in x_start..x_end {
            let fg = *overlay.get_pixel((tx - px) as u32, (ty - py) as u32);
            let bg = *base.get_pixel(tx as u32, ty as u32);
            base.put_pixel(tx as u32, ty as u32, blend_pixels(bg, fg, opacity));
        }
    }
    Ok(())
}

/// Opacity for an `alpha` transparency percentage.
pub fn opacity_from_alpha(alpha: Option<u32>) -> f32 {
    match alpha {
        Some(a) => 1.0 - (a.min(100) as f32 / 100.0),
        None => 1.0,
    }
}

/// Porter-Duff "over" with an extra opacity applied to the foreground.
pub(crate) fn blend_pixels(background: Rgba<u8>, foreground: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    let fg_alpha = (foreground[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
    let bg_alpha = background[3] as f32 / 255.0;
    let out_alpha = fg_alpha + bg_alpha * (1.0 - fg_alpha);

    if out_alpha < 0.001 {
        return Rgba([0, 0, 0, 0]);
    }

    let channel = |fg: u8, bg: u8| -> u8 {
        let fg_f = fg as f32 / 255.0;
        let bg_f = bg as f32 / 255.0;
        let result = (fg_f * fg_alpha + bg_f * bg_alpha * (1.0 - fg_alpha)) / out_alpha;
        (result * 255.0).round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        channel(foreground[0], background[0]),
        channel(foreground[1], background[1]),
        channel(foreground[2], background[2]),
        (out_alpha * 255.0).round() as u8,
    ])
}

/// Loads overlay images through the object store, caching decoded pixels.
#[derive(Clone)]
pub struct OverlayFetcher {
    store: Arc<dyn ObjectStore>,
    cache: Cache<String, Arc<RgbaImage>>,
}

impl OverlayFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, config: &OverlayCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .build();
        Self { store, cache }
    }

    fn cache_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    pub async fn fetch(&self, bucket: &str, key: &str) -> Result<Arc<RgbaImage>, ImageHandlerError> {
        let cache_key = Self::cache_key(bucket, key);
        if let Some(cached) = self.cache.get(&cache_key).await {
            Metrics::global().overlay_cache_hits.inc();
            return Ok(cached);
        }

        let object = self.store.get_object(bucket, key).await?;
        let decoded = decode_overlay(&object.body)?;
        let image = Arc::new(decoded.to_rgba8());

        tracing::debug!(
            bucket = %bucket,
            key = %key,
            width = image.width(),
            height = image.height(),
            "Overlay image cached"
        );
        self.cache.insert(cache_key, image.clone()).await;
        Ok(image)
    }

    pub async fn is_cached(&self, bucket: &str, key: &str) -> bool {
        self.cache
            .get(&Self::cache_key(bucket, key))
            .await
            .is_some()
    }
}

fn decode_overlay(data: &[u8]) -> Result<DynamicImage, ImageHandlerError> {
    image::io::Reader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ImageHandlerError::from_codec_message(format!("Failed to read overlay: {e}")))?
        .decode()
        .map_err(|e| ImageHandlerError::from_codec_message(format!("Failed to decode overlay: {e}")))
}
