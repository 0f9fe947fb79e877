//! Edit pipeline implementation
//!
//! decode → geometric → overlay → content-aware → color → encode

use bytes::Bytes;
use fast_image_resize::{FilterType, Image, PixelType, ResizeAlg, Resizer};
use futures::future::try_join_all;
use image::imageops;
use image::io::Reader as ImageReader;
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::detection::{DetectionError, DetectionService};
use super::edits::{
    CropRegion, Edit, EditPhase, EditSpecification, FitMode, ModerationOptions, OverlaySpec,
    ResizeOptions, SmartCropOptions,
};
use super::encoder::{EncoderFactory, EncoderQuality, ImageEncoder, PngEncoder};
use super::format::{detect_format, OutputFormat};
use super::overlay::{
    blend_pixels, composite_overlay, opacity_from_alpha, overlay_position, scale_overlay,
    OverlayFetcher,
};
use crate::config::ImageLimitsConfig;
use crate::error::ImageHandlerError;
use crate::metrics::Metrics;

/// Decoded overlays keyed by `(bucket, key)`
pub type OverlaySet = HashMap<(String, String), Arc<RgbaImage>>;

/// Result of image processing
#[derive(Debug)]
pub struct ProcessedImage {
    pub data: Vec<u8>,
    pub format: OutputFormat,
    pub content_type: String,
    /// Source dimensions (width, height)
    pub original_size: (u32, u32),
    /// Output dimensions (width, height)
    pub output_size: (u32, u32),
}

pub struct EditPipeline {
    overlays: OverlayFetcher,
    detection: Option<Arc<dyn DetectionService>>,
    detection_timeout: Duration,
    limits: ImageLimitsConfig,
}

impl EditPipeline {
    pub fn new(overlays: OverlayFetcher, limits: ImageLimitsConfig) -> Self {
        Self {
            overlays,
            detection: None,
            detection_timeout: Duration::from_secs(5),
            limits,
        }
    }

    pub fn with_detection(
        mut self,
        detection: Arc<dyn DetectionService>,
        timeout: Duration,
    ) -> Self {
        self.detection = Some(detection);
        self.detection_timeout = timeout;
        self
    }

    /// Fetch every overlay named by `edits` concurrently.
    pub async fn prefetch_overlays(
        &self,
        edits: &EditSpecification,
    ) -> Result<OverlaySet, ImageHandlerError> {
        let fetches = edits.overlays().map(|spec| async move {
            let image = self.overlays.fetch(&spec.bucket, &spec.key).await?;
            Ok::<_, ImageHandlerError>(((spec.bucket.clone(), spec.key.clone()), image))
        });
        Ok(try_join_all(fetches).await?.into_iter().collect())
    }

    /// Apply `edits` to `data` and encode the result.
    ///
    /// `output_format` overrides the source format; overlays missing from
    /// `overlays` are fetched on demand.
    pub async fn process(
        &self,
        data: &[u8],
        edits: &EditSpecification,
        output_format: Option<OutputFormat>,
        effort: Option<u8>,
        overlays: &OverlaySet,
    ) -> Result<ProcessedImage, ImageHandlerError> {
        let started = Instant::now();

        let decoded = decode_image(data, &self.limits)?;
        let original_size = (decoded.width(), decoded.height());
        let mut img = decoded.to_rgba8();

        for edit in edits.in_phase(EditPhase::Geometric) {
            img = self.apply_geometric(img, edit)?;
        }

        for spec in edits.overlays() {
            self.apply_overlay(&mut img, spec, overlays).await?;
        }

        for edit in edits.in_phase(EditPhase::ContentAware) {
            img = match edit {
                Edit::SmartCrop(options) => self.smart_crop(img, options).await?,
                Edit::ContentModeration(options) => self.moderate(img, options).await?,
                _ => img,
            };
        }

        for edit in edits.in_phase(EditPhase::Color) {
            img = apply_color(img, edit);
        }

        let format = output_format
            .or_else(|| detect_format(data))
            .unwrap_or(OutputFormat::Png);
        let mut quality = EncoderQuality::with_quality(edits.quality_for(format).unwrap_or(80));
        if let Some(effort) = effort {
            quality = quality.with_effort(effort);
        }

        let (width, height) = img.dimensions();
        let encoded = EncoderFactory::create(format).encode(img.as_raw(), width, height, quality)?;

        Metrics::global().observe_pipeline(encoded.content_type, started.elapsed().as_secs_f64());

        Ok(ProcessedImage {
            data: encoded.data,
            format,
            content_type: encoded.content_type.to_string(),
            original_size,
            output_size: (width, height),
        })
    }

    fn apply_geometric(&self, img: RgbaImage, edit: &Edit) -> Result<RgbaImage, ImageHandlerError> {
        match edit {
            Edit::Resize(options) => self.resize(img, options),
            Edit::Crop(region) => crop(img, region),
            Edit::Rotate(Some(90)) => Ok(imageops::rotate90(&img)),
            Edit::Rotate(Some(180)) => Ok(imageops::rotate180(&img)),
            Edit::Rotate(Some(270)) => Ok(imageops::rotate270(&img)),
            Edit::Flip => Ok(imageops::flip_vertical(&img)),
            Edit::Flop => Ok(imageops::flip_horizontal(&img)),
            _ => Ok(img),
        }
    }

    fn resize(&self, img: RgbaImage, options: &ResizeOptions) -> Result<RgbaImage, ImageHandlerError> {
        let (sw, sh) = img.dimensions();
        let (sw_f, sh_f) = (sw as f64, sh as f64);
        let scaled = |scale: f64| {
            (
                ((sw_f * scale).round() as u32).max(1),
                ((sh_f * scale).round() as u32).max(1),
            )
        };

        if options.width.is_none() && options.height.is_none() {
            return Ok(img);
        }
        // The requested box bounds the contain canvas and the cover crop
        self.check_output_size(options.width.unwrap_or(1), options.height.unwrap_or(1))?;

        let (w, h) = match (options.width, options.height) {
            (None, None) => (sw, sh),
            (Some(w), None) => scaled(w as f64 / sw_f),
            (None, Some(h)) => scaled(h as f64 / sh_f),
            (Some(w), Some(h)) => match options.fit {
                FitMode::Fill => (w, h),
                FitMode::Inside | FitMode::Contain => {
                    scaled((w as f64 / sw_f).min(h as f64 / sh_f))
                }
                FitMode::Outside | FitMode::Cover => {
                    scaled((w as f64 / sw_f).max(h as f64 / sh_f))
                }
            },
        };
        self.check_output_size(w, h)?;

        let resized = if (w, h) == (sw, sh) {
            img
        } else {
            resize_rgba(&img, w, h)?
        };

        match (options.width, options.height, options.fit) {
            (Some(bw), Some(bh), FitMode::Cover) => {
                let x = (w.saturating_sub(bw)) / 2;
                let y = (h.saturating_sub(bh)) / 2;
                Ok(imageops::crop_imm(&resized, x, y, bw.min(w), bh.min(h)).to_image())
            }
            (Some(bw), Some(bh), FitMode::Contain) => {
                let background = options.background.unwrap_or(Rgba([0, 0, 0, 255]));
                let mut canvas = RgbaImage::from_pixel(bw, bh, background);
                let x = (bw as i64 - w as i64) / 2;
                let y = (bh as i64 - h as i64) / 2;
                imageops::overlay(&mut canvas, &resized, x, y);
                Ok(canvas)
            }
            _ => Ok(resized),
        }
    }

    fn check_output_size(&self, width: u32, height: u32) -> Result<(), ImageHandlerError> {
        let pixels = width as u64 * height as u64;
        if width > self.limits.max_width
            || height > self.limits.max_height
            || pixels > self.limits.max_pixels
        {
            return Err(ImageHandlerError::bad_request(
                "Resize::TooLarge",
                format!(
                    "Requested size {}x{} exceeds the limit of {}x{} ({} pixels)",
                    width, height, self.limits.max_width, self.limits.max_height, self.limits.max_pixels
                ),
            ));
        }
        Ok(())
    }

    async fn apply_overlay(
        &self,
        img: &mut RgbaImage,
        spec: &OverlaySpec,
        overlays: &OverlaySet,
    ) -> Result<(), ImageHandlerError> {
        let source = match overlays.get(&(spec.bucket.clone(), spec.key.clone())) {
            Some(image) => image.clone(),
            None => self.overlays.fetch(&spec.bucket, &spec.key).await?,
        };

        let base = img.dimensions();
        let scaled = scale_overlay(&source, base, spec.w_ratio, spec.h_ratio)?;
        let position = overlay_position(
            base,
            scaled.dimensions(),
            spec.left.as_deref(),
            spec.top.as_deref(),
        );

        tracing::debug!(
            bucket = %spec.bucket,
            key = %spec.key,
            x = position.0,
            y = position.1,
            width = scaled.width(),
            height = scaled.height(),
            "Compositing overlay"
        );
        composite_overlay(img, &scaled, position, opacity_from_alpha(spec.alpha))
    }

    async fn detect<T, F, Fut>(&self, call: F) -> Result<T, ImageHandlerError>
    where
        F: FnOnce(Arc<dyn DetectionService>) -> Fut,
        Fut: Future<Output = Result<T, DetectionError>>,
    {
        let service = self
            .detection
            .clone()
            .ok_or(DetectionError::NotConfigured)?;
        match tokio::time::timeout(self.detection_timeout, call(service)).await {
            Ok(result) => result.map_err(ImageHandlerError::from),
            Err(_) => Err(DetectionError::Timeout(self.detection_timeout.as_millis() as u64).into()),
        }
    }

    async fn smart_crop(
        &self,
        img: RgbaImage,
        options: &SmartCropOptions,
    ) -> Result<RgbaImage, ImageHandlerError> {
        let png = encode_for_detection(&img)?;
        let faces = self
            .detect(|service| async move { service.detect_faces(png).await })
            .await?;

        if faces.is_empty() {
            return Ok(img);
        }

        let face = faces.get(options.face_index).ok_or_else(|| {
            ImageHandlerError::bad_request(
                "SmartCrop::FaceIndexOutOfRange",
                format!(
                    "Face index {} requested but only {} face(s) were detected",
                    options.face_index,
                    faces.len()
                ),
            )
        })?;

        let (w, h) = img.dimensions();
        let (w_f, h_f) = (w as f64, h as f64);
        let padding = options.padding as i64;

        let mut left = (face.left * w_f).floor() as i64 - padding;
        let mut top = (face.top * h_f).floor() as i64 - padding;
        let mut width = (face.width * w_f).round() as i64 + padding * 2;
        let mut height = (face.height * h_f).round() as i64 + padding * 2;

        if padding == 0 {
            // Detector boxes may spill over the edges
            let right = (left + width).min(w as i64);
            let bottom = (top + height).min(h as i64);
            left = left.max(0);
            top = top.max(0);
            width = right - left;
            height = bottom - top;
        } else if left < 0 || top < 0 || left + width > w as i64 || top + height > h as i64 {
            return Err(ImageHandlerError::bad_request(
                "SmartCrop::PaddingOutOfBounds",
                "The padding value exceeds the boundaries of the original image. Try a smaller padding.",
            ));
        }

        if width <= 0 || height <= 0 {
            return Ok(img);
        }

        crop(
            img,
            &CropRegion {
                left: left as u32,
                top: top as u32,
                width: width as u32,
                height: height as u32,
            },
        )
    }

    async fn moderate(
        &self,
        img: RgbaImage,
        options: &ModerationOptions,
    ) -> Result<RgbaImage, ImageHandlerError> {
        let png = encode_for_detection(&img)?;
        let min_confidence = options.min_confidence;
        let labels = self
            .detect(|service| async move {
                service.detect_moderation_labels(png, min_confidence).await
            })
            .await?;

        let flagged = labels.iter().filter(|l| l.confidence >= min_confidence).any(|label| {
            options.labels.is_empty()
                || options.labels.contains(&label.name)
                || label
                    .parent_name
                    .as_ref()
                    .is_some_and(|parent| options.labels.contains(parent))
        });

        if flagged {
            tracing::info!(labels = labels.len(), sigma = options.blur, "Blurring moderated image");
            Ok(imageops::blur(&img, options.blur))
        } else {
            Ok(img)
        }
    }
}

/// Decode image data, rejecting inputs beyond the configured limits before
/// the pixels are allocated.
pub fn decode_image(data: &[u8], limits: &ImageLimitsConfig) -> Result<DynamicImage, ImageHandlerError> {
    if data.len() > limits.max_input_size {
        return Err(ImageHandlerError::new(
            413,
            "PayloadTooLarge",
            format!(
                "File size {} bytes exceeds maximum {} bytes",
                data.len(),
                limits.max_input_size
            ),
        ));
    }

    let reader = || {
        ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| decode_failed(e.to_string()))
    };

    let (width, height) = reader()?
        .into_dimensions()
        .map_err(|e| decode_failed(e.to_string()))?;
    let pixels = width as u64 * height as u64;
    if width > limits.max_width || height > limits.max_height || pixels > limits.max_pixels {
        return Err(ImageHandlerError::bad_request(
            "ImageTooLarge",
            format!(
                "Image dimensions {}x{} ({} pixels) exceed limit of {} pixels",
                width, height, pixels, limits.max_pixels
            ),
        ));
    }

    reader()?
        .decode()
        .map_err(|e| decode_failed(e.to_string()))
}

fn decode_failed(message: String) -> ImageHandlerError {
    match ImageHandlerError::from_codec_message(message) {
        err if err.is_server_error() => ImageHandlerError::bad_request(
            "ImageDecodeError",
            format!("Failed to decode image: {}", err.message),
        ),
        err => err,
    }
}

fn crop(img: RgbaImage, region: &CropRegion) -> Result<RgbaImage, ImageHandlerError> {
    let (w, h) = img.dimensions();
    let right = region.left as u64 + region.width as u64;
    let bottom = region.top as u64 + region.height as u64;
    if right > w as u64 || bottom > h as u64 {
        return Err(ImageHandlerError::bad_request(
            "Crop::AreaOutOfBounds",
            format!(
                "Crop area {}x{}+{}+{} exceeds the image size {}x{}",
                region.width, region.height, region.left, region.top, w, h
            ),
        ));
    }
    Ok(imageops::crop_imm(&img, region.left, region.top, region.width, region.height).to_image())
}

fn apply_color(mut img: RgbaImage, edit: &Edit) -> RgbaImage {
    match edit {
        Edit::Grayscale => DynamicImage::ImageRgba8(img).grayscale().to_rgba8(),
        Edit::Negate => {
            imageops::invert(&mut img);
            img
        }
        Edit::Tint(tint) => {
            for pixel in img.pixels_mut() {
                let luma = (0.2126 * pixel[0] as f32
                    + 0.7152 * pixel[1] as f32
                    + 0.0722 * pixel[2] as f32)
                    / 255.0;
                for c in 0..3 {
                    pixel[c] = (luma * tint[c] as f32).round().clamp(0.0, 255.0) as u8;
                }
            }
            img
        }
        Edit::Flatten(background) => {
            let opaque = Rgba([background[0], background[1], background[2], 255]);
            for pixel in img.pixels_mut() {
                *pixel = blend_pixels(opaque, *pixel, 1.0);
            }
            img
        }
        Edit::Blur(sigma) => imageops::blur(&img, *sigma),
        Edit::Sharpen(sigma) => imageops::unsharpen(&img, *sigma, 1),
        _ => img,
    }
}

fn encode_for_detection(img: &RgbaImage) -> Result<Bytes, ImageHandlerError> {
    let (width, height) = img.dimensions();
    let encoded = PngEncoder.encode(
        img.as_raw(),
        width,
        height,
        EncoderQuality::default().with_effort(0),
    )?;
    Ok(Bytes::from(encoded.data))
}

/// Resize RGBA pixels using fast-image-resize with the Lanczos3 filter
pub fn resize_rgba(img: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage, ImageHandlerError> {
    let resize_failed =
        |m: String| ImageHandlerError::from_codec_message(format!("Resize failed: {}", m));

    let src_width =
        NonZeroU32::new(img.width()).ok_or_else(|| resize_failed("Source width is 0".into()))?;
    let src_height =
        NonZeroU32::new(img.height()).ok_or_else(|| resize_failed("Source height is 0".into()))?;
    let dst_width =
        NonZeroU32::new(target_w).ok_or_else(|| resize_failed("Target width is 0".into()))?;
    let dst_height =
        NonZeroU32::new(target_h).ok_or_else(|| resize_failed("Target height is 0".into()))?;

    let src_image = Image::from_vec_u8(src_width, src_height, img.as_raw().clone(), PixelType::U8x4)
        .map_err(|e| resize_failed(format!("Failed to create source image: {:?}", e)))?;

    let mut dst_image = Image::new(dst_width, dst_height, PixelType::U8x4);
    let mut resizer = Resizer::new(ResizeAlg::Convolution(FilterType::Lanczos3));
    resizer
        .resize(&src_image.view(), &mut dst_image.view_mut())
        .map_err(|e| resize_failed(format!("Resize operation failed: {:?}", e)))?;

    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| resize_failed("Failed to create output image buffer".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayCacheConfig;
    use crate::image_handler::detection::{BoundingBox, ModerationLabel};
    use crate::s3::{InMemoryObjectStore, StoredObject};
    use async_trait::async_trait;
    use rstest::rstest;
    use serde_json::json;

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn pipeline_with(store: InMemoryObjectStore) -> EditPipeline {
        EditPipeline::new(
            OverlayFetcher::new(Arc::new(store), &OverlayCacheConfig::default()),
            ImageLimitsConfig::default(),
        )
    }

    fn edits(value: serde_json::Value) -> EditSpecification {
        EditSpecification::from_json(&value).unwrap()
    }

    async fn run(pipeline: &EditPipeline, data: &[u8], spec: &EditSpecification) -> Result<ProcessedImage, ImageHandlerError> {
        let overlays = pipeline.prefetch_overlays(spec).await?;
        pipeline.process(data, spec, None, None, &overlays).await
    }

    struct FakeDetection {
        faces: Vec<BoundingBox>,
        labels: Vec<ModerationLabel>,
        delay: Duration,
    }

    #[async_trait]
    impl DetectionService for FakeDetection {
        async fn detect_faces(&self, _image: Bytes) -> Result<Vec<BoundingBox>, DetectionError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.faces.clone())
        }

        async fn detect_moderation_labels(
            &self,
            _image: Bytes,
            _min_confidence: f32,
        ) -> Result<Vec<ModerationLabel>, DetectionError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.labels.clone())
        }
    }

    fn with_faces(faces: Vec<BoundingBox>) -> EditPipeline {
        pipeline_with(InMemoryObjectStore::new()).with_detection(
            Arc::new(FakeDetection {
                faces,
                labels: vec![],
                delay: Duration::ZERO,
            }),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_resize_width_keeps_aspect() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let result = run(&pipeline, &png(40, 20, [10, 20, 30, 255]), &edits(json!({"resize": {"width": 10}})))
            .await
            .unwrap();
        assert_eq!(result.original_size, (40, 20));
        assert_eq!(result.output_size, (10, 5));
        assert_eq!(result.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_resize_fit_modes() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let source = png(40, 20, [10, 20, 30, 255]);
        let cases = [
            ("cover", (10, 10)),
            ("contain", (10, 10)),
            ("fill", (10, 10)),
            ("inside", (10, 5)),
            ("outside", (20, 10)),
        ];
        for (fit, expected) in cases {
            let spec = edits(json!({"resize": {"width": 10, "height": 10, "fit": fit}}));
            let result = run(&pipeline, &source, &spec).await.unwrap();
            assert_eq!(result.output_size, expected, "fit {}", fit);
        }
    }

    #[tokio::test]
    async fn test_geometric_runs_before_overlay_regardless_of_key_order() {
        let store = InMemoryObjectStore::new();
        store.insert("assets", "logo.png", StoredObject::new(png(20, 30, [255, 0, 0, 255])));
        let pipeline = pipeline_with(store);

        // The overlay only fits after the base is rotated to 20x40
        let spec = edits(json!({
            "overlayWith": {"bucket": "assets", "key": "logo.png"},
            "rotate": 90
        }));
        let result = run(&pipeline, &png(40, 20, [0, 0, 0, 255]), &spec).await.unwrap();
        assert_eq!(result.output_size, (20, 40));
    }

    #[tokio::test]
    async fn test_overlay_larger_than_base_is_bad_request() {
        let store = InMemoryObjectStore::new();
        store.insert("assets", "big.png", StoredObject::new(png(50, 10, [255, 0, 0, 255])));
        let pipeline = pipeline_with(store);

        let spec = edits(json!({"overlayWith": {"bucket": "assets", "key": "big.png"}}));
        let err = run(&pipeline, &png(40, 40, [0, 0, 0, 255]), &spec).await.unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "BadRequest");
        assert_eq!(err.message, "Image to overlay must have same dimensions or smaller");
    }

    #[tokio::test]
    async fn test_overlay_ratio_shrinks_overlay_to_fit() {
        let store = InMemoryObjectStore::new();
        store.insert("assets", "big.png", StoredObject::new(png(50, 10, [255, 0, 0, 255])));
        let pipeline = pipeline_with(store);

        let spec = edits(json!({
            "overlayWith": {"bucket": "assets", "key": "big.png", "wRatio": 50, "options": {"left": "0", "top": "0"}}
        }));
        let result = run(&pipeline, &png(40, 40, [0, 0, 0, 255]), &spec).await.unwrap();
        let decoded = image::load_from_memory(&result.data).unwrap().to_rgba8();
        assert_eq!(*decoded.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*decoded.get_pixel(25, 0), Rgba([0, 0, 0, 255]));
    }

    #[tokio::test]
    async fn test_missing_overlay_surfaces_store_status() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let spec = edits(json!({"overlayWith": {"bucket": "assets", "key": "gone.png"}}));
        let err = pipeline.prefetch_overlays(&spec).await.unwrap_err();
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn test_output_format_override() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let spec = edits(json!({"grayscale": true}));
        let result = pipeline
            .process(&png(4, 4, [200, 10, 10, 255]), &spec, Some(OutputFormat::Jpeg), None, &OverlaySet::new())
            .await
            .unwrap();
        assert_eq!(result.format, OutputFormat::Jpeg);
        assert_eq!(image::guess_format(&result.data).unwrap(), image::ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn test_color_edits() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let result = run(&pipeline, &png(2, 2, [255, 0, 0, 255]), &edits(json!({"negate": true})))
            .await
            .unwrap();
        let decoded = image::load_from_memory(&result.data).unwrap().to_rgba8();
        assert_eq!(*decoded.get_pixel(0, 0), Rgba([0, 255, 255, 255]));

        let result = run(
            &pipeline,
            &png(2, 2, [0, 0, 0, 0]),
            &edits(json!({"flatten": {"background": "#ffffff"}})),
        )
        .await
        .unwrap();
        let decoded = image::load_from_memory(&result.data).unwrap().to_rgba8();
        assert_eq!(*decoded.get_pixel(1, 1), Rgba([255, 255, 255, 255]));
    }

    #[tokio::test]
    async fn test_crop_out_of_bounds() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let spec = edits(json!({"crop": {"left": 5, "top": 0, "width": 10, "height": 2}}));
        let err = run(&pipeline, &png(10, 10, [0, 0, 0, 255]), &spec).await.unwrap_err();
        assert_eq!(err.code, "Crop::AreaOutOfBounds");
    }

    #[tokio::test]
    async fn test_undecodable_source() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let err = run(&pipeline, b"SampleImageContent\n", &edits(json!({"grayscale": true})))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "ImageDecodeError");
    }

    #[tokio::test]
    async fn test_image_bomb_rejected_before_decode() {
        let mut pipeline = pipeline_with(InMemoryObjectStore::new());
        pipeline.limits.max_pixels = 10;
        let err = run(&pipeline, &png(4, 4, [0, 0, 0, 255]), &edits(json!({"grayscale": true})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "ImageTooLarge");
    }

    #[tokio::test]
    async fn test_contain_canvas_is_bounded_by_limits() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let spec = edits(json!({"resize": {"width": 20000, "height": 10, "fit": "contain"}}));
        let err = run(&pipeline, &png(1, 10, [0, 0, 0, 255]), &spec)
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "Resize::TooLarge");
    }

    #[rstest]
    #[case("cover")]
    #[case("contain")]
    #[case("fill")]
    #[case("inside")]
    #[case("outside")]
    #[tokio::test]
    async fn test_oversized_resize_box_rejected(#[case] fit: &str) {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let spec = edits(json!({"resize": {"width": 4_000_000_000u32, "height": 10, "fit": fit}}));
        let err = run(&pipeline, &png(2, 2, [0, 0, 0, 255]), &spec)
            .await
            .unwrap_err();
        assert_eq!(err.code, "Resize::TooLarge");
    }

    #[tokio::test]
    async fn test_oversized_single_axis_resize_rejected() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let spec = edits(json!({"resize": {"height": 100_000}}));
        let err = run(&pipeline, &png(2, 2, [0, 0, 0, 255]), &spec)
            .await
            .unwrap_err();
        assert_eq!(err.code, "Resize::TooLarge");
    }

    #[test]
    fn test_codec_composite_message_becomes_overlay_error() {
        let err = decode_failed(format!(
            "backend said: {}",
            crate::error::CODEC_COMPOSITE_SIZE_MESSAGE
        ));
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "BadRequest");
        assert_eq!(err.message, crate::error::OVERLAY_TOO_LARGE_MESSAGE);

        let other = decode_failed("truncated stream".to_string());
        assert_eq!(other.code, "ImageDecodeError");
        assert_eq!(other.message, "Failed to decode image: truncated stream");
    }

    #[tokio::test]
    async fn test_smart_crop_crops_to_face() {
        let pipeline = with_faces(vec![BoundingBox { left: 0.25, top: 0.25, width: 0.5, height: 0.5 }]);
        let result = run(&pipeline, &png(40, 40, [0, 0, 0, 255]), &edits(json!({"smartCrop": {"padding": 2}})))
            .await
            .unwrap();
        assert_eq!(result.output_size, (24, 24));
    }

    #[tokio::test]
    async fn test_smart_crop_without_faces_is_noop() {
        let pipeline = with_faces(vec![]);
        let result = run(&pipeline, &png(40, 40, [0, 0, 0, 255]), &edits(json!({"smartCrop": true})))
            .await
            .unwrap();
        assert_eq!(result.output_size, (40, 40));
    }

    #[tokio::test]
    async fn test_smart_crop_face_index_out_of_range() {
        let pipeline = with_faces(vec![BoundingBox { left: 0.1, top: 0.1, width: 0.2, height: 0.2 }]);
        let err = run(&pipeline, &png(40, 40, [0, 0, 0, 255]), &edits(json!({"smartCrop": {"faceIndex": 1}})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "SmartCrop::FaceIndexOutOfRange");
    }

    #[tokio::test]
    async fn test_smart_crop_padding_out_of_bounds() {
        let pipeline = with_faces(vec![BoundingBox { left: 0.0, top: 0.0, width: 0.5, height: 0.5 }]);
        let err = run(&pipeline, &png(40, 40, [0, 0, 0, 255]), &edits(json!({"smartCrop": {"padding": 5}})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "SmartCrop::PaddingOutOfBounds");
    }

    #[tokio::test]
    async fn test_detection_timeout_is_typed() {
        let pipeline = pipeline_with(InMemoryObjectStore::new()).with_detection(
            Arc::new(FakeDetection {
                faces: vec![],
                labels: vec![],
                delay: Duration::from_millis(200),
            }),
            Duration::from_millis(10),
        );
        let err = run(&pipeline, &png(8, 8, [0, 0, 0, 255]), &edits(json!({"smartCrop": true})))
            .await
            .unwrap_err();
        assert_eq!(err.status, 504);
        assert_eq!(err.code, "DetectionTimeout");
    }

    #[tokio::test]
    async fn test_content_aware_without_service() {
        let pipeline = pipeline_with(InMemoryObjectStore::new());
        let err = run(&pipeline, &png(8, 8, [0, 0, 0, 255]), &edits(json!({"contentModeration": true})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "DetectionUnavailable");
    }

    #[tokio::test]
    async fn test_moderation_blurs_only_matching_labels() {
        let source = {
            let img = RgbaImage::from_fn(16, 16, |x, _| {
                if x < 8 { Rgba([0, 0, 0, 255]) } else { Rgba([255, 255, 255, 255]) }
            });
            let mut buffer = Cursor::new(Vec::new());
            DynamicImage::ImageRgba8(img).write_to(&mut buffer, image::ImageFormat::Png).unwrap();
            buffer.into_inner()
        };
        let pipeline = pipeline_with(InMemoryObjectStore::new()).with_detection(
            Arc::new(FakeDetection {
                faces: vec![],
                labels: vec![ModerationLabel {
                    name: "Smoking".to_string(),
                    confidence: 90.0,
                    parent_name: Some("Drugs".to_string()),
                }],
                delay: Duration::ZERO,
            }),
            Duration::from_millis(200),
        );

        let untouched = run(
            &pipeline,
            &source,
            &edits(json!({"contentModeration": {"moderationLabels": ["Violence"], "blur": 2}})),
        )
        .await
        .unwrap();
        let decoded = image::load_from_memory(&untouched.data).unwrap().to_rgba8();
        assert_eq!(*decoded.get_pixel(7, 0), Rgba([0, 0, 0, 255]));

        let blurred = run(
            &pipeline,
            &source,
            &edits(json!({"contentModeration": {"moderationLabels": ["Drugs"], "blur": 2}})),
        )
        .await
        .unwrap();
        let decoded = image::load_from_memory(&blurred.data).unwrap().to_rgba8();
        assert_ne!(*decoded.get_pixel(7, 0), Rgba([0, 0, 0, 255]));
    }
}
