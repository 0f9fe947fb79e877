// End-to-end handler tests with an in-memory object store

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

use shashin::config::{FallbackConfig, ImagesConfig, OverlayCacheConfig};
use shashin::handler::ImageHandler;
use shashin::image_handler::{EditPipeline, OverlayFetcher};
use shashin::request::{ImageHandlerEvent, RequestResolver};
use shashin::s3::{InMemoryObjectStore, ObjectStore, StoreError, StoredObject};

fn encode(format: image::ImageFormat, w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(w, h, image::Rgb([30, 60, 90]));
    let mut buffer = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, format)
        .unwrap();
    buffer.into_inner()
}

fn images_config() -> ImagesConfig {
    ImagesConfig {
        source_buckets: vec!["photos".to_string(), "overlays".to_string()],
        ..Default::default()
    }
}

fn build(config: ImagesConfig, store: Arc<dyn ObjectStore>) -> ImageHandler {
    let resolver = RequestResolver::new(config.clone(), store.clone());
    let pipeline = EditPipeline::new(
        OverlayFetcher::new(store.clone(), &OverlayCacheConfig::default()),
        config.limits.clone(),
    );
    ImageHandler::new(config, resolver, pipeline, store, Duration::from_secs(10))
}

fn payload_event(payload: serde_json::Value) -> ImageHandlerEvent {
    ImageHandlerEvent::new(format!("/{}", STANDARD.encode(payload.to_string())))
}

fn error_body(body: &str) -> serde_json::Value {
    serde_json::from_str(body).expect("error body is JSON")
}

#[tokio::test]
async fn test_passthrough_returns_stored_bytes() {
    let original = encode(image::ImageFormat::Jpeg, 12, 18);
    let store = InMemoryObjectStore::new();
    store.insert(
        "photos",
        "test.jpg",
        StoredObject::new(original.clone()).with_content_type("image/jpeg"),
    );
    let handler = build(images_config(), Arc::new(store));

    let result = handler.handle(&ImageHandlerEvent::new("/test.jpg")).await;
    assert_eq!(result.status_code, 200);
    assert!(result.is_base64_encoded);
    assert_eq!(result.body_bytes().unwrap(), original);
    assert_eq!(result.header("Content-Type"), Some("image/jpeg"));
    assert_eq!(result.header("Cache-Control"), Some("max-age=31536000,public"));
    assert_eq!(result.header("Access-Control-Allow-Credentials"), Some("true"));
    assert_eq!(result.header("Access-Control-Allow-Origin"), None);
}

#[tokio::test]
async fn test_custom_headers_override_defaults() {
    let store = InMemoryObjectStore::new();
    store.insert("photos", "test.jpg", StoredObject::new(encode(image::ImageFormat::Jpeg, 4, 4)));
    let handler = build(images_config(), Arc::new(store));

    let result = handler
        .handle(&payload_event(serde_json::json!({
            "key": "test.jpg",
            "headers": {"Cache-Control": "max-age=60", "X-Custom": "yes"}
        })))
        .await;
    assert_eq!(result.status_code, 200);
    assert_eq!(result.header("cache-control"), Some("max-age=60"));
    assert_eq!(result.header("X-Custom"), Some("yes"));
}

#[tokio::test]
async fn test_format_conversion_sets_content_type() {
    let store = InMemoryObjectStore::new();
    store.insert("photos", "test.jpg", StoredObject::new(encode(image::ImageFormat::Jpeg, 16, 8)));
    let handler = build(images_config(), Arc::new(store));

    let result = handler
        .handle(&payload_event(serde_json::json!({
            "key": "test.jpg",
            "edits": {"resize": {"width": 8}, "toFormat": "png"}
        })))
        .await;
    assert_eq!(result.status_code, 200);
    assert_eq!(result.header("Content-Type"), Some("image/png"));
    let img = image::load_from_memory(&result.body_bytes().unwrap()).unwrap();
    assert_eq!((img.width(), img.height()), (8, 4));
}

#[tokio::test]
async fn test_missing_object_without_fallback_is_json_404() {
    let handler = build(images_config(), Arc::new(InMemoryObjectStore::new()));
    let result = handler.handle(&ImageHandlerEvent::new("/nope.jpg")).await;

    assert_eq!(result.status_code, 404);
    assert!(!result.is_base64_encoded);
    assert_eq!(result.header("Content-Type"), Some("application/json"));
    let body = error_body(&result.body);
    assert_eq!(body["code"], "NoSuchKey");
    assert_eq!(body["status"], 404);
    assert_eq!(
        body["message"],
        "The image nope.jpg does not exist or the request may not be base64 encoded properly."
    );
}

#[tokio::test]
async fn test_missing_object_with_fallback_serves_fallback_image() {
    let fallback = encode(image::ImageFormat::Png, 3, 3);
    let store = InMemoryObjectStore::new();
    store.insert(
        "photos",
        "fallback.png",
        StoredObject::new(fallback.clone()).with_content_type("image/png"),
    );
    let handler = build(
        ImagesConfig {
            fallback: FallbackConfig {
                enabled: true,
                bucket: "photos".to_string(),
                key: "fallback.png".to_string(),
            },
            ..images_config()
        },
        Arc::new(store),
    );

    let result = handler.handle(&ImageHandlerEvent::new("/nope.jpg")).await;
    assert_eq!(result.status_code, 404);
    assert!(result.is_base64_encoded);
    assert_eq!(result.body_bytes().unwrap(), fallback);
    assert_eq!(result.header("Content-Type"), Some("image/png"));
    assert_eq!(result.header("Cache-Control"), Some("max-age=31536000,public"));
}

#[tokio::test]
async fn test_overlay_larger_than_base_is_400() {
    let store = InMemoryObjectStore::new();
    store.insert("photos", "base.png", StoredObject::new(encode(image::ImageFormat::Png, 10, 10)));
    store.insert("overlays", "logo.png", StoredObject::new(encode(image::ImageFormat::Png, 20, 5)));
    let handler = build(images_config(), Arc::new(store));

    let result = handler
        .handle(&payload_event(serde_json::json!({
            "key": "base.png",
            "edits": {"overlayWith": {"bucket": "overlays", "key": "logo.png"}}
        })))
        .await;
    assert_eq!(result.status_code, 400);
    let body = error_body(&result.body);
    assert_eq!(body["code"], "BadRequest");
    assert_eq!(body["message"], "Image to overlay must have same dimensions or smaller");
}

struct FailingStore;

#[async_trait]
impl ObjectStore for FailingStore {
    async fn get_object(&self, _bucket: &str, _key: &str) -> Result<StoredObject, StoreError> {
        Err(StoreError::Backend("connection reset by peer".to_string()))
    }
}

#[tokio::test]
async fn test_server_errors_are_masked() {
    let handler = build(images_config(), Arc::new(FailingStore));
    let result = handler.handle(&ImageHandlerEvent::new("/a.jpg")).await;

    assert_eq!(result.status_code, 500);
    assert!(!result.body.contains("connection reset"));
    let body = error_body(&result.body);
    assert_eq!(body["code"], "InternalError");
    assert_eq!(
        body["message"],
        "Internal error. Please contact the system administrator."
    );
    assert_eq!(body["status"], 500);
}

#[tokio::test]
async fn test_cors_origin_only_when_enabled() {
    let store = InMemoryObjectStore::new();
    store.insert("photos", "test.jpg", StoredObject::new(encode(image::ImageFormat::Jpeg, 2, 2)));
    let handler = build(
        ImagesConfig {
            cors_enabled: true,
            cors_origin: "*".to_string(),
            ..images_config()
        },
        Arc::new(store),
    );
    let result = handler.handle(&ImageHandlerEvent::new("/test.jpg")).await;
    assert_eq!(result.header("Access-Control-Allow-Origin"), Some("*"));

    let result = handler.handle(&ImageHandlerEvent::new("/missing.jpg")).await;
    assert_eq!(result.header("Access-Control-Allow-Origin"), Some("*"));
}
