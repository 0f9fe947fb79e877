// Request resolver tests covering both request encodings

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;

use shashin::config::ImagesConfig;
use shashin::image_handler::OutputFormat;
use shashin::request::{ImageHandlerEvent, RequestResolver, RequestType};
use shashin::s3::{InMemoryObjectStore, StoredObject};

fn jpeg_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 6, image::Rgb([10, 120, 200]));
    let mut buffer = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, image::ImageFormat::Jpeg)
        .unwrap();
    buffer.into_inner()
}

fn resolver() -> RequestResolver {
    let store = InMemoryObjectStore::new();
    store.insert(
        "photos",
        "a.jpg",
        StoredObject::new(jpeg_bytes()).with_content_type("image/jpeg"),
    );
    RequestResolver::new(
        ImagesConfig {
            source_buckets: vec!["photos".to_string()],
            ..Default::default()
        },
        Arc::new(store),
    )
}

#[tokio::test]
async fn test_both_encodings_resolve_to_the_same_request() {
    let resolver = resolver();

    let payload = serde_json::json!({
        "bucket": "photos",
        "key": "a.jpg",
        "edits": {"resize": {"width": 10}, "grayscale": true},
        "outputFormat": "png"
    });
    let default_event = ImageHandlerEvent::new(format!("/{}", STANDARD.encode(payload.to_string())));
    let query_event =
        ImageHandlerEvent::from_path_and_query("/a.jpg?bucket=photos&w=10&gray=true&format=png");

    let from_default = resolver.resolve(&default_event).await.unwrap();
    let from_query = resolver.resolve(&query_event).await.unwrap();

    assert_eq!(from_default.request_type, RequestType::Default);
    assert_eq!(from_query.request_type, RequestType::Query);
    assert_eq!(from_default.bucket, from_query.bucket);
    assert_eq!(from_default.key, from_query.key);
    assert_eq!(from_default.edits, from_query.edits);
    assert_eq!(from_default.output_format, Some(OutputFormat::Png));
    assert_eq!(from_default.output_format, from_query.output_format);
    assert_eq!(from_default.content_type, "image/png");
    assert_eq!(from_default.original_image, from_query.original_image);
}

#[tokio::test]
async fn test_undecodable_payload_is_bad_request() {
    let resolver = resolver();
    let event = ImageHandlerEvent::new(format!("/{}", STANDARD.encode("{not json")));
    let err = resolver.resolve(&event).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.code, "DecodeRequest::CannotDecodeRequest");
}

#[tokio::test]
async fn test_unknown_edit_is_bad_request() {
    let resolver = resolver();
    let payload = serde_json::json!({"key": "a.jpg", "edits": {"sepia": true}});
    let event = ImageHandlerEvent::new(format!("/{}", STANDARD.encode(payload.to_string())));
    let err = resolver.resolve(&event).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.code, "InvalidEdit");
}

#[tokio::test]
async fn test_custom_headers_survive_resolution() {
    let resolver = resolver();
    let payload = serde_json::json!({
        "key": "a.jpg",
        "headers": {"Cache-Control": "max-age=60", "X-Tag": "thumb"}
    });
    let event = ImageHandlerEvent::new(format!("/{}", STANDARD.encode(payload.to_string())));
    let request = resolver.resolve(&event).await.unwrap();
    assert_eq!(request.headers.get("X-Tag").map(String::as_str), Some("thumb"));
    assert!(request.is_passthrough());
}
