//! Origin request handler
//!
//! Resolves the request, runs the edit pipeline and assembles the response.
//! This is the only place errors become responses, and the only place the
//! fallback image is substituted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ImagesConfig;
use crate::error::ImageHandlerError;
use crate::image_handler::format::infer_content_type;
use crate::image_handler::EditPipeline;
use crate::metrics::Metrics;
use crate::request::{ImageHandlerEvent, ImageRequest, RequestResolver, DEFAULT_CACHE_CONTROL};
use crate::s3::ObjectStore;

/// Response produced for one event.
///
/// Image bodies are base64 encoded; error bodies are the JSON envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status_code: u16,
    pub is_base64_encoded: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl ExecutionResult {
    /// Raw response bytes, decoding the body when it is base64.
    pub fn body_bytes(&self) -> Result<Vec<u8>, ImageHandlerError> {
        if self.is_base64_encoded {
            STANDARD
                .decode(&self.body)
                .map_err(|e| ImageHandlerError::internal(format!("Invalid response body: {}", e)))
        } else {
            Ok(self.body.clone().into_bytes())
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct ImageHandler {
    config: ImagesConfig,
    resolver: RequestResolver,
    pipeline: EditPipeline,
    store: Arc<dyn ObjectStore>,
    request_timeout: Duration,
}

impl ImageHandler {
    pub fn new(
        config: ImagesConfig,
        resolver: RequestResolver,
        pipeline: EditPipeline,
        store: Arc<dyn ObjectStore>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            config,
            resolver,
            pipeline,
            store,
            request_timeout,
        }
    }

    pub async fn handle(&self, event: &ImageHandlerEvent) -> ExecutionResult {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(request_id = %request_id, path = %event.path, "Handling image request");

        let outcome = match tokio::time::timeout(self.request_timeout, self.process(event)).await {
            Ok(result) => result,
            Err(_) => Err(ImageHandlerError::timeout(self.request_timeout.as_millis() as u64)),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                if err.is_server_error() {
                    tracing::error!(request_id = %request_id, path = %event.path, status = err.status, code = %err.code, message = %err.message, "Image request failed");
                } else {
                    tracing::info!(request_id = %request_id, path = %event.path, status = err.status, code = %err.code, message = %err.message, "Image request rejected");
                }
                self.error_response(&err).await
            }
        };

        Metrics::global().record_response(result.status_code);
        result
    }

    async fn process(&self, event: &ImageHandlerEvent) -> Result<ExecutionResult, ImageHandlerError> {
        let parsed = self.resolver.parse(event)?;
        let (request, overlays) = tokio::try_join!(
            self.resolver.fetch(&parsed, event),
            self.pipeline.prefetch_overlays(&parsed.edits)
        )?;

        let (body, content_type) = if request.is_passthrough() {
            (request.original_image.to_vec(), request.content_type.clone())
        } else {
            let processed = self
                .pipeline
                .process(
                    &request.original_image,
                    &request.edits,
                    request.output_format,
                    request.effort,
                    &overlays,
                )
                .await?;
            tracing::debug!(
                bucket = %request.bucket,
                key = %request.full_key,
                original_size = ?processed.original_size,
                output_size = ?processed.output_size,
                "Image processed"
            );
            (processed.data, processed.content_type)
        };

        Ok(self.success_response(&request, body, content_type))
    }

    fn base_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Access-Control-Allow-Methods".to_string(), "GET".to_string());
        headers.insert(
            "Access-Control-Allow-Headers".to_string(),
            "Content-Type, Authorization".to_string(),
        );
        headers.insert("Access-Control-Allow-Credentials".to_string(), "true".to_string());
        if self.config.cors_enabled {
            headers.insert(
                "Access-Control-Allow-Origin".to_string(),
                self.config.cors_origin.clone(),
            );
        }
        headers
    }

    fn success_response(
        &self,
        request: &ImageRequest,
        body: Vec<u8>,
        content_type: String,
    ) -> ExecutionResult {
        let mut headers = self.base_headers();
        headers.insert("Content-Type".to_string(), content_type);
        if let Some(expires) = &request.expires {
            headers.insert("Expires".to_string(), expires.clone());
        }
        if let Some(last_modified) = &request.last_modified {
            headers.insert("Last-Modified".to_string(), last_modified.clone());
        }
        headers.insert("Cache-Control".to_string(), request.cache_control.clone());

        // Caller-supplied headers win
        for (name, value) in &request.headers {
            headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }

        ExecutionResult {
            status_code: 200,
            is_base64_encoded: true,
            headers,
            body: STANDARD.encode(body),
        }
    }

    async fn error_response(&self, err: &ImageHandlerError) -> ExecutionResult {
        if self.config.fallback.enabled {
            match self.fallback_response(err.status).await {
                Ok(result) => {
                    Metrics::global().fallback_responses.inc();
                    return result;
                }
                Err(e) => {
                    tracing::error!(
                        bucket = %self.config.fallback.bucket,
                        key = %self.config.fallback.key,
                        error = %e,
                        "Error occurred while getting the fallback image"
                    );
                }
            }
        }

        let mut headers = self.base_headers();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        ExecutionResult {
            status_code: err.to_public().status,
            is_base64_encoded: false,
            headers,
            body: err.to_json_body(),
        }
    }

    async fn fallback_response(&self, status: u16) -> Result<ExecutionResult, ImageHandlerError> {
        let fallback = &self.config.fallback;
        let object = self.store.get_object(&fallback.bucket, &fallback.key).await?;

        let mut headers = self.base_headers();
        let content_type = object
            .content_type
            .clone()
            .or_else(|| infer_content_type(&object.body).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        headers.insert("Content-Type".to_string(), content_type);
        if let Some(last_modified) = object.last_modified {
            headers.insert("Last-Modified".to_string(), last_modified);
        }
        headers.insert("Cache-Control".to_string(), DEFAULT_CACHE_CONTROL.to_string());

        Ok(ExecutionResult {
            status_code: status,
            is_base64_encoded: true,
            headers,
            body: STANDARD.encode(&object.body),
        })
    }
}
