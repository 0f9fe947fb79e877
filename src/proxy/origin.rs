//! Origin service: answers image requests directly from the handler.
//!
//! Every request is handled in `request_filter`; nothing is proxied further.

use async_trait::async_trait;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::Result;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use super::helpers::{extract_headers, write_response};
use super::special_endpoints::handle_special_endpoint;
use crate::config::Config;
use crate::error::ImageHandlerError;
use crate::handler::ImageHandler;
use crate::image_handler::{DetectionService, EditPipeline, HttpDetectionService, OverlayFetcher};
use crate::request::{parse_query_string, HttpTenantStore, ImageHandlerEvent, RequestResolver};
use crate::s3::{ObjectStore, S3ObjectStore};

/// Assemble an `ImageHandler` backed by S3 and the configured services.
pub async fn build_image_handler(config: &Config) -> std::result::Result<ImageHandler, ImageHandlerError> {
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::from_config(&config.s3).await);

    let mut resolver = RequestResolver::new(config.images.clone(), store.clone());
    if config.tenants.enabled {
        let tenants = HttpTenantStore::new(&config.tenants)
            .map_err(|e| ImageHandlerError::internal(e.to_string()))?;
        resolver = resolver.with_tenants(Arc::new(tenants));
    }

    let overlays = OverlayFetcher::new(store.clone(), &config.images.overlay_cache);
    let mut pipeline = EditPipeline::new(overlays, config.images.limits.clone());
    if let Some(detection) = &config.detection {
        let service: Arc<dyn DetectionService> = Arc::new(
            HttpDetectionService::new(detection)
                .map_err(|e| ImageHandlerError::internal(e.to_string()))?,
        );
        pipeline = pipeline.with_detection(service, Duration::from_millis(detection.timeout_ms));
    }

    Ok(ImageHandler::new(
        config.images.clone(),
        resolver,
        pipeline,
        store,
        Duration::from_millis(config.origin.request_timeout_ms),
    ))
}

pub struct OriginService {
    config: Arc<Config>,
    handler: OnceCell<ImageHandler>,
    start_time: Instant,
}

impl OriginService {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            handler: OnceCell::new(),
            start_time: Instant::now(),
        }
    }

    /// Use a prepared handler instead of building one from configuration.
    pub fn with_handler(config: Config, handler: ImageHandler) -> Self {
        Self {
            config: Arc::new(config),
            handler: OnceCell::new_with(Some(handler)),
            start_time: Instant::now(),
        }
    }

    // Built lazily so the AWS client lives on the server's runtime
    async fn handler(&self) -> std::result::Result<&ImageHandler, ImageHandlerError> {
        self.handler
            .get_or_try_init(|| build_image_handler(&self.config))
            .await
    }
}

#[async_trait]
impl ProxyHttp for OriginService {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Err(pingora_core::Error::explain(
            pingora_core::ErrorType::InternalError,
            "The origin service has no upstream",
        ))
    }

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        let path = req.uri.path().to_string();

        if let Some(response) = handle_special_endpoint(&path, self.start_time) {
            write_response(
                session,
                response.status,
                [("Content-Type", response.content_type)],
                response.body.into_bytes(),
            )
            .await?;
            return Ok(true);
        }

        let event = ImageHandlerEvent {
            path,
            query: req.uri.query().map(parse_query_string).unwrap_or_default(),
            headers: extract_headers(req),
        };

        let result = match self.handler().await {
            Ok(handler) => handler.handle(&event).await,
            Err(e) => {
                tracing::error!(error = %e, "Failed to initialise image handler");
                let body = e.to_json_body();
                write_response(
                    session,
                    e.to_public().status,
                    [("Content-Type", "application/json")],
                    body.into_bytes(),
                )
                .await?;
                return Ok(true);
            }
        };

        let body = match result.body_bytes() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Response body could not be decoded");
                e.to_json_body().into_bytes()
            }
        };
        let headers: Vec<(&str, &str)> = result
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        write_response(session, result.status_code, headers, body).await?;

        tracing::info!(
            path = %event.path,
            status = result.status_code,
            "Origin request completed"
        );
        Ok(true)
    }
}
