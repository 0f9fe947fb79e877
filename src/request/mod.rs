//! Request resolution
//!
//! Turns an inbound event into an `ImageRequest`: which object to load, what
//! to do to it, and how the response should be labelled.

pub mod parser;
pub mod tenant;

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::ImagesConfig;
use crate::error::ImageHandlerError;
use crate::image_handler::format::{infer_content_type, is_generic_content_type};
use crate::image_handler::{select_output_format, EditSpecification, OutputFormat};
use crate::s3::ObjectStore;

pub use parser::{parse_request, ParsedRequest, RequestType};
pub use tenant::{is_tenant_active, HttpTenantStore, InMemoryTenantStore, TenantStatus, TenantStore};

pub const DEFAULT_CACHE_CONTROL: &str = "max-age=31536000,public";

/// Inbound request as seen by the origin: path, query pairs and headers.
///
/// Query keys may repeat; header names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageHandlerEvent {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
}

impl ImageHandlerEvent {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Build an event from a request target such as `/key.jpg?w=10&h=20`.
    pub fn from_path_and_query(target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query_string(query)),
            None => (target, Vec::new()),
        };
        Self::new(path).with_query(query)
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Split a raw query string into decoded pairs, keeping repeats and order.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// A fully resolved request, with the source object loaded
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub request_type: RequestType,
    pub bucket: String,
    pub key: String,
    /// Key actually read from the store (`tenant/key` when tenants are gated)
    pub full_key: String,
    pub tenant_id: Option<String>,
    pub edits: EditSpecification,
    pub output_format: Option<OutputFormat>,
    pub effort: Option<u8>,
    pub original_image: Bytes,
    pub content_type: String,
    pub expires: Option<String>,
    pub last_modified: Option<String>,
    pub cache_control: String,
    pub headers: BTreeMap<String, String>,
}

impl ImageRequest {
    /// No edits and no format change: the stored bytes are returned as-is.
    pub fn is_passthrough(&self) -> bool {
        self.edits.is_empty() && self.output_format.is_none()
    }
}

pub struct RequestResolver {
    config: ImagesConfig,
    store: Arc<dyn ObjectStore>,
    tenants: Option<Arc<dyn TenantStore>>,
}

impl RequestResolver {
    pub fn new(config: ImagesConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            tenants: None,
        }
    }

    /// Enable tenant gating: keys are scoped by tenant and inactive tenants
    /// look like missing objects.
    pub fn with_tenants(mut self, tenants: Arc<dyn TenantStore>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    /// Decode and validate the request without touching any store.
    pub fn parse(&self, event: &ImageHandlerEvent) -> Result<ParsedRequest, ImageHandlerError> {
        if self.config.enable_signature && event.query_param("signature").is_none() {
            return Err(ImageHandlerError::bad_request(
                "AuthorizationQueryParametersError",
                "Query-string requires the signature parameter.",
            ));
        }

        let mut parsed = parse_request(event, self.tenants.is_some())?;
        let bucket = self.allowed_bucket(parsed.bucket.as_deref())?;
        for overlay in parsed.edits.overlays() {
            self.allowed_bucket(Some(&overlay.bucket))?;
        }
        parsed.bucket = Some(bucket);
        Ok(parsed)
    }

    /// Deny the request as a missing object unless its tenant is active.
    pub async fn gate_tenant(&self, parsed: &ParsedRequest) -> Result<(), ImageHandlerError> {
        if let Some(tenants) = &self.tenants {
            if !is_tenant_active(tenants.as_ref(), parsed.tenant_id.as_deref()).await {
                return Err(ImageHandlerError::no_such_key(&parsed.key));
            }
        }
        Ok(())
    }

    /// Load the source object for a parsed request and work out the
    /// response metadata.
    pub async fn fetch(
        &self,
        parsed: &ParsedRequest,
        event: &ImageHandlerEvent,
    ) -> Result<ImageRequest, ImageHandlerError> {
        self.gate_tenant(parsed).await?;

        let bucket = self.allowed_bucket(parsed.bucket.as_deref())?;
        let full_key = match (&self.tenants, &parsed.tenant_id) {
            (Some(_), Some(tenant)) => format!("{}/{}", tenant, parsed.key),
            _ => parsed.key.clone(),
        };

        let object = self
            .store
            .get_object(&bucket, &full_key)
            .await
            .map_err(|e| {
                tracing::debug!(bucket = %bucket, key = %full_key, error = %e, "Source object fetch failed");
                match ImageHandlerError::from(e) {
                    err if err.status == 404 => ImageHandlerError::no_such_key(&parsed.key),
                    err => err,
                }
            })?;

        let output_format = select_output_format(
            parsed.output_format,
            parsed.edits.to_format(),
            self.config.auto_webp,
            event.header("accept"),
            None,
        );
        let content_type = resolve_content_type(output_format, object.content_type.as_deref(), &object.body)?;

        Ok(ImageRequest {
            request_type: parsed.request_type,
            bucket,
            key: parsed.key.clone(),
            full_key,
            tenant_id: parsed.tenant_id.clone(),
            edits: parsed.edits.clone(),
            output_format,
            effort: parsed.effort,
            original_image: object.body,
            content_type,
            expires: object.expires,
            last_modified: object.last_modified,
            cache_control: object
                .cache_control
                .unwrap_or_else(|| DEFAULT_CACHE_CONTROL.to_string()),
            headers: parsed.headers.clone(),
        })
    }

    pub async fn resolve(&self, event: &ImageHandlerEvent) -> Result<ImageRequest, ImageHandlerError> {
        let parsed = self.parse(event)?;
        self.fetch(&parsed, event).await
    }

    fn allowed_bucket(&self, requested: Option<&str>) -> Result<String, ImageHandlerError> {
        let bucket = match requested {
            Some(bucket) => bucket,
            None => self
                .config
                .source_buckets
                .first()
                .map(String::as_str)
                .ok_or_else(|| ImageHandlerError::internal("No source buckets configured"))?,
        };

        if self.config.source_buckets.iter().any(|b| b == bucket) {
            Ok(bucket.to_string())
        } else {
            Err(ImageHandlerError::new(
                403,
                "ImageBucket::CannotAccessBucket",
                "The bucket you specified could not be accessed. Please check that the bucket is specified in your SOURCE_BUCKETS.",
            ))
        }
    }
}

/// Content type of the response.
///
/// The chosen output format wins; otherwise the stored type, unless it is
/// missing or generic, in which case the bytes are sniffed.
pub fn resolve_content_type(
    output_format: Option<OutputFormat>,
    stored: Option<&str>,
    body: &[u8],
) -> Result<String, ImageHandlerError> {
    if let Some(format) = output_format {
        return Ok(format.content_type().to_string());
    }
    match stored {
        Some(ct) if !ct.is_empty() && !is_generic_content_type(ct) => Ok(ct.to_string()),
        _ => infer_content_type(body).map(str::to_string).ok_or_else(|| {
            ImageHandlerError::bad_request(
                "RequestTypeError",
                "The file does not have an extension and the file type could not be inferred. Please ensure that your original image is of a supported file type (jpg, png, tiff, webp, svg, gif, avif).",
            )
        }),
    }
}
