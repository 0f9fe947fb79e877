//! Object store access for source and overlay images.
//!
//! The `ObjectStore` trait is the only way the origin reads objects. The
//! production implementation wraps the AWS SDK; `InMemoryObjectStore` backs
//! tests and local development.

use async_trait::async_trait;
use aws_sdk_s3::primitives::DateTimeFormat;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::config::S3Config;
use crate::error::ImageHandlerError;

/// An object as returned by the store, with the metadata the response needs.
#[derive(Debug, Clone, Default)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// HTTP-date string
    pub last_modified: Option<String>,
    /// HTTP-date string
    pub expires: Option<String>,
    pub cache_control: Option<String>,
}

impl StoredObject {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("access denied to {bucket}/{key}")]
    AccessDenied { bucket: String, key: String },

    #[error("object store request failed: {0}")]
    Backend(String),
}

impl From<StoreError> for ImageHandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key, .. } => ImageHandlerError::no_such_key(&key),
            StoreError::AccessDenied { .. } => {
                ImageHandlerError::new(403, "AccessDenied", err.to_string())
            }
            StoreError::Backend(msg) => ImageHandlerError::internal(msg),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object by bucket and key
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;
}

/// Build an AWS SDK client from configuration.
///
/// Static credentials are used when both keys are set; otherwise the default
/// provider chain resolves them.
pub async fn create_s3_client(config: &S3Config) -> S3Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));

    if let Some(endpoint) = &config.endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
        loader = loader.credentials_provider(aws_credential_types::Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "shashin-config",
        ));
    }

    let shared = loader.load().await;
    let s3_config = aws_sdk_s3::config::Builder::from(&shared)
        .force_path_style(config.endpoint.is_some())
        .build();
    S3Client::from_conf(s3_config)
}

/// `ObjectStore` backed by Amazon S3 (or an S3-compatible endpoint).
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    pub async fn from_config(config: &S3Config) -> Self {
        Self::new(create_s3_client(config).await)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let status = e.raw_response().map(|r| r.status().as_u16());
                let no_such_key = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if no_such_key || status == Some(404) {
                    StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else if status == Some(403) {
                    StoreError::AccessDenied {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StoreError::Backend(format!("S3 fetch failed: {e}"))
                }
            })?;

        let last_modified = response
            .last_modified()
            .and_then(|dt| dt.fmt(DateTimeFormat::HttpDate).ok());
        let content_type = response.content_type().map(str::to_string);
        let cache_control = response.cache_control().map(str::to_string);
        let expires = response.expires_string().map(str::to_string);

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to read S3 body: {e}")))?
            .into_bytes();

        Ok(StoredObject {
            body,
            content_type,
            last_modified,
            expires,
            cache_control,
        })
    }
}

/// In-memory `ObjectStore` keyed by `(bucket, key)`.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, object: StoredObject) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert((bucket.to_string(), key.to_string()), object);
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StoreError::Backend("object map poisoned".to_string()))?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
