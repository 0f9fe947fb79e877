//! Shared signing secret retrieval.
//!
//! The secret is fetched at most once per process by `SecretAccessor`.
//! Concurrent first callers wait on the same in-flight fetch; a failed fetch
//! is not cached so the next request retries.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::{SecretConfig, SecretSource};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),

    #[error("secret '{id}' is malformed: {reason}")]
    Malformed { id: String, reason: String },
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the raw secret value by identifier
    async fn get_secret(&self, id: &str) -> Result<String, SecretError>;
}

/// Secret supplied directly through configuration.
#[derive(Clone)]
pub struct StaticSecretStore {
    value: String,
}

impl StaticSecretStore {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl std::fmt::Debug for StaticSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecretStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, id: &str) -> Result<String, SecretError> {
        if self.value.is_empty() {
            return Err(SecretError::NotFound(id.to_string()));
        }
        Ok(self.value.clone())
    }
}

/// Secret store reached over HTTP: `GET {endpoint}/{id}` returns the value.
pub struct HttpSecretStore {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSecretStore {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SecretError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecretError::Unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn get_secret(&self, id: &str) -> Result<String, SecretError> {
        let url = format!("{}/{}", self.endpoint, urlencoding::encode(id));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SecretError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(id.to_string()));
        }
        if !response.status().is_success() {
            return Err(SecretError::Unavailable(format!(
                "secret store responded with status {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| SecretError::Unavailable(e.to_string()))
    }
}

/// Process-wide cached view of the signing secret.
pub struct SecretAccessor {
    store: Arc<dyn SecretStore>,
    id: String,
    json_field: Option<String>,
    cached: OnceCell<String>,
}

impl SecretAccessor {
    pub fn new(store: Arc<dyn SecretStore>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
            json_field: None,
            cached: OnceCell::new(),
        }
    }

    /// Treat the stored value as JSON and extract `field` from it.
    pub fn with_json_field(mut self, field: impl Into<String>) -> Self {
        self.json_field = Some(field.into());
        self
    }

    pub fn from_config(config: &SecretConfig) -> Result<Self, SecretError> {
        let store: Arc<dyn SecretStore> = match config.source {
            SecretSource::Static => Arc::new(StaticSecretStore::new(
                config.value.clone().unwrap_or_default(),
            )),
            SecretSource::Http => Arc::new(HttpSecretStore::new(
                config.endpoint.clone().unwrap_or_default(),
                Duration::from_millis(config.timeout_ms),
            )?),
        };
        let accessor = Self::new(store, config.id.clone());
        Ok(match &config.json_field {
            Some(field) => accessor.with_json_field(field.clone()),
            None => accessor,
        })
    }

    /// Return the secret, fetching it on first use.
    pub async fn get(&self) -> Result<&str, SecretError> {
        let value = self
            .cached
            .get_or_try_init(|| async {
                let raw = self.store.get_secret(&self.id).await?;
                let secret = match &self.json_field {
                    Some(field) => extract_json_field(&self.id, &raw, field)?,
                    None => raw,
                };
                if secret.is_empty() {
                    return Err(SecretError::NotFound(self.id.clone()));
                }
                tracing::debug!(secret_id = %self.id, "Signing secret loaded");
                Ok(secret)
            })
            .await?;
        Ok(value.as_str())
    }

    pub fn is_cached(&self) -> bool {
        self.cached.initialized()
    }
}

fn extract_json_field(id: &str, raw: &str, field: &str) -> Result<String, SecretError> {
    let doc: serde_json::Value = serde_json::from_str(raw).map_err(|e| SecretError::Malformed {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    doc.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SecretError::Malformed {
            id: id.to_string(),
            reason: format!("missing string field '{}'", field),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
        fail_first: bool,
        value: String,
    }

    #[async_trait]
    impl SecretStore for CountingStore {
        async fn get_secret(&self, _id: &str) -> Result<String, SecretError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail_first && n == 0 {
                return Err(SecretError::Unavailable("cold start".to_string()));
            }
            Ok(self.value.clone())
        }
    }

    #[tokio::test]
    async fn test_secret_fetched_once_for_concurrent_callers() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            fail_first: false,
            value: "k3y".to_string(),
        });
        let accessor = Arc::new(SecretAccessor::new(store.clone(), "hmacSecret"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let accessor = accessor.clone();
            handles.push(tokio::spawn(async move {
                accessor.get().await.map(str::to_string)
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "k3y");
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(accessor.is_cached());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            fail_first: true,
            value: "k3y".to_string(),
        });
        let accessor = SecretAccessor::new(store.clone(), "hmacSecret");

        assert!(accessor.get().await.is_err());
        assert!(!accessor.is_cached());
        assert_eq!(accessor.get().await.unwrap(), "k3y");
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_json_field_extraction() {
        let store = Arc::new(StaticSecretStore::new(r#"{"hmacSecret":"abc","other":1}"#));
        let accessor = SecretAccessor::new(store, "edge-secrets").with_json_field("hmacSecret");
        assert_eq!(accessor.get().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_json_field_missing_is_malformed() {
        let store = Arc::new(StaticSecretStore::new(r#"{"other":"abc"}"#));
        let accessor = SecretAccessor::new(store, "edge-secrets").with_json_field("hmacSecret");
        assert!(matches!(
            accessor.get().await,
            Err(SecretError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_static_secret_is_not_found() {
        let accessor = SecretAccessor::new(Arc::new(StaticSecretStore::new("")), "hmacSecret");
        assert_eq!(
            accessor.get().await.unwrap_err(),
            SecretError::NotFound("hmacSecret".to_string())
        );
    }
}
