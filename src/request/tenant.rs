//! Tenant activation lookup
//!
//! Gating fails closed: a missing tenant id, an unknown tenant, an inactive
//! tenant and a lookup error all deny access.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::config::TenantConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
    #[serde(other)]
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenantError {
    #[error("tenant store unavailable: {0}")]
    Unavailable(String),

    #[error("tenant store returned an invalid record: {0}")]
    InvalidRecord(String),
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Look up a tenant's status; `None` when the tenant does not exist
    async fn get_status(&self, tenant_id: &str) -> Result<Option<TenantStatus>, TenantError>;
}

/// Whether `tenant_id` names an active tenant.
pub async fn is_tenant_active(store: &dyn TenantStore, tenant_id: Option<&str>) -> bool {
    let tenant_id = match tenant_id {
        Some(id) if !id.is_empty() => id,
        _ => return false,
    };

    match store.get_status(tenant_id).await {
        Ok(Some(TenantStatus::Active)) => true,
        Ok(status) => {
            tracing::debug!(tenant_id = %tenant_id, status = ?status, "Tenant not active");
            false
        }
        Err(e) => {
            tracing::warn!(tenant_id = %tenant_id, error = %e, "Tenant lookup failed, denying access");
            false
        }
    }
}

#[derive(Deserialize)]
struct TenantRecord {
    status: TenantStatus,
}

/// Tenant store reached over HTTP: `GET {endpoint}/{tenant_id}` returns
/// `{"status": "active"}`; 404 means the tenant does not exist.
pub struct HttpTenantStore {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTenantStore {
    pub fn new(config: &TenantConfig) -> Result<Self, TenantError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TenantError::Unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl TenantStore for HttpTenantStore {
    async fn get_status(&self, tenant_id: &str) -> Result<Option<TenantStatus>, TenantError> {
        let url = format!("{}/{}", self.endpoint, urlencoding::encode(tenant_id));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TenantError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TenantError::Unavailable(format!(
                "tenant store responded with status {}",
                response.status()
            )));
        }

        let record: TenantRecord = response
            .json()
            .await
            .map_err(|e| TenantError::InvalidRecord(e.to_string()))?;
        Ok(Some(record.status))
    }
}

/// Tenant store held in memory, for tests and local development.
#[derive(Clone, Default)]
pub struct InMemoryTenantStore {
    tenants: Arc<RwLock<HashMap<String, TenantStatus>>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: &str, status: TenantStatus) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.insert(tenant_id.to_string(), status);
        }
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get_status(&self, tenant_id: &str) -> Result<Option<TenantStatus>, TenantError> {
        let tenants = self
            .tenants
            .read()
            .map_err(|_| TenantError::Unavailable("tenant map poisoned".to_string()))?;
        Ok(tenants.get(tenant_id).cloned())
    }
}
