//! Edge authentication
//!
//! Every request reaching the edge must carry an HMAC of its canonical form
//! in the `signature` query parameter, and may carry an `expires` UNIX
//! timestamp. The authenticator either rejects the request or forwards it
//! with its query rewritten into canonical order.

pub mod canonical;
pub mod signer;

use std::collections::HashMap;
use thiserror::Error;

use crate::config::Environment;
use crate::metrics::Metrics;
use crate::secrets::{SecretAccessor, SecretError};
use canonical::{canonical_string, constant_time_compare, sign, sorted_entries, split_query};

pub const VIEWER_HOST_HEADER: &str = "viewer-host";

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("signing secret unavailable: {0}")]
    Secret(#[from] SecretError),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// Request as received at the edge
#[derive(Debug, Clone, Default)]
pub struct SignedRequest {
    pub uri: String,
    /// Raw query pairs, repeats kept, values not decoded
    pub query: Vec<(String, String)>,
    /// Header names in lowercase
    pub headers: HashMap<String, String>,
    /// Correlation id used in redacted error messages
    pub request_id: String,
}

impl SignedRequest {
    pub fn new(uri: impl Into<String>, raw_query: &str) -> Self {
        Self {
            uri: uri.into(),
            query: split_query(raw_query),
            headers: HashMap::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeDecision {
    /// Answer the viewer directly; nothing reaches the origin
    Reject { status: u16, body: String },
    /// Send the request on with its query in canonical order
    Forward {
        uri: String,
        query: String,
        viewer_host: Option<String>,
    },
}

impl EdgeDecision {
    fn reject(status: u16, body: impl Into<String>) -> Self {
        EdgeDecision::Reject {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            EdgeDecision::Reject { status, .. } => Some(*status),
            EdgeDecision::Forward { .. } => None,
        }
    }
}

/// Browser noise such as `favicon.ico`, answered without any crypto
fn is_noise_path(uri: &str) -> bool {
    uri.to_ascii_lowercase().ends_with("favicon.ico")
}

pub struct EdgeAuthenticator {
    secret: SecretAccessor,
    environment: Environment,
}

impl EdgeAuthenticator {
    pub fn new(secret: SecretAccessor, environment: Environment) -> Self {
        Self {
            secret,
            environment,
        }
    }

    pub async fn authenticate(&self, request: &SignedRequest) -> EdgeDecision {
        self.authenticate_at(request, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Decide on `request` as if the current time were `now_ms`.
    pub async fn authenticate_at(&self, request: &SignedRequest, now_ms: i64) -> EdgeDecision {
        let (decision, outcome) = match self.evaluate(request, now_ms).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    request_id = %request.request_id,
                    uri = %request.uri,
                    error = %e,
                    "Edge authentication failed"
                );
                let body = match self.environment {
                    Environment::Development => e.to_string(),
                    Environment::Production => format!(
                        "An error occured, please contact us to resolve this issue. Reference #{}",
                        request.request_id
                    ),
                };
                (EdgeDecision::reject(400, body), "error")
            }
        };

        Metrics::global().record_edge_decision(outcome);
        tracing::debug!(request_id = %request.request_id, uri = %request.uri, outcome, "Edge decision");
        decision
    }

    async fn evaluate(
        &self,
        request: &SignedRequest,
        now_ms: i64,
    ) -> Result<(EdgeDecision, &'static str), EdgeError> {
        if is_noise_path(&request.uri) {
            return Ok((EdgeDecision::reject(404, "Not Found"), "noise"));
        }

        let supplied = match request.param("signature") {
            Some(signature) if !signature.is_empty() => signature,
            _ => {
                return Ok((
                    EdgeDecision::reject(401, "Missing signature"),
                    "missing_signature",
                ))
            }
        };

        let canonical = canonical_string(&request.uri, &request.query);
        let secret = self.secret.get().await?;
        let expected = sign(secret.as_bytes(), &canonical)?;
        if !constant_time_compare(&expected, supplied) {
            return Ok((
                EdgeDecision::reject(403, "Invalid signature"),
                "invalid_signature",
            ));
        }

        if let Some(expires) = request.param("expires") {
            let expires = match expires.parse::<f64>() {
                Ok(seconds) if seconds.is_finite() => seconds,
                _ => {
                    return Ok((
                        EdgeDecision::reject(400, "Invalid expires parameter"),
                        "invalid_expires",
                    ))
                }
            };
            if expires * 1000.0 < now_ms as f64 {
                return Ok((
                    EdgeDecision::reject(
                        400,
                        "Signature has expired, please request a new signature",
                    ),
                    "expired",
                ));
            }
        }

        Ok((
            EdgeDecision::Forward {
                uri: request.uri.clone(),
                query: sorted_entries(&request.query).join("&"),
                viewer_host: request.headers.get("host").cloned(),
            },
            "forwarded",
        ))
    }
}
