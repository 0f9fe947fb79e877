//! Offline URL signing
//!
//! Produces the same canonical string and signature the edge computes, so a
//! URL built here passes `EdgeAuthenticator` unchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use super::canonical::{canonical_string, sign};
use super::EdgeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedUrl {
    pub canonical: String,
    pub signature: String,
    /// Path and query, ready to append to the edge host
    pub url: String,
}

/// Path for a default (base64 JSON) request payload.
pub fn encode_payload(payload: &serde_json::Value) -> String {
    format!("/{}", STANDARD.encode(payload.to_string()))
}

/// Sign `path` with the given raw query pairs.
///
/// An `expires_at` UNIX timestamp, when given, is added to the query before
/// signing.
pub fn sign_url(
    secret: &str,
    path: &str,
    query: &[(String, String)],
    expires_at: Option<i64>,
) -> Result<SignedUrl, EdgeError> {
    let mut query: Vec<(String, String)> = query
        .iter()
        .filter(|(k, _)| k != "signature")
        .cloned()
        .collect();
    if let Some(expires) = expires_at {
        query.retain(|(k, _)| k != "expires");
        query.push(("expires".to_string(), expires.to_string()));
    }

    let canonical = canonical_string(path, &query);
    let signature = sign(secret.as_bytes(), &canonical)?;
    let separator = if canonical.contains('?') { '&' } else { '?' };
    let url = format!("{}{}signature={}", canonical, separator, signature);

    Ok(SignedUrl {
        canonical,
        signature,
        url,
    })
}
