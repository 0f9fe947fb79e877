//! Canonical request form
//!
//! The canonical string is the request path followed by the flattened,
//! sorted query without its `signature` entries. It is both the HMAC input
//! and the CDN cache key, so parameter order never changes it.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::EdgeError;

type HmacSha256 = Hmac<Sha256>;

/// Split a raw query string into `(key, value)` pairs without decoding.
///
/// Repeated keys stay as separate pairs; empty segments are skipped.
pub fn split_query(raw: &str) -> Vec<(String, String)> {
    raw.trim_start_matches('?')
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (segment.to_string(), String::new()),
        })
        .collect()
}

/// `key=value` entries, one per value, sorted lexicographically.
pub fn sorted_entries(query: &[(String, String)]) -> Vec<String> {
    let mut entries: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    entries.sort();
    entries
}

/// Sorted entries joined with `&`, signature excluded.
pub fn canonical_query(query: &[(String, String)]) -> String {
    sorted_entries(query)
        .into_iter()
        .filter(|entry| !entry.starts_with("signature="))
        .collect::<Vec<_>>()
        .join("&")
}

/// `uri`, plus `?` and the canonical query when it is not empty.
pub fn canonical_string(uri: &str, query: &[(String, String)]) -> String {
    let joined = canonical_query(query);
    if joined.is_empty() {
        uri.to_string()
    } else {
        format!("{}?{}", uri, joined)
    }
}

/// Lowercase hex HMAC-SHA256 of `message`.
pub fn sign(secret: &[u8], message: &str) -> Result<String, EdgeError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| EdgeError::InvalidKey(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare without short-circuiting on the first differing byte.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
