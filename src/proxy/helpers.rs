//! Session helpers shared by the origin and edge services.

use std::collections::HashMap;

use pingora_core::Result;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::Session;

/// Headers of a Pingora request, names lowercased.
///
/// Headers with non-UTF8 values are skipped.
pub fn extract_headers(req: &RequestHeader) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in req.headers.iter() {
        if let Ok(value_str) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value_str.to_string());
        }
    }
    headers
}

/// Write a complete response and end the session's response body.
pub async fn write_response<'a>(
    session: &mut Session,
    status: u16,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    body: Vec<u8>,
) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    for (name, value) in headers {
        header.insert_header(name.to_string(), value.to_string())?;
    }
    header.insert_header("Content-Length", body.len().to_string())?;

    session
        .write_response_header(Box::new(header), false)
        .await?;
    session
        .write_response_body(Some(body.into()), true)
        .await?;
    Ok(())
}

/// Split `host[:port]` into parts, defaulting the port by scheme.
pub fn split_host_port(address: &str, tls: bool) -> (String, u16) {
    let default_port = if tls { 443 } else { 80 };
    let address = address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (address.to_string(), default_port),
    }
}
