//! Edge service: verifies signed URLs and forwards them to the origin with
//! their query in canonical order.

use async_trait::async_trait;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::Result;
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::time::Duration;

use super::helpers::{extract_headers, split_host_port, write_response};
use crate::config::EdgeConfig;
use crate::edge::{EdgeAuthenticator, EdgeDecision, SignedRequest, VIEWER_HOST_HEADER};

const ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request state carried from `request_filter` to the upstream phases
#[derive(Debug, Default)]
pub struct EdgeContext {
    /// Path and canonical query to send to the origin
    pub target: Option<String>,
    pub viewer_host: Option<String>,
}

pub struct EdgeProxy {
    config: EdgeConfig,
    authenticator: EdgeAuthenticator,
}

impl EdgeProxy {
    pub fn new(config: EdgeConfig, authenticator: EdgeAuthenticator) -> Self {
        Self {
            config,
            authenticator,
        }
    }
}

/// Request target forwarded to the origin
pub fn forward_target(uri: &str, query: &str) -> String {
    if query.is_empty() {
        uri.to_string()
    } else {
        format!("{}?{}", uri, query)
    }
}

#[async_trait]
impl ProxyHttp for EdgeProxy {
    type CTX = EdgeContext;

    fn new_ctx(&self) -> Self::CTX {
        EdgeContext::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        let mut request = SignedRequest::new(req.uri.path(), req.uri.query().unwrap_or_default());
        request.headers = extract_headers(req);

        match self.authenticator.authenticate(&request).await {
            EdgeDecision::Reject { status, body } => {
                tracing::info!(
                    request_id = %request.request_id,
                    uri = %request.uri,
                    status,
                    reason = %body,
                    "Edge rejected request"
                );
                write_response(
                    session,
                    status,
                    [("Content-Type", "text/plain")],
                    body.into_bytes(),
                )
                .await?;
                Ok(true)
            }
            EdgeDecision::Forward {
                uri,
                query,
                viewer_host,
            } => {
                ctx.target = Some(forward_target(&uri, &query));
                ctx.viewer_host = viewer_host;
                Ok(false)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let (host, port) = split_host_port(&self.config.origin, self.config.origin_tls);
        let sni = if self.config.origin_sni.is_empty() {
            host.clone()
        } else {
            self.config.origin_sni.clone()
        };

        let mut peer = Box::new(HttpPeer::new((host, port), self.config.origin_tls, sni));
        peer.options.connection_timeout = Some(ORIGIN_TIMEOUT);
        peer.options.read_timeout = Some(ORIGIN_TIMEOUT);
        peer.options.write_timeout = Some(ORIGIN_TIMEOUT);
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let target = ctx.target.as_deref().ok_or_else(|| {
            pingora_core::Error::explain(
                pingora_core::ErrorType::InternalError,
                "No forward target in context",
            )
        })?;
        let uri = target.parse().map_err(|e: http::uri::InvalidUri| {
            pingora_core::Error::explain(
                pingora_core::ErrorType::InternalError,
                format!("Invalid forward URI: {}", e),
            )
        })?;
        upstream_request.set_uri(uri);

        if let Some(host) = &ctx.viewer_host {
            upstream_request.insert_header(VIEWER_HOST_HEADER, host.as_str())?;
        }
        Ok(())
    }
}
