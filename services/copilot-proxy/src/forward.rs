//! Upstream request construction
//!
//! Rewrites the inbound request for the Copilot API: fixed upstream host,
//! hop-by-hop headers removed, the current bearer token and the editor
//! identification headers the API expects set. The token is read from the
//! manager on every request, so a rotation applies to the very next send.

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use copilot_token::TokenManager;
use tracing::debug;

use crate::error::UpstreamError;

/// Headers removed in both directions (RFC 9110 §7.6.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client identification the Copilot API requires on every request.
pub const CLIENT_HEADERS: &[(&str, &str)] = &[
    ("editor-version", "vscode/1.98.1"),
    ("editor-plugin-version", "copilot-chat/0.26.7"),
    ("user-agent", copilot_auth::USER_AGENT),
    ("x-github-api-version", "2025-04-01"),
    ("copilot-integration-id", "vscode-chat"),
    ("openai-intent", "conversation-panel"),
    ("x-vscode-user-agent-library-version", "electron-fetch"),
];

/// Local OpenAI-style completion path and its Copilot equivalent.
const CHAT_COMPLETIONS_ALIAS: (&str, &str) = ("/v1/chat/completions", "/chat/completions");

/// Upstream path for an inbound path. Only the chat completions path is
/// rewritten; everything else passes through unchanged.
pub fn upstream_path(path: &str) -> &str {
    if path == CHAT_COMPLETIONS_ALIAS.0 {
        CHAT_COMPLETIONS_ALIAS.1
    } else {
        path
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Sends rewritten requests to the Copilot API.
pub struct Forwarder {
    client: reqwest::Client,
    upstream_url: String,
    host: HeaderValue,
    tokens: Arc<TokenManager>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(
        client: reqwest::Client,
        upstream_url: &str,
        tokens: Arc<TokenManager>,
        timeout: Duration,
    ) -> common::Result<Self> {
        let parsed = reqwest::Url::parse(upstream_url)
            .map_err(|e| common::Error::Config(format!("invalid upstream_url {upstream_url}: {e}")))?;
        let authority = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(common::Error::Config(format!(
                    "upstream_url has no host: {upstream_url}"
                )));
            }
        };
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| common::Error::Config(format!("invalid upstream host {authority}: {e}")))?;

        Ok(Self {
            client,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            host,
            tokens,
            timeout,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Full upstream URL for an already-rewritten path and optional query.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) => format!("{}{path}?{q}", self.upstream_url),
            None => format!("{}{path}", self.upstream_url),
        }
    }

    /// Build the upstream header set from the inbound one.
    ///
    /// Inbound values are kept in order, including repeated names. `Host`
    /// and `Authorization` are replaced, and the client identification
    /// headers overwrite whatever the caller sent.
    pub fn upstream_headers(&self, inbound: &HeaderMap) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::with_capacity(inbound.len() + CLIENT_HEADERS.len() + 2);
        for (name, value) in inbound {
            if !is_hop_by_hop(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        headers.insert(HOST, self.host.clone());

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", self.tokens.token()))
            .map_err(|_| UpstreamError::Request("upstream token is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        for &(name, value) in CLIENT_HEADERS {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        Ok(headers)
    }

    /// Send the request and wait for the upstream response headers.
    ///
    /// The timeout bounds only the wait for headers; the body is read later
    /// by the relay for as long as the upstream keeps streaming. Dropping
    /// the returned future cancels the upstream request.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        inbound: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.target_url(path, query);
        let headers = self.upstream_headers(inbound)?;
        debug!(%url, "forwarding upstream");

        let send = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send();

        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UpstreamError::Timeout(self.timeout.as_secs())),
        }
    }
}
