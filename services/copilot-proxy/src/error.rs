//! Per-request error types
//!
//! Neither type ever reaches the process level: `UpstreamError` becomes a
//! 502/504 JSON response, `StreamError` ends a relay that has already sent
//! its headers and is only logged and counted.

use thiserror::Error;

/// Failure to obtain upstream response headers.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream timeout after {0}s")]
    Timeout(u64),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream request failed: {0}")]
    Request(String),
}

impl UpstreamError {
    /// Label for `proxy_upstream_errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connect(_) => "connection",
            Self::Request(_) => "request",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Failure while copying a response body to the client.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("reading upstream body failed: {0}")]
    Read(String),

    #[error("client went away: {0}")]
    Write(String),
}

impl StreamError {
    /// Label for `proxy_stream_errors_total`.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write(_) => "write",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_labels_are_stable() {
        assert_eq!(UpstreamError::Timeout(30).kind(), "timeout");
        assert_eq!(UpstreamError::Connect("refused".into()).kind(), "connection");
        assert_eq!(UpstreamError::Request("bad".into()).kind(), "request");
        assert_eq!(StreamError::Read("reset".into()).stage(), "read");
        assert_eq!(StreamError::Write("closed".into()).stage(), "write");
    }

    #[test]
    fn timeout_message_names_duration() {
        assert_eq!(
            UpstreamError::Timeout(30).to_string(),
            "upstream timeout after 30s"
        );
    }

    #[tokio::test]
    async fn connect_failures_are_classified() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();
        assert!(matches!(UpstreamError::from(err), UpstreamError::Connect(_)));
    }
}
