//! GitHub token to Copilot token exchange
//!
//! A GitHub OAuth token is long-lived but cannot call the Copilot API. This
//! module trades it for a short-lived Copilot token via GitHub's internal
//! token endpoint. The exchange is repeated every time the Copilot token
//! approaches expiry.

use std::fmt;

use serde::Deserialize;

use crate::constants::{TOKEN_EXCHANGE_URL, USER_AGENT};
use crate::error::{Error, Result};

/// Response from the Copilot token endpoint.
///
/// `expires_at` is an absolute unix timestamp in seconds. `refresh_in` is a
/// delta in seconds from the response time and is what the token manager
/// schedules from.
#[derive(Clone, Deserialize)]
pub struct ExchangeResponse {
    pub token: String,
    pub expires_at: i64,
    pub refresh_in: i64,
}

impl fmt::Debug for ExchangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeResponse")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("refresh_in", &self.refresh_in)
            .finish()
    }
}

/// Client for the Copilot token endpoint.
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    client: reqwest::Client,
    url: String,
}

impl TokenExchanger {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_url(client, TOKEN_EXCHANGE_URL)
    }

    /// Exchanger pointed at a non-default endpoint.
    pub fn with_url(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Trade a GitHub OAuth token for a Copilot API token.
    ///
    /// One GET, no retries. Non-success statuses carry the status and body
    /// text so a rejected credential (401) is distinguishable from an
    /// outage.
    pub async fn exchange(&self, credential: &str) -> Result<ExchangeResponse> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(credential)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::ExchangeStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ExchangeResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid token exchange response: {e}")))
    }
}
