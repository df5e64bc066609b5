//! GitHub device authorization flow (RFC 8628)
//!
//! `request_code` asks GitHub for a device code and a short user code. The
//! user enters the user code at the verification URI while `poll_for_token`
//! asks the token endpoint, once per interval, whether the code has been
//! approved. Polling ends on approval, denial, expiry, or cancellation.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{ACCESS_TOKEN_URL, DEVICE_CODE_URL, DEVICE_GRANT_TYPE, GITHUB_CLIENT_ID, GITHUB_SCOPE};
use crate::error::{Error, Result};

/// Added to the poll interval each time the server answers `slow_down`.
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Interval used when the device code response omits one (RFC 8628 §3.2).
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// An in-progress device authorization.
///
/// Lives only while the user is being asked to approve the code. `expires_in`
/// and `poll_interval` are in seconds, as sent by GitHub.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(rename = "interval", default = "default_poll_interval")]
    pub poll_interval: u64,
}

/// Raw access token endpoint response. GitHub answers 200 for both the
/// success and the "not yet" cases; `error` distinguishes them.
#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
}

/// What a single poll told us.
#[derive(Debug, PartialEq, Eq)]
enum PollResponse {
    Pending,
    SlowDown { interval: Option<u64> },
    Expired,
    Denied,
    Granted(String),
    Failed(String),
}

impl AccessTokenResponse {
    fn classify(self) -> Option<PollResponse> {
        match self.error.as_deref() {
            Some("authorization_pending") => Some(PollResponse::Pending),
            Some("slow_down") => Some(PollResponse::SlowDown {
                interval: self.interval,
            }),
            Some("expired_token") => Some(PollResponse::Expired),
            Some("access_denied") => Some(PollResponse::Denied),
            Some(other) => Some(PollResponse::Failed(match self.error_description {
                Some(desc) => format!("{other}: {desc}"),
                None => other.to_string(),
            })),
            None => self
                .access_token
                .filter(|t| !t.is_empty())
                .map(PollResponse::Granted),
        }
    }
}

/// Compute the poll interval after a `slow_down` answer.
///
/// The interval grows by `SLOW_DOWN_STEP`. If the server states a new
/// interval and it is larger, that value is used instead.
pub fn slowed_interval(current: Duration, server_interval: Option<u64>) -> Duration {
    let bumped = current.saturating_add(SLOW_DOWN_STEP);
    match server_interval {
        Some(secs) => bumped.max(Duration::from_secs(secs)),
        None => bumped,
    }
}

/// Client for the GitHub device authorization endpoints.
#[derive(Debug, Clone)]
pub struct DeviceFlow {
    client: reqwest::Client,
    device_code_url: String,
    access_token_url: String,
}

impl DeviceFlow {
    /// Device flow against github.com.
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoints(client, DEVICE_CODE_URL, ACCESS_TOKEN_URL)
    }

    /// Device flow against explicit endpoints.
    pub fn with_endpoints(
        client: reqwest::Client,
        device_code_url: impl Into<String>,
        access_token_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            device_code_url: device_code_url.into(),
            access_token_url: access_token_url.into(),
        }
    }

    /// Request a new device code and user code.
    ///
    /// Single request; fails on transport errors, non-success status, or a
    /// malformed response body.
    pub async fn request_code(&self, cancel: &CancellationToken) -> Result<DeviceCodeSession> {
        let send = self
            .client
            .post(&self.device_code_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({
                "client_id": GITHUB_CLIENT_ID,
                "scope": GITHUB_SCOPE,
            }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = send => r.map_err(|e| Error::Http(format!("device code request failed: {e}")))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::DeviceCode(format!(
                "device code endpoint returned {status}: {body}"
            )));
        }

        let session = response
            .json::<DeviceCodeSession>()
            .await
            .map_err(|e| Error::DeviceCode(format!("invalid device code response: {e}")))?;

        debug!(
            expires_in = session.expires_in,
            interval = session.poll_interval,
            "device code issued"
        );
        Ok(session)
    }

    /// Wait for the user to approve `session`, returning the GitHub token.
    ///
    /// Sleeps one interval before every poll. `slow_down` lengthens the
    /// interval for all later polls. `expired_token`, `access_denied` and
    /// unknown error codes end the loop without further requests, as does the
    /// session's own `expires_in` running out. Transport errors and
    /// undecodable responses are logged and polling continues.
    ///
    /// Cancelling `cancel` aborts the wait immediately with `Error::Cancelled`.
    pub async fn poll_for_token(
        &self,
        session: &DeviceCodeSession,
        cancel: &CancellationToken,
    ) -> Result<Secret<String>> {
        let deadline = Instant::now()
            .checked_add(Duration::from_secs(session.expires_in))
            .ok_or_else(|| {
                Error::DeviceCode(format!(
                    "device code lifetime of {}s is out of range",
                    session.expires_in
                ))
            })?;
        let mut interval = Duration::from_secs(session.poll_interval);

        loop {
            // An interval too large to schedule lies past any deadline
            let wake = match Instant::now().checked_add(interval) {
                Some(wake) if wake <= deadline => wake,
                _ => {
                    warn!("device code expired locally before approval");
                    return Err(Error::Expired);
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.poll_once(session) => r,
            };

            match outcome {
                Ok(PollResponse::Granted(token)) => {
                    info!("device authorization approved");
                    return Ok(Secret::new(token));
                }
                Ok(PollResponse::Pending) => {
                    debug!("authorization pending");
                }
                Ok(PollResponse::SlowDown {
                    interval: server_interval,
                }) => {
                    interval = slowed_interval(interval, server_interval);
                    info!(
                        interval_secs = interval.as_secs(),
                        "token endpoint asked to slow down"
                    );
                }
                Ok(PollResponse::Expired) => return Err(Error::Expired),
                Ok(PollResponse::Denied) => return Err(Error::AccessDenied),
                Ok(PollResponse::Failed(reason)) => {
                    return Err(Error::DeviceCode(format!(
                        "token endpoint returned error {reason}"
                    )));
                }
                Err(e) => {
                    warn!(error = %e, "access token poll failed, will retry");
                }
            }
        }
    }

    async fn poll_once(&self, session: &DeviceCodeSession) -> Result<PollResponse> {
        let response = self
            .client
            .post(&self.access_token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({
                "client_id": GITHUB_CLIENT_ID,
                "device_code": session.device_code,
                "grant_type": DEVICE_GRANT_TYPE,
            }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("access token request failed: {e}")))?;

        let status = response.status();
        let parsed = response
            .json::<AccessTokenResponse>()
            .await
            .map_err(|e| Error::Http(format!("undecodable access token response ({status}): {e}")))?;

        parsed.classify().ok_or_else(|| {
            Error::Http(format!(
                "access token response ({status}) carried neither a token nor an error"
            ))
        })
    }
}
