//! The short-lived upstream token and its schedule

use std::time::Duration;

use common::Secret;
use copilot_auth::ExchangeResponse;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// How long before expiry a token is refreshed.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// A Copilot token plus the monotonic times that govern its refresh.
///
/// `refresh_at == expires_at - SAFETY_MARGIN` and `refresh_at < expires_at`
/// hold for every value constructed through `from_exchange`.
#[derive(Debug, Clone)]
pub struct UpstreamToken {
    value: Secret<String>,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub refresh_at: Instant,
    /// Absolute expiry reported by the token endpoint (unix seconds).
    pub upstream_expires_at: i64,
}

impl UpstreamToken {
    /// Build a token from an exchange response received at `issued_at`.
    ///
    /// Rejects an empty token, and a `refresh_in` that does not exceed the
    /// safety margin (it would schedule the refresh at or before issuance).
    pub fn from_exchange(response: ExchangeResponse, issued_at: Instant) -> Result<Self> {
        if response.token.is_empty() {
            return Err(Error::InvalidToken("token endpoint returned an empty token".into()));
        }

        let margin = SAFETY_MARGIN.as_secs() as i64;
        if response.refresh_in <= margin {
            return Err(Error::InvalidToken(format!(
                "refresh_in of {}s does not exceed the {margin}s safety margin",
                response.refresh_in
            )));
        }

        let lifetime = Duration::from_secs(response.refresh_in as u64);
        let expires_at = issued_at.checked_add(lifetime).ok_or_else(|| {
            Error::InvalidToken(format!(
                "refresh_in of {}s is out of range",
                response.refresh_in
            ))
        })?;

        Ok(Self {
            value: Secret::new(response.token),
            issued_at,
            expires_at,
            refresh_at: expires_at - SAFETY_MARGIN,
            upstream_expires_at: response.expires_at,
        })
    }

    pub fn value(&self) -> &str {
        self.value.expose()
    }

    /// Time left until the scheduled refresh, zero if already due.
    pub fn refresh_in(&self, now: Instant) -> Duration {
        self.refresh_at.saturating_duration_since(now)
    }

    /// Time left until expiry, zero if already expired.
    pub fn expires_in(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
