//! Background refresh loop
//!
//! Sleeps until the current token's `refresh_at`, exchanges, swaps. Only one
//! exchange is ever in flight because the loop awaits each one before
//! scheduling the next.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::Shared;

/// Delay before retrying after a failed refresh.
pub const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(15);

pub(crate) fn spawn_refresh_task(shared: Arc<Shared>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = shared.load().refresh_at;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep_until(next) => {}
            }

            // A refresh still in flight at shutdown is abandoned
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                r = shared.exchange() => r,
            };

            next = match outcome {
                Ok(token) => {
                    let refresh_at = token.refresh_at;
                    info!(
                        refresh_in_secs = token.refresh_in(Instant::now()).as_secs(),
                        upstream_expires_at = token.upstream_expires_at,
                        "upstream token refreshed"
                    );
                    shared.store(token);
                    metrics::counter!("copilot_token_refresh_total", "result" => "success")
                        .increment(1);
                    refresh_at
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = REFRESH_RETRY_DELAY.as_secs(),
                        "upstream token refresh failed, keeping current token"
                    );
                    metrics::counter!("copilot_token_refresh_total", "result" => "failure")
                        .increment(1);
                    Instant::now() + REFRESH_RETRY_DELAY
                }
            };
        }

        debug!("token refresh task stopped");
    })
}
