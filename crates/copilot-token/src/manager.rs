//! Token manager: owns the current upstream token
//!
//! The token lives behind `RwLock<Arc<UpstreamToken>>`. A refresh builds the
//! replacement entirely outside the lock, then the write lock is held only
//! for the pointer swap. Readers clone the `Arc` and release immediately, so
//! any number of concurrent `token()` calls never wait on the network.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use common::Secret;
use copilot_auth::{ExchangeResponse, TokenExchanger};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::refresh::spawn_refresh_task;
use crate::token::UpstreamToken;

/// Something that can trade the GitHub credential for an upstream token.
///
/// Uses `Pin<Box<dyn Future>>` so the manager can hold it as a trait object.
pub trait TokenSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<ExchangeResponse>> + Send + 'a>>;
}

impl TokenSource for TokenExchanger {
    fn fetch<'a>(
        &'a self,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<ExchangeResponse>> + Send + 'a>> {
        Box::pin(self.exchange(credential))
    }
}

/// State shared between the manager handle and its refresh task.
pub(crate) struct Shared {
    current: RwLock<Arc<UpstreamToken>>,
    credential: Secret<String>,
    source: Arc<dyn TokenSource>,
}

impl Shared {
    pub(crate) fn load(&self) -> Arc<UpstreamToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn store(&self, token: UpstreamToken) {
        let token = Arc::new(token);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub(crate) async fn exchange(&self) -> Result<UpstreamToken> {
        exchange(self.source.as_ref(), &self.credential).await
    }
}

async fn exchange(source: &dyn TokenSource, credential: &Secret<String>) -> Result<UpstreamToken> {
    let response = source.fetch(credential.expose()).await?;
    UpstreamToken::from_exchange(response, Instant::now())
}

/// Owner of the upstream token and its background refresh task.
///
/// Construct with `start`, share behind an `Arc`, stop with `close`.
/// Dropping the manager also stops the task.
pub struct TokenManager {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    /// Exchange `credential` once and start the refresh task.
    ///
    /// Fails, and no task is spawned, if the initial exchange fails: the
    /// proxy must never serve without a token.
    pub async fn start(credential: Secret<String>, source: Arc<dyn TokenSource>) -> Result<Self> {
        let initial = exchange(source.as_ref(), &credential).await?;
        info!(
            refresh_in_secs = initial.refresh_in(Instant::now()).as_secs(),
            "upstream token acquired"
        );

        let shared = Arc::new(Shared {
            current: RwLock::new(Arc::new(initial)),
            credential,
            source,
        });
        let shutdown = CancellationToken::new();
        let task = spawn_refresh_task(shared.clone(), shutdown.clone());

        Ok(Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Current upstream token value. Never blocks on I/O and never empty.
    pub fn token(&self) -> String {
        self.shared.load().value().to_owned()
    }

    /// Snapshot of the current token with its schedule.
    pub fn current(&self) -> Arc<UpstreamToken> {
        self.shared.load()
    }

    /// Stop the refresh task and wait for it to exit.
    ///
    /// Returns promptly even mid-sleep or mid-exchange. The last token stays
    /// readable afterwards. Calling again is a no-op.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = handle.await {
            if e.is_panic() {
                warn!(error = %e, "token refresh task panicked");
            }
        }
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
