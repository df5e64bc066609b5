//! Copilot upstream token lifecycle
//!
//! `TokenManager` owns the short-lived Copilot token derived from a GitHub
//! credential. It performs one exchange at construction, then refreshes the
//! token in a background task shortly before it expires. Readers never wait
//! on the network: `token()` returns the last good value under a read lock.
//!
//! Lifecycle:
//! 1. `TokenManager::start()` exchanges once; failure means no manager
//! 2. The refresh task sleeps until `refresh_at`, exchanges, swaps the token
//! 3. A failed refresh keeps the old token and retries after a fixed delay
//! 4. `close()` stops the task promptly; the last token stays readable

pub mod error;
pub mod manager;
mod refresh;
pub mod token;

pub use error::{Error, Result};
pub use manager::{TokenManager, TokenSource};
pub use refresh::REFRESH_RETRY_DELAY;
pub use token::{SAFETY_MARGIN, UpstreamToken};
