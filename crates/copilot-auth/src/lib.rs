//! GitHub Copilot authentication library
//!
//! Provides the GitHub device authorization flow, the exchange of a GitHub
//! OAuth token for a short-lived Copilot API token, and persistence of the
//! long-lived GitHub token. This crate has no dependency on the proxy binary
//! and is usable on its own.
//!
//! Credential flow:
//! 1. `DeviceFlow::request_code()` obtains a user code and verification URI
//! 2. The user approves the code in a browser
//! 3. `DeviceFlow::poll_for_token()` returns the GitHub token once approved
//! 4. `CredentialFile::save()` persists it with owner-only permissions
//! 5. `TokenExchanger::exchange()` trades it for a Copilot token, repeatedly,
//!    for as long as the proxy runs

pub mod constants;
pub mod credentials;
pub mod device;
pub mod error;
pub mod exchange;

pub use constants::*;
pub use credentials::CredentialFile;
pub use device::{DeviceCodeSession, DeviceFlow};
pub use error::{Error, Result};
pub use exchange::{ExchangeResponse, TokenExchanger};
