//! Error types for device authorization and token exchange

/// Errors from GitHub authentication operations.
///
/// Device flow failures (`DeviceCode`, `Expired`, `AccessDenied`, `Cancelled`)
/// end the authentication command. Exchange failures (`ExchangeStatus`,
/// `TokenExchange`) abort startup but are retried by a running token manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("device authorization failed: {0}")]
    DeviceCode(String),

    #[error("device code expired before authorization completed")]
    Expired,

    #[error("authorization was denied by the user")]
    AccessDenied,

    #[error("device authorization cancelled")]
    Cancelled,

    #[error("token exchange returned {status}: {body}")]
    ExchangeStatus { status: u16, body: String },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
