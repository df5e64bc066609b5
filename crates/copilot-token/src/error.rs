//! Error types for token management

/// Errors from obtaining an upstream token.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Exchange(#[from] copilot_auth::Error),

    #[error("unusable upstream token: {0}")]
    InvalidToken(String),
}

/// Result alias for token operations.
pub type Result<T> = std::result::Result<T, Error>;
