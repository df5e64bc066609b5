//! Common types for the Copilot API proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
