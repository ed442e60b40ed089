//! Error types for Parley
//!
//! `ParleyError` is the application-level error shared by every crate.
//! Binary entry points wrap it in `anyhow`.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum ParleyError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}
