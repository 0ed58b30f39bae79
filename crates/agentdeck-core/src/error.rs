//! Application error types with rich context

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Engine Location/Spawn Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Agent engine not found. Install the engine or add it to your PATH.")]
    EngineNotFound,

    #[error("Failed to spawn engine process: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Engine process error: {message}")]
    Process { message: String },

    // ─────────────────────────────────────────────────────────────
    // Authentication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Gateway authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Gateway rejected the device identity")]
    IdentityMismatch,

    #[error("Gateway returned an unauthorized response: {message}")]
    Unauthorized { message: String },

    #[error("Device key error: {message}")]
    Crypto { message: String },

    // ─────────────────────────────────────────────────────────────
    // Transport/Request Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Request '{method}' timed out after {seconds}s")]
    RequestTimeout { method: String, seconds: u64 },

    #[error("Secure gateway link is disconnected")]
    Disconnected,

    #[error("Gateway protocol error: {message}")]
    Protocol { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to write configuration {}: {reason}", path.display())]
    ConfigWrite { path: PathBuf, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    // ─────────────────────────────────────────────────────────────
    // Shared initialization outcome
    // ─────────────────────────────────────────────────────────────
    /// An error observed through a shared initialization future. Concurrent
    /// callers all receive the same underlying failure.
    #[error(transparent)]
    Shared(#[from] Arc<Error>),
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn request_timeout(method: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::RequestTimeout {
            method: method.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Check if this is a recoverable error.
    ///
    /// Recoverable errors leave the application running; the caller may retry
    /// after conditions change (engine installed, gateway back up, ...).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::EngineNotFound
            | Error::IdentityMismatch
            | Error::RequestTimeout { .. }
            | Error::Disconnected
            | Error::ConfigWrite { .. }
            | Error::Protocol { .. } => true,
            Error::Shared(inner) => inner.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this error is fatal to the initialization attempt that
    /// produced it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::AuthFailed { .. } | Error::Unauthorized { .. } | Error::ProcessSpawn { .. } => {
                true
            }
            Error::Shared(inner) => inner.is_fatal(),
            _ => false,
        }
    }
}
