//! # agentdeck-core - Core Domain Types
//!
//! Foundation crate for agentdeck. Provides the error taxonomy, the gateway
//! wire-protocol types and pending-request tracker, the engine event model,
//! and logging initialization.
//!
//! This crate has **zero internal dependencies** -- it only depends on
//! external crates (serde, thiserror, tokio, tracing).
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use agentdeck_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod protocol;

/// Prelude for common imports used throughout all agentdeck crates
pub mod prelude {
    pub use super::error::{Error, Result};
    pub use tracing::{debug, error, info, trace, warn};
}

pub use error::{Error, Result};
pub use events::{ConnectionState, EngineEvent};
pub use protocol::{
    next_correlation_id, parse_frame, response_to_result, ErrorBody, EventFrame, GatewayFrame,
    RequestFrame, RequestTracker, ResponseFrame, ShutdownNotice, SHUTDOWN_EVENT,
};
