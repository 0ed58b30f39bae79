//! Engine event model pushed to subscribers.

use serde_json::Value;

/// Current state of the gateway connection.
///
/// Exactly one instance per supervisor; transitions are driven by the
/// transport's background task and never by concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not attempting to connect.
    Idle,
    /// Socket connection attempt in progress.
    Connecting,
    /// Socket open, authentication handshake outstanding.
    Authenticating,
    /// Authenticated and ready to exchange frames.
    Connected,
    /// Connection lost or closed.
    Disconnected,
    /// A reconnect timer is pending.
    ReconnectScheduled {
        /// Consecutive reconnect schedulings since the last success (1-based).
        attempt: u32,
    },
}

/// Events delivered to supervisor subscribers, independent of any request.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An event frame forwarded from the gateway.
    Gateway {
        event: String,
        payload: Option<Value>,
    },
    /// A synthetic failure extracted from the engine's stderr. The engine
    /// does not always surface these as protocol events.
    AgentFailure { message: String },
    /// The engine process exited.
    ProcessExited { code: Option<i32> },
    /// The transport connection state changed.
    ConnectionChanged(ConnectionState),
}
