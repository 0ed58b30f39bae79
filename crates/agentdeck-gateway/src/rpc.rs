//! RPC method policy helpers.

use std::time::Duration;

/// Default timeout for request/response RPCs.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for chat-shaped methods, which may stream model output server-side
/// before replying.
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Method prefixes that get the long chat timeout.
const CHAT_PREFIXES: &[&str] = &["chat.", "agent.", "session."];

/// Per-method request timeout.
pub fn timeout_for_method(method: &str) -> Duration {
    if CHAT_PREFIXES.iter().any(|p| method.starts_with(p)) {
        CHAT_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

/// Returns `true` when a gateway error message signals a revoked or invalid
/// session. Mid-session, this is fatal for the connection.
pub fn is_unauthorized_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unauthorized") || lower.contains("invalid token") || lower.contains("forbidden")
}
