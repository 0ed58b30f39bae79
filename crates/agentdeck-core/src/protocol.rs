//! Wire protocol types for the engine gateway socket.
//!
//! The gateway speaks a small JSON frame protocol over WebSocket. Three frame
//! shapes exist: requests (`type:"req"`), responses (`type:"res"`), and
//! unsolicited events (`type:"event"`, no `id`). This module defines the typed
//! frames, the inbound-frame parser, and the pending-request tracker that
//! correlates responses with their originating requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Event name the gateway sends just before an intentional restart.
pub const SHUTDOWN_EVENT: &str = "shutdown";

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

/// Outbound request frame.
#[derive(Debug, Serialize)]
pub struct RequestFrame {
    /// Always `"req"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Correlation id echoed back in the matching response.
    pub id: String,
    /// Method name, e.g. `"models.list"` or `"chat.send"`.
    pub method: String,
    /// Optional method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn new(id: String, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            kind: "req",
            id,
            method: method.into(),
            params,
        }
    }
}

/// Inbound response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    /// The id matching the original request.
    pub id: Option<String>,
    /// Whether the request succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Successful result payload.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Error body, present when `ok` is false.
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    /// Error message from a failed response, or an empty string.
    pub fn error_message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    /// Additional fields the gateway may attach, kept untyped.
    #[serde(flatten)]
    pub extra: Value,
}

/// Inbound event frame (no `id`; pushed to subscribers unconditionally).
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    /// Event name, e.g. `"agent.output"` or the reserved `"shutdown"`.
    pub event: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl EventFrame {
    /// Parse the reserved `shutdown` event payload, if this is one.
    pub fn shutdown_notice(&self) -> Option<ShutdownNotice> {
        if self.event != SHUTDOWN_EVENT {
            return None;
        }
        let payload = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(payload).ok()
    }
}

/// Payload of the reserved `shutdown` event.
///
/// `restartExpectedMs` announces how soon the gateway expects to be back; the
/// transport uses it to floor the next reconnect delay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownNotice {
    #[serde(default)]
    pub restart_expected_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Parsed frame discriminant
// ---------------------------------------------------------------------------

/// The result of parsing a raw gateway WebSocket text frame.
#[derive(Debug)]
pub enum GatewayFrame {
    /// A response to a request we sent.
    Response(ResponseFrame),
    /// An unsolicited event.
    Event(EventFrame),
    /// A frame we could not interpret.
    Unknown(String),
}

/// Parse a raw WebSocket text message into a typed [`GatewayFrame`].
///
/// Dispatch is on the top-level `"type"` tag: `"res"` frames carry an `id`
/// and resolve a pending request, `"event"` frames carry no id and fan out to
/// subscribers. Anything else is [`GatewayFrame::Unknown`].
pub fn parse_frame(text: &str) -> GatewayFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return GatewayFrame::Unknown(text.to_string()),
    };

    match value.get("type").and_then(Value::as_str) {
        Some("res") => match serde_json::from_value::<ResponseFrame>(value) {
            Ok(response) => GatewayFrame::Response(response),
            Err(_) => GatewayFrame::Unknown(text.to_string()),
        },
        Some("event") => match serde_json::from_value::<EventFrame>(value) {
            Ok(event) => GatewayFrame::Event(event),
            Err(_) => GatewayFrame::Unknown(text.to_string()),
        },
        _ => GatewayFrame::Unknown(text.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Request tracker
// ---------------------------------------------------------------------------

/// Global monotonically-increasing counter for correlation ids.
static CORRELATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique correlation id string.
pub fn next_correlation_id() -> String {
    CORRELATION_ID_COUNTER
        .fetch_add(1, Ordering::SeqCst)
        .to_string()
}

/// A registered pending request waiting for a gateway response.
struct PendingRequest {
    /// Channel half used to deliver the outcome to the caller.
    response_tx: oneshot::Sender<Result<Value>>,
    /// Absolute deadline after which the janitor sweep cancels the request.
    deadline: Instant,
    /// Originating method, for logging and timeout errors.
    method: String,
    /// The configured timeout, echoed in the timeout error.
    timeout_secs: u64,
}

/// Tracks in-flight requests and matches them to responses.
///
/// Owned exclusively by the transport's I/O task; an entry is cleared exactly
/// once, by whichever of {matching response, deadline sweep, bulk cancel}
/// happens first. Entries are inserted only after the request frame has been
/// written to the socket.
pub struct RequestTracker {
    pending: HashMap<String, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Register a pending slot for an already-sent request.
    pub fn insert(
        &mut self,
        id: String,
        method: impl Into<String>,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<Value>>,
    ) {
        self.pending.insert(
            id,
            PendingRequest {
                response_tx,
                deadline: Instant::now() + timeout,
                method: method.into(),
                timeout_secs: timeout.as_secs(),
            },
        );
    }

    /// Deliver a response to its waiting caller.
    ///
    /// Returns `true` if `id` was found in the pending map, `false` if no
    /// matching pending request exists (late response after timeout, or a
    /// response we never asked for).
    pub fn complete(&mut self, id: &str, response: ResponseFrame) -> bool {
        if let Some(pending) = self.pending.remove(id) {
            // The receiver may have been dropped by a caller-side timeout;
            // ignore the send error.
            let _ = pending.response_tx.send(response_to_result(response));
            true
        } else {
            false
        }
    }

    /// Fail a pending request with a specific error instead of a response.
    ///
    /// Returns `true` if `id` was found in the pending map.
    pub fn fail(&mut self, id: &str, err: Error) -> bool {
        if let Some(pending) = self.pending.remove(id) {
            let _ = pending.response_tx.send(Err(err));
            true
        } else {
            false
        }
    }

    /// Reject every pending request with [`Error::Disconnected`].
    ///
    /// Invoked on voluntary shutdown or confirmed disconnect so no caller is
    /// left hanging.
    pub fn cancel_all(&mut self) {
        for (_, req) in self.pending.drain() {
            let _ = req.response_tx.send(Err(Error::Disconnected));
        }
    }

    /// Remove and fail all requests whose deadline has passed.
    ///
    /// Returns `(id, method)` pairs of the removed requests.
    pub fn sweep_expired(&mut self) -> Vec<(String, String)> {
        let now = Instant::now();

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, req)| now >= req.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(req) = self.pending.remove(&id) {
                let _ = req.response_tx.send(Err(Error::RequestTimeout {
                    method: req.method.clone(),
                    seconds: req.timeout_secs,
                }));
                removed.push((id, req.method));
            }
        }

        removed
    }

    /// Number of currently pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a [`ResponseFrame`] into the caller-facing result.
pub fn response_to_result(response: ResponseFrame) -> Result<Value> {
    if response.ok {
        Ok(response.payload.unwrap_or(Value::Null))
    } else {
        let message = response.error_message();
        if message.is_empty() {
            Err(Error::protocol("gateway response carried no error body"))
        } else {
            Err(Error::protocol(message))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
