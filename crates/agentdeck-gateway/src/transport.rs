//! Authenticated WebSocket client for the engine gateway.
//!
//! The [`GatewayClient`] dials the local gateway, completes the device-auth
//! handshake before returning, then hands the socket to a background task
//! that correlates request/response frames, fans out events, and reconnects
//! with restart-aware exponential backoff.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       GatewayClient                          │
//! │                                                              │
//! │  ┌──────────────┐        ┌───────────────────────────────┐  │
//! │  │  GatewayHandle│        │   Background Task             │  │
//! │  │              │        │                               │  │
//! │  │  request() ──┼──cmd──▶│  WebSocket read/write loop    │  │
//! │  │              │  chan  │                               │  │
//! │  │  state()   ◀─┼────────│  Route: response → tracker    │  │
//! │  │              │        │         event → broadcast     │  │
//! │  └──────────────┘        └───────────────────────────────┘  │
//! │                                                              │
//! │  RequestTracker correlates ids with response receivers;      │
//! │  entries are registered only after the frame hits the wire.  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use agentdeck_core::events::{ConnectionState, EngineEvent};
use agentdeck_core::prelude::*;
use agentdeck_core::protocol::{
    next_correlation_id, parse_frame, GatewayFrame, RequestFrame, RequestTracker,
};

use crate::identity::{is_identity_mismatch, ClaimParams, IdentityStore};
use crate::rpc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Initial reconnection backoff duration.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum reconnection backoff duration (cap).
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum number of consecutive reconnection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Capacity of the command channel (bounded, to apply backpressure).
const CMD_CHANNEL_CAPACITY: usize = 32;

/// Timeout for the whole authentication handshake.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on the restart hint a shutdown notice can impose. A buggy or
/// hostile gateway must not be able to stall reconnection arbitrarily.
const RESTART_HINT_CAP: Duration = Duration::from_secs(15);

/// Slack added on top of the announced restart window, so we redial just
/// after the gateway expects to be back rather than just before.
const RESTART_HINT_SLOP: Duration = Duration::from_millis(400);

/// How often to sweep timed-out pending requests in the I/O loop.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Everything needed to dial and authenticate against the gateway.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub token: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

impl ConnectOptions {
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }
}

/// Internal messages sent from the public API to the background task.
enum ClientCommand {
    /// Send a request frame and deliver the outcome to `response_tx`.
    SendRequest {
        method: String,
        params: Option<Value>,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    /// Gracefully close the WebSocket and stop the background task.
    Disconnect,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A clonable handle for making gateway RPC requests.
///
/// Shares the underlying WebSocket with the [`GatewayClient`] that created
/// it. The handle becomes inoperable when the background task exits; requests
/// then return [`Error::ChannelClosed`].
#[derive(Clone)]
pub struct GatewayHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    state: Arc<std::sync::RwLock<ConnectionState>>,
}

impl std::fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner()).clone();
        f.debug_struct("GatewayHandle")
            .field("connection_state", &state)
            .finish()
    }
}

impl GatewayHandle {
    /// Send a request and wait for its response.
    ///
    /// The per-method timeout is enforced by the I/O task's deadline sweep,
    /// so the pending slot is cleared exactly once even when the caller gives
    /// up early.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the background task has exited.
    /// - [`Error::Disconnected`] if the link dropped while the request was
    ///   in flight.
    /// - [`Error::RequestTimeout`] if no response arrived in time.
    /// - [`Error::Protocol`] for gateway-reported errors.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();

        self.cmd_tx
            .send(ClientCommand::SendRequest {
                method: method.to_string(),
                params,
                timeout: rpc::timeout_for_method(method),
                response_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        response_rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read().unwrap_or_else(|e| e.into_inner()) == ConnectionState::Connected
    }

    /// A handle backed by a disconnected dummy channel, for unit tests.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn new_for_test(state: ConnectionState) -> Self {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        Self {
            cmd_tx,
            state: Arc::new(std::sync::RwLock::new(state)),
        }
    }
}

/// Authenticated client connection to the engine gateway.
///
/// Create with [`GatewayClient::connect`]; extract a clonable
/// [`GatewayHandle`] with [`GatewayClient::handle`] for concurrent callers.
pub struct GatewayClient {
    handle: GatewayHandle,
}

impl GatewayClient {
    /// Dial the gateway, authenticate, and spawn the background I/O task.
    ///
    /// Does not return until the handshake has completed, so a successful
    /// return means the link is live and authorized. Events observed during
    /// the handshake are forwarded to `events` rather than dropped.
    ///
    /// On a device-identity mismatch the identity is rotated and the dial
    /// retried exactly once; a second rejection is surfaced as
    /// [`Error::AuthFailed`].
    pub async fn connect(
        opts: ConnectOptions,
        identity: Arc<IdentityStore>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(CMD_CHANNEL_CAPACITY);
        let state = Arc::new(std::sync::RwLock::new(ConnectionState::Connecting));
        publish_state(&state, &events, ConnectionState::Connecting);

        let ws_stream = dial_and_auth(&opts, &identity, &events, &state).await?;
        publish_state(&state, &events, ConnectionState::Connected);

        tokio::spawn(run_client_task(
            opts,
            identity,
            ws_stream,
            cmd_rx,
            events,
            Arc::clone(&state),
        ));

        Ok(Self {
            handle: GatewayHandle { cmd_tx, state },
        })
    }

    /// A clonable request handle sharing this client's connection.
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.handle.request(method, params).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.handle.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Gracefully close the connection and stop the background task.
    pub async fn disconnect(&self) {
        // If the channel is already closed the task has already exited.
        let _ = self.handle.cmd_tx.send(ClientCommand::Disconnect).await;
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Dial the gateway and run the handshake, rotating the device identity at
/// most once if the gateway reports an identity mismatch.
async fn dial_and_auth(
    opts: &ConnectOptions,
    identity: &Arc<IdentityStore>,
    events: &broadcast::Sender<EngineEvent>,
    state: &Arc<std::sync::RwLock<ConnectionState>>,
) -> Result<WsStream> {
    let mut rotated = false;

    loop {
        let mut ws_stream = connect_ws(&opts.ws_url()).await?;
        publish_state(state, events, ConnectionState::Authenticating);

        match authenticate(&mut ws_stream, opts, identity, events).await {
            Ok(()) => return Ok(ws_stream),
            Err(Error::IdentityMismatch) if !rotated => {
                // One rotation per connection attempt; a second mismatch
                // means the server-side trust store is disagreeing for a
                // reason a fresh key will not fix.
                rotated = true;
                identity.rotate()?;
                let _ = ws_stream.close(None).await;
            }
            Err(Error::IdentityMismatch) => {
                // Rotation already happened once this attempt; a repeat
                // rejection is terminal.
                let _ = ws_stream.close(None).await;
                return Err(Error::auth_failed(
                    "gateway rejected the device identity after rotation",
                ));
            }
            Err(err) => {
                let _ = ws_stream.close(None).await;
                return Err(err);
            }
        }
    }
}

/// Run the authentication handshake on a freshly-opened socket.
///
/// Sends a `connect` request carrying the bearer token and a signed device
/// claim, then reads frames until the matching response arrives. Event frames
/// seen mid-handshake are forwarded, not discarded.
async fn authenticate(
    ws_stream: &mut WsStream,
    opts: &ConnectOptions,
    identity: &Arc<IdentityStore>,
    events: &broadcast::Sender<EngineEvent>,
) -> Result<()> {
    let claim = identity.build_claim(&ClaimParams {
        client_id: opts.client_id.clone(),
        client_mode: opts.client_mode.clone(),
        role: opts.role.clone(),
        scopes: opts.scopes.clone(),
        token: opts.token.clone(),
        nonce: Some(Uuid::new_v4().to_string()),
    })?;

    let auth_id = format!("connect-{}", Uuid::new_v4());
    let request = RequestFrame::new(
        auth_id.clone(),
        "connect",
        Some(json!({
            "token": opts.token,
            "clientId": opts.client_id,
            "clientMode": opts.client_mode,
            "role": opts.role,
            "scopes": opts.scopes,
            "minProtocol": opts.min_protocol,
            "maxProtocol": opts.max_protocol,
            "device": claim,
        })),
    );

    let frame = serde_json::to_string(&request)?;
    ws_stream
        .send(WsMessage::Text(frame.into()))
        .await
        .map_err(|e| Error::auth_failed(format!("failed to send connect request: {e}")))?;

    let deadline = tokio::time::sleep(AUTH_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match parse_frame(text.as_str()) {
                            GatewayFrame::Response(response)
                                if response.id.as_deref() == Some(auth_id.as_str()) =>
                            {
                                if response.ok {
                                    info!("gateway handshake completed");
                                    return Ok(());
                                }
                                let message = response.error_message().to_string();
                                return if is_identity_mismatch(&message) {
                                    Err(Error::IdentityMismatch)
                                } else {
                                    Err(Error::auth_failed(message))
                                };
                            }
                            GatewayFrame::Response(response) => {
                                debug!(
                                    "ignoring response for unknown id {:?} during handshake",
                                    response.id
                                );
                            }
                            GatewayFrame::Event(event) => {
                                let _ = events.send(EngineEvent::Gateway {
                                    event: event.event,
                                    payload: event.payload,
                                });
                            }
                            GatewayFrame::Unknown(raw) => {
                                debug!(
                                    "ignoring unknown frame during handshake: {}",
                                    &raw[..raw.len().min(120)]
                                );
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Err(Error::Disconnected);
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary
                    }
                    Some(Err(err)) => {
                        return Err(Error::auth_failed(format!("socket error: {err}")));
                    }
                }
            }
            _ = &mut deadline => {
                return Err(Error::auth_failed(format!(
                    "no handshake response within {}s",
                    AUTH_TIMEOUT.as_secs()
                )));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

/// What ended one connection's I/O loop.
enum IoExit {
    /// Connection lost unexpectedly; caller should reconnect. Carries the
    /// redial floor derived from a shutdown notice, if one was seen.
    Reconnect { hint: Option<Instant> },
    /// Disconnect command or dropped client; terminate cleanly.
    Shutdown,
    /// The gateway revoked our session mid-stream. Do not reconnect.
    Fatal,
}

/// Entry point for the background I/O task.
///
/// Takes the already-authenticated socket for the first connection, then owns
/// reconnection (including re-authentication) on unexpected disconnects.
async fn run_client_task(
    opts: ConnectOptions,
    identity: Arc<IdentityStore>,
    ws_stream: WsStream,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    events: broadcast::Sender<EngineEvent>,
    state: Arc<std::sync::RwLock<ConnectionState>>,
) {
    let mut tracker = RequestTracker::new();

    let exit = run_io_loop(ws_stream, &mut cmd_rx, &events, &mut tracker).await;
    tracker.cancel_all();

    let mut hint = match exit {
        IoExit::Reconnect { hint } => hint,
        IoExit::Shutdown | IoExit::Fatal => {
            publish_state(&state, &events, ConnectionState::Disconnected);
            return;
        }
    };

    // Connection lost unexpectedly. Retry with backoff, floored by any
    // restart hint the gateway announced before going away.
    let mut attempt: u32 = 1;
    loop {
        if attempt > MAX_RECONNECT_ATTEMPTS {
            error!("exceeded {MAX_RECONNECT_ATTEMPTS} reconnection attempts, giving up");
            publish_state(&state, &events, ConnectionState::Disconnected);
            break;
        }

        publish_state(&state, &events, ConnectionState::ReconnectScheduled { attempt });

        let delay = reconnect_delay(attempt, hint.take());
        warn!(
            "gateway link lost, retrying in {:?} (attempt {}/{})",
            delay, attempt, MAX_RECONNECT_ATTEMPTS
        );
        tokio::time::sleep(delay).await;

        // The client was dropped while we slept; stop retrying.
        if cmd_rx.is_closed() {
            publish_state(&state, &events, ConnectionState::Disconnected);
            break;
        }

        publish_state(&state, &events, ConnectionState::Connecting);
        match dial_and_auth(&opts, &identity, &events, &state).await {
            Ok(ws_stream) => {
                info!("gateway link re-established (attempt {attempt})");
                publish_state(&state, &events, ConnectionState::Connected);
                attempt = 1; // reset on success

                let exit = run_io_loop(ws_stream, &mut cmd_rx, &events, &mut tracker).await;
                tracker.cancel_all();

                match exit {
                    IoExit::Reconnect { hint: next_hint } => hint = next_hint,
                    IoExit::Shutdown | IoExit::Fatal => {
                        publish_state(&state, &events, ConnectionState::Disconnected);
                        break;
                    }
                }
            }
            Err(err) if err.is_fatal() => {
                error!("reconnection aborted: {err}");
                publish_state(&state, &events, ConnectionState::Disconnected);
                break;
            }
            Err(err) => {
                warn!("reconnection attempt {attempt} failed: {err}");
                attempt += 1;
            }
        }
    }

    debug!("gateway background task exiting");
}

/// Run one connection's read/write select loop.
async fn run_io_loop(
    ws_stream: WsStream,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    events: &broadcast::Sender<EngineEvent>,
    tracker: &mut RequestTracker,
) -> IoExit {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // The redial floor announced by a shutdown notice, carried out of the
    // loop when the connection drops.
    let mut restart_hint: Option<Instant> = None;

    let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
    sweep_interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            // ── Incoming WebSocket message ───────────────────────────────
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match handle_ws_text(text.as_str(), tracker, events, &mut restart_hint) {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Fatal => return IoExit::Fatal,
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("gateway sent Close frame");
                        return IoExit::Reconnect { hint: restart_hint };
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary — ignore
                    }
                    Some(Err(err)) => {
                        warn!("WebSocket read error: {err}");
                        return IoExit::Reconnect { hint: restart_hint };
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        return IoExit::Reconnect { hint: restart_hint };
                    }
                }
            }

            // ── Outgoing command from the public API ─────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::SendRequest { method, params, timeout, response_tx }) => {
                        handle_send_request(
                            &method,
                            params,
                            timeout,
                            response_tx,
                            tracker,
                            &mut ws_sink,
                        )
                        .await;
                    }
                    Some(ClientCommand::Disconnect) => {
                        send_close(&mut ws_sink).await;
                        return IoExit::Shutdown;
                    }
                    None => {
                        debug!("command channel closed, shutting down");
                        send_close(&mut ws_sink).await;
                        return IoExit::Shutdown;
                    }
                }
            }

            // ── Periodic pending-request deadline sweep ──────────────────
            _ = sweep_interval.tick() => {
                let expired = tracker.sweep_expired();
                for (id, method) in &expired {
                    warn!("request {id} ({method}) timed out waiting for the gateway");
                }
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    Fatal,
}

/// Route an incoming text frame to the tracker or event subscribers.
fn handle_ws_text(
    text: &str,
    tracker: &mut RequestTracker,
    events: &broadcast::Sender<EngineEvent>,
    restart_hint: &mut Option<Instant>,
) -> FrameOutcome {
    match parse_frame(text) {
        GatewayFrame::Response(response) => {
            if !response.ok && rpc::is_unauthorized_message(response.error_message()) {
                // The session was revoked mid-stream. Reconnecting with the
                // same credentials would loop forever against a closed door.
                if let Some(id) = response.id.as_deref() {
                    tracker.fail(id, Error::unauthorized(response.error_message()));
                }
                error!("gateway revoked the session, tearing the link down");
                return FrameOutcome::Fatal;
            }
            if let Some(id) = response.id.clone() {
                if !tracker.complete(&id, response) {
                    debug!("received response for unknown request id {id}");
                }
            }
        }
        GatewayFrame::Event(event) => {
            if let Some(notice) = event.shutdown_notice() {
                let wait = Duration::from_millis(notice.restart_expected_ms.unwrap_or(0))
                    .min(RESTART_HINT_CAP)
                    + RESTART_HINT_SLOP;
                debug!("gateway announced shutdown, flooring next redial at {wait:?}");
                *restart_hint = Some(Instant::now() + wait);
            }
            let _ = events.send(EngineEvent::Gateway {
                event: event.event,
                payload: event.payload,
            });
        }
        GatewayFrame::Unknown(raw) => {
            debug!("ignoring unknown frame: {}", &raw[..raw.len().min(120)]);
        }
    }

    FrameOutcome::Continue
}

/// Serialize a request, write it to the socket, then register the pending
/// slot. The ordering is deliberate: a slot must never exist for a frame that
/// was not actually written, so a failed write surfaces as an immediate error
/// rather than a dangling timeout.
async fn handle_send_request(
    method: &str,
    params: Option<Value>,
    timeout: Duration,
    response_tx: oneshot::Sender<Result<Value>>,
    tracker: &mut RequestTracker,
    ws_sink: &mut SplitSink<WsStream, WsMessage>,
) {
    let id = next_correlation_id();
    let request = RequestFrame::new(id.clone(), method, params);

    let frame = match serde_json::to_string(&request) {
        Ok(f) => f,
        Err(err) => {
            let _ = response_tx.send(Err(Error::protocol(format!(
                "failed to serialize request: {err}"
            ))));
            return;
        }
    };

    if let Err(err) = ws_sink.send(WsMessage::Text(frame.into())).await {
        warn!("failed to send request {id} ({method}): {err}");
        let _ = response_tx.send(Err(Error::Disconnected));
        return;
    }

    tracker.insert(id, method, timeout, response_tx);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn connect_ws(ws_url: &str) -> Result<WsStream> {
    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .map_err(|err| Error::process(format!("failed to connect to gateway: {err}")))?;
    Ok(ws_stream)
}

/// Compute the delay before reconnection attempt `n`.
///
/// The exponential term is `INITIAL_BACKOFF * 2^(n-1)` capped at
/// `MAX_BACKOFF`; a restart hint from a shutdown notice raises the floor so
/// we do not hammer a gateway that told us when it will be back.
fn reconnect_delay(attempt: u32, hint: Option<Instant>) -> Duration {
    let backoff = compute_backoff(attempt);
    let floor = hint
        .map(|at| at.saturating_duration_since(Instant::now()))
        .unwrap_or(Duration::ZERO);
    backoff.max(floor)
}

/// Exponential backoff for attempt `n`: `INITIAL_BACKOFF * 2^(n-1)`, capped.
fn compute_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier: u64 = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let secs = INITIAL_BACKOFF.as_secs().saturating_mul(multiplier);
    Duration::from_secs(secs.min(MAX_BACKOFF.as_secs()))
}

/// Send a Close frame, ignoring write errors.
async fn send_close(ws_sink: &mut SplitSink<WsStream, WsMessage>) {
    let _ = ws_sink.send(WsMessage::Close(None)).await;
    let _ = ws_sink.close().await;
}

/// Publish a connection-state transition to the shared slot and subscribers.
fn publish_state(
    state: &Arc<std::sync::RwLock<ConnectionState>>,
    events: &broadcast::Sender<EngineEvent>,
    new_state: ConnectionState,
) {
    {
        let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
        if *guard == new_state {
            return;
        }
        *guard = new_state.clone();
    }
    let _ = events.send(EngineEvent::ConnectionChanged(new_state));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
