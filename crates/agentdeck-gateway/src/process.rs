//! Engine process supervision.
//!
//! A handle is either managed (we spawned the engine and own its lifetime)
//! or adopted (an engine was already serving the gateway port when we
//! started). Adopted processes are never signaled on shutdown.

use std::net::TcpStream;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, oneshot, Notify};

use agentdeck_core::events::EngineEvent;
use agentdeck_core::prelude::*;

use crate::classifier::{LineSignal, LogClassifier};
use crate::launcher::platform_launcher;
use crate::locator::EngineEntry;

/// How long to wait for the gateway-listening line before proceeding anyway.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns `true` when something already accepts connections on the port.
pub fn port_in_use(port: u16) -> bool {
    TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(300),
    )
    .is_ok()
}

/// A supervised engine process.
pub struct EngineProcessHandle {
    managed: bool,
    pid: Option<u32>,
    port: u16,
    /// The gateway token the process was launched against. `None` for
    /// adopted processes, whose secrets we do not control.
    launch_token: Option<String>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl EngineProcessHandle {
    /// Adopt an engine that is already serving the gateway port.
    pub fn adopted(port: u16) -> Self {
        info!("adopting external engine already listening on port {port}");
        Self {
            managed: false,
            pid: None,
            port,
            launch_token: None,
            kill_tx: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
            exit_notify: Arc::new(Notify::new()),
        }
    }

    /// Spawn the engine in gateway mode and wait for its readiness signal.
    ///
    /// Readiness is best effort. If the listening line never appears within
    /// the window we proceed and let the connection attempt decide.
    pub async fn spawn(
        entry: &EngineEntry,
        port: u16,
        token: &str,
        events: broadcast::Sender<EngineEvent>,
    ) -> Result<Self> {
        let args = vec![
            "gateway".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];

        info!(path = %entry.path.display(), port, "spawning engine gateway process");

        let launcher = platform_launcher();
        let mut cmd = launcher.command(entry, &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::EngineNotFound
            } else {
                Error::ProcessSpawn {
                    reason: e.to_string(),
                }
            }
        })?;

        let pid = child.id();
        info!("engine process started with PID: {:?}", pid);

        let (ready_tx, ready_rx) = oneshot::channel::<Option<u16>>();
        let ready_slot = Arc::new(Mutex::new(Some(ready_tx)));

        let stdout = child.stdout.take().expect("stdout was configured");
        tokio::spawn(Self::output_reader(
            BufReader::new(stdout).lines(),
            "stdout",
            events.clone(),
            ready_slot.clone(),
        ));

        let stderr = child.stderr.take().expect("stderr was configured");
        tokio::spawn(Self::output_reader(
            BufReader::new(stderr).lines(),
            "stderr",
            events.clone(),
            ready_slot,
        ));

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            exited.clone(),
            exit_notify.clone(),
            events,
        ));

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(reported)) => {
                debug!("engine reported gateway listening (port hint: {reported:?})");
            }
            Ok(Err(_)) => {
                warn!("engine output closed before the gateway reported readiness");
            }
            Err(_) => {
                warn!(
                    "no readiness signal within {}s, proceeding to connect anyway",
                    READY_TIMEOUT.as_secs()
                );
            }
        }

        Ok(Self {
            managed: true,
            pid,
            port,
            launch_token: Some(token.to_string()),
            kill_tx: Mutex::new(Some(kill_tx)),
            exited,
            exit_notify,
        })
    }

    /// A managed handle that owns no real child, for supervisor tests.
    #[cfg(test)]
    pub(crate) fn managed_for_test(port: u16, token: &str) -> Self {
        Self {
            managed: true,
            pid: None,
            port,
            launch_token: Some(token.to_string()),
            kill_tx: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
            exit_notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The token a managed process was spawned against, `None` when adopted.
    pub fn launch_token(&self) -> Option<&str> {
        self.launch_token.as_deref()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Wait until the managed process exits. Returns immediately for adopted
    /// processes that were already observed dead.
    pub async fn wait_exited(&self) {
        if self.has_exited() {
            return;
        }
        self.exit_notify.notified().await;
    }

    /// Stop the process if we own it. Adopted engines are left running.
    pub fn stop(&self) {
        if !self.managed {
            debug!("not stopping adopted engine process");
            return;
        }
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = sender {
            info!("stopping managed engine process (pid {:?})", self.pid);
            let _ = tx.send(());
        }
    }

    async fn output_reader(
        mut lines: tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>,
        stream: &'static str,
        events: broadcast::Sender<EngineEvent>,
        ready_slot: Arc<Mutex<Option<oneshot::Sender<Option<u16>>>>>,
    ) {
        let classifier = LogClassifier::new();

        while let Ok(Some(line)) = lines.next_line().await {
            trace!("engine {stream}: {line}");

            match classifier.classify(&line) {
                LineSignal::GatewayListening { port } => {
                    let sender = ready_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                    if let Some(tx) = sender {
                        let _ = tx.send(port);
                    }
                }
                LineSignal::AgentFailure { message } => {
                    warn!("engine reported agent failure: {message}");
                    let _ = events.send(EngineEvent::AgentFailure { message });
                }
                LineSignal::None => {}
            }
        }

        debug!("engine {stream} reader finished");
    }

    /// Wait for process exit or a kill request, then publish the exit.
    async fn wait_for_exit(
        mut child: tokio::process::Child,
        kill_rx: oneshot::Receiver<()>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
        events: broadcast::Sender<EngineEvent>,
    ) {
        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!("failed waiting on engine process: {err}");
                    None
                }
            },
            killed = kill_rx => {
                // A dropped sender means the handle went away without an
                // explicit stop(); the engine must keep running, so only an
                // actual kill request terminates it.
                if killed.is_ok() {
                    debug!("kill requested, terminating engine process");
                    let _ = child.kill().await;
                } else {
                    debug!("handle dropped without stop, leaving engine process running");
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        };

        info!("engine process exited with code {code:?}");
        exited.store(true, Ordering::SeqCst);
        exit_notify.notify_waiters();
        let _ = events.send(EngineEvent::ProcessExited { code });
    }
}
