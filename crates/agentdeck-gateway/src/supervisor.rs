//! Engine lifecycle orchestration.
//!
//! The [`EngineSupervisor`] owns the whole chain: locate the engine binary,
//! reconcile its config file, establish the device identity, launch or adopt
//! the gateway process, and authenticate the transport. Initialization is
//! lazy and deduplicated, so any number of concurrent callers trigger at most
//! one launch sequence and all observe its outcome.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use agentdeck_core::events::{ConnectionState, EngineEvent};
use agentdeck_core::prelude::*;

use crate::config::{ConfigPreparer, GatewayDefaults, PreparedConfig};
use crate::fallback::{is_mgmt_method, MgmtExecutor};
use crate::identity::IdentityStore;
use crate::locator::ExecutableLocator;
use crate::process::{port_in_use, EngineProcessHandle};
use crate::transport::{ConnectOptions, GatewayClient};

/// Default local gateway port.
pub const DEFAULT_PORT: u16 = 4517;

/// Capacity of the subscriber broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Protocol range this client speaks.
const MIN_PROTOCOL: u32 = 1;
const MAX_PROTOCOL: u32 = 1;

/// Static configuration of a supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Engine home directory holding the config file and device identity.
    pub home_dir: PathBuf,
    pub port: u16,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// Directory holding a bundled engine build, checked before PATH.
    pub bundled_dir: Option<PathBuf>,
}

impl SupervisorSettings {
    pub fn new(home_dir: PathBuf) -> Self {
        Self {
            home_dir,
            port: DEFAULT_PORT,
            client_id: "agentdeck".to_string(),
            client_mode: "desktop".to_string(),
            role: "operator".to_string(),
            scopes: vec!["chat".to_string(), "mgmt".to_string()],
            bundled_dir: None,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.home_dir.join("config.json")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.home_dir.join("identity").join("device.json")
    }
}

type InitFuture = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// Mutable supervisor state, guarded by one async mutex.
struct Inner {
    process: Option<Arc<EngineProcessHandle>>,
    client: Option<GatewayClient>,
    shutting_down: bool,
}

/// Supervises one engine instance end to end.
pub struct EngineSupervisor {
    settings: SupervisorSettings,
    locator: Arc<ExecutableLocator>,
    identity: Arc<IdentityStore>,
    mgmt: MgmtExecutor,
    events: broadcast::Sender<EngineEvent>,
    inner: Mutex<Inner>,
    /// In-flight initialization, shared between concurrent callers.
    init: Mutex<Option<InitFuture>>,
}

impl EngineSupervisor {
    pub fn new(settings: SupervisorSettings) -> Arc<Self> {
        let locator = Arc::new(ExecutableLocator::new(settings.bundled_dir.clone()));
        let identity = Arc::new(IdentityStore::new(settings.identity_path()));
        let mgmt = MgmtExecutor::new(
            Arc::clone(&locator),
            ConfigPreparer::new(settings.config_path()),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let supervisor = Arc::new(Self {
            settings,
            locator,
            identity,
            mgmt,
            events: events.clone(),
            inner: Mutex::new(Inner {
                process: None,
                client: None,
                shutting_down: false,
            }),
            init: Mutex::new(None),
        });

        tokio::spawn(monitor_events(
            Arc::downgrade(&supervisor),
            events.subscribe(),
        ));

        supervisor
    }

    /// Subscribe to engine events (gateway pushes, agent failures, process
    /// exits, connection transitions).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current transport state, [`ConnectionState::Idle`] before first use.
    pub async fn connection_state(&self) -> ConnectionState {
        let inner = self.inner.lock().await;
        inner
            .client
            .as_ref()
            .map(|c| c.connection_state())
            .unwrap_or(ConnectionState::Idle)
    }

    /// Ensure the engine is running and the gateway link is authenticated.
    ///
    /// Concurrent callers share one launch sequence; every caller observes
    /// the identical outcome. A failed initialization is not cached, so the
    /// next call starts fresh.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let fut = {
            let mut slot = self.init.lock().await;

            {
                let inner = self.inner.lock().await;
                if inner.shutting_down {
                    return Err(Error::Disconnected);
                }
                if let Some(client) = inner.client.as_ref() {
                    if client.is_connected() {
                        return Ok(());
                    }
                }
            }

            match slot.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let this = Arc::clone(self);
                    let fut: InitFuture = async move {
                        this.run_init().await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let outcome = fut.await;

        // Clear the slot so a failure is retried on the next call. Every
        // waiter of this round already holds its clone of the future.
        {
            let mut slot = self.init.lock().await;
            *slot = None;
        }

        outcome.map_err(Error::from)
    }

    /// The launch sequence proper. Runs at most once per initialization round.
    async fn run_init(self: Arc<Self>) -> Result<()> {
        info!("initializing engine gateway link");

        let candidate_token = Uuid::new_v4().simple().to_string();
        let preparer = ConfigPreparer::new(self.settings.config_path());
        let prepared = preparer.prepare(&GatewayDefaults::new(candidate_token, self.settings.port))?;
        if prepared.wrote {
            debug!("engine config reconciled on disk");
        }

        self.identity.load_or_create()?;

        let existing = {
            let inner = self.inner.lock().await;
            inner.process.clone()
        };

        let plan = plan_for_existing(existing.as_deref(), &prepared);
        let (process, launched) = match (plan, existing) {
            (ProcessPlan::Reuse, Some(process)) => {
                debug!("reusing running engine process");
                (process, false)
            }
            (ProcessPlan::Recycle, Some(process)) => {
                info!("managed engine settings drifted, restarting it");
                process.stop();
                process.wait_exited().await;
                (self.launch_engine(&prepared).await?, true)
            }
            _ => {
                if port_in_use(prepared.port) {
                    (Arc::new(EngineProcessHandle::adopted(prepared.port)), false)
                } else {
                    (self.launch_engine(&prepared).await?, true)
                }
            }
        };

        let opts = ConnectOptions {
            port: prepared.port,
            token: prepared.token,
            client_id: self.settings.client_id.clone(),
            client_mode: self.settings.client_mode.clone(),
            role: self.settings.role.clone(),
            scopes: self.settings.scopes.clone(),
            min_protocol: MIN_PROTOCOL,
            max_protocol: MAX_PROTOCOL,
        };

        let client = match GatewayClient::connect(opts, Arc::clone(&self.identity), self.events.clone()).await
        {
            Ok(client) => client,
            Err(err) => {
                // A spawn from this round must not leak when the handshake
                // fails; a reused or adopted engine is left running.
                if launched {
                    process.stop();
                }
                return Err(err);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            client.disconnect().await;
            process.stop();
            return Err(Error::Disconnected);
        }
        inner.process = Some(process);
        inner.client = Some(client);

        info!("engine gateway link established");
        Ok(())
    }

    async fn launch_engine(
        &self,
        prepared: &PreparedConfig,
    ) -> Result<Arc<EngineProcessHandle>> {
        let entry = self.locator.locate()?;
        Ok(Arc::new(
            EngineProcessHandle::spawn(&entry, prepared.port, &prepared.token, self.events.clone())
                .await?,
        ))
    }

    /// Serve one RPC.
    ///
    /// Management methods prefer a live socket but degrade to the one-shot
    /// CLI fallback without triggering a launch. Everything else initializes
    /// on demand and requires the authenticated link.
    pub async fn handle_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        if is_mgmt_method(method) {
            let handle = {
                let inner = self.inner.lock().await;
                inner
                    .client
                    .as_ref()
                    .filter(|c| c.is_connected())
                    .map(|c| c.handle())
            };

            if let Some(handle) = handle {
                match handle.request(method, params.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        debug!("socket path for '{method}' failed ({err}), using CLI fallback");
                    }
                }
            }

            return self.mgmt.execute(method, params).await;
        }

        self.initialize().await?;

        let handle = {
            let inner = self.inner.lock().await;
            inner.client.as_ref().map(|c| c.handle())
        };
        match handle {
            Some(handle) => handle.request(method, params).await,
            None => Err(Error::Disconnected),
        }
    }

    /// Restart a managed engine. Adopted engines are left alone.
    pub async fn recycle(self: &Arc<Self>) -> Result<()> {
        let (process, client) = {
            let mut inner = self.inner.lock().await;
            (inner.process.take(), inner.client.take())
        };

        match process {
            Some(process) if process.is_managed() => {
                info!("recycling managed engine process");
                if let Some(client) = client {
                    client.disconnect().await;
                }
                process.stop();
                process.wait_exited().await;
            }
            Some(process) => {
                debug!("engine is adopted, recycle only re-establishes the link");
                if let Some(client) = client {
                    client.disconnect().await;
                }
                drop(process);
            }
            None => {}
        }

        self.initialize().await
    }

    /// Tear everything down. The supervisor stays usable for mgmt fallback
    /// calls but will refuse to re-launch.
    pub async fn shutdown(&self) {
        let (process, client) = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            (inner.process.take(), inner.client.take())
        };

        if let Some(client) = client {
            client.disconnect().await;
        }
        if let Some(process) = process {
            process.stop();
            if process.is_managed() {
                process.wait_exited().await;
            }
        }

        info!("engine supervisor shut down");
    }
}

/// What initialization should do with a previously tracked engine process.
#[derive(Debug)]
enum ProcessPlan {
    /// The running process still matches the prepared settings; keep it.
    Reuse,
    /// A managed process was launched under stale settings; restart it.
    Recycle,
    /// No usable process; adopt an existing listener or spawn one.
    Probe,
}

/// A live process matching the prepared port and token is kept. A managed
/// process whose secrets or port drifted is restarted so the gateway picks up
/// the new settings. Adopted processes are never restarted by us, whatever
/// their settings.
fn plan_for_existing(
    process: Option<&EngineProcessHandle>,
    prepared: &PreparedConfig,
) -> ProcessPlan {
    let Some(process) = process else {
        return ProcessPlan::Probe;
    };
    if process.has_exited() {
        return ProcessPlan::Probe;
    }
    if !process.is_managed() {
        return ProcessPlan::Reuse;
    }
    if process.port() == prepared.port && process.launch_token() == Some(prepared.token.as_str()) {
        return ProcessPlan::Reuse;
    }
    ProcessPlan::Recycle
}

/// Background watcher clearing supervisor state when the process dies.
///
/// Holds only a weak reference so the supervisor can be dropped normally.
async fn monitor_events(
    supervisor: Weak<EngineSupervisor>,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("event monitor lagged, missed {missed} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let EngineEvent::ProcessExited { code } = event {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };

            let mut inner = supervisor.inner.lock().await;
            if !inner.shutting_down {
                warn!("engine process exited (code {code:?}), clearing supervisor state");
            }
            inner.process = None;
            inner.client = None;
        }
    }

    debug!("event monitor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path) -> SupervisorSettings {
        SupervisorSettings::new(dir.to_path_buf())
    }

    #[test]
    fn test_settings_paths() {
        let s = SupervisorSettings::new(PathBuf::from("/home/u/.openagent"));
        assert_eq!(s.config_path(), PathBuf::from("/home/u/.openagent/config.json"));
        assert_eq!(
            s.identity_path(),
            PathBuf::from("/home/u/.openagent/identity/device.json")
        );
        assert_eq!(s.port, DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_initial_state_is_idle() {
        let temp = tempdir().unwrap();
        let supervisor = EngineSupervisor::new(settings(temp.path()));
        assert_eq!(supervisor.connection_state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_mgmt_request_does_not_launch_engine() {
        // config.get must be served from the local document with no engine
        // present and no initialization attempt.
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"theme":"dark"}"#).unwrap();

        let supervisor = EngineSupervisor::new(settings(temp.path()));
        let value = supervisor.handle_request("config.get", None).await.unwrap();

        assert_eq!(value["theme"], "dark");
        assert_eq!(supervisor.connection_state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_initialize_refused_after_shutdown() {
        let temp = tempdir().unwrap();
        let supervisor = EngineSupervisor::new(settings(temp.path()));
        supervisor.shutdown().await;

        let result = supervisor.initialize().await;
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    fn prepared(token: &str, port: u16) -> PreparedConfig {
        PreparedConfig {
            token: token.to_string(),
            port,
            wrote: false,
        }
    }

    #[test]
    fn test_plan_reuses_managed_process_with_current_settings() {
        let process = EngineProcessHandle::managed_for_test(4517, "tok");
        assert!(matches!(
            plan_for_existing(Some(&process), &prepared("tok", 4517)),
            ProcessPlan::Reuse
        ));
    }

    #[test]
    fn test_plan_recycles_managed_process_on_token_change() {
        let process = EngineProcessHandle::managed_for_test(4517, "old-token");
        assert!(matches!(
            plan_for_existing(Some(&process), &prepared("new-token", 4517)),
            ProcessPlan::Recycle
        ));
    }

    #[test]
    fn test_plan_recycles_managed_process_on_port_change() {
        let process = EngineProcessHandle::managed_for_test(4517, "tok");
        assert!(matches!(
            plan_for_existing(Some(&process), &prepared("tok", 9000)),
            ProcessPlan::Recycle
        ));
    }

    #[test]
    fn test_plan_never_recycles_adopted_process() {
        // Token drift on an adopted engine is not ours to fix.
        let process = EngineProcessHandle::adopted(4517);
        assert!(matches!(
            plan_for_existing(Some(&process), &prepared("new-token", 4517)),
            ProcessPlan::Reuse
        ));
    }

    #[test]
    fn test_plan_probes_without_a_process() {
        assert!(matches!(
            plan_for_existing(None, &prepared("tok", 4517)),
            ProcessPlan::Probe
        ));
    }

    #[tokio::test]
    async fn test_mgmt_fallback_survives_shutdown() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"a":1}"#).unwrap();

        let supervisor = EngineSupervisor::new(settings(temp.path()));
        supervisor.shutdown().await;

        let value = supervisor.handle_request("config.get", None).await.unwrap();
        assert_eq!(value["a"], 1);
    }
}
