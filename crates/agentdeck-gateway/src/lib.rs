//! Engine process supervision and authenticated gateway transport.
//!
//! This crate launches or adopts a separately-installed agent engine,
//! authenticates against its local WebSocket gateway with an Ed25519 device
//! identity, correlates RPC requests over the link, and reconnects with
//! restart-aware backoff. When the link is down, a whitelist of management
//! methods degrades to one-shot CLI invocations of the engine binary.
//!
//! The main entry point is [`supervisor::EngineSupervisor`].

pub mod classifier;
pub mod config;
pub mod fallback;
pub mod identity;
pub mod launcher;
pub mod locator;
pub mod process;
pub mod rpc;
pub mod supervisor;
pub mod transport;

pub use config::{ConfigPreparer, GatewayDefaults, PreparedConfig};
pub use fallback::{is_mgmt_method, MgmtExecutor, MGMT_METHODS};
pub use identity::{AuthClaim, ClaimParams, IdentityStore};
pub use locator::{EngineEntry, ExecutableLocator, InvocationMode};
pub use process::EngineProcessHandle;
pub use supervisor::{EngineSupervisor, SupervisorSettings, DEFAULT_PORT};
pub use transport::{ConnectOptions, GatewayClient, GatewayHandle};
