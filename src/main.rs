//! agentdeck - desktop control surface for a locally-installed agent engine.
//!
//! This is the binary entry point. All supervision and transport logic lives
//! in the workspace crates.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use agentdeck_core::prelude::*;
use agentdeck_gateway::process::port_in_use;
use agentdeck_gateway::{EngineSupervisor, SupervisorSettings, DEFAULT_PORT};

/// Desktop control surface for a locally-installed agent engine
#[derive(Parser, Debug)]
#[command(name = "agentdeck")]
#[command(about = "Supervise and talk to a local agent engine gateway", long_about = None)]
struct Args {
    /// Engine home directory (config file and device identity)
    #[arg(long, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Gateway port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report engine discovery and gateway reachability without launching
    Status,
    /// Launch or adopt the engine and stream gateway events as JSON lines
    Run,
    /// Send one RPC to the engine (launching it if needed)
    Request {
        /// Method name, e.g. "models.list" or "chat.send"
        method: String,
        /// Params as a JSON object
        #[arg(value_name = "PARAMS_JSON")]
        params: Option<String>,
    },
    /// Read or patch the engine config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current config document
    Get,
    /// Merge a JSON patch into the config document
    Patch {
        #[arg(value_name = "PATCH_JSON")]
        patch: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().map_err(|e| Error::config(e.to_string()))?;
    agentdeck_core::logging::init()?;

    let args = Args::parse();

    let home_dir = match args.home {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or_else(|| Error::config("could not determine a home directory"))?
            .join(".openagent"),
    };

    let mut settings = SupervisorSettings::new(home_dir);
    settings.port = args.port;

    match args.command {
        Command::Status => status(settings),
        Command::Run => run(settings).await,
        Command::Request { method, params } => {
            let params = parse_params(params.as_deref())?;
            request(settings, &method, params).await
        }
        Command::Config { action } => match action {
            ConfigAction::Get => request(settings, "config.get", None).await,
            ConfigAction::Patch { patch } => {
                let patch = parse_params(Some(&patch))?;
                request(settings, "config.patch", patch).await
            }
        },
    }
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    match raw {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| Error::config(format!("params must be valid JSON: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report what the supervisor would work with, without side effects beyond
/// the engine probe.
fn status(settings: SupervisorSettings) -> Result<()> {
    let locator = agentdeck_gateway::ExecutableLocator::new(settings.bundled_dir.clone());
    let engine = match locator.locate() {
        Ok(entry) => json!({
            "found": true,
            "path": entry.path.display().to_string(),
            "mode": format!("{:?}", entry.mode),
        }),
        Err(_) => json!({ "found": false }),
    };

    print_json(&json!({
        "engine": engine,
        "gateway": {
            "port": settings.port,
            "inUse": port_in_use(settings.port),
        },
        "configPath": settings.config_path().display().to_string(),
        "identityPath": settings.identity_path().display().to_string(),
    }))
}

/// Keep the link up and dump every engine event as one JSON line.
async fn run(settings: SupervisorSettings) -> Result<()> {
    let supervisor = EngineSupervisor::new(settings);
    let mut events = supervisor.subscribe();

    supervisor.initialize().await?;
    info!("connected; streaming events (ctrl-c to stop)");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event stream lagged, missed {missed} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

fn print_event(event: &agentdeck_core::events::EngineEvent) {
    use agentdeck_core::events::EngineEvent;

    let line = match event {
        EngineEvent::Gateway { event, payload } => {
            json!({ "kind": "gateway", "event": event, "payload": payload })
        }
        EngineEvent::AgentFailure { message } => {
            json!({ "kind": "agentFailure", "message": message })
        }
        EngineEvent::ProcessExited { code } => {
            json!({ "kind": "processExited", "code": code })
        }
        EngineEvent::ConnectionChanged(state) => {
            json!({ "kind": "connection", "state": format!("{state:?}") })
        }
    };
    println!("{line}");
}

async fn request(settings: SupervisorSettings, method: &str, params: Option<Value>) -> Result<()> {
    let supervisor = EngineSupervisor::new(settings);
    let result = supervisor.handle_request(method, params).await;
    supervisor.shutdown().await;

    print_json(&result?)
}
