//! Engine gateway configuration preparation.
//!
//! Before launching the engine we reconcile its JSON config file so the
//! gateway section carries the settings we depend on. User-authored keys are
//! preserved; only missing defaults are filled in, plus a small set of keys
//! the engine no longer understands is stripped. The file is rewritten only
//! when the serialized bytes actually change.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use agentdeck_core::prelude::*;

/// Gateway keys dropped from older installations. The engine rejects its
/// whole config file when these are present.
const UNSUPPORTED_GATEWAY_KEYS: &[&str] = &["tls", "proxy", "legacyAuth"];

/// Defaults applied to the `gateway` object when the key is absent.
#[derive(Debug, Clone)]
pub struct GatewayDefaults {
    pub mode: String,
    pub auth_mode: String,
    pub token: String,
    pub allowed_origins: Vec<String>,
    pub port: u16,
}

impl GatewayDefaults {
    pub fn new(token: String, port: u16) -> Self {
        Self {
            mode: "local".to_string(),
            auth_mode: "token".to_string(),
            token,
            allowed_origins: vec!["*".to_string()],
            port,
        }
    }
}

/// Outcome of a preparation pass.
#[derive(Debug, Clone)]
pub struct PreparedConfig {
    /// The effective token: the one already in the file, or the generated
    /// candidate that was written into it.
    pub token: String,
    /// The effective gateway port; a port in the file wins over the default.
    pub port: u16,
    /// Whether the file on disk was rewritten.
    pub wrote: bool,
}

/// Reconciles the engine's JSON config file on disk.
pub struct ConfigPreparer {
    path: PathBuf,
}

impl ConfigPreparer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current config document, tolerating absence and corruption.
    pub fn load_document(&self) -> Map<String, Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    warn!(path = %self.path.display(), "config file is not a JSON object, starting empty");
                    Map::new()
                }
                Err(err) => {
                    warn!(path = %self.path.display(), "config file unparseable ({err}), starting empty");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        }
    }

    /// Merge gateway defaults into the config file without clobbering
    /// user-set values, and strip keys the engine rejects.
    pub fn prepare(&self, defaults: &GatewayDefaults) -> Result<PreparedConfig> {
        let original = self.load_document();
        let mut doc = original.clone();

        let gateway = doc
            .entry("gateway".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let gateway = match gateway {
            Value::Object(map) => map,
            other => {
                warn!("gateway config key is not an object, replacing it");
                *other = Value::Object(Map::new());
                match other {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                }
            }
        };

        for key in UNSUPPORTED_GATEWAY_KEYS {
            if gateway.remove(*key).is_some() {
                info!("stripped unsupported gateway config key '{key}'");
            }
        }

        if !gateway.contains_key("mode") {
            gateway.insert("mode".to_string(), json!(defaults.mode));
        }

        let auth = gateway
            .entry("auth".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(auth) = auth {
            if !auth.contains_key("mode") {
                auth.insert("mode".to_string(), json!(defaults.auth_mode));
            }
            if !auth.contains_key("token") {
                auth.insert("token".to_string(), json!(defaults.token));
            }
        }

        let cors = gateway
            .entry("cors".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(cors) = cors {
            if !cors.contains_key("allowedOrigins") {
                cors.insert("allowedOrigins".to_string(), json!(defaults.allowed_origins));
            }
        }

        if !gateway.contains_key("port") {
            gateway.insert("port".to_string(), json!(defaults.port));
        }

        let wrote = match self.write_if_changed(&original, &doc) {
            Ok(wrote) => wrote,
            Err(err) => {
                // Non-fatal. The engine keeps booting from whatever is on
                // disk, so report the settings that file implies.
                warn!("could not persist reconciled config ({err}), continuing with the on-disk state");
                return Ok(PreparedConfig {
                    token: effective_token(&original, defaults),
                    port: effective_port(&original, defaults),
                    wrote: false,
                });
            }
        };

        Ok(PreparedConfig {
            token: effective_token(&doc, defaults),
            port: effective_port(&doc, defaults),
            wrote,
        })
    }

    /// Persist an updated document, used by the config mgmt fallback.
    pub fn store_document(&self, doc: &Map<String, Value>) -> Result<bool> {
        let original = self.load_document();
        self.write_if_changed(&original, doc)
    }

    fn write_if_changed(
        &self,
        original: &Map<String, Value>,
        updated: &Map<String, Value>,
    ) -> Result<bool> {
        let original_bytes = serde_json::to_string_pretty(&Value::Object(original.clone()))?;
        let updated_bytes = serde_json::to_string_pretty(&Value::Object(updated.clone()))?;
        let file_matches = std::fs::read_to_string(&self.path)
            .map(|raw| raw == updated_bytes)
            .unwrap_or(false);
        if original_bytes == updated_bytes && file_matches {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::ConfigWrite {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        }
        std::fs::write(&self.path, updated_bytes).map_err(|e| Error::ConfigWrite {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        debug!(path = %self.path.display(), "wrote engine config");
        Ok(true)
    }
}

/// The gateway token a config document implies, or the generated default.
fn effective_token(doc: &Map<String, Value>, defaults: &GatewayDefaults) -> String {
    doc.get("gateway")
        .and_then(|g| g.get("auth"))
        .and_then(|a| a.get("token"))
        .and_then(Value::as_str)
        .unwrap_or(&defaults.token)
        .to_string()
}

/// The gateway port a config document implies, or the default.
fn effective_port(doc: &Map<String, Value>, defaults: &GatewayDefaults) -> u16 {
    doc.get("gateway")
        .and_then(|g| g.get("port"))
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(defaults.port)
}
