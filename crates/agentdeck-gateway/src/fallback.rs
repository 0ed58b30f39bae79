//! One-shot management fallback.
//!
//! A small whitelist of read-mostly management methods stays usable while the
//! gateway link is down: each call runs the engine binary once in CLI mode
//! and parses its JSON output. Config reads and patches never touch the
//! engine at all; they operate on the local config document directly.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use agentdeck_core::prelude::*;

use crate::config::ConfigPreparer;
use crate::launcher::run_capture;
use crate::locator::ExecutableLocator;

/// Methods the fallback path is allowed to serve. Everything else requires a
/// live gateway connection.
pub const MGMT_METHODS: &[&str] = &[
    "plugins.list",
    "models.list",
    "skills.status",
    "channels.status",
    "usage.snapshot",
    "usage.cost",
    "config.get",
    "config.patch",
    "system.version",
];

pub fn is_mgmt_method(method: &str) -> bool {
    MGMT_METHODS.contains(&method)
}

/// Usage queries degrade to an empty well-formed shape instead of erroring,
/// so dashboards render zeros rather than failure banners.
pub fn is_usage_method(method: &str) -> bool {
    method.starts_with("usage.")
}

fn empty_usage_payload() -> Value {
    json!({
        "available": false,
        "totals": {},
        "entries": [],
    })
}

/// Executes whitelisted mgmt methods without a gateway connection.
pub struct MgmtExecutor {
    locator: Arc<ExecutableLocator>,
    preparer: ConfigPreparer,
}

impl MgmtExecutor {
    pub fn new(locator: Arc<ExecutableLocator>, preparer: ConfigPreparer) -> Self {
        Self { locator, preparer }
    }

    /// Serve one mgmt method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for methods outside the whitelist. Usage
    /// methods never error; their failures collapse to the empty payload.
    pub async fn execute(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !is_mgmt_method(method) {
            return Err(Error::protocol(format!(
                "method '{method}' is not available while disconnected"
            )));
        }

        match method {
            "config.get" => Ok(Value::Object(self.preparer.load_document())),
            "config.patch" => self.patch_config(params),
            _ if is_usage_method(method) => match self.invoke(method, params).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    debug!("usage fallback '{method}' degraded to empty payload: {err}");
                    Ok(empty_usage_payload())
                }
            },
            _ => self.invoke(method, params).await,
        }
    }

    /// Apply a shallow-per-key deep merge of `params` onto the config file.
    fn patch_config(&self, params: Option<Value>) -> Result<Value> {
        let patch = match params {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(Error::config("config.patch params must be an object")),
            None => Map::new(),
        };

        let mut doc = self.preparer.load_document();
        for (key, value) in patch {
            merge_value(&mut doc, key, value);
        }

        self.preparer.store_document(&doc)?;
        Ok(Value::Object(doc))
    }

    /// Run the engine once in CLI mode. `"a.b"` maps to `a b --json
    /// --no-color`, plus `--key value` pairs from the params object.
    async fn invoke(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let entry = self.locator.locate()?;
        let args = cli_args(method, params.as_ref());

        let output = run_capture(&entry, &args).await?;
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(Error::process(format!(
                "'{method}' fallback exited with {:?}: {stderr}",
                output.status
            )));
        }

        let stdout = output.stdout.trim();
        match serde_json::from_str::<Value>(stdout) {
            Ok(value) => Ok(value),
            Err(_) => Ok(json!({ "output": stdout })),
        }
    }
}

/// Merge one patch entry into the document. Objects merge recursively, `null`
/// deletes the key, everything else replaces.
fn merge_value(doc: &mut Map<String, Value>, key: String, value: Value) {
    match value {
        Value::Null => {
            doc.remove(&key);
        }
        Value::Object(patch) => match doc.get_mut(&key) {
            Some(Value::Object(existing)) => {
                for (k, v) in patch {
                    merge_value(existing, k, v);
                }
            }
            _ => {
                doc.insert(key, Value::Object(patch));
            }
        },
        other => {
            doc.insert(key, other);
        }
    }
}

/// Translate a method and params into CLI arguments.
fn cli_args(method: &str, params: Option<&Value>) -> Vec<String> {
    let mut args: Vec<String> = method.split('.').map(str::to_string).collect();
    args.push("--json".to_string());
    args.push("--no-color".to_string());

    if let Some(Value::Object(map)) = params {
        for (key, value) in map {
            args.push(format!("--{key}"));
            match value {
                Value::String(s) => args.push(s.clone()),
                other => args.push(other.to_string()),
            }
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_whitelist_membership() {
        assert!(is_mgmt_method("models.list"));
        assert!(is_mgmt_method("config.patch"));
        assert!(!is_mgmt_method("chat.send"));
        assert!(!is_mgmt_method("models"));
    }

    #[test]
    fn test_usage_method_detection() {
        assert!(is_usage_method("usage.snapshot"));
        assert!(is_usage_method("usage.cost"));
        assert!(!is_usage_method("models.list"));
    }

    #[test]
    fn test_cli_args_for_bare_method() {
        assert_eq!(
            cli_args("models.list", None),
            vec!["models", "list", "--json", "--no-color"]
        );
    }

    #[test]
    fn test_cli_args_with_params() {
        let params = json!({"limit": 5, "format": "wide"});
        let args = cli_args("usage.cost", Some(&params));
        assert_eq!(args[0], "usage");
        assert_eq!(args[1], "cost");
        assert!(args.contains(&"--limit".to_string()));
        assert!(args.contains(&"5".to_string()));
        assert!(args.contains(&"--format".to_string()));
        assert!(args.contains(&"wide".to_string()));
    }

    #[test]
    fn test_merge_value_recurses_into_objects() {
        let mut doc = Map::new();
        doc.insert("gateway".to_string(), json!({"port": 4517, "mode": "local"}));

        merge_value(&mut doc, "gateway".to_string(), json!({"port": 9000}));

        assert_eq!(doc["gateway"]["port"], 9000);
        assert_eq!(doc["gateway"]["mode"], "local");
    }

    #[test]
    fn test_merge_value_null_deletes_key() {
        let mut doc = Map::new();
        doc.insert("theme".to_string(), json!("dark"));
        merge_value(&mut doc, "theme".to_string(), Value::Null);
        assert!(!doc.contains_key("theme"));
    }

    fn executor(dir: &std::path::Path) -> MgmtExecutor {
        MgmtExecutor::new(
            Arc::new(ExecutableLocator::new(None)),
            ConfigPreparer::new(dir.join("config.json")),
        )
    }

    #[tokio::test]
    async fn test_non_whitelisted_method_rejected() {
        let temp = tempdir().unwrap();
        let result = executor(temp.path()).execute("chat.send", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_config_get_reads_local_document() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"theme":"dark"}"#).unwrap();

        let value = executor(temp.path()).execute("config.get", None).await.unwrap();
        assert_eq!(value["theme"], "dark");
    }

    #[tokio::test]
    async fn test_config_get_missing_file_is_empty_object() {
        let temp = tempdir().unwrap();
        let value = executor(temp.path()).execute("config.get", None).await.unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn test_config_patch_merges_and_persists() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"gateway":{"port":4517}}"#,
        )
        .unwrap();

        let value = executor(temp.path())
            .execute("config.patch", Some(json!({"gateway":{"mode":"local"}})))
            .await
            .unwrap();

        assert_eq!(value["gateway"]["port"], 4517);
        assert_eq!(value["gateway"]["mode"], "local");

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(temp.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(on_disk["gateway"]["mode"], "local");
    }

    #[tokio::test]
    async fn test_config_patch_rejects_non_object_params() {
        let temp = tempdir().unwrap();
        let result = executor(temp.path())
            .execute("config.patch", Some(json!([1, 2])))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_usage_method_degrades_to_empty_payload() {
        // Locator has no engine to find, so the invocation fails; usage
        // methods swallow that into the empty shape.
        let temp = tempdir().unwrap();
        let value = executor(temp.path())
            .execute("usage.snapshot", None)
            .await
            .unwrap();

        assert_eq!(value["available"], false);
        assert_eq!(value["totals"], json!({}));
        assert_eq!(value["entries"], json!([]));
    }
}
