//! Engine executable discovery.
//!
//! Resolves a runnable engine entry point across the bundled installation
//! directory, package-manager global install directories, and `PATH`. Thin
//! package-manager shims are resolved to their underlying script entry so the
//! supervisor can run them under the embedded node runtime.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use agentdeck_core::prelude::*;

/// Name of the engine executable as installed on PATH.
pub const ENGINE_BIN: &str = "openagent";

/// npm package that ships the engine.
pub const ENGINE_PACKAGE: &str = "openagent";

/// Cooldown between failed probe rounds, to avoid shell churn when the
/// engine is genuinely absent.
const PROBE_COOLDOWN: Duration = Duration::from_secs(10);

/// How the resolved entry point is meant to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// A standalone binary; execute directly.
    Native,
    /// A JavaScript entry point; run under the node runtime.
    NodeScript,
}

/// A resolved engine entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEntry {
    pub path: PathBuf,
    pub mode: InvocationMode,
}

impl EngineEntry {
    fn native(path: PathBuf) -> Self {
        Self {
            path,
            mode: InvocationMode::Native,
        }
    }

    fn script(path: PathBuf) -> Self {
        Self {
            path,
            mode: InvocationMode::NodeScript,
        }
    }
}

/// Locates the engine executable, caching failed probes for a cooldown.
pub struct ExecutableLocator {
    /// Optional directory shipped with the host application.
    bundled_dir: Option<PathBuf>,
    /// Instant of the last failed probe round, if any.
    last_failure: Mutex<Option<Instant>>,
}

impl ExecutableLocator {
    pub fn new(bundled_dir: Option<PathBuf>) -> Self {
        Self {
            bundled_dir,
            last_failure: Mutex::new(None),
        }
    }

    /// Resolve the engine entry point.
    ///
    /// Search order: bundled installation directory, package-manager global
    /// install directories, then `PATH`. Returns [`Error::EngineNotFound`]
    /// when nothing runnable is found; repeated failures within the cooldown
    /// window short-circuit without re-probing.
    pub fn locate(&self) -> Result<EngineEntry> {
        {
            let guard = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *guard {
                if at.elapsed() < PROBE_COOLDOWN {
                    debug!("engine probe cooldown active, skipping search");
                    return Err(Error::EngineNotFound);
                }
            }
        }

        match self.probe() {
            Some(entry) => {
                let mut guard = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
                *guard = None;
                info!(
                    "resolved engine entry: {} ({:?})",
                    entry.path.display(),
                    entry.mode
                );
                Ok(entry)
            }
            None => {
                let mut guard = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
                *guard = Some(Instant::now());
                warn!("engine executable not found in any search location");
                Err(Error::EngineNotFound)
            }
        }
    }

    fn probe(&self) -> Option<EngineEntry> {
        for candidate in self.candidates() {
            if candidate.is_file() {
                if let Some(entry) = classify_entry(&candidate) {
                    return Some(entry);
                }
            }
        }

        // PATH last; `which` handles platform executable extensions.
        if let Ok(found) = which::which(ENGINE_BIN) {
            return classify_entry(&found);
        }

        None
    }

    /// Candidate paths in priority order, PATH excluded.
    fn candidates(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(dir) = &self.bundled_dir {
            paths.push(dir.join(ENGINE_BIN));
        }

        for prefix in npm_global_prefixes() {
            paths.push(prefix.join(ENGINE_BIN));
        }

        paths
    }
}

/// Global npm bin directories to try, honoring `NPM_CONFIG_PREFIX`.
fn npm_global_prefixes() -> Vec<PathBuf> {
    let mut prefixes = Vec::new();

    if let Ok(prefix) = std::env::var("NPM_CONFIG_PREFIX") {
        prefixes.push(PathBuf::from(prefix).join("bin"));
    }

    if let Some(home) = dirs::home_dir() {
        prefixes.push(home.join(".npm-global").join("bin"));
        prefixes.push(home.join(".local").join("bin"));
    }

    #[cfg(target_os = "windows")]
    if let Ok(appdata) = std::env::var("APPDATA") {
        prefixes.push(PathBuf::from(appdata).join("npm"));
    }

    #[cfg(not(target_os = "windows"))]
    {
        prefixes.push(PathBuf::from("/usr/local/bin"));
        prefixes.push(PathBuf::from("/opt/homebrew/bin"));
    }

    prefixes
}

/// Classify a found file as native or node-script, resolving shims.
fn classify_entry(path: &Path) -> Option<EngineEntry> {
    // Follow symlinks; a global npm install is usually a symlink into
    // <prefix>/lib/node_modules/<pkg>/....
    let resolved = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    if is_script_path(&resolved) {
        return Some(EngineEntry::script(resolved));
    }

    if is_shim_path(&resolved) {
        return resolve_shim(&resolved).map(EngineEntry::script);
    }

    Some(EngineEntry::native(resolved))
}

fn is_script_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("js") | Some("mjs") | Some("cjs")
    )
}

fn is_shim_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("cmd") | Some("bat") | Some("ps1")
    )
}

/// Resolve a package-manager shim to the real script entry.
///
/// The shim sits next to a `node_modules/<pkg>` tree; the package manifest's
/// declared entry (`bin`, then `main`) wins, with conventional filenames as a
/// fallback.
fn resolve_shim(shim: &Path) -> Option<PathBuf> {
    let shim_dir = shim.parent()?;
    let package_dir = shim_dir.join("node_modules").join(ENGINE_PACKAGE);
    resolve_package_entry(&package_dir)
}

/// Resolve a package directory to its script entry point.
pub(crate) fn resolve_package_entry(package_dir: &Path) -> Option<PathBuf> {
    let manifest_path = package_dir.join("package.json");

    if let Ok(raw) = std::fs::read_to_string(&manifest_path) {
        if let Ok(manifest) = serde_json::from_str::<Value>(&raw) {
            if let Some(rel) = manifest_entry(&manifest) {
                let full = package_dir.join(rel);
                if full.is_file() {
                    return Some(full);
                }
            }
        }
    }

    // Conventional fallbacks when the manifest is absent or disagrees with
    // the files on disk.
    let named = format!("bin/{ENGINE_BIN}.js");
    for rel in [named.as_str(), "dist/index.js", "index.js"] {
        let full = package_dir.join(rel);
        if full.is_file() {
            return Some(full);
        }
    }

    None
}

/// Pull the declared entry out of a parsed package manifest.
fn manifest_entry(manifest: &Value) -> Option<String> {
    match manifest.get("bin") {
        Some(Value::String(s)) => return Some(s.clone()),
        Some(Value::Object(map)) => {
            if let Some(Value::String(s)) = map.get(ENGINE_BIN) {
                return Some(s.clone());
            }
            // Single-binary packages often key `bin` by the package name.
            if map.len() == 1 {
                if let Some(Value::String(s)) = map.values().next() {
                    return Some(s.clone());
                }
            }
        }
        _ => {}
    }

    manifest
        .get("main")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_package(dir: &Path, manifest: &Value, files: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("package.json"),
            serde_json::to_string_pretty(manifest).unwrap(),
        )
        .unwrap();
        for rel in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "// entry\n").unwrap();
        }
    }

    #[test]
    fn test_locate_not_found_uses_cooldown() {
        let temp = tempdir().unwrap();
        let locator = ExecutableLocator::new(Some(temp.path().join("missing")));

        // First probe fails and arms the cooldown; the second must fail fast
        // without clearing it.
        assert!(matches!(locator.locate(), Err(Error::EngineNotFound)));
        assert!(locator
            .last_failure
            .lock()
            .unwrap()
            .is_some());
        assert!(matches!(locator.locate(), Err(Error::EngineNotFound)));
    }

    #[test]
    fn test_locate_finds_bundled_native_binary() {
        let temp = tempdir().unwrap();
        let bin = temp.path().join(ENGINE_BIN);
        std::fs::write(&bin, b"\x7fELF").unwrap();

        let locator = ExecutableLocator::new(Some(temp.path().to_path_buf()));
        let entry = locator.locate().unwrap();
        assert_eq!(entry.mode, InvocationMode::Native);
    }

    #[test]
    fn test_success_clears_cooldown() {
        let temp = tempdir().unwrap();
        let locator = ExecutableLocator::new(Some(temp.path().to_path_buf()));

        // Arm the cooldown manually, then make the binary appear.
        *locator.last_failure.lock().unwrap() = Some(Instant::now() - Duration::from_secs(60));
        std::fs::write(temp.path().join(ENGINE_BIN), b"bin").unwrap();

        assert!(locator.locate().is_ok());
        assert!(locator.last_failure.lock().unwrap().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_npm_config_prefix_is_probed() {
        let temp = tempdir().unwrap();
        let bin_dir = temp.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::write(bin_dir.join(ENGINE_BIN), b"bin").unwrap();

        std::env::set_var("NPM_CONFIG_PREFIX", temp.path());
        let entry = ExecutableLocator::new(None).locate();
        std::env::remove_var("NPM_CONFIG_PREFIX");

        let entry = entry.unwrap();
        assert_eq!(entry.mode, InvocationMode::Native);
        assert_eq!(
            entry.path.file_name().and_then(|n| n.to_str()),
            Some(ENGINE_BIN)
        );
    }

    #[test]
    fn test_classify_script_extension_as_node_script() {
        let temp = tempdir().unwrap();
        let script = temp.path().join("entry.js");
        std::fs::write(&script, "#!/usr/bin/env node\n").unwrap();

        let entry = classify_entry(&script).unwrap();
        assert_eq!(entry.mode, InvocationMode::NodeScript);
    }

    #[test]
    fn test_resolve_package_entry_prefers_manifest_bin_string() {
        let temp = tempdir().unwrap();
        let pkg = temp.path().join("pkg");
        write_package(
            &pkg,
            &json!({"name": ENGINE_PACKAGE, "bin": "cli/run.js", "main": "lib/index.js"}),
            &["cli/run.js", "lib/index.js"],
        );

        let entry = resolve_package_entry(&pkg).unwrap();
        assert!(entry.ends_with("cli/run.js"));
    }

    #[test]
    fn test_resolve_package_entry_bin_map_keyed_by_name() {
        let temp = tempdir().unwrap();
        let pkg = temp.path().join("pkg");
        write_package(
            &pkg,
            &json!({"name": ENGINE_PACKAGE, "bin": {ENGINE_BIN: "bin/start.js"}}),
            &["bin/start.js"],
        );

        let entry = resolve_package_entry(&pkg).unwrap();
        assert!(entry.ends_with("bin/start.js"));
    }

    #[test]
    fn test_resolve_package_entry_falls_back_to_main() {
        let temp = tempdir().unwrap();
        let pkg = temp.path().join("pkg");
        write_package(
            &pkg,
            &json!({"name": ENGINE_PACKAGE, "main": "lib/server.js"}),
            &["lib/server.js"],
        );

        let entry = resolve_package_entry(&pkg).unwrap();
        assert!(entry.ends_with("lib/server.js"));
    }

    #[test]
    fn test_resolve_package_entry_conventional_fallback() {
        let temp = tempdir().unwrap();
        let pkg = temp.path().join("pkg");
        // Manifest declares an entry that does not exist on disk.
        write_package(
            &pkg,
            &json!({"name": ENGINE_PACKAGE, "bin": "gone.js"}),
            &["dist/index.js"],
        );

        let entry = resolve_package_entry(&pkg).unwrap();
        assert!(entry.ends_with("dist/index.js"));
    }

    #[test]
    fn test_resolve_package_entry_missing_package_is_none() {
        let temp = tempdir().unwrap();
        assert!(resolve_package_entry(&temp.path().join("nope")).is_none());
    }
}
