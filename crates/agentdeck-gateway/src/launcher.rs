//! Platform-aware construction of engine process commands.
//!
//! Native binaries are executed directly. Node script entrypoints run under
//! `node`. On Windows, `.cmd`/`.bat` shims must go through `cmd /C` with the
//! whole command line quoted as one argument, otherwise argument splitting
//! mangles paths with spaces.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use agentdeck_core::prelude::*;

use crate::locator::{EngineEntry, InvocationMode};

/// One-shot subprocess timeout for mgmt fallback invocations.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds a runnable command for an engine entry.
pub trait ProcessLauncher: Send + Sync {
    fn command(&self, entry: &EngineEntry, args: &[String]) -> Command;
}

pub struct UnixLauncher;

impl ProcessLauncher for UnixLauncher {
    fn command(&self, entry: &EngineEntry, args: &[String]) -> Command {
        let mut cmd = match entry.mode {
            InvocationMode::Native => Command::new(&entry.path),
            InvocationMode::NodeScript => {
                let mut cmd = Command::new("node");
                cmd.arg(&entry.path);
                cmd
            }
        };
        cmd.args(args);
        cmd
    }
}

pub struct WindowsLauncher;

impl ProcessLauncher for WindowsLauncher {
    fn command(&self, entry: &EngineEntry, args: &[String]) -> Command {
        if requires_cmd_shell(&entry.path) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C");
            cmd.arg(build_cmd_line(&entry.path, args));
            return cmd;
        }

        UnixLauncher.command(entry, args)
    }
}

/// Pick the launcher for the current platform.
pub fn platform_launcher() -> Box<dyn ProcessLauncher> {
    if cfg!(windows) {
        Box::new(WindowsLauncher)
    } else {
        Box::new(UnixLauncher)
    }
}

fn requires_cmd_shell(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat")
    )
}

/// Quote a program path and its arguments into a single `cmd /C` line.
fn build_cmd_line(program: &Path, args: &[String]) -> String {
    let mut parts = vec![quote_cmd_arg(&program.display().to_string())];
    parts.extend(args.iter().map(|a| quote_cmd_arg(a)));
    parts.join(" ")
}

fn quote_cmd_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(' ') || arg.contains('\t') {
        format!("\"{}\"", arg.replace('"', "\"\""))
    } else {
        arg.to_string()
    }
}

/// Captured result of a one-shot engine invocation.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Run the engine once with the given arguments and capture its output.
///
/// Used by the mgmt fallback path when no gateway connection is available.
pub async fn run_capture(entry: &EngineEntry, args: &[String]) -> Result<CapturedOutput> {
    let launcher = platform_launcher();
    let mut cmd = launcher.command(entry, args);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(path = %entry.path.display(), ?args, "running one-shot engine invocation");

    let child = cmd.spawn().map_err(|e| Error::ProcessSpawn {
        reason: format!("{}: {e}", entry.path.display()),
    })?;

    let output = tokio::time::timeout(CAPTURE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| {
            Error::process(format!(
                "one-shot invocation timed out after {}s",
                CAPTURE_TIMEOUT.as_secs()
            ))
        })??;

    Ok(CapturedOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(path: &str, mode: InvocationMode) -> EngineEntry {
        EngineEntry {
            path: PathBuf::from(path),
            mode,
        }
    }

    #[test]
    fn test_unix_native_runs_binary_directly() {
        let cmd = UnixLauncher.command(
            &entry("/usr/local/bin/openagent", InvocationMode::Native),
            &["gateway".to_string()],
        );
        assert_eq!(cmd.as_std().get_program(), "/usr/local/bin/openagent");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, vec!["gateway"]);
    }

    #[test]
    fn test_unix_node_script_runs_under_node() {
        let cmd = UnixLauncher.command(
            &entry("/opt/openagent/dist/index.js", InvocationMode::NodeScript),
            &["--json".to_string()],
        );
        assert_eq!(cmd.as_std().get_program(), "node");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, vec!["/opt/openagent/dist/index.js", "--json"]);
    }

    #[test]
    fn test_windows_cmd_shim_goes_through_cmd_shell() {
        let cmd = WindowsLauncher.command(
            &entry("C:\\npm\\openagent.cmd", InvocationMode::Native),
            &["gateway".to_string()],
        );
        assert_eq!(cmd.as_std().get_program(), "cmd");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args[0], "/C");
    }

    #[test]
    fn test_quote_cmd_arg_handles_spaces_and_quotes() {
        assert_eq!(quote_cmd_arg("plain"), "plain");
        assert_eq!(quote_cmd_arg("with space"), "\"with space\"");
        assert_eq!(quote_cmd_arg("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_build_cmd_line_quotes_program_path() {
        let line = build_cmd_line(
            Path::new("C:\\Program Files\\openagent.cmd"),
            &["gateway".to_string(), "--port".to_string(), "4517".to_string()],
        );
        assert!(line.starts_with("\"C:\\Program Files\\openagent.cmd\""));
        assert!(line.ends_with("gateway --port 4517"));
    }
}
