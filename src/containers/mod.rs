//! Container lifecycle orchestration over an external runtime CLI.
//!
//! This module is the heart of the crate: declarative container
//! configuration, the command-building/escaping layer, the lifecycle
//! manager, typed event channels, log streaming and runtime event
//! monitoring. All of it drives a docker- or podman-compatible binary
//! through subprocesses; nothing here talks to a daemon socket.

pub mod bus;
pub mod command;
pub mod logs;
pub mod manager;
pub mod monitor;
pub mod output;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::process::Child;

use crate::runtime::ContainerRuntime;

pub use bus::{
    ContainerDiedEvent, ContainerEventBus, ContainerOperationEvent, LifecycleEvent,
    LifecycleOperation,
};
pub use logs::{
    ContainerLogStream, LogEntry, LogEntryStream, LogSource, LogStreamEvent, LogStreamOptions,
    LogTail,
};
pub use manager::{
    ContainerManager, CreateContainerOptions, NameOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
pub use monitor::{EventsMonitor, EventsMonitorOptions};

/// Declarative description of a container to create.
///
/// The manager never mutates a config it is handed; the optional build step
/// works on a private copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image reference, used unless a Dockerfile build supplies a tag
    pub image: String,
    /// Positional command appended after the image
    pub command: Vec<String>,
    /// Entrypoint override
    pub entrypoint: Option<String>,
    /// Host path -> container path bind mounts
    pub volumes: IndexMap<String, String>,
    /// Environment variables set at creation
    pub env: IndexMap<String, String>,
    /// Memory limit in the runtime's unit-suffixed syntax ("512m", "2g")
    pub memory: Option<String>,
    /// Soft memory limit
    pub memory_reservation: Option<String>,
    /// Memory plus swap limit
    pub memory_swap: Option<String>,
    /// CPU quota in cores
    pub cpus: Option<f64>,
    /// Relative CPU weight
    pub cpu_shares: Option<u64>,
    /// Maximum number of processes
    pub pids_limit: Option<u64>,
    /// Network mode ("bridge", "host", "none", ...)
    pub network_mode: Option<String>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// User the main process runs as (`uid`, `uid:gid`, or name)
    pub user: Option<String>,
    /// Labels attached at creation
    pub labels: IndexMap<String, String>,
    /// Run with extended privileges
    pub privileged: bool,
    /// Linux capabilities to add
    pub cap_add: Vec<String>,
    /// Linux capabilities to drop
    pub cap_drop: Vec<String>,
    /// Raw `--security-opt` entries (seccomp, apparmor, ...)
    pub security_opts: Vec<String>,
    /// Ask the runtime to delete the container when it exits
    pub auto_remove: bool,
    /// Dockerfile to build before creation; silently skipped when missing
    pub dockerfile: Option<PathBuf>,
    /// Build context directory, defaulting to the Dockerfile's parent
    pub build_context: Option<PathBuf>,
}

impl ContainerConfig {
    /// Config running `image` with everything else at defaults.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            command: Vec::new(),
            entrypoint: None,
            volumes: IndexMap::new(),
            env: IndexMap::new(),
            memory: None,
            memory_reservation: None,
            memory_swap: None,
            cpus: None,
            cpu_shares: None,
            pids_limit: None,
            network_mode: None,
            working_dir: None,
            user: None,
            labels: IndexMap::new(),
            privileged: false,
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            security_opts: Vec::new(),
            auto_remove: false,
            dockerfile: None,
            build_context: None,
        }
    }
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerStatus {
    /// Lossy mapping from the runtime's status string.
    ///
    /// Unrecognized states read as `Exited` rather than failing; inspect
    /// parsing must never error on a status value.
    pub fn from_runtime(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Exited,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
        };
        write!(f, "{}", label)
    }
}

/// Point-in-time container metadata from `inspect`.
///
/// A fresh value per query; nothing is cached. Timestamps and the exit code
/// are absent when the runtime emits its `<no value>` sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// Runtime-assigned name with the leading `/` stripped
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub oom_killed: Option<bool>,
}

/// One-shot resource snapshot from `stats --no-stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// May exceed 100 on multi-core hosts
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

/// Outcome of a lifecycle operation.
///
/// Operations report failure here instead of returning errors; the only
/// throwing calls in this module are the monitoring/stream setup paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerOperationResult {
    pub success: bool,
    /// Affected container id; empty string on failure, never absent
    pub container_id: String,
    /// Exact command line executed, for observability and tests
    pub command: String,
    pub error: Option<String>,
    /// Fresh metadata, attached where the operation performs a follow-up
    /// inspect
    pub container_info: Option<ContainerInfo>,
}

impl ContainerOperationResult {
    /// Successful outcome for `container_id`.
    pub fn succeeded(container_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            success: true,
            container_id: container_id.into(),
            command: command.into(),
            error: None,
            container_info: None,
        }
    }

    /// Failure with no affected container id.
    pub fn failed(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            container_id: String::new(),
            command: command.into(),
            error: Some(error.into()),
            container_info: None,
        }
    }
}

/// Command input for `exec`: a raw line or an explicit argv.
///
/// The line form is tokenized with shell quoting rules at the boundary, so
/// callers can hand over either shape without the manager guessing later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecCommand {
    /// Single line, split honoring quotes and backslashes
    Line(String),
    /// Pre-split argument vector, used as-is
    Argv(Vec<String>),
}

impl ExecCommand {
    /// Normalize to an argument vector.
    pub fn into_argv(self) -> Vec<String> {
        match self {
            ExecCommand::Line(line) => command::split_command_line(&line),
            ExecCommand::Argv(argv) => argv,
        }
    }
}

impl From<&str> for ExecCommand {
    fn from(line: &str) -> Self {
        ExecCommand::Line(line.to_string())
    }
}

impl From<String> for ExecCommand {
    fn from(line: String) -> Self {
        ExecCommand::Line(line)
    }
}

impl From<Vec<String>> for ExecCommand {
    fn from(argv: Vec<String>) -> Self {
        ExecCommand::Argv(argv)
    }
}

impl From<&[&str]> for ExecCommand {
    fn from(argv: &[&str]) -> Self {
        ExecCommand::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// Options for running a command inside a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecCommandOptions {
    /// Pin a runtime instead of asking the selector
    pub runtime: Option<ContainerRuntime>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// User to run as (`uid`, `uid:gid`, or name)
    pub user: Option<String>,
    /// Extra environment variables for this exec only
    pub env: IndexMap<String, String>,
    /// Milliseconds before the command is killed and reported as exit 124.
    /// `None` uses the configured default; values <= 0 disable the deadline
    /// entirely (passed through, not clamped).
    pub timeout_ms: Option<i64>,
    /// Allocate a pseudo-TTY
    pub tty: bool,
    /// Keep stdin open
    pub interactive: bool,
    /// Run the exec'd process with extended privileges
    pub privileged: bool,
}

/// Outcome of an exec call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecCommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; 124 for timeouts, -1 when no process ran
    pub exit_code: i32,
    /// Exact command line executed
    pub command: String,
    pub error: Option<String>,
}

impl ExecCommandResult {
    /// Failure before any process ran.
    pub fn failed(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            command: command.into(),
            error: Some(error.into()),
        }
    }
}

/// Errors from the orchestration layer's throwing paths.
///
/// Lifecycle and exec failures are reported inside their result types; only
/// setup of the long-lived monitoring/streaming subprocesses errors out.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("No container runtime available")]
    RuntimeUnavailable,

    #[error("Events monitoring is already active")]
    AlreadyMonitoring,

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lossily decode one `read_until` line, stripping the trailing newline.
///
/// Subprocess output carries no encoding guarantee; invalid UTF-8 becomes
/// replacement characters instead of an error that would end the stream.
pub(crate) fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && buf[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// SIGTERM the child, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(_)) => None,
        Err(_) => {
            let _ = child.kill().await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_maps_known_states() {
        assert_eq!(ContainerStatus::from_runtime("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_runtime("Created"), ContainerStatus::Created);
        assert_eq!(ContainerStatus::from_runtime(" paused "), ContainerStatus::Paused);
    }

    #[test]
    fn unknown_status_reads_as_exited() {
        assert_eq!(ContainerStatus::from_runtime("configured"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from_runtime(""), ContainerStatus::Exited);
    }

    #[test]
    fn decode_line_strips_one_trailing_newline() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"windows\r\n"), "windows");
        assert_eq!(decode_line(b"unterminated"), "unterminated");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn decode_line_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"ok \xff\xfe end\n"), "ok \u{fffd}\u{fffd} end");
    }

    #[test]
    fn exec_command_line_is_tokenized() {
        let argv = ExecCommand::from("echo 'hello world'").into_argv();
        assert_eq!(argv, vec!["echo".to_string(), "hello world".to_string()]);
    }

    #[test]
    fn exec_command_argv_passes_through() {
        let argv = ExecCommand::from(vec!["ls".to_string(), "-la".to_string()]).into_argv();
        assert_eq!(argv, vec!["ls".to_string(), "-la".to_string()]);
    }

    #[test]
    fn exec_command_deserializes_both_shapes() {
        let line: ExecCommand = serde_json::from_str("\"npm test\"").unwrap();
        assert_eq!(line, ExecCommand::Line("npm test".to_string()));

        let argv: ExecCommand = serde_json::from_str("[\"npm\", \"test\"]").unwrap();
        assert_eq!(argv, ExecCommand::Argv(vec!["npm".to_string(), "test".to_string()]));
    }

    #[test]
    fn failed_result_has_empty_container_id() {
        let result = ContainerOperationResult::failed("docker start x", "boom");
        assert!(!result.success);
        assert_eq!(result.container_id, "");
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn container_config_deserializes_from_partial_toml() {
        let config: ContainerConfig = toml::from_str(
            r#"
            image = "node:20-alpine"
            privileged = true

            [env]
            NODE_ENV = "test"
            "#,
        )
        .unwrap();
        assert_eq!(config.image, "node:20-alpine");
        assert!(config.privileged);
        assert_eq!(config.env.get("NODE_ENV").map(String::as_str), Some("test"));
        assert!(config.volumes.is_empty());
    }
}
