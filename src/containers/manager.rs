//! Container lifecycle management over an external runtime CLI.
//!
//! [`ContainerManager`] owns the configuration, a [`RuntimeSelector`] and
//! the event bus. Every lifecycle call spawns an independent subprocess and
//! awaits it; failures come back inside [`ContainerOperationResult`] rather
//! than as errors. Only the monitoring and log-stream setup calls return
//! `Result`, since those represent setup-time preconditions.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::runtime::{ContainerRuntime, PathRuntimeSelector, RuntimeSelector};

use super::bus::{
    ContainerDiedEvent, ContainerEventBus, ContainerOperationEvent, LifecycleEvent,
    LifecycleOperation,
};
use super::logs::{ContainerLogStream, LogStreamOptions};
use super::monitor::{EventsMonitor, EventsMonitorOptions};
use super::{
    command, output, ContainerConfig, ContainerError, ContainerInfo, ContainerOperationResult,
    ContainerStats, ExecCommand, ExecCommandOptions, ExecCommandResult,
};

/// Exit code reported when a command exceeds its deadline.
const TIMEOUT_EXIT_CODE: i32 = 124;

static UNSAFE_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// Options for [`ContainerManager::create_container`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerOptions {
    /// Declarative container definition
    pub config: ContainerConfig,
    /// Correlation key carried on emitted events and used for naming
    pub task_id: Option<String>,
    /// Exact container name; generated from `task_id` when absent
    pub name: Option<String>,
    /// Chain a start after a successful create
    pub auto_start: bool,
    /// Pin a runtime instead of asking the selector
    pub runtime: Option<ContainerRuntime>,
}

impl CreateContainerOptions {
    /// Options with everything defaulted except the container config.
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }
}

impl Default for CreateContainerOptions {
    fn default() -> Self {
        Self {
            config: ContainerConfig::default(),
            task_id: None,
            name: None,
            auto_start: false,
            runtime: None,
        }
    }
}

/// Options for [`ContainerManager::start_container`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartContainerOptions {
    /// Pin a runtime instead of asking the selector
    pub runtime: Option<ContainerRuntime>,
    /// Correlation key carried on emitted events
    pub task_id: Option<String>,
}

/// Options for [`ContainerManager::stop_container`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopContainerOptions {
    pub runtime: Option<ContainerRuntime>,
    pub task_id: Option<String>,
    /// Seconds to wait before the runtime kills the container; the
    /// configured default (10 s) when absent
    pub timeout_secs: Option<u64>,
}

/// Options for [`ContainerManager::remove_container`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveContainerOptions {
    pub runtime: Option<ContainerRuntime>,
    pub task_id: Option<String>,
    /// Remove even while running (`rm --force`)
    pub force: bool,
}

/// Options for [`ContainerManager::generate_container_name`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NameOptions {
    /// Override the configured name prefix
    pub prefix: Option<String>,
    /// Override the configured segment separator
    pub separator: Option<String>,
    /// Append a short opaque uniqueness suffix
    pub include_timestamp: bool,
    /// Include the sanitized task id segment; `false` yields just the prefix
    pub include_task_id: bool,
}

impl Default for NameOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            separator: None,
            include_timestamp: false,
            include_task_id: true,
        }
    }
}

/// Captured output of one finished (or timed-out) runtime command.
#[derive(Debug)]
struct RuntimeCommandOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

/// Lifecycle manager for containers named under a common prefix.
#[derive(Debug)]
pub struct ContainerManager {
    config: OrchestratorConfig,
    selector: Arc<dyn RuntimeSelector>,
    bus: Arc<ContainerEventBus>,
    monitor: Mutex<Option<EventsMonitor>>,
}

impl ContainerManager {
    /// Manager with an explicit runtime selector.
    pub fn new(config: OrchestratorConfig, selector: Arc<dyn RuntimeSelector>) -> Self {
        Self {
            config,
            selector,
            bus: Arc::new(ContainerEventBus::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Manager probing the PATH for a runtime per the config's preference
    /// order.
    pub fn with_default_selector(config: OrchestratorConfig) -> Self {
        let selector = Arc::new(PathRuntimeSelector::from_config(&config));
        Self::new(config, selector)
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Event bus carrying lifecycle and death notifications.
    pub fn events(&self) -> &ContainerEventBus {
        &self.bus
    }

    /// Subscribe to every state-changing operation.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe_lifecycle()
    }

    /// Subscribe to deaths observed by the events monitor.
    pub fn subscribe_died(&self) -> broadcast::Receiver<ContainerDiedEvent> {
        self.bus.subscribe_died()
    }

    /// Build a runtime-safe container name for a task.
    ///
    /// Characters outside `[A-Za-z0-9_-]` in the task id are replaced with
    /// `_`; the default shape is `<prefix><separator><task>`.
    pub fn generate_container_name(&self, task_id: &str, options: &NameOptions) -> String {
        let prefix = options
            .prefix
            .as_deref()
            .unwrap_or(&self.config.name_prefix);
        let separator = options
            .separator
            .as_deref()
            .unwrap_or(&self.config.name_separator);

        let mut name = prefix.to_string();
        if options.include_task_id && !task_id.is_empty() {
            name.push_str(separator);
            name.push_str(&UNSAFE_NAME_CHARS.replace_all(task_id, "_"));
        }
        if options.include_timestamp {
            let suffix = Uuid::new_v4().simple().to_string();
            name.push_str(separator);
            name.push_str(&suffix[..8]);
        }
        name
    }

    /// Create a container, optionally building its image and starting it.
    ///
    /// A configured Dockerfile that does not exist, or a build that fails,
    /// falls back to the configured image; the create itself still runs. With
    /// `auto_start`, a failed start triggers a best-effort `rm` of the
    /// just-created container and the start failure becomes the result; the
    /// created event is withheld until the chain resolves, so its success
    /// flag always reports the operation's overall outcome.
    pub async fn create_container(&self, options: CreateContainerOptions) -> ContainerOperationResult {
        let CreateContainerOptions {
            mut config,
            task_id,
            name,
            auto_start,
            runtime,
        } = options;

        let runtime = match self.resolve_runtime(runtime).await {
            Some(runtime) => runtime,
            None => {
                let result = ContainerOperationResult::failed(
                    String::new(),
                    ContainerError::RuntimeUnavailable.to_string(),
                );
                self.publish(LifecycleOperation::Created, &result, task_id);
                return result;
            }
        };
        let binary = self.binary_for(runtime);

        let container_name = match name {
            Some(name) => name,
            None => self.generate_container_name(
                task_id.as_deref().unwrap_or(""),
                &NameOptions::default(),
            ),
        };

        config.image = self.resolve_image(&binary, &container_name, &config).await;

        let args = command::build_create_args(&container_name, &config);
        let rendered = command::render_command(&binary, &args);
        let create_result = match run_runtime_command(&binary, &args, Some(self.command_deadline())).await
        {
            Ok(output) if output.timed_out => ContainerOperationResult::failed(
                rendered,
                format!("Command timed out after {}ms", self.config.command_timeout_ms),
            ),
            Ok(output) if output.exit_code != 0 => {
                ContainerOperationResult::failed(rendered, failure_message(&output))
            }
            Ok(output) => {
                // The runtime prints the new container's id on stdout
                let id = output.stdout.trim();
                let id = if id.is_empty() { container_name.as_str() } else { id };
                ContainerOperationResult::succeeded(id, rendered)
            }
            Err(e) => ContainerOperationResult::failed(
                rendered,
                format!("Failed to spawn {}: {}", binary, e),
            ),
        };
        if !create_result.success || !auto_start {
            self.publish(LifecycleOperation::Created, &create_result, task_id);
            return create_result;
        }

        // Hold the created event back until the chained start resolves, so
        // a subscriber never hears about a container the rollback below is
        // about to remove
        let start_args = vec!["start".to_string(), create_result.container_id.clone()];
        let start_result = self
            .run_lifecycle(&create_result.container_id, start_args, Some(runtime), true)
            .await;
        if start_result.success {
            let result = ContainerOperationResult {
                container_info: start_result.container_info.clone(),
                ..create_result
            };
            self.publish(LifecycleOperation::Created, &result, task_id.clone());
            self.publish(LifecycleOperation::Started, &start_result, task_id);
            return result;
        }

        // Best-effort rollback; its own outcome never changes the reported
        // failure, and neither a removed nor a started event is published
        // for the abandoned container
        let rm_args = vec![
            "rm".to_string(),
            "--force".to_string(),
            create_result.container_id.clone(),
        ];
        match run_runtime_command(&binary, &rm_args, Some(self.command_deadline())).await {
            Ok(output) if output.exit_code != 0 => {
                debug!(
                    "Rollback rm for {} exited {}",
                    create_result.container_id, output.exit_code
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to spawn rollback rm for {}: {}", create_result.container_id, e),
        }
        let result = ContainerOperationResult {
            success: false,
            error: start_result.error,
            container_info: None,
            ..create_result
        };
        self.publish(LifecycleOperation::Created, &result, task_id);
        result
    }

    /// Start a container and attach a fresh inspect snapshot on success.
    pub async fn start_container(
        &self,
        container_id: &str,
        options: StartContainerOptions,
    ) -> ContainerOperationResult {
        let args = vec!["start".to_string(), container_id.to_string()];
        self.lifecycle_command(
            LifecycleOperation::Started,
            container_id,
            args,
            options.runtime,
            options.task_id,
            true,
        )
        .await
    }

    /// Stop a container, giving it a grace period before the runtime kills
    /// it.
    pub async fn stop_container(
        &self,
        container_id: &str,
        options: StopContainerOptions,
    ) -> ContainerOperationResult {
        let grace = options.timeout_secs.unwrap_or(self.config.stop_timeout_secs);
        let args = vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.to_string(),
            container_id.to_string(),
        ];
        self.lifecycle_command(
            LifecycleOperation::Stopped,
            container_id,
            args,
            options.runtime,
            options.task_id,
            false,
        )
        .await
    }

    /// Remove a container, optionally while it is still running.
    pub async fn remove_container(
        &self,
        container_id: &str,
        options: RemoveContainerOptions,
    ) -> ContainerOperationResult {
        let mut args = vec!["rm".to_string()];
        if options.force {
            args.push("--force".to_string());
        }
        args.push(container_id.to_string());
        self.lifecycle_command(
            LifecycleOperation::Removed,
            container_id,
            args,
            options.runtime,
            options.task_id,
            false,
        )
        .await
    }

    /// Fresh metadata snapshot, `None` on any failure.
    pub async fn get_container_info(
        &self,
        container_id: &str,
        runtime: Option<ContainerRuntime>,
    ) -> Option<ContainerInfo> {
        let runtime = self.resolve_runtime(runtime).await?;
        let binary = self.binary_for(runtime);
        inspect_container(&binary, container_id, self.command_deadline()).await
    }

    /// One-shot resource snapshot, `None` on any failure.
    pub async fn get_stats(
        &self,
        container_id: &str,
        runtime: Option<ContainerRuntime>,
    ) -> Option<ContainerStats> {
        let runtime = self.resolve_runtime(runtime).await?;
        let binary = self.binary_for(runtime);
        let args = command::build_stats_args(container_id);
        let output = match run_runtime_command(&binary, &args, Some(self.command_deadline())).await {
            Ok(output) if output.exit_code == 0 => output,
            Ok(output) => {
                debug!("Stats for {} exited {}", container_id, output.exit_code);
                return None;
            }
            Err(e) => {
                debug!("Failed to spawn stats for {}: {}", container_id, e);
                return None;
            }
        };
        output
            .stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .and_then(output::parse_stats_line)
    }

    /// All containers carrying this manager's name prefix.
    ///
    /// Individual inspect failures are dropped from the result; a failed
    /// `ps` yields an empty list.
    pub async fn list_managed_containers(&self) -> Vec<ContainerInfo> {
        let runtime = match self.selector.best_runtime().await {
            Some(runtime) => runtime,
            None => return Vec::new(),
        };
        let binary = self.binary_for(runtime);
        let args = command::build_ps_args(&self.config.name_prefix);
        let output = match run_runtime_command(&binary, &args, Some(self.command_deadline())).await {
            Ok(output) if output.exit_code == 0 => output,
            Ok(output) => {
                debug!("Container listing exited {}", output.exit_code);
                return Vec::new();
            }
            Err(e) => {
                debug!("Failed to spawn container listing: {}", e);
                return Vec::new();
            }
        };

        let mut containers = Vec::new();
        for name in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(info) = inspect_container(&binary, name, self.command_deadline()).await {
                containers.push(info);
            }
        }
        containers
    }

    /// Run a command inside a container.
    ///
    /// Accepts a raw command line or a pre-split argv. An elapsed deadline
    /// reports exit code 124; every other failure carries the captured
    /// output and exit code.
    pub async fn exec_command(
        &self,
        container_id: &str,
        cmd: impl Into<ExecCommand>,
        options: ExecCommandOptions,
    ) -> ExecCommandResult {
        let argv = cmd.into().into_argv();
        if argv.is_empty() {
            return ExecCommandResult::failed(String::new(), "Empty command");
        }
        let runtime = match self.resolve_runtime(options.runtime).await {
            Some(runtime) => runtime,
            None => {
                return ExecCommandResult::failed(
                    String::new(),
                    ContainerError::RuntimeUnavailable.to_string(),
                )
            }
        };
        let binary = self.binary_for(runtime);
        let args = command::build_exec_args(container_id, &argv, &options);
        let rendered = command::render_command(&binary, &args);

        let requested = options
            .timeout_ms
            .unwrap_or(self.config.exec_timeout_ms as i64);
        let deadline = if requested > 0 {
            Some(Duration::from_millis(requested as u64))
        } else {
            None
        };

        match run_runtime_command(&binary, &args, deadline).await {
            Ok(output) if output.timed_out => ExecCommandResult {
                success: false,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: TIMEOUT_EXIT_CODE,
                command: rendered,
                error: Some(format!("Command timed out after {}ms", requested)),
            },
            Ok(output) => {
                let error = if output.exit_code == 0 {
                    None
                } else {
                    Some(failure_message(&output))
                };
                ExecCommandResult {
                    success: output.exit_code == 0,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    command: rendered,
                    error,
                }
            }
            Err(e) => {
                ExecCommandResult::failed(rendered, format!("Failed to spawn {}: {}", binary, e))
            }
        }
    }

    /// Start watching the runtime's event stream.
    ///
    /// Errors when no runtime is available, when monitoring is already
    /// active, or when the events subprocess cannot be spawned.
    pub async fn start_events_monitoring(
        &self,
        options: EventsMonitorOptions,
    ) -> Result<(), ContainerError> {
        let mut slot = self.monitor.lock().await;
        if slot.as_ref().map(EventsMonitor::is_active).unwrap_or(false) {
            return Err(ContainerError::AlreadyMonitoring);
        }

        let runtime = match self.selector.best_runtime().await {
            Some(runtime) => runtime,
            None => return Err(ContainerError::RuntimeUnavailable),
        };
        let binary = self.binary_for(runtime);

        let mut options = options;
        if options.event_types.is_empty() {
            options.event_types = self.config.default_event_types.clone();
        }
        let task_prefix = format!("{}{}", self.config.name_prefix, self.config.name_separator);

        let monitor = EventsMonitor::spawn(
            &binary,
            options,
            task_prefix,
            self.bus.clone(),
            self.command_deadline(),
            self.shutdown_grace(),
        )?;
        *slot = Some(monitor);
        Ok(())
    }

    /// Stop watching the runtime's event stream. Safe to call when never
    /// started.
    pub async fn stop_events_monitoring(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    /// Whether a live events subprocess is currently held.
    pub async fn is_events_monitoring_active(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .map(EventsMonitor::is_active)
            .unwrap_or(false)
    }

    /// Open a live log stream for a container.
    pub async fn stream_logs(
        &self,
        container_id: &str,
        options: LogStreamOptions,
    ) -> Result<ContainerLogStream, ContainerError> {
        let runtime = match self.selector.best_runtime().await {
            Some(runtime) => runtime,
            None => return Err(ContainerError::RuntimeUnavailable),
        };
        let binary = self.binary_for(runtime);
        ContainerLogStream::spawn(&binary, container_id, options, self.shutdown_grace())
    }

    /// Shared start/stop/remove path: resolve, run, map, publish.
    async fn lifecycle_command(
        &self,
        operation: LifecycleOperation,
        container_id: &str,
        args: Vec<String>,
        runtime: Option<ContainerRuntime>,
        task_id: Option<String>,
        attach_info: bool,
    ) -> ContainerOperationResult {
        let result = self
            .run_lifecycle(container_id, args, runtime, attach_info)
            .await;
        self.publish(operation, &result, task_id);
        result
    }

    /// Execute one lifecycle command and map its output, publishing nothing.
    async fn run_lifecycle(
        &self,
        container_id: &str,
        args: Vec<String>,
        runtime: Option<ContainerRuntime>,
        attach_info: bool,
    ) -> ContainerOperationResult {
        let runtime = match self.resolve_runtime(runtime).await {
            Some(runtime) => runtime,
            None => {
                return ContainerOperationResult::failed(
                    String::new(),
                    ContainerError::RuntimeUnavailable.to_string(),
                )
            }
        };
        let binary = self.binary_for(runtime);
        let rendered = command::render_command(&binary, &args);

        let mut result = match run_runtime_command(&binary, &args, Some(self.command_deadline())).await
        {
            Ok(output) if output.timed_out => ContainerOperationResult::failed(
                rendered,
                format!("Command timed out after {}ms", self.config.command_timeout_ms),
            ),
            Ok(output) if output.exit_code != 0 => {
                ContainerOperationResult::failed(rendered, failure_message(&output))
            }
            Ok(_) => ContainerOperationResult::succeeded(container_id, rendered),
            Err(e) => ContainerOperationResult::failed(
                rendered,
                format!("Failed to spawn {}: {}", binary, e),
            ),
        };
        if result.success && attach_info {
            result.container_info =
                inspect_container(&binary, container_id, self.command_deadline()).await;
        }
        result
    }

    fn publish(
        &self,
        operation: LifecycleOperation,
        result: &ContainerOperationResult,
        task_id: Option<String>,
    ) {
        let event = ContainerOperationEvent::from_result(result, task_id);
        self.bus.publish_operation(operation, event);
    }

    /// Build the image when a Dockerfile is configured; any build problem
    /// falls back to the configured image.
    async fn resolve_image(
        &self,
        binary: &str,
        container_name: &str,
        config: &ContainerConfig,
    ) -> String {
        let dockerfile = match &config.dockerfile {
            Some(path) => path,
            None => return config.image.clone(),
        };
        if !dockerfile.exists() {
            debug!(
                "Dockerfile {} not found, using image {}",
                dockerfile.display(),
                config.image
            );
            return config.image.clone();
        }

        let tag = format!("{}-image", container_name.to_lowercase());
        let context = match &config.build_context {
            Some(context) => context.clone(),
            None => dockerfile
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let args = vec![
            "build".to_string(),
            "--tag".to_string(),
            tag.clone(),
            "--file".to_string(),
            dockerfile.display().to_string(),
            context.display().to_string(),
        ];
        let deadline = Duration::from_millis(self.config.build_timeout_ms);
        match run_runtime_command(binary, &args, Some(deadline)).await {
            Ok(output) if output.exit_code == 0 && !output.timed_out => tag,
            Ok(output) => {
                warn!(
                    "Image build failed ({}), using image {}",
                    failure_message(&output),
                    config.image
                );
                config.image.clone()
            }
            Err(e) => {
                warn!("Failed to spawn image build: {}, using image {}", e, config.image);
                config.image.clone()
            }
        }
    }

    async fn resolve_runtime(
        &self,
        requested: Option<ContainerRuntime>,
    ) -> Option<ContainerRuntime> {
        match requested {
            Some(runtime) => Some(runtime),
            None => self.selector.best_runtime().await,
        }
    }

    /// Binary to invoke for a runtime, honoring the configured override.
    fn binary_for(&self, runtime: ContainerRuntime) -> String {
        match &self.config.binary_path {
            Some(path) => path.display().to_string(),
            None => runtime.binary().to_string(),
        }
    }

    fn command_deadline(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms)
    }

    fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_grace_ms)
    }
}

/// Run one runtime command to completion, capturing its output.
///
/// An elapsed deadline reports `timed_out` with exit code 124; the child is
/// reaped via `kill_on_drop`.
async fn run_runtime_command(
    binary: &str,
    args: &[String],
    deadline: Option<Duration>,
) -> std::io::Result<RuntimeCommandOutput> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let output = match deadline {
        Some(deadline) => match timeout(deadline, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Ok(RuntimeCommandOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                })
            }
        },
        None => child.wait_with_output().await?,
    };

    Ok(RuntimeCommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        timed_out: false,
    })
}

/// Most useful failure description available: stderr, then stdout, then the
/// bare exit code.
fn failure_message(output: &RuntimeCommandOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("Command failed with exit code {}", output.exit_code)
}

/// Inspect one container with the fixed template, bounded by `deadline` and
/// tolerating every failure as `None`.
pub(crate) async fn inspect_container(
    binary: &str,
    container_id: &str,
    deadline: Duration,
) -> Option<ContainerInfo> {
    let args = command::build_inspect_args(container_id);
    let output = match run_runtime_command(binary, &args, Some(deadline)).await {
        Ok(output) if output.timed_out => {
            debug!("Inspect for {} timed out", container_id);
            return None;
        }
        Ok(output) if output.exit_code != 0 => {
            debug!("Inspect for {} exited {}", container_id, output.exit_code);
            return None;
        }
        Ok(output) => output,
        Err(e) => {
            debug!("Failed to spawn inspect for {}: {}", container_id, e);
            return None;
        }
    };
    output
        .stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .and_then(output::parse_inspect_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FixedRuntimeSelector;
    use pretty_assertions::assert_eq;

    fn manager() -> ContainerManager {
        ContainerManager::new(
            OrchestratorConfig::default(),
            Arc::new(FixedRuntimeSelector::new(ContainerRuntime::Docker)),
        )
    }

    #[test]
    fn default_name_is_prefix_separator_task() {
        let manager = manager();
        let name = manager.generate_container_name("task-123", &NameOptions::default());
        assert_eq!(name, "apex-task-123");
    }

    #[test]
    fn unsafe_characters_become_underscores() {
        let manager = manager();
        let name = manager.generate_container_name("task with spaces!@#", &NameOptions::default());
        assert_eq!(name, "apex-task_with_spaces___");
    }

    #[test]
    fn uniqueness_suffix_appends_eight_chars() {
        let manager = manager();
        let options = NameOptions {
            include_timestamp: true,
            ..NameOptions::default()
        };
        let name = manager.generate_container_name("job", &options);
        assert!(name.starts_with("apex-job-"));
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn suffix_differs_between_calls() {
        let manager = manager();
        let options = NameOptions {
            include_timestamp: true,
            ..NameOptions::default()
        };
        let a = manager.generate_container_name("job", &options);
        let b = manager.generate_container_name("job", &options);
        assert_ne!(a, b);
    }

    #[test]
    fn task_segment_can_be_omitted() {
        let manager = manager();
        let options = NameOptions {
            include_task_id: false,
            ..NameOptions::default()
        };
        assert_eq!(manager.generate_container_name("ignored", &options), "apex");
    }

    #[test]
    fn empty_task_id_yields_just_the_prefix() {
        let manager = manager();
        assert_eq!(
            manager.generate_container_name("", &NameOptions::default()),
            "apex"
        );
    }

    #[test]
    fn custom_prefix_and_separator_override_config() {
        let manager = manager();
        let options = NameOptions {
            prefix: Some("worker".to_string()),
            separator: Some("_".to_string()),
            ..NameOptions::default()
        };
        assert_eq!(
            manager.generate_container_name("a.b", &options),
            "worker_a_b"
        );
    }

    #[test]
    fn failure_message_prefers_stderr() {
        let output = RuntimeCommandOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: 1,
            timed_out: false,
        };
        assert_eq!(failure_message(&output), "err");
    }

    #[test]
    fn failure_message_falls_back_to_stdout_then_code() {
        let output = RuntimeCommandOutput {
            stdout: "only stdout\n".to_string(),
            stderr: String::new(),
            exit_code: 2,
            timed_out: false,
        };
        assert_eq!(failure_message(&output), "only stdout");

        let silent = RuntimeCommandOutput {
            stdout: String::new(),
            stderr: "  \n".to_string(),
            exit_code: 3,
            timed_out: false,
        };
        assert_eq!(failure_message(&silent), "Command failed with exit code 3");
    }

    #[tokio::test]
    async fn exec_rejects_an_empty_command() {
        let manager = manager();
        let result = manager
            .exec_command("abc", Vec::<String>::new(), ExecCommandOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error.as_deref(), Some("Empty command"));
    }

    #[tokio::test]
    async fn no_runtime_fails_without_throwing() {
        let manager = ContainerManager::new(
            OrchestratorConfig::default(),
            Arc::new(FixedRuntimeSelector::none()),
        );
        let result = manager
            .create_container(CreateContainerOptions::new(ContainerConfig::new("alpine")))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("No container runtime available")
        );
        assert_eq!(result.container_id, "");
    }
}
