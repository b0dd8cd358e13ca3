//! Background watcher over the runtime's `events` stream.
//!
//! [`EventsMonitor`] holds one long-lived `events --format {{json .}}`
//! subprocess and decodes its NDJSON output line by line. Death events for
//! containers matching the configured name filter are enriched with a
//! deadline-bounded inspect round-trip and republished on the event bus;
//! everything else, including undecodable or non-UTF-8 lines, is skipped
//! without stopping the stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::{ContainerDiedEvent, ContainerEventBus};
use super::manager::inspect_container;
use super::{command, terminate_child, ContainerError};

/// Options for the `events` subprocess and the die pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsMonitorOptions {
    /// Event kinds to request, one `--filter event=<kind>` each
    pub event_types: Vec<String>,
    /// Label equality filters, one `--filter label=<k>=<v>` each
    pub label_filters: IndexMap<String, String>,
    /// Only act on containers whose name starts with this prefix;
    /// `None` accepts every container
    pub name_prefix: Option<String>,
}

impl Default for EventsMonitorOptions {
    fn default() -> Self {
        Self {
            event_types: vec![
                "die".to_string(),
                "start".to_string(),
                "stop".to_string(),
                "create".to_string(),
                "destroy".to_string(),
            ],
            label_filters: IndexMap::new(),
            name_prefix: None,
        }
    }
}

/// One decoded line of the `events` NDJSON stream.
///
/// The runtime emits both legacy (`status`) and modern (`Type`/`Action`)
/// shapes depending on version; both are accepted.
#[derive(Debug, Clone, Deserialize)]
struct RuntimeEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "Type")]
    event_type: Option<String>,
    #[serde(default, rename = "Action")]
    action: Option<String>,
    #[serde(default, rename = "Actor")]
    actor: Option<EventActor>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventActor {
    #[serde(default, rename = "ID")]
    id: Option<String>,
    #[serde(default, rename = "Attributes")]
    attributes: HashMap<String, String>,
}

impl RuntimeEvent {
    /// Event kind, whichever shape carried it.
    fn kind(&self) -> Option<&str> {
        self.status.as_deref().or(self.action.as_deref())
    }

    fn container_id(&self) -> Option<&str> {
        self.actor
            .as_ref()
            .and_then(|actor| actor.id.as_deref())
            .or(self.id.as_deref())
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.actor
            .as_ref()
            .and_then(|actor| actor.attributes.get(key))
            .map(String::as_str)
    }
}

/// Live `events` subprocess plus the decoder task feeding the bus.
#[derive(Debug)]
pub struct EventsMonitor {
    command: String,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    decoder: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicBool>,
}

impl EventsMonitor {
    /// Spawn the `events` subprocess and start decoding.
    ///
    /// `task_prefix` is stripped from matching container names to recover
    /// the caller's task id (e.g. `"apex-"` turns `apex-build-1` into
    /// `build-1`).
    pub(crate) fn spawn(
        binary: &str,
        options: EventsMonitorOptions,
        task_prefix: String,
        bus: Arc<ContainerEventBus>,
        inspect_deadline: Duration,
        grace: Duration,
    ) -> Result<Self, ContainerError> {
        let args = command::build_events_args(&options);
        let rendered = command::render_command(binary, &args);

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ContainerError::SpawnFailed {
                command: rendered.clone(),
                source,
            })?;

        // A pid of None here means the child was reaped before we ever got
        // to read from it
        if child.id().is_none() {
            return Err(ContainerError::SpawnFailed {
                command: rendered,
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "events process exited immediately",
                ),
            });
        }

        let stdout = match child.stdout.take() {
            Some(pipe) => pipe,
            None => {
                return Err(ContainerError::SpawnFailed {
                    command: rendered,
                    source: std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "events process has no stdout pipe",
                    ),
                });
            }
        };

        let active = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let decoder = {
            let binary = binary.to_string();
            let active = active.clone();
            let name_filter = options.name_prefix.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            terminate_child(&mut child, grace).await;
                            break;
                        }
                        // read_until leaves a partial line in `buf` when the
                        // shutdown branch wins, so nothing is lost between
                        // iterations
                        read = reader.read_until(b'\n', &mut buf) => match read {
                            Ok(0) => break,
                            Ok(_) => {
                                let line = super::decode_line(&buf);
                                buf.clear();
                                // Stay responsive to shutdown while the die
                                // enrichment runs its inspect
                                tokio::select! {
                                    _ = &mut shutdown_rx => {
                                        terminate_child(&mut child, grace).await;
                                        break;
                                    }
                                    _ = handle_event_line(
                                        &binary,
                                        &line,
                                        name_filter.as_deref(),
                                        &task_prefix,
                                        inspect_deadline,
                                        &bus,
                                    ) => {}
                                }
                            }
                            Err(e) => {
                                warn!("Runtime events stream read failed: {}", e);
                                break;
                            }
                        },
                    }
                }
                active.store(false, Ordering::SeqCst);
            })
        };

        Ok(Self {
            command: rendered,
            shutdown: Mutex::new(Some(shutdown_tx)),
            decoder: Mutex::new(Some(decoder)),
            active,
        })
    }

    /// Exact command line the monitor runs, for observability.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the subprocess is still believed to be running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Terminate the subprocess and wait for the decoder to finish; the wait
    /// stays within the grace period even while an enrichment inspect is in
    /// flight. Safe to call more than once; later calls are no-ops.
    pub async fn stop(&self) {
        let sender = self.shutdown.lock().await.take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        let handle = self.decoder.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Decode one NDJSON line and republish deaths of matching containers.
async fn handle_event_line(
    binary: &str,
    line: &str,
    name_filter: Option<&str>,
    task_prefix: &str,
    inspect_deadline: Duration,
    bus: &ContainerEventBus,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let event: RuntimeEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping undecodable runtime event: {}", e);
            return;
        }
    };

    // Modern-shape events carry a Type; only container events matter here
    if let Some(event_type) = event.event_type.as_deref() {
        if event_type != "container" {
            return;
        }
    }
    if event.kind() != Some("die") {
        return;
    }
    let container_id = match event.container_id() {
        Some(id) => id.to_string(),
        None => {
            debug!("Ignoring die event without a container id");
            return;
        }
    };
    let name = event.attribute("name").unwrap_or(&container_id).to_string();
    if let Some(prefix) = name_filter {
        if !name.starts_with(prefix) {
            return;
        }
    }

    // The container may already be gone by the time we inspect, in which
    // case the event attributes are the only source for the exit code
    let info = inspect_container(binary, &container_id, inspect_deadline).await;
    let exit_code = info
        .as_ref()
        .and_then(|info| info.exit_code)
        .or_else(|| {
            event
                .attribute("exitCode")
                .and_then(|code| code.parse().ok())
        })
        .unwrap_or(-1);
    let oom_killed = info
        .as_ref()
        .and_then(|info| info.oom_killed)
        .unwrap_or(false);
    let timestamp = event
        .time
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let task_id = name.strip_prefix(task_prefix).unwrap_or(&name).to_string();
    bus.publish_died(ContainerDiedEvent {
        container_id,
        task_id,
        exit_code,
        oom_killed,
        timestamp,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn legacy_event_shape_decodes() {
        let event: RuntimeEvent = serde_json::from_str(
            r#"{"status":"die","id":"abc123","Actor":{"ID":"abc123","Attributes":{"name":"apex-task-1","exitCode":"137"}},"time":1692960000}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), Some("die"));
        assert_eq!(event.container_id(), Some("abc123"));
        assert_eq!(event.attribute("name"), Some("apex-task-1"));
        assert_eq!(event.attribute("exitCode"), Some("137"));
    }

    #[test]
    fn modern_event_shape_decodes() {
        let event: RuntimeEvent = serde_json::from_str(
            r#"{"Type":"container","Action":"die","Actor":{"ID":"def456","Attributes":{"name":"apex-task-2"}}}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), Some("die"));
        assert_eq!(event.event_type.as_deref(), Some("container"));
        assert_eq!(event.container_id(), Some("def456"));
    }

    #[test]
    fn status_wins_over_action_when_both_present() {
        let event: RuntimeEvent =
            serde_json::from_str(r#"{"status":"die","Action":"kill"}"#).unwrap();
        assert_eq!(event.kind(), Some("die"));
    }

    #[test]
    fn default_options_request_the_standard_event_set() {
        let options = EventsMonitorOptions::default();
        assert_eq!(
            options.event_types,
            vec!["die", "start", "stop", "create", "destroy"]
        );
        assert!(options.label_filters.is_empty());
        assert_eq!(options.name_prefix, None);
    }

    const INSPECT_DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn garbage_line_is_skipped_without_publishing() {
        let bus = ContainerEventBus::new();
        let mut died = bus.subscribe_died();
        handle_event_line("docker", "{not json", None, "apex-", INSPECT_DEADLINE, &bus).await;
        handle_event_line("docker", "", None, "apex-", INSPECT_DEADLINE, &bus).await;
        assert!(died.try_recv().is_err());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn garbage_line_is_logged() {
        let bus = ContainerEventBus::new();
        handle_event_line("docker", "{not json", None, "apex-", INSPECT_DEADLINE, &bus).await;
        assert!(logs_contain("Skipping undecodable runtime event"));
    }

    #[tokio::test]
    async fn non_die_events_are_ignored() {
        let bus = ContainerEventBus::new();
        let mut died = bus.subscribe_died();
        handle_event_line(
            "docker",
            r#"{"status":"start","id":"abc","Actor":{"Attributes":{"name":"apex-x"}}}"#,
            None,
            "apex-",
            INSPECT_DEADLINE,
            &bus,
        )
        .await;
        assert!(died.try_recv().is_err());
    }

    #[tokio::test]
    async fn name_filter_drops_foreign_containers() {
        let bus = ContainerEventBus::new();
        let mut died = bus.subscribe_died();
        handle_event_line(
            "/nonexistent-runtime-binary",
            r#"{"status":"die","id":"abc","Actor":{"ID":"abc","Attributes":{"name":"other-thing","exitCode":"0"}}}"#,
            Some("apex-"),
            "apex-",
            INSPECT_DEADLINE,
            &bus,
        )
        .await;
        assert!(died.try_recv().is_err());
    }

    #[tokio::test]
    async fn die_event_falls_back_to_attribute_exit_code() {
        let bus = ContainerEventBus::new();
        let mut died = bus.subscribe_died();
        // Inspect against a nonexistent binary fails, so the exitCode
        // attribute must carry the result
        handle_event_line(
            "/nonexistent-runtime-binary",
            r#"{"status":"die","id":"abc123","Actor":{"ID":"abc123","Attributes":{"name":"apex-task-9","exitCode":"137"}},"time":1692960000}"#,
            Some("apex-"),
            "apex-",
            INSPECT_DEADLINE,
            &bus,
        )
        .await;
        let event = died.try_recv().unwrap();
        assert_eq!(event.container_id, "abc123");
        assert_eq!(event.task_id, "task-9");
        assert_eq!(event.exit_code, 137);
        assert!(!event.oom_killed);
        assert_eq!(event.timestamp.timestamp(), 1692960000);
    }
}
