//! Streaming reader for container logs.
//!
//! [`ContainerLogStream`] wraps one long-lived `logs` subprocess. Lines are
//! parsed as they arrive and delivered twice: pushed to broadcast
//! subscribers as [`LogStreamEvent`]s and queued for pull-based iteration
//! via [`ContainerLogStream::next_entry`]. Process-level errors and the
//! final exit surface as their own events, never folded into entries.

use std::fmt;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use super::{command, output, terminate_child, ContainerError};

/// Buffered push events before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1000;

static MUX_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(stdout|stderr):\s*").unwrap());

/// Which pipe a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogSource,
    /// Present when timestamps were requested and the line carried a
    /// parsable one; millisecond precision
    pub timestamp: Option<DateTime<Utc>>,
    /// Line with the timestamp and any multiplex prefix stripped
    pub message: String,
    /// Original line exactly as the runtime emitted it
    pub raw: String,
}

/// How many lines of history to request before following.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTail {
    /// Entire retained history
    All,
    /// Only the most recent `n` lines
    Lines(u64),
}

impl fmt::Display for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTail::All => write!(f, "all"),
            LogTail::Lines(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for LogTail {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LogTail::All => serializer.serialize_str("all"),
            LogTail::Lines(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for LogTail {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TailVisitor;

        impl<'de> serde::de::Visitor<'de> for TailVisitor {
            type Value = LogTail;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"all\" or a line count")
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<LogTail, E> {
                Ok(LogTail::Lines(value))
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<LogTail, E> {
                Ok(LogTail::Lines(value.max(0) as u64))
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<LogTail, E> {
                if value.eq_ignore_ascii_case("all") {
                    return Ok(LogTail::All);
                }
                value
                    .parse()
                    .map(LogTail::Lines)
                    .map_err(|_| E::custom(format!("invalid tail value: {}", value)))
            }
        }

        deserializer.deserialize_any(TailVisitor)
    }
}

/// Options for `logs` streaming.
///
/// Pipe filters default to enabled; an explicit `false` is authoritative
/// and wires that pipe to null instead of reading it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStreamOptions {
    /// Keep following new output
    pub follow: bool,
    /// Ask the runtime to prefix each line with an RFC3339 timestamp,
    /// which the stream parses off into [`LogEntry::timestamp`]
    pub timestamps: bool,
    /// Only logs after this moment (runtime-native timestamp or duration)
    pub since: Option<String>,
    /// Only logs before this moment
    pub until: Option<String>,
    /// History window to request
    pub tail: Option<LogTail>,
    /// Relay the stdout pipe
    pub stdout: bool,
    /// Relay the stderr pipe
    pub stderr: bool,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            follow: true,
            timestamps: false,
            since: None,
            until: None,
            tail: None,
            stdout: true,
            stderr: true,
        }
    }
}

/// Push notifications emitted alongside the pull iterator.
#[derive(Debug, Clone)]
pub enum LogStreamEvent {
    /// A parsed log line
    Entry(LogEntry),
    /// Pipe-level read failure
    Error(String),
    /// The logs subprocess exited (code absent on signal death)
    Exited(Option<i32>),
}

/// Live log stream bound to one `logs` subprocess.
///
/// Dropping the stream terminates the subprocess; [`end`](Self::end) does
/// the same explicitly and waits for teardown.
#[derive(Debug)]
pub struct ContainerLogStream {
    container_id: String,
    command: String,
    events: broadcast::Sender<LogStreamEvent>,
    #[allow(dead_code)]
    _keep_alive: broadcast::Receiver<LogStreamEvent>,
    entries: Mutex<mpsc::UnboundedReceiver<LogEntry>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicBool>,
}

impl ContainerLogStream {
    /// Spawn the `logs` subprocess and begin reading.
    pub(crate) fn spawn(
        binary: &str,
        container_id: &str,
        options: LogStreamOptions,
        grace: Duration,
    ) -> Result<Self, ContainerError> {
        let args = command::build_logs_args(container_id, &options);
        let rendered = command::render_command(binary, &args);

        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(if options.stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if options.stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ContainerError::SpawnFailed {
            command: rendered.clone(),
            source,
        })?;

        let active = Arc::new(AtomicBool::new(true));
        let (event_tx, keep_alive) = broadcast::channel(CHANNEL_CAPACITY);
        let (entry_tx, entry_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        if let Some(pipe) = child.stdout.take() {
            spawn_reader(
                pipe,
                LogSource::Stdout,
                options.timestamps,
                entry_tx.clone(),
                event_tx.clone(),
            );
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader(
                pipe,
                LogSource::Stderr,
                options.timestamps,
                entry_tx,
                event_tx.clone(),
            );
        }

        let supervisor = tokio::spawn(supervise(
            child,
            shutdown_rx,
            event_tx.clone(),
            active.clone(),
            grace,
        ));

        Ok(Self {
            container_id: container_id.to_string(),
            command: rendered,
            events: event_tx,
            _keep_alive: keep_alive,
            entries: Mutex::new(entry_rx),
            shutdown: Mutex::new(Some(shutdown_tx)),
            supervisor: Mutex::new(Some(supervisor)),
            active,
        })
    }

    /// Container the stream is attached to.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Exact command line the stream runs, for observability.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the subprocess is still believed to be running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Subscribe to push notifications (entries, errors, exit).
    pub fn subscribe(&self) -> broadcast::Receiver<LogStreamEvent> {
        self.events.subscribe()
    }

    /// Pull the next parsed entry; `None` once the stream has ended and the
    /// buffer is drained.
    pub async fn next_entry(&self) -> Option<LogEntry> {
        self.entries.lock().await.recv().await
    }

    /// Stop following and terminate the subprocess. Safe to call more than
    /// once; later calls are no-ops.
    pub async fn end(&self) {
        let sender = self.shutdown.lock().await.take();
        if let Some(sender) = sender {
            self.active.store(false, Ordering::SeqCst);
            let _ = sender.send(());
        }
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Convert into a plain `Stream` of entries.
    ///
    /// The subprocess is terminated when the returned stream is dropped.
    pub fn into_stream(self) -> LogEntryStream {
        LogEntryStream {
            entries: UnboundedReceiverStream::new(self.entries.into_inner()),
            shutdown: self.shutdown.into_inner(),
        }
    }
}

/// Owning `Stream` adapter over a log stream's entries.
#[derive(Debug)]
pub struct LogEntryStream {
    entries: UnboundedReceiverStream<LogEntry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Stream for LogEntryStream {
    type Item = LogEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogEntry>> {
        Pin::new(&mut self.entries).poll_next(cx)
    }
}

impl Drop for LogEntryStream {
    fn drop(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
    }
}

/// Read one pipe line by line, publishing parsed entries to both delivery
/// paths. Lines are framed with `read_until` and decoded lossily, so binary
/// garbage in the output costs one mangled entry rather than the stream;
/// `Error` is reserved for genuine read failures on the pipe.
fn spawn_reader<R>(
    pipe: R,
    stream: LogSource,
    timestamps: bool,
    entries: mpsc::UnboundedSender<LogEntry>,
    events: broadcast::Sender<LogStreamEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let entry = parse_log_line(&super::decode_line(&buf), stream, timestamps);
                    let _ = events.send(LogStreamEvent::Entry(entry.clone()));
                    if entries.send(entry).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events.send(LogStreamEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

/// Wait for the subprocess to exit, or terminate it on shutdown request.
/// Either way the final state is published as `Exited`.
async fn supervise(
    mut child: Child,
    shutdown: oneshot::Receiver<()>,
    events: broadcast::Sender<LogStreamEvent>,
    active: Arc<AtomicBool>,
    grace: Duration,
) {
    let exit_code = tokio::select! {
        status = child.wait() => status.ok().and_then(|status| status.code()),
        _ = shutdown => terminate_child(&mut child, grace).await,
    };
    active.store(false, Ordering::SeqCst);
    let _ = events.send(LogStreamEvent::Exited(exit_code));
}

/// Parse one raw line: an optional leading RFC3339 timestamp (when
/// requested), then an optional `stdout:`/`stderr:` multiplex prefix that
/// retags the entry's stream.
fn parse_log_line(raw: &str, stream: LogSource, timestamps: bool) -> LogEntry {
    let mut message = raw;
    let mut timestamp = None;

    if timestamps {
        if let Some((first, rest)) = message.split_once(' ') {
            if let Some(parsed) = output::parse_timestamp(first) {
                timestamp = Some(parsed);
                message = rest;
            }
        }
    }

    let mut tagged = stream;
    if let Some(caps) = MUX_PREFIX.captures(message) {
        if &caps[1] == "stderr" {
            tagged = LogSource::Stderr;
        } else {
            tagged = LogSource::Stdout;
        }
        message = &message[caps[0].len()..];
    }

    LogEntry {
        stream: tagged,
        timestamp,
        message: message.to_string(),
        raw: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_lines_pass_through() {
        let entry = parse_log_line("hello from the app", LogSource::Stdout, false);
        assert_eq!(entry.stream, LogSource::Stdout);
        assert_eq!(entry.timestamp, None);
        assert_eq!(entry.message, "hello from the app");
        assert_eq!(entry.raw, "hello from the app");
    }

    #[test]
    fn timestamps_are_stripped_and_truncated() {
        let entry = parse_log_line(
            "2023-08-25T12:34:56.123456789Z server listening",
            LogSource::Stdout,
            true,
        );
        assert_eq!(entry.message, "server listening");
        let ts = entry.timestamp.unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_000_000);
        assert!(entry.raw.starts_with("2023-08-25T"));
    }

    #[test]
    fn unparsable_timestamp_leaves_the_line_intact() {
        let entry = parse_log_line("notadate hello", LogSource::Stdout, true);
        assert_eq!(entry.timestamp, None);
        assert_eq!(entry.message, "notadate hello");
    }

    #[test]
    fn timestamps_ignored_when_not_requested() {
        let entry = parse_log_line(
            "2023-08-25T12:34:56.123456789Z server listening",
            LogSource::Stdout,
            false,
        );
        assert_eq!(entry.timestamp, None);
        assert!(entry.message.starts_with("2023-08-25T"));
    }

    #[test]
    fn multiplex_prefix_retags_the_stream() {
        let entry = parse_log_line("stderr: boom", LogSource::Stdout, false);
        assert_eq!(entry.stream, LogSource::Stderr);
        assert_eq!(entry.message, "boom");

        let entry = parse_log_line("stdout: fine", LogSource::Stderr, false);
        assert_eq!(entry.stream, LogSource::Stdout);
        assert_eq!(entry.message, "fine");
    }

    #[test]
    fn timestamp_then_prefix_both_strip() {
        let entry = parse_log_line(
            "2023-08-25T12:34:56.000000000Z stderr: late failure",
            LogSource::Stdout,
            true,
        );
        assert_eq!(entry.stream, LogSource::Stderr);
        assert_eq!(entry.message, "late failure");
        assert!(entry.timestamp.is_some());
    }

    #[tokio::test]
    async fn reader_survives_invalid_utf8_bytes() {
        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel();
        let (event_tx, _keep_alive) = broadcast::channel(16);
        let bytes: &'static [u8] = b"before\n\xff\xfe mid\nafter\n";
        spawn_reader(bytes, LogSource::Stdout, false, entry_tx, event_tx);

        assert_eq!(entry_rx.recv().await.unwrap().message, "before");
        assert_eq!(entry_rx.recv().await.unwrap().message, "\u{fffd}\u{fffd} mid");
        assert_eq!(entry_rx.recv().await.unwrap().message, "after");
        assert_eq!(entry_rx.recv().await, None);
    }

    #[test]
    fn tail_displays_as_flag_value() {
        assert_eq!(LogTail::All.to_string(), "all");
        assert_eq!(LogTail::Lines(50).to_string(), "50");
    }

    #[test]
    fn tail_deserializes_both_shapes() {
        let all: LogTail = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, LogTail::All);
        let lines: LogTail = serde_json::from_str("25").unwrap();
        assert_eq!(lines, LogTail::Lines(25));
    }

    #[test]
    fn default_options_follow_both_pipes() {
        let options = LogStreamOptions::default();
        assert!(options.follow);
        assert!(options.stdout);
        assert!(options.stderr);
        assert!(!options.timestamps);
        assert_eq!(options.tail, None);
    }
}
