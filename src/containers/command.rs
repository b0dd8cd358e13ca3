//! Command construction and shell escaping for runtime CLI invocations.
//!
//! Everything user-controlled that ends up in a rendered command line goes
//! through [`escape_shell_arg`]. Execution itself always passes an argument
//! vector to the subprocess layer; the escaped string exists so results and
//! logs carry exactly what ran.

use once_cell::sync::Lazy;
use regex::Regex;

use super::logs::LogStreamOptions;
use super::monitor::EventsMonitorOptions;
use super::output;
use super::{ContainerConfig, ExecCommandOptions};

/// Characters that never need quoting in a POSIX shell.
static SAFE_ARG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-./:]+$").unwrap());

/// Quote one token for shell display.
///
/// Tokens made only of safe characters pass through untouched; everything
/// else is wrapped in single quotes, with embedded single quotes rewritten
/// as `'"'"'`.
pub fn escape_shell_arg(arg: &str) -> String {
    if SAFE_ARG.is_match(arg) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}

/// Render a full command line for logging and result reporting.
pub fn render_command(binary: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(escape_shell_arg(binary));
    parts.extend(args.iter().map(|arg| escape_shell_arg(arg)));
    parts.join(" ")
}

/// Arguments for `create`, translating the declarative config into flags.
///
/// Flag groups keep a fixed order so rendered commands are deterministic:
/// name, entrypoint, mounts, env, placement, labels, resources, security,
/// auto-remove, then the image and its positional command.
pub fn build_create_args(name: &str, config: &ContainerConfig) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), name.to_string()];

    if let Some(entrypoint) = &config.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }
    for (host, container) in &config.volumes {
        args.push("--volume".to_string());
        args.push(format!("{}:{}", host, container));
    }
    for (key, value) in &config.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(working_dir) = &config.working_dir {
        args.push("--workdir".to_string());
        args.push(working_dir.clone());
    }
    if let Some(user) = &config.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if let Some(network) = &config.network_mode {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend(resource_args(config));
    args.extend(security_args(config));
    if config.auto_remove {
        args.push("--rm".to_string());
    }

    args.push(config.image.clone());
    args.extend(config.command.iter().cloned());
    args
}

/// Resource limit flags. Absent limits emit nothing.
pub fn resource_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(memory) = &config.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(reservation) = &config.memory_reservation {
        args.push("--memory-reservation".to_string());
        args.push(reservation.clone());
    }
    if let Some(swap) = &config.memory_swap {
        args.push("--memory-swap".to_string());
        args.push(swap.clone());
    }
    if let Some(cpus) = config.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    if let Some(shares) = config.cpu_shares {
        args.push("--cpu-shares".to_string());
        args.push(shares.to_string());
    }
    if let Some(limit) = config.pids_limit {
        args.push("--pids-limit".to_string());
        args.push(limit.to_string());
    }
    args
}

/// Security flags: privilege escalation, capabilities, security options.
pub fn security_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = Vec::new();
    if config.privileged {
        args.push("--privileged".to_string());
    }
    for cap in &config.cap_add {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    for cap in &config.cap_drop {
        args.push("--cap-drop".to_string());
        args.push(cap.clone());
    }
    for opt in &config.security_opts {
        args.push("--security-opt".to_string());
        args.push(opt.clone());
    }
    args
}

/// Arguments for `exec` with the given argv and options.
pub fn build_exec_args(
    container_id: &str,
    argv: &[String],
    options: &ExecCommandOptions,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if options.tty {
        args.push("--tty".to_string());
    }
    if options.interactive {
        args.push("--interactive".to_string());
    }
    if options.privileged {
        args.push("--privileged".to_string());
    }
    if let Some(working_dir) = &options.working_dir {
        args.push("--workdir".to_string());
        args.push(working_dir.clone());
    }
    if let Some(user) = &options.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    for (key, value) in &options.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(container_id.to_string());
    args.extend(argv.iter().cloned());
    args
}

/// Arguments for `logs` with the stream's flag set.
pub fn build_logs_args(container_id: &str, options: &LogStreamOptions) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if options.follow {
        args.push("--follow".to_string());
    }
    if options.timestamps {
        args.push("--timestamps".to_string());
    }
    if let Some(since) = &options.since {
        args.push("--since".to_string());
        args.push(since.clone());
    }
    if let Some(until) = &options.until {
        args.push("--until".to_string());
        args.push(until.clone());
    }
    if let Some(tail) = &options.tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    args.push(container_id.to_string());
    args
}

/// Arguments for `events` in NDJSON mode with event and label filters.
pub fn build_events_args(options: &EventsMonitorOptions) -> Vec<String> {
    let mut args = vec![
        "events".to_string(),
        "--format".to_string(),
        "{{json .}}".to_string(),
    ];
    for event in &options.event_types {
        args.push("--filter".to_string());
        args.push(format!("event={}", event));
    }
    for (key, value) in &options.label_filters {
        args.push("--filter".to_string());
        args.push(format!("label={}={}", key, value));
    }
    args
}

/// Arguments for the fixed-template `inspect`.
pub fn build_inspect_args(container_id: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "--format".to_string(),
        output::INSPECT_FORMAT.to_string(),
        container_id.to_string(),
    ]
}

/// Arguments for one-shot `stats`.
pub fn build_stats_args(container_id: &str) -> Vec<String> {
    vec![
        "stats".to_string(),
        "--no-stream".to_string(),
        "--format".to_string(),
        output::STATS_FORMAT.to_string(),
        container_id.to_string(),
    ]
}

/// Arguments for listing containers whose name carries `prefix`.
pub fn build_ps_args(prefix: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "--filter".to_string(),
        format!("name={}", prefix),
        "--format".to_string(),
        "{{.Names}}".to_string(),
    ]
}

/// Tokenize a command line, honoring quotes and backslashes.
///
/// Unbalanced quoting falls back to plain whitespace splitting instead of
/// failing; an empty or all-whitespace line yields an empty vector.
pub fn split_command_line(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match shell_words::split(trimmed) {
        Ok(tokens) => tokens,
        Err(_) => trimmed.split_whitespace().map(str::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn safe_tokens_pass_through() {
        assert_eq!(escape_shell_arg("node:20-alpine"), "node:20-alpine");
        assert_eq!(escape_shell_arg("/usr/local/bin"), "/usr/local/bin");
        assert_eq!(escape_shell_arg("task_1.log"), "task_1.log");
    }

    #[test]
    fn unsafe_tokens_get_single_quoted() {
        assert_eq!(escape_shell_arg("hello world"), "'hello world'");
        assert_eq!(escape_shell_arg("$HOME"), "'$HOME'");
        assert_eq!(escape_shell_arg("a;b"), "'a;b'");
        assert_eq!(escape_shell_arg(""), "''");
    }

    #[test]
    fn embedded_single_quotes_use_the_close_reopen_idiom() {
        assert_eq!(escape_shell_arg("it's"), r#"'it'"'"'s'"#);
        assert_eq!(escape_shell_arg("''"), r#"''"'"''"'"''"#);
    }

    #[test]
    fn render_includes_binary_and_escapes_args() {
        let rendered = render_command("docker", &strings(&["exec", "c1", "echo", "hi there"]));
        assert_eq!(rendered, "docker exec c1 echo 'hi there'");
    }

    #[test]
    fn create_args_for_a_minimal_config() {
        let config = ContainerConfig::new("alpine:3.19");
        let args = build_create_args("apex-task-1", &config);
        assert_eq!(
            args,
            strings(&["create", "--name", "apex-task-1", "alpine:3.19"])
        );
    }

    #[test]
    fn create_args_translate_the_full_config() {
        let mut config = ContainerConfig::new("node:20-alpine");
        config.command = strings(&["npm", "test"]);
        config.entrypoint = Some("/bin/sh".to_string());
        config.volumes.insert("/host/src".to_string(), "/app".to_string());
        config.env.insert("NODE_ENV".to_string(), "test".to_string());
        config.working_dir = Some("/app".to_string());
        config.user = Some("1000:1000".to_string());
        config.network_mode = Some("none".to_string());
        config.labels.insert("apex.task".to_string(), "t1".to_string());
        config.memory = Some("512m".to_string());
        config.cpus = Some(1.5);
        config.pids_limit = Some(128);
        config.privileged = true;
        config.cap_drop = strings(&["ALL"]);
        config.security_opts = strings(&["no-new-privileges"]);
        config.auto_remove = true;

        let args = build_create_args("apex-task-1", &config);
        assert_eq!(
            args,
            strings(&[
                "create",
                "--name",
                "apex-task-1",
                "--entrypoint",
                "/bin/sh",
                "--volume",
                "/host/src:/app",
                "--env",
                "NODE_ENV=test",
                "--workdir",
                "/app",
                "--user",
                "1000:1000",
                "--network",
                "none",
                "--label",
                "apex.task=t1",
                "--memory",
                "512m",
                "--cpus",
                "1.5",
                "--pids-limit",
                "128",
                "--privileged",
                "--cap-drop",
                "ALL",
                "--security-opt",
                "no-new-privileges",
                "--rm",
                "node:20-alpine",
                "npm",
                "test",
            ])
        );
    }

    #[test]
    fn resource_args_skip_absent_limits() {
        assert!(resource_args(&ContainerConfig::new("img")).is_empty());

        let mut config = ContainerConfig::new("img");
        config.memory_swap = Some("1g".to_string());
        config.cpu_shares = Some(512);
        assert_eq!(
            resource_args(&config),
            strings(&["--memory-swap", "1g", "--cpu-shares", "512"])
        );
    }

    #[test]
    fn exec_args_carry_flags_before_id_and_argv() {
        let mut env = IndexMap::new();
        env.insert("CI".to_string(), "1".to_string());
        let options = ExecCommandOptions {
            working_dir: Some("/work".to_string()),
            user: Some("root".to_string()),
            env,
            tty: true,
            ..ExecCommandOptions::default()
        };
        let args = build_exec_args("abc123", &strings(&["npm", "test"]), &options);
        assert_eq!(
            args,
            strings(&[
                "exec", "--tty", "--workdir", "/work", "--user", "root", "--env", "CI=1",
                "abc123", "npm", "test",
            ])
        );
    }

    #[test]
    fn logs_args_reflect_the_flag_set() {
        let options = LogStreamOptions {
            timestamps: true,
            since: Some("10m".to_string()),
            tail: Some(super::super::LogTail::Lines(50)),
            ..LogStreamOptions::default()
        };
        let args = build_logs_args("abc123", &options);
        assert_eq!(
            args,
            strings(&[
                "logs",
                "--follow",
                "--timestamps",
                "--since",
                "10m",
                "--tail",
                "50",
                "abc123",
            ])
        );
    }

    #[test]
    fn events_args_use_ndjson_and_filters() {
        let mut options = EventsMonitorOptions::default();
        options.label_filters.insert("apex.owner".to_string(), "ci".to_string());
        let args = build_events_args(&options);
        assert_eq!(
            args,
            strings(&[
                "events",
                "--format",
                "{{json .}}",
                "--filter",
                "event=die",
                "--filter",
                "event=start",
                "--filter",
                "event=stop",
                "--filter",
                "event=create",
                "--filter",
                "event=destroy",
                "--filter",
                "label=apex.owner=ci",
            ])
        );
    }

    #[test]
    fn split_honors_quotes_and_backslashes() {
        assert_eq!(
            split_command_line(r#"echo "hello world" 'single here'"#),
            strings(&["echo", "hello world", "single here"])
        );
        assert_eq!(
            split_command_line(r"printf one\ token"),
            strings(&["printf", "one token"])
        );
    }

    #[test]
    fn split_collapses_whitespace_runs() {
        assert_eq!(
            split_command_line("  ls   -la\t/tmp  "),
            strings(&["ls", "-la", "/tmp"])
        );
    }

    #[test]
    fn split_of_blank_input_is_empty() {
        assert_eq!(split_command_line(""), Vec::<String>::new());
        assert_eq!(split_command_line("   \t "), Vec::<String>::new());
    }

    #[test]
    fn split_falls_back_on_unbalanced_quotes() {
        assert_eq!(
            split_command_line(r#"echo "unterminated"#),
            strings(&["echo", "\"unterminated"])
        );
    }

    #[test]
    fn escaped_values_survive_tokenization() {
        for original in ["plain", "two words", "it's", "a\"b", "$PATH;rm -rf"] {
            let escaped = escape_shell_arg(original);
            let tokens = shell_words::split(&escaped).unwrap();
            assert_eq!(tokens, vec![original.to_string()]);
        }
    }
}
