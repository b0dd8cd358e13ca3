//! Container runtime detection and selection.
//!
//! The orchestrator never assumes which runtime binary is installed. It asks
//! an injected [`RuntimeSelector`] so embedders can probe PATH, pin a runtime,
//! or stub one out entirely in tests.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::OrchestratorConfig;

/// Supported container runtime CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Binary name the runtime is invoked as.
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// All runtimes this crate knows how to drive.
    pub fn all() -> [ContainerRuntime; 2] {
        [ContainerRuntime::Docker, ContainerRuntime::Podman]
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary())
    }
}

/// Decides which container runtime the orchestrator uses.
///
/// `best_runtime` returning `None` means no runtime is usable on this host;
/// lifecycle operations then fail with a "No container runtime available"
/// result instead of spawning anything.
#[async_trait]
pub trait RuntimeSelector: Send + Sync + fmt::Debug {
    /// The runtime the manager should prefer right now, if any.
    async fn best_runtime(&self) -> Option<ContainerRuntime>;

    /// Whether a specific runtime responds on this host.
    async fn is_runtime_available(&self, runtime: ContainerRuntime) -> bool;
}

/// Default selector: probes `<binary> --version` in preference order.
#[derive(Debug, Clone)]
pub struct PathRuntimeSelector {
    preference: Vec<ContainerRuntime>,
    binary_override: Option<PathBuf>,
}

impl PathRuntimeSelector {
    /// Probe docker first, then podman.
    pub fn new() -> Self {
        Self {
            preference: vec![ContainerRuntime::Docker, ContainerRuntime::Podman],
            binary_override: None,
        }
    }

    /// Probe in an explicit order.
    pub fn with_preference(preference: Vec<ContainerRuntime>) -> Self {
        Self {
            preference,
            binary_override: None,
        }
    }

    /// Selector honoring the config's probe order and binary override.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            preference: config.runtime_preference.clone(),
            binary_override: config.binary_path.clone(),
        }
    }

    async fn probe_runtime(&self, runtime: ContainerRuntime) -> bool {
        match &self.binary_override {
            Some(path) => probe_binary(&path.display().to_string()).await,
            None => probe_binary(runtime.binary()).await,
        }
    }
}

impl Default for PathRuntimeSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeSelector for PathRuntimeSelector {
    async fn best_runtime(&self) -> Option<ContainerRuntime> {
        for runtime in &self.preference {
            if self.probe_runtime(*runtime).await {
                return Some(*runtime);
            }
        }
        None
    }

    async fn is_runtime_available(&self, runtime: ContainerRuntime) -> bool {
        self.probe_runtime(runtime).await
    }
}

/// Spawn `<binary> --version` and report whether it exits cleanly.
async fn probe_binary(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Selector that always reports a fixed answer, bypassing probing.
///
/// Useful when the embedder already knows what is installed, and for tests.
#[derive(Debug, Clone)]
pub struct FixedRuntimeSelector {
    runtime: Option<ContainerRuntime>,
}

impl FixedRuntimeSelector {
    /// Always report this runtime as available.
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }

    /// Report that no runtime is available at all.
    pub fn none() -> Self {
        Self { runtime: None }
    }
}

#[async_trait]
impl RuntimeSelector for FixedRuntimeSelector {
    async fn best_runtime(&self) -> Option<ContainerRuntime> {
        self.runtime
    }

    async fn is_runtime_available(&self, runtime: ContainerRuntime) -> bool {
        self.runtime == Some(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn binary_names() {
        assert_eq!(ContainerRuntime::Docker.binary(), "docker");
        assert_eq!(ContainerRuntime::Podman.binary(), "podman");
    }

    #[test]
    fn display_matches_binary() {
        assert_eq!(ContainerRuntime::Docker.to_string(), "docker");
        assert_eq!(ContainerRuntime::Podman.to_string(), "podman");
    }

    #[test]
    fn serde_round_trip_is_lowercase() {
        let json = serde_json::to_string(&ContainerRuntime::Podman).unwrap();
        assert_eq!(json, "\"podman\"");
        let parsed: ContainerRuntime = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ContainerRuntime::Podman);
    }

    #[tokio::test]
    async fn fixed_selector_reports_its_runtime() {
        let selector = FixedRuntimeSelector::new(ContainerRuntime::Docker);
        assert_eq!(selector.best_runtime().await, Some(ContainerRuntime::Docker));
        assert!(selector.is_runtime_available(ContainerRuntime::Docker).await);
        assert!(!selector.is_runtime_available(ContainerRuntime::Podman).await);
    }

    #[tokio::test]
    async fn fixed_selector_none_reports_nothing() {
        let selector = FixedRuntimeSelector::none();
        assert_eq!(selector.best_runtime().await, None);
        assert!(!selector.is_runtime_available(ContainerRuntime::Docker).await);
    }

    #[tokio::test]
    async fn probing_a_missing_binary_is_false() {
        assert!(!probe_binary("definitely-not-a-container-runtime").await);
    }
}
