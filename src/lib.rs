// Apex Container Orchestration Library
//
// This library manages the lifecycle of sandboxed task containers over an
// external docker/podman-compatible CLI: creation, execution, log streaming
// and runtime event monitoring for the Apex task-execution platform.

pub mod config;
pub mod containers;
pub mod runtime;

// Re-export commonly used types
pub use config::{ConfigError, OrchestratorConfig};
pub use containers::{
    ContainerConfig, ContainerDiedEvent, ContainerError, ContainerEventBus, ContainerInfo,
    ContainerLogStream, ContainerManager, ContainerOperationEvent, ContainerOperationResult,
    ContainerStats, ContainerStatus, CreateContainerOptions, EventsMonitorOptions, ExecCommand,
    ExecCommandOptions, ExecCommandResult, LifecycleEvent, LifecycleOperation, LogEntry,
    LogEntryStream, LogSource, LogStreamEvent, LogStreamOptions, LogTail, NameOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
pub use runtime::{ContainerRuntime, FixedRuntimeSelector, PathRuntimeSelector, RuntimeSelector};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
