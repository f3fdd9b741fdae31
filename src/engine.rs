use crate::tree::MountTree;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Options passed to the boot primitive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootConfig {
    /// Name of the working directory inside the runtime
    pub workdir_name: String,
}

/// Emitted by a runtime once a process inside it is reachable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Kill switch for a process spawned inside a runtime
pub trait ProcessControl: Send + Sync {
    fn kill(&self);
}

/// A process running inside a runtime
pub struct SpawnedProcess {
    /// Combined stdout/stderr, line by line
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves with the exit code; dropped without a value if killed
    pub exit: oneshot::Receiver<i32>,
    pub control: Arc<dyn ProcessControl>,
}

/// Boots instances of an external execution environment
#[async_trait]
pub trait RuntimeBooter: Send + Sync {
    /// Start a fresh runtime instance
    async fn boot(&self, config: &BootConfig) -> anyhow::Result<Arc<dyn RuntimeInstance>>;

    /// Short name used in logs
    fn name(&self) -> &str;
}

/// One booted execution environment.
///
/// Paths are slash-separated and relative to the runtime's working
/// directory; a leading `/` refers to that directory.
#[async_trait]
pub trait RuntimeInstance: Send + Sync {
    /// Apply a whole tree to the working directory
    async fn mount(&self, tree: &MountTree) -> anyhow::Result<()>;

    /// Start `program` with `args` inside the working directory
    async fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<SpawnedProcess>;

    /// Subscribe to server-ready notifications
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    async fn read_file(&self, path: &str) -> anyhow::Result<String>;

    async fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()>;

    async fn mkdir(&self, path: &str, recursive: bool) -> anyhow::Result<()>;

    /// Release everything the instance holds
    async fn teardown(&self);
}
