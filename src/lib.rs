//! Shared lifecycle management for live code-preview runtimes.
//!
//! A [`SandboxRuntimeManager`] keeps at most one runtime instance alive for
//! any number of consumers: the first [`acquire`](SandboxRuntimeManager::acquire)
//! boots it (with retries), concurrent callers share that boot, and the last
//! [`release`](SandboxRuntimeManager::release) tears it down. Between those
//! points consumers mount a project tree, start a dev server and follow the
//! lifecycle through status subscriptions.
//!
//! ```rust,ignore
//! use previewbox::{create_default_manager, PreviewOptions, VirtualFileNode};
//!
//! let manager = create_default_manager()?;
//! let handle = manager.acquire().await?;
//! manager.mount_files(&[VirtualFileNode::file("/index.js", "...")]).await?;
//! let url = manager.start_server(PreviewOptions::port(3000)).await?;
//! manager.release(handle).await;
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod native;
pub mod sandbox_builder;
pub mod status;
pub mod tree;

#[cfg(test)]
mod fake;

pub use config::{ManagerConfig, PreviewOptions, DEFAULT_PORT, MANIFEST_FILE};
pub use engine::{
    BootConfig, ProcessControl, RuntimeBooter, RuntimeInstance, ServerReady, SpawnedProcess,
};
pub use errors::{PreviewError, Result};
pub use manager::{RuntimeHandle, SandboxRuntimeManager};
pub use native::{detect_server_url, NativeInstance, NativeRuntimeBooter};
pub use sandbox_builder::{
    create_default_manager, create_manager, create_native_manager, global_manager,
    install_global_manager, ManagerOptions,
};
pub use status::{LifecyclePhase, ServerStatus, StatusCallback, Subscription};
pub use tree::{MountEntry, MountTree, NodeKind, TreeError, VirtualFileNode};
