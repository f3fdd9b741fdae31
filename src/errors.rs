use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PreviewError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreviewError {
    #[error("Runtime failed to boot after {attempts} attempts: {message}")]
    BootFailure { attempts: u32, message: String },

    #[error("Failed to mount files: {0}")]
    MountFailure(String),

    #[error("Dependency install exited with code {0}")]
    InstallNonZeroExit(i32),

    #[error("Timed out after {timeout:?} waiting for server to start on port {port}")]
    ServerStartTimeout { port: u16, timeout: Duration },

    #[error("Runtime handle was disposed; acquire the runtime again")]
    HandleDisposed,

    #[error("Runtime has not been booted")]
    NotBooted,

    #[error("Files are not mounted yet")]
    FilesNotMounted,

    #[error("Failed to spawn `{command}`: {message}")]
    SpawnFailure { command: String, message: String },

    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("Failed to write file {path}: {message}")]
    FileWrite { path: String, message: String },

    #[error("Failed to read file {path}: {message}")]
    FileRead { path: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl PreviewError {
    /// Whether the caller can reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PreviewError::BootFailure { .. }
                | PreviewError::MountFailure(_)
                | PreviewError::ServerStartTimeout { .. }
                | PreviewError::HandleDisposed
                | PreviewError::FileWrite { .. }
        )
    }
}

/// Render a boot error, annotating the failure modes browsers and hosts
/// commonly hit so the message is actionable on its own.
pub(crate) fn describe_boot_fault(err: &anyhow::Error) -> String {
    let message = format!("{err:#}");
    let lower = message.to_ascii_lowercase();

    let hint = if lower.contains("lockdown")
        || lower.contains("cross-origin")
        || lower.contains("isolation")
    {
        Some("the host environment is missing the isolation it requires (cross-origin-embedder-policy / cross-origin-opener-policy)")
    } else if lower.contains("worker") {
        Some("runtime workers could not be loaded; check network access and retry")
    } else {
        None
    };

    match hint {
        Some(hint) => format!("{message} ({hint})"),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_fault_hints() {
        let err = anyhow::anyhow!("SES lockdown failed");
        assert!(describe_boot_fault(&err).contains("isolation"));

        let err = anyhow::anyhow!("Unable to load worker script");
        assert!(describe_boot_fault(&err).contains("workers could not be loaded"));

        let err = anyhow::anyhow!("boom");
        assert_eq!(describe_boot_fault(&err), "boom");
    }

    #[test]
    fn retryable_classification() {
        assert!(PreviewError::HandleDisposed.is_retryable());
        assert!(PreviewError::ServerStartTimeout {
            port: 3000,
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!PreviewError::InstallNonZeroExit(1).is_retryable());
        assert!(!PreviewError::FilesNotMounted.is_retryable());
    }
}
