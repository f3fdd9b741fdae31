use crate::errors::{PreviewError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Port the dev server is expected to bind when the caller does not say.
pub const DEFAULT_PORT: u16 = 3000;

/// Manifest file checked for (and synthesized) before installing.
pub const MANIFEST_FILE: &str = "package.json";

/// Lifecycle tuning for [`crate::SandboxRuntimeManager`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Working directory name handed to the boot primitive
    pub workdir_name: String,
    /// Total boot attempts before giving up
    pub max_boot_attempts: u32,
    /// Delay before the second attempt; doubles for every later attempt
    pub boot_backoff_ms: u64,
    /// Upper bound for a single boot attempt
    pub boot_attempt_timeout_ms: u64,
    /// How long `start_server` waits for a server-ready notification
    pub server_ready_timeout_ms: u64,
    /// Upper bound for the dependency install step
    pub install_timeout_ms: u64,
    /// How long teardown waits for in-flight operations to settle
    pub teardown_grace_ms: u64,
    /// Port used when `PreviewOptions::port` is absent
    pub default_port: u16,
    /// Command used when `PreviewOptions::command` is absent
    pub default_command: String,
    /// Install command; `None` skips the install step entirely
    pub install_command: Option<String>,
    /// Manifest written when the mounted tree has none
    pub default_manifest: serde_json::Value,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workdir_name: "preview-project".to_string(),
            max_boot_attempts: 3,
            boot_backoff_ms: 2_000,
            boot_attempt_timeout_ms: 60_000,
            server_ready_timeout_ms: 30_000,
            install_timeout_ms: 300_000,
            teardown_grace_ms: 500,
            default_port: DEFAULT_PORT,
            default_command: "npm run dev".to_string(),
            install_command: Some("npm install".to_string()),
            default_manifest: default_manifest(),
        }
    }
}

impl ManagerConfig {
    /// Short timeouts and no install step, for interactive tooling
    pub fn quick() -> Self {
        Self {
            max_boot_attempts: 1,
            boot_backoff_ms: 250,
            server_ready_timeout_ms: 15_000,
            teardown_grace_ms: 100,
            install_command: None,
            ..Default::default()
        }
    }

    pub fn with_workdir_name(mut self, name: impl Into<String>) -> Self {
        self.workdir_name = name.into();
        self
    }

    pub fn with_boot_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.max_boot_attempts = attempts;
        self.boot_backoff_ms = duration_ms(backoff);
        self
    }

    pub fn with_server_ready_timeout(mut self, timeout: Duration) -> Self {
        self.server_ready_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace_ms = duration_ms(grace);
        self
    }

    pub fn with_install_command(mut self, command: Option<String>) -> Self {
        self.install_command = command;
        self
    }

    pub fn boot_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_attempt_timeout_ms)
    }

    pub fn server_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.server_ready_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.boot_backoff_ms.saturating_mul(factor))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_boot_attempts == 0 {
            return Err(PreviewError::InvalidConfig(
                "max_boot_attempts must be at least 1".to_string(),
            ));
        }
        if self.default_command.trim().is_empty() {
            return Err(PreviewError::InvalidConfig(
                "default_command must not be empty".to_string(),
            ));
        }
        if self.workdir_name.trim().is_empty() {
            return Err(PreviewError::InvalidConfig(
                "workdir_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a JSON config file; absent keys fall back to the defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PreviewError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            PreviewError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PREVIEWBOX_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("PREVIEWBOX_WORKDIR") {
            self.workdir_name = v;
        }
        if let Some(v) = lookup("PREVIEWBOX_BOOT_ATTEMPTS") {
            self.max_boot_attempts = parse_number("PREVIEWBOX_BOOT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("PREVIEWBOX_BOOT_BACKOFF_MS") {
            self.boot_backoff_ms = parse_number("PREVIEWBOX_BOOT_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("PREVIEWBOX_SERVER_TIMEOUT_MS") {
            self.server_ready_timeout_ms = parse_number("PREVIEWBOX_SERVER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("PREVIEWBOX_TEARDOWN_GRACE_MS") {
            self.teardown_grace_ms = parse_number("PREVIEWBOX_TEARDOWN_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("PREVIEWBOX_PORT") {
            self.default_port = parse_number("PREVIEWBOX_PORT", &v)?;
        }
        if let Some(v) = lookup("PREVIEWBOX_COMMAND") {
            self.default_command = v;
        }
        if let Some(v) = lookup("PREVIEWBOX_INSTALL_COMMAND") {
            // An empty value disables the install step
            self.install_command = Some(v).filter(|c| !c.trim().is_empty());
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PreviewError::InvalidConfig(format!("{key} is not a valid number: {value:?}")))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn default_manifest() -> serde_json::Value {
    json!({
        "name": "preview-project",
        "private": true,
        "version": "0.0.0",
        "scripts": {
            "dev": "next dev"
        },
        "dependencies": {
            "next": "^13.4.1",
            "react": "^18.2.0",
            "react-dom": "^18.2.0"
        }
    })
}

/// Per-call options for [`crate::SandboxRuntimeManager::start_server`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOptions {
    pub port: Option<u16>,
    pub command: Option<String>,
    /// Defaults to `true`: wait for the server-ready notification
    pub wait_for_port: Option<bool>,
}

impl PreviewOptions {
    pub fn port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn without_waiting(mut self) -> Self {
        self.wait_for_port = Some(false);
        self
    }
}
