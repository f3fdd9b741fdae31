use crate::{
    config::ManagerConfig, engine::RuntimeBooter, errors::PreviewError,
    manager::SandboxRuntimeManager, native::NativeRuntimeBooter, Result,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Options for creating a manager
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// JSON config file layered under the environment overrides
    pub config_path: Option<PathBuf>,
    /// Used instead of the file when present
    pub config: Option<ManagerConfig>,
    /// Programs that must be on PATH before booting; defaults to `node` and `npm`
    pub required_programs: Option<Vec<String>>,
    /// Whether `PREVIEWBOX_*` variables are applied
    pub env_overrides: bool,
}

impl ManagerOptions {
    pub fn from_env() -> Self {
        Self {
            env_overrides: true,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_required_programs(mut self, programs: Vec<String>) -> Self {
        self.required_programs = Some(programs);
        self
    }

    /// Resolve the effective configuration: explicit config, else file, else defaults,
    /// then environment overrides.
    pub fn resolve_config(&self) -> Result<ManagerConfig> {
        let config = match (&self.config, &self.config_path) {
            (Some(config), _) => config.clone(),
            (None, Some(path)) => ManagerConfig::from_json_file(path)?,
            (None, None) => ManagerConfig::default(),
        };
        if self.env_overrides {
            config.with_env_overrides()
        } else {
            config.validate()?;
            Ok(config)
        }
    }
}

/// Create a manager over any runtime booter
pub fn create_manager(
    booter: Arc<dyn RuntimeBooter>,
    options: &ManagerOptions,
) -> Result<SandboxRuntimeManager> {
    let config = options.resolve_config()?;
    tracing::debug!(booter = booter.name(), ?config, "creating runtime manager");
    SandboxRuntimeManager::new(booter, config)
}

/// Create a manager that runs previews on the host
pub fn create_native_manager(options: &ManagerOptions) -> Result<SandboxRuntimeManager> {
    let booter = match &options.required_programs {
        Some(programs) => NativeRuntimeBooter::with_required_programs(programs.clone()),
        None => NativeRuntimeBooter::new(),
    };
    create_manager(Arc::new(booter), options)
}

/// Create default native manager, honoring `PREVIEWBOX_*` variables
pub fn create_default_manager() -> Result<SandboxRuntimeManager> {
    create_native_manager(&ManagerOptions::from_env())
}

static GLOBAL_MANAGER: OnceLock<SandboxRuntimeManager> = OnceLock::new();

/// Install the process-wide manager. Fails if one is already installed.
pub fn install_global_manager(manager: SandboxRuntimeManager) -> Result<&'static SandboxRuntimeManager> {
    GLOBAL_MANAGER.set(manager).map_err(|_| {
        PreviewError::InvalidConfig("a global runtime manager is already installed".to_string())
    })?;
    global_manager()
}

/// The process-wide manager, created with [`create_default_manager`] on first use
pub fn global_manager() -> Result<&'static SandboxRuntimeManager> {
    if let Some(manager) = GLOBAL_MANAGER.get() {
        return Ok(manager);
    }
    let manager = create_default_manager()?;
    // Another thread may have won the race; both managers are still idle
    Ok(GLOBAL_MANAGER.get_or_init(|| manager))
}
