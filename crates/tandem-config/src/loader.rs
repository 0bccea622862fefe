//! Configuration loader with multi-source merging

use crate::{Paths, TandemConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    /// Explicit file layered above the project files.
    file: Option<PathBuf>,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TANDEM".to_string(),
            file: None,
            include_user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TANDEM")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Layer an explicit config file; it must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip ~/.config/tandem/config.toml.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TandemConfig> {
        let toml_file = |path: PathBuf, required: bool| {
            config::File::from(path)
                .required(required)
                .format(config::FileFormat::Toml)
        };
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = TandemConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults).context("Failed to encode default configuration")?,
        );

        // 2. User config (~/.config/tandem/config.toml)
        if self.include_user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(toml_file(user_config_file, false));
                }
            }
        }

        // 3. Project config (tandem.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(toml_file(project_config_file, false));
        }

        // 4. Local config (tandem.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(toml_file(local_config_file, false));
        }

        // 5. Explicit --config file
        if let Some(file) = &self.file {
            builder = builder.add_source(toml_file(file.clone(), true));
        }

        // 6. Environment variables (TANDEM_NODE__NAME=alpha)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let tandem_config: TandemConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tandem_config
            .validate()
            .context("Configuration failed validation")?;
        Ok(tandem_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
