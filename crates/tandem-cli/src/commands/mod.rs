//! CLI command implementations.

pub mod config;
pub mod node;
pub mod signals;
pub mod version;
pub mod view_service;

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tandem_config::{ConfigLoader, TandemConfig};

/// Where configuration comes from, per the global flags.
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    pub project_dir: Option<PathBuf>,
}

impl ConfigSources {
    pub fn dir(&self) -> Result<PathBuf> {
        match &self.project_dir {
            Some(dir) => Ok(dir.clone()),
            None => env::current_dir().context("Failed to determine current directory"),
        }
    }

    pub fn load(&self) -> Result<TandemConfig> {
        let mut loader = ConfigLoader::new().with_project_dir(self.dir()?);
        if let Some(file) = &self.file {
            loader = loader.with_file(file);
        }
        loader.load().context("Failed to load configuration")
    }
}
