//! Engine Configuration
//!
//! One JSON document, camelCase keys, every field optional.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::compositor::TokenConfig;
use crate::packer::{GeometryError, PackerConfig};
use crate::print::PageGeometry;
use crate::validation::FailureMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(#[from] GeometryError),

    #[error("Invalid config: {0}")]
    Value(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub page: PageGeometry,
    #[serde(default)]
    pub packer: PackerConfig,
    #[serde(default)]
    pub token: TokenConfig,
    /// Render threads. `None` uses one per core.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub validation: FailureMode,
    /// Base name of page files: `<basename>_<n>.png`.
    #[serde(default = "default_basename")]
    pub page_basename: String,
}

fn default_basename() -> String { "sheet".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page: PageGeometry::default(),
            packer: PackerConfig::default(),
            token: TokenConfig::default(),
            workers: None,
            fail_fast: false,
            validation: FailureMode::default(),
            page_basename: default_basename(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        PageGeometry::from_user(self.page.width, self.page.height, self.page.margin, self.page.dpi)?;
        if self.token.role_diameter == 0 || self.token.reminder_diameter == 0 {
            return Err(ConfigError::Value("token diameters must be positive".into()));
        }
        let fits = [
            ("token.roleName", self.token.role_name.check()),
            ("token.reminderText", self.token.reminder_text.check()),
            ("token.ability", self.token.ability.check()),
        ];
        for (field, result) in fits {
            result.map_err(|msg| ConfigError::Value(format!("{}: {}", field, msg)))?;
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Value("workers must be at least 1".into()));
        }
        if self.page_basename.trim().is_empty() {
            return Err(ConfigError::Value("pageBasename is empty".into()));
        }
        Ok(())
    }
}
