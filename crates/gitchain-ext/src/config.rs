//! Extension runtime configuration
//!
//! Loaded from the `[extensions]` table of the node's TOML configuration file.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default suffix of extension scripts
pub const DEFAULT_SCRIPT_EXTENSION: &str = "js";

/// Settings for extension discovery and the script interpreter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Directory scanned for extension scripts
    pub dir: PathBuf,
    /// Suffix appended to names given without one
    pub script_extension: String,
    /// Heap limit for each interpreter runtime, in bytes
    pub memory_limit: Option<usize>,
    /// Stack limit for each interpreter runtime, in bytes
    pub max_stack_size: Option<usize>,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gitchain")
            .join("extensions");

        Self {
            dir,
            script_extension: DEFAULT_SCRIPT_EXTENSION.to_string(),
            memory_limit: None,
            max_stack_size: None,
        }
    }
}

/// Shape of the configuration file; unrelated tables are ignored
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    extensions: ExtensionsConfig,
}

impl ExtensionsConfig {
    /// Configuration rooted at the given extension directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Parse the `[extensions]` table from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.extensions)
    }

    /// Load configuration from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
