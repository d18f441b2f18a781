//! Extension script discovery
//!
//! Resolves extension names to script files under the extension directory and
//! lists what is installed there. Access is read-only.

use crate::config::ExtensionsConfig;
use crate::error::{ExtensionError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locates extension scripts on disk
#[derive(Debug, Clone)]
pub struct ExtensionLoader {
    /// Directory holding extension scripts
    dir: PathBuf,
    /// Suffix implied when a name has none
    script_extension: String,
}

impl ExtensionLoader {
    /// Create a loader for a directory and script suffix
    pub fn new(dir: impl Into<PathBuf>, script_extension: impl Into<String>) -> Self {
        let script_extension = script_extension.into();
        Self {
            dir: dir.into(),
            script_extension: script_extension.trim_start_matches('.').to_string(),
        }
    }

    /// Create a loader from configuration
    pub fn from_config(config: &ExtensionsConfig) -> Self {
        Self::new(config.dir.clone(), config.script_extension.clone())
    }

    /// Extension directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Script suffix, without the leading dot
    pub fn script_extension(&self) -> &str {
        &self.script_extension
    }

    /// Registry name for an extension: the default suffix is dropped so that
    /// `"deploy"` and `"deploy.js"` refer to the same extension.
    pub fn canonical_name<'a>(&self, name: &'a str) -> &'a str {
        name.strip_suffix(&format!(".{}", self.script_extension))
            .filter(|stem| !stem.is_empty())
            .unwrap_or(name)
    }

    /// Resolve a name to its script path, appending the default suffix when the
    /// name has none.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name.contains("..") || name.contains(['/', '\\']) {
            return Err(ExtensionError::InvalidName(name.to_string()));
        }

        let file_name = if Path::new(name).extension().is_some() {
            name.to_string()
        } else {
            format!("{}.{}", name, self.script_extension)
        };
        Ok(self.dir.join(file_name))
    }

    /// Whether a script exists for the name
    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|path| path.is_file()).unwrap_or(false)
    }

    /// Read the script for a name
    pub fn read(&self, name: &str) -> Result<(PathBuf, Vec<u8>)> {
        let path = self.resolve(name)?;
        debug!("Reading extension {} from {:?}", name, path);
        match std::fs::read(&path) {
            Ok(source) => Ok((path, source)),
            Err(source) => Err(ExtensionError::NotFound {
                name: name.to_string(),
                path,
                source,
            }),
        }
    }

    /// List installed extensions by name, sorted.
    ///
    /// Only files carrying the script suffix are reported; a missing directory
    /// yields an empty list.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        if self.dir.is_dir() {
            for entry in std::fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some(self.script_extension.as_str())
                {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}
