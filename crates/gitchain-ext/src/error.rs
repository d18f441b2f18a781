//! Error types for the extension runtime

use std::path::PathBuf;
use thiserror::Error;

/// Result type for extension runtime operations
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Errors that can occur while preparing, running or stopping extensions
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Script file missing or unreadable
    #[error("Extension not found: {name} ({path})")]
    NotFound {
        /// Requested extension name
        name: String,
        /// Resolved script path
        path: PathBuf,
        /// Underlying read failure
        #[source]
        source: std::io::Error,
    },

    /// Name that would escape the extension directory
    #[error("Invalid extension name: {0:?}")]
    InvalidName(String),

    /// An instance with this name is already registered as running
    #[error("Extension is already running: {0}")]
    AlreadyRunning(String),

    /// `run()` called on an instance that was stopped or interrupted
    #[error("Extension was stopped and cannot be restarted: {0}")]
    Closed(String),

    /// `stop(name)` for a name absent from the running registry
    #[error("Extension is not running: {0}")]
    NotRunning(String),

    /// Uncaught exception in the script body, a timer callback or a job
    #[error("Script error in {name}: {message}")]
    Script {
        /// Extension name
        name: String,
        /// Exception message and stack, when available
        message: String,
    },

    /// Interpreter could not be created or configured
    #[error("Script engine error: {0}")]
    Engine(String),

    /// Scheduler thread could not be started
    #[error("Failed to start scheduler for {name}: {source}")]
    Spawn {
        /// Extension name
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl ExtensionError {
    /// Whether this error was raised by script code rather than the host
    pub fn is_script_error(&self) -> bool {
        matches!(self, ExtensionError::Script { .. })
    }
}

impl From<rquickjs::Error> for ExtensionError {
    fn from(err: rquickjs::Error) -> Self {
        ExtensionError::Engine(err.to_string())
    }
}
