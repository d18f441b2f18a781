//! gitchain extension runtime
//!
//! Runs user-supplied JavaScript extensions inside the node:
//! - Script discovery in the configured extension directory
//! - One isolated interpreter context per extension, with the node's host
//!   surface, `args` and `console` injected
//! - Browser-style timers (`setTimeout`, `setInterval` and their `clear*`)
//!   served by a dedicated scheduler thread per running extension
//! - A manager tracking running extensions by name, also exposed to the
//!   console as the `ext` namespace

pub mod bindings;
pub mod config;
pub mod console;
pub mod context;
pub mod error;
pub mod host;
pub mod instance;
pub mod loader;
pub mod manager;
mod scheduler;
pub mod timers;

pub use bindings::ExtensionModule;
pub use config::ExtensionsConfig;
pub use console::Console;
pub use context::{Args, ScriptContextFactory};
pub use error::{ExtensionError, Result};
pub use host::{HostModule, HostSurface, JsonModule};
pub use instance::{ExitReason, ExtensionInstance, InstanceStatus};
pub use loader::ExtensionLoader;
pub use manager::{ExtensionControl, ExtensionManager};
