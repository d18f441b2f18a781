//! Interactive evaluation context
//!
//! A [`Console`] owns an interpreter on the calling thread with the host
//! surface, the `ext` namespace and `console` installed. It has no scheduler,
//! so timers are not available here.

use crate::bindings::ExtensionModule;
use crate::context::{drain_jobs, install_console, script_error};
use crate::error::{ExtensionError, Result};
use crate::host::js_to_json;
use crate::manager::ExtensionManager;
use rquickjs::{Context, Runtime, Value};

const CONSOLE_NAME: &str = "console";

/// Script console bound to an [`ExtensionManager`]
pub struct Console {
    manager: ExtensionManager,
    context: Context,
    runtime: Runtime,
}

impl Console {
    pub fn new(manager: &ExtensionManager) -> Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        let surface = manager
            .surface()
            .clone()
            .with_module(ExtensionModule::new(manager.clone()));

        context
            .with(|ctx| -> rquickjs::Result<()> {
                surface.install(&ctx)?;
                install_console(&ctx, CONSOLE_NAME)
            })
            .map_err(|err| ExtensionError::Engine(format!("failed to set up console: {err}")))?;

        Ok(Self {
            manager: manager.clone(),
            context,
            runtime,
        })
    }

    /// Manager the `ext` namespace operates on
    pub fn manager(&self) -> &ExtensionManager {
        &self.manager
    }

    /// Evaluate source and return the completion value as JSON
    pub fn eval(&self, source: &str) -> Result<serde_json::Value> {
        let value = self.context.with(|ctx| {
            let value: Value = ctx
                .eval(source)
                .map_err(|err| script_error(&ctx, CONSOLE_NAME, err))?;
            js_to_json(&ctx, value).map_err(|err| script_error(&ctx, CONSOLE_NAME, err))
        })?;
        drain_jobs(&self.runtime, &self.context, CONSOLE_NAME)?;
        Ok(value)
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtensionsConfig;
    use crate::host::{HostSurface, JsonModule};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_console_sees_surface_and_ext() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("alpha.js"), "1").unwrap();
        let surface = HostSurface::new()
            .with_module(JsonModule::new("node").function("height", |_| Ok(json!(42))));
        let manager = ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), surface);
        let console = Console::new(&manager).unwrap();

        assert_eq!(console.eval("node.height() + 1").unwrap(), json!(43));
        assert_eq!(console.eval("host.node.height()").unwrap(), json!(42));
        assert_eq!(console.eval("ext.getInstalled()").unwrap(), json!(["alpha"]));
        assert_eq!(console.eval("ext.isInstalled('alpha.js')").unwrap(), json!(true));
    }

    #[test]
    fn test_console_reports_exceptions() {
        let temp = tempdir().unwrap();
        let manager =
            ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), HostSurface::new());
        let console = Console::new(&manager).unwrap();

        let err = console.eval("ext.run('missing')").unwrap_err();
        assert!(err.is_script_error());
        assert!(err.to_string().contains("Extension not found: missing"));

        // The console survives a failed evaluation.
        assert_eq!(console.eval("1 + 1").unwrap(), json!(2));
    }
}
