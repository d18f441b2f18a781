//! Extension manager
//!
//! Tracks which extensions are currently running, one instance per name, and
//! exposes the operations offered to the node's console.

use crate::config::ExtensionsConfig;
use crate::context::{Args, ScriptContextFactory};
use crate::error::{ExtensionError, Result};
use crate::host::HostSurface;
use crate::instance::{ExitHook, ExitReason, ExtensionInstance};
use crate::loader::ExtensionLoader;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ManagerInner {
    factory: ScriptContextFactory,
    /// Running instances by name
    running: Mutex<HashMap<String, ExtensionInstance>>,
    /// Host-level interrupt shared by every instance this manager creates
    shutdown: CancellationToken,
}

impl ManagerInner {
    fn running(&self) -> MutexGuard<'_, HashMap<String, ExtensionInstance>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the registry entry for `instance`, if it is still the one
    /// registered under its name.
    fn unregister(&self, instance: &ExtensionInstance) -> bool {
        self.release(instance, &mut || {})
    }

    /// Like [`unregister`](Self::unregister), running `publish` before the
    /// registry lock is released.
    fn release(&self, instance: &ExtensionInstance, publish: &mut dyn FnMut()) -> bool {
        let mut running = self.running();
        let removed = match running.get(instance.name()) {
            Some(current) if current.same(instance) => {
                running.remove(instance.name());
                debug!("Unregistered extension {}", instance.name());
                true
            }
            _ => false,
        };
        publish();
        removed
    }
}

/// Registry and lifecycle control for extensions.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<ManagerInner>,
}

impl ExtensionManager {
    /// Create a manager for the configured extension directory
    pub fn new(config: &ExtensionsConfig, surface: HostSurface) -> Self {
        Self::from_factory(ScriptContextFactory::new(config, surface))
    }

    /// Create a manager around an existing context factory
    pub fn from_factory(factory: ScriptContextFactory) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                running: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Script discovery used by this manager
    pub fn loader(&self) -> &ExtensionLoader {
        self.inner.factory.loader()
    }

    /// Host surface given to every extension context
    pub fn surface(&self) -> &HostSurface {
        self.inner.factory.surface()
    }

    /// Whether a script exists for the name
    pub fn is_installed(&self, name: &str) -> bool {
        self.loader().exists(name)
    }

    /// Names of installed extensions, sorted
    pub fn installed(&self) -> Result<Vec<String>> {
        self.loader().list()
    }

    /// Prepare an extension without starting it
    pub fn load(&self, name: &str, args: Args) -> Result<ExtensionControl> {
        let instance =
            self.inner
                .factory
                .prepare_with_interrupt(name, args, &self.inner.shutdown)?;
        Ok(ExtensionControl {
            manager: self.clone(),
            instance,
        })
    }

    /// Prepare and start an extension.
    ///
    /// Fails with [`ExtensionError::AlreadyRunning`] if an instance with the
    /// same name is registered.
    pub fn run(&self, name: &str, args: Args) -> Result<ExtensionControl> {
        let key = self.loader().canonical_name(name);
        if self.is_running(key) {
            return Err(ExtensionError::AlreadyRunning(key.to_string()));
        }

        let control = self.load(name, args)?;
        self.start(&control.instance)?;
        Ok(control)
    }

    /// Check-and-insert the instance under its name, then start it outside the
    /// registry lock.
    fn start(&self, instance: &ExtensionInstance) -> Result<()> {
        if self.inner.shutdown.is_cancelled() || instance.is_closed() {
            return Err(ExtensionError::Closed(instance.name().to_string()));
        }

        {
            let mut running = self.inner.running();
            match running.get(instance.name()) {
                Some(current) if current.same(instance) => return Ok(()),
                Some(_) => {
                    return Err(ExtensionError::AlreadyRunning(instance.name().to_string()));
                }
                None => {
                    running.insert(instance.name().to_string(), instance.clone());
                }
            }
        }

        match instance.start(Some(self.exit_hook(instance))) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.inner.unregister(instance);
                Ok(())
            }
            Err(err) => {
                self.inner.unregister(instance);
                Err(err)
            }
        }
    }

    fn exit_hook(&self, instance: &ExtensionInstance) -> ExitHook {
        let inner = Arc::clone(&self.inner);
        let instance = instance.clone();
        Box::new(move |publish: &mut dyn FnMut()| {
            inner.release(&instance, publish);
        })
    }

    /// Stop the running extension registered under `name`
    pub fn stop(&self, name: &str) -> Result<()> {
        let key = self.loader().canonical_name(name);
        let instance = self
            .inner
            .running()
            .remove(key)
            .ok_or_else(|| ExtensionError::NotRunning(key.to_string()))?;
        info!("Stopping extension {}", key);
        instance.stop();
        Ok(())
    }

    /// Names of running extensions, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.running().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether an extension with this name is running
    pub fn is_running(&self, name: &str) -> bool {
        let key = self.loader().canonical_name(name);
        self.inner.running().contains_key(key)
    }

    /// Running instance registered under `name`
    pub fn get(&self, name: &str) -> Option<ExtensionInstance> {
        let key = self.loader().canonical_name(name);
        self.inner.running().get(key).cloned()
    }

    /// Interrupt every instance created by this manager.
    ///
    /// Running extensions end with [`ExitReason::Cancelled`]; afterwards the
    /// manager refuses to start anything.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!(running = self.inner.running().len(), "Shutting down extensions");
        }
        self.inner.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until no extension is running
    pub async fn wait_idle(&self) {
        loop {
            let instances: Vec<ExtensionInstance> =
                self.inner.running().values().cloned().collect();
            if instances.is_empty() {
                return;
            }
            for instance in instances {
                let reason = instance.stopped().await;
                debug!(extension = %instance.name(), ?reason, "Extension ended");
            }
        }
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("dir", &self.loader().dir())
            .field("running", &self.running())
            .finish()
    }
}

/// Control handle returned by [`ExtensionManager::load`] and
/// [`ExtensionManager::run`], bound to one specific instance.
#[derive(Debug, Clone)]
pub struct ExtensionControl {
    manager: ExtensionManager,
    instance: ExtensionInstance,
}

impl ExtensionControl {
    /// Extension name
    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// Start this instance and register it with the manager
    pub fn run(&self) -> Result<()> {
        self.manager.start(&self.instance)
    }

    /// Stop this instance. Idempotent.
    pub fn stop(&self) {
        self.instance.stop();
        self.manager.inner.unregister(&self.instance);
    }

    /// Whether this instance is running
    pub fn is_running(&self) -> bool {
        self.instance.is_running()
    }

    /// The underlying instance
    pub fn instance(&self) -> &ExtensionInstance {
        &self.instance
    }

    /// Wait for the current run to end
    pub async fn stopped(&self) -> ExitReason {
        self.instance.stopped().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_manager() {
        let temp = tempdir().unwrap();
        let manager =
            ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), HostSurface::new());

        assert!(manager.installed().unwrap().is_empty());
        assert!(manager.running().is_empty());
        assert!(!manager.is_running("any"));
        assert!(matches!(manager.stop("any"), Err(ExtensionError::NotRunning(_))));
    }

    #[test]
    fn test_run_missing_script_is_not_found() {
        let temp = tempdir().unwrap();
        let manager =
            ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), HostSurface::new());

        let err = manager.run("ghost", Args::new()).unwrap_err();
        assert!(matches!(err, ExtensionError::NotFound { .. }));
        assert!(manager.running().is_empty());
    }

    #[test]
    fn test_shutdown_refuses_new_runs() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("late.js"), "1").unwrap();
        let manager =
            ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), HostSurface::new());

        manager.shutdown();
        assert!(manager.is_shut_down());
        assert!(matches!(
            manager.run("late", Args::new()),
            Err(ExtensionError::Closed(_))
        ));
        assert!(!manager.is_running("late"));
    }

    #[test]
    fn test_shutdown_closes_loaded_controls() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("held.js"), "1").unwrap();
        let manager =
            ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), HostSurface::new());

        let control = manager.load("held", Args::new()).unwrap();
        assert!(!control.instance().is_closed());
        manager.shutdown();
        assert!(control.instance().is_closed());
        assert!(matches!(control.run(), Err(ExtensionError::Closed(_))));
    }

    #[test]
    fn test_exit_hook_publishes_under_registry_lock() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("tick.js"), "1").unwrap();
        let manager =
            ExtensionManager::new(&ExtensionsConfig::with_dir(temp.path()), HostSurface::new());

        let control = manager.load("tick", Args::new()).unwrap();
        manager
            .inner
            .running()
            .insert("tick".to_string(), control.instance().clone());

        let inner = Arc::clone(&manager.inner);
        let mut published = false;
        let hook = manager.exit_hook(control.instance());
        hook(&mut || {
            // Status flips while the registry is still locked.
            assert!(inner.running.try_lock().is_err());
            published = true;
        });

        assert!(published);
        assert!(!manager.is_running("tick"));
    }
}
