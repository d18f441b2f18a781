//! Script context factory
//!
//! `prepare` reads an extension script and captures everything its context
//! needs in a [`ScriptSeed`]. The interpreter itself ([`ScriptContext`]) is
//! built from the seed on the scheduler thread that owns it, since a QuickJS
//! context must never be touched by another thread.

use crate::config::ExtensionsConfig;
use crate::error::{ExtensionError, Result};
use crate::host::HostSurface;
use crate::instance::ExtensionInstance;
use crate::loader::ExtensionLoader;
use crate::timers::{TimerId, TimerRegistry, clamp_delay};
use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Arguments handed to a script as the `args` global
pub type Args = BTreeMap<String, String>;

/// Global exposing the caller-supplied arguments
pub const ARGS_GLOBAL: &str = "args";

/// Hidden global used by the scheduler to dispatch fired timers
const FIRE_TIMER_GLOBAL: &str = "__gitchainFireTimer";

/// Installs the timer primitives on top of the native registry bindings.
///
/// Callbacks and their bound arguments stay on the JS side, keyed by handle;
/// the native side only tracks deadlines.
const TIMERS_JS: &str = r#"
(function (global, native) {
    const pending = new Map();

    function schedule(callback, delay, args, repeating) {
        if (typeof callback !== 'function') {
            throw new TypeError('timer callback must be a function');
        }
        const id = native.schedule(Number(delay), repeating);
        pending.set(id, { callback, args });
        return id;
    }

    function clear(id) {
        if (typeof id !== 'number') {
            return;
        }
        native.clear(id);
        pending.delete(id);
    }

    global.setTimeout = (callback, delay, ...args) => schedule(callback, delay, args, false);
    global.setInterval = (callback, delay, ...args) => schedule(callback, delay, args, true);
    global.clearTimeout = clear;
    global.clearInterval = clear;

    Object.defineProperty(global, '__gitchainFireTimer', {
        value: function (id, repeating) {
            const entry = pending.get(id);
            if (entry === undefined) {
                return;
            }
            if (!repeating) {
                pending.delete(id);
            }
            entry.callback.apply(undefined, entry.args);
        },
    });
})
"#;

/// Everything needed to materialize an extension's interpreter context
#[derive(Debug)]
pub struct ScriptSeed {
    /// Extension name
    pub name: String,
    /// Script path the source was read from
    pub path: PathBuf,
    /// Raw script bytes
    pub source: Vec<u8>,
    /// Value of the `args` global
    pub args: Args,
    /// Host capability surface
    pub surface: HostSurface,
    /// Heap limit in bytes
    pub memory_limit: Option<usize>,
    /// Stack limit in bytes
    pub max_stack_size: Option<usize>,
}

/// Builds not-yet-running extension instances
#[derive(Debug, Clone)]
pub struct ScriptContextFactory {
    loader: ExtensionLoader,
    surface: HostSurface,
    memory_limit: Option<usize>,
    max_stack_size: Option<usize>,
}

impl ScriptContextFactory {
    /// Create a factory from configuration and the surface every context gets
    pub fn new(config: &ExtensionsConfig, surface: HostSurface) -> Self {
        Self {
            loader: ExtensionLoader::from_config(config),
            surface,
            memory_limit: config.memory_limit,
            max_stack_size: config.max_stack_size,
        }
    }

    /// Script discovery used by this factory
    pub fn loader(&self) -> &ExtensionLoader {
        &self.loader
    }

    /// Host surface injected into each context
    pub fn surface(&self) -> &HostSurface {
        &self.surface
    }

    /// Prepare an extension with its own stop signal only
    pub fn prepare(&self, name: &str, args: Args) -> Result<ExtensionInstance> {
        self.prepare_with_interrupt(name, args, &CancellationToken::new())
    }

    /// Prepare an extension whose scheduler also stops when `interrupt` fires
    pub fn prepare_with_interrupt(
        &self,
        name: &str,
        args: Args,
        interrupt: &CancellationToken,
    ) -> Result<ExtensionInstance> {
        let (path, source) = self.loader.read(name)?;
        let seed = ScriptSeed {
            name: self.loader.canonical_name(name).to_string(),
            path,
            source,
            args,
            surface: self.surface.clone(),
            memory_limit: self.memory_limit,
            max_stack_size: self.max_stack_size,
        };
        debug!("Prepared extension {} from {:?}", seed.name, seed.path);
        Ok(ExtensionInstance::new(Arc::new(seed), interrupt.child_token()))
    }
}

/// A live interpreter context for one extension.
///
/// Owned by exactly one scheduler thread for its whole life.
pub struct ScriptContext {
    name: String,
    timers: Rc<RefCell<TimerRegistry>>,
    context: Context,
    runtime: Runtime,
}

impl ScriptContext {
    /// Build a fresh context with the surface, `args`, `console` and timers
    /// installed. Must run inside a tokio runtime with time enabled.
    pub fn new(seed: &ScriptSeed) -> Result<Self> {
        let runtime = Runtime::new()?;
        if let Some(limit) = seed.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = seed.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        let context = Context::full(&runtime)?;
        let timers = Rc::new(RefCell::new(TimerRegistry::new()));

        context
            .with(|ctx| -> rquickjs::Result<()> {
                seed.surface.install(&ctx)?;
                install_args(&ctx, &seed.args)?;
                install_console(&ctx, &seed.name)?;
                install_timers(&ctx, &timers)
            })
            .map_err(|err| {
                ExtensionError::Engine(format!("failed to set up context for {}: {err}", seed.name))
            })?;

        Ok(Self {
            name: seed.name.clone(),
            timers,
            context,
            runtime,
        })
    }

    /// Timer registry of this context
    pub fn timers(&self) -> &Rc<RefCell<TimerRegistry>> {
        &self.timers
    }

    /// Evaluate the script body, then drain queued promise jobs
    pub fn eval(&self, source: &[u8]) -> Result<()> {
        self.context.with(|ctx| {
            ctx.eval::<(), _>(source.to_vec())
                .map_err(|err| script_error(&ctx, &self.name, err))
        })?;
        self.drain_jobs()
    }

    /// Invoke the callback of a fired timer with its bound arguments
    pub fn fire(&self, id: TimerId, repeating: bool) -> Result<()> {
        self.context.with(|ctx| {
            let fire: Function = ctx
                .globals()
                .get(FIRE_TIMER_GLOBAL)
                .map_err(|err| script_error(&ctx, &self.name, err))?;
            fire.call::<_, ()>((id, repeating))
                .map_err(|err| script_error(&ctx, &self.name, err))
        })?;
        self.drain_jobs()
    }

    fn drain_jobs(&self) -> Result<()> {
        drain_jobs(&self.runtime, &self.context, &self.name)
    }
}

/// Run pending promise jobs until the queue is empty
pub(crate) fn drain_jobs(runtime: &Runtime, context: &Context, name: &str) -> Result<()> {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(_) => {
                let message = context.with(|ctx| exception_message(&ctx));
                return Err(ExtensionError::Script {
                    name: name.to_string(),
                    message,
                });
            }
        }
    }
}

/// Map an interpreter error to a script error, consuming a pending exception
pub(crate) fn script_error(ctx: &Ctx<'_>, name: &str, err: rquickjs::Error) -> ExtensionError {
    let message = if matches!(err, rquickjs::Error::Exception) {
        exception_message(ctx)
    } else {
        err.to_string()
    };
    ExtensionError::Script {
        name: name.to_string(),
        message,
    }
}

/// Take the pending exception of a context and describe it
pub(crate) fn exception_message(ctx: &Ctx<'_>) -> String {
    let value = ctx.catch();
    if let Some(exception) = value.as_exception() {
        let message = exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
        return match exception.stack() {
            Some(stack) if !stack.trim().is_empty() => {
                format!("{message}\n{}", stack.trim_end())
            }
            _ => message,
        };
    }
    value
        .get::<Coerced<String>>()
        .map(|text| text.0)
        .unwrap_or_else(|_| "uncaught exception".to_string())
}

fn install_args(ctx: &Ctx<'_>, args: &Args) -> rquickjs::Result<()> {
    let object = Object::new(ctx.clone())?;
    for (key, value) in args {
        object.set(key.as_str(), value.as_str())?;
    }
    ctx.globals().set(ARGS_GLOBAL, object)
}

fn install_timers(ctx: &Ctx<'_>, timers: &Rc<RefCell<TimerRegistry>>) -> rquickjs::Result<()> {
    let native = Object::new(ctx.clone())?;

    let registry = Rc::clone(timers);
    native.set(
        "schedule",
        Function::new(ctx.clone(), move |delay: f64, repeating: bool| -> TimerId {
            registry.borrow_mut().schedule(clamp_delay(delay), repeating)
        })?,
    )?;

    let registry = Rc::clone(timers);
    native.set(
        "clear",
        Function::new(ctx.clone(), move |id: f64| {
            if id.fract() == 0.0 && id >= 1.0 && id <= f64::from(TimerId::MAX) {
                registry.borrow_mut().clear(id as TimerId);
            }
        })?,
    )?;

    let setup: Function = ctx.eval(TIMERS_JS)?;
    setup.call::<_, ()>((ctx.globals(), native))
}

pub(crate) fn install_console<'js>(ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for level in ["log", "info", "warn", "error", "debug"] {
        let extension = name.to_string();
        let func = Function::new(ctx.clone(), move |values: Rest<Value<'js>>| {
            let line = values
                .0
                .into_iter()
                .map(|value| {
                    value
                        .get::<Coerced<String>>()
                        .map(|text| text.0)
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join(" ");
            match level {
                "error" => error!(target: "gitchain::script", extension = %extension, "{line}"),
                "warn" => warn!(target: "gitchain::script", extension = %extension, "{line}"),
                "debug" => debug!(target: "gitchain::script", extension = %extension, "{line}"),
                _ => info!(target: "gitchain::script", extension = %extension, "{line}"),
            }
        })?;
        console.set(level, func)?;
    }
    ctx.globals().set("console", console)
}
