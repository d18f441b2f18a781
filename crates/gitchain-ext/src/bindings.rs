//! Console bindings for the extension manager
//!
//! Installs the manager's operations as the `ext` namespace of a console
//! context. Extension contexts never receive this namespace.

use crate::context::Args;
use crate::error::ExtensionError;
use crate::host::HostModule;
use crate::manager::{ExtensionControl, ExtensionManager};
use rquickjs::convert::Coerced;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, Object, Value};

/// Namespace the manager is exposed under
pub const EXT_NAMESPACE: &str = "ext";

/// Host module exposing an [`ExtensionManager`] to scripts
#[derive(Debug, Clone)]
pub struct ExtensionModule {
    manager: ExtensionManager,
}

impl ExtensionModule {
    /// Expose `manager` as the `ext` namespace
    pub fn new(manager: ExtensionManager) -> Self {
        Self { manager }
    }
}

impl HostModule for ExtensionModule {
    fn namespace(&self) -> &str {
        EXT_NAMESPACE
    }

    fn install<'js>(&self, ctx: &Ctx<'js>, target: &Object<'js>) -> rquickjs::Result<()> {
        let manager = self.manager.clone();
        target.set(
            "run",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      name: String,
                      args: Opt<Value<'js>>|
                      -> rquickjs::Result<Object<'js>> {
                    let args = read_args(&ctx, args.0)?;
                    let control = manager.run(&name, args).map_err(|err| throw(&ctx, err))?;
                    control_object(&ctx, control, false)
                },
            )?,
        )?;

        let manager = self.manager.clone();
        target.set(
            "load",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      name: String,
                      args: Opt<Value<'js>>|
                      -> rquickjs::Result<Object<'js>> {
                    let args = read_args(&ctx, args.0)?;
                    let control = manager.load(&name, args).map_err(|err| throw(&ctx, err))?;
                    control_object(&ctx, control, true)
                },
            )?,
        )?;

        let manager = self.manager.clone();
        target.set(
            "stop",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, name: String| {
                manager.stop(&name).map_err(|err| throw(&ctx, err))
            })?,
        )?;

        let manager = self.manager.clone();
        target.set(
            "isRunning",
            Function::new(ctx.clone(), move |name: String| manager.is_running(&name))?,
        )?;

        let manager = self.manager.clone();
        target.set(
            "getRunning",
            Function::new(ctx.clone(), move || manager.running())?,
        )?;

        let manager = self.manager.clone();
        target.set(
            "getInstalled",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| {
                manager.installed().map_err(|err| throw(&ctx, err))
            })?,
        )?;

        let manager = self.manager.clone();
        target.set(
            "isInstalled",
            Function::new(ctx.clone(), move |name: String| manager.is_installed(&name))?,
        )?;

        Ok(())
    }
}

/// Build the JS control object for one instance
fn control_object<'js>(
    ctx: &Ctx<'js>,
    control: ExtensionControl,
    with_run: bool,
) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;
    object.set("name", control.name())?;

    let handle = control.clone();
    object.set(
        "isRunning",
        Function::new(ctx.clone(), move || handle.is_running())?,
    )?;

    let handle = control.clone();
    object.set("stop", Function::new(ctx.clone(), move || handle.stop())?)?;

    if with_run {
        object.set(
            "run",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| {
                control.run().map_err(|err| throw(&ctx, err))
            })?,
        )?;
    }

    Ok(object)
}

/// Read an optional plain object into string arguments
fn read_args<'js>(ctx: &Ctx<'js>, value: Option<Value<'js>>) -> rquickjs::Result<Args> {
    let mut args = Args::new();
    let Some(value) = value else {
        return Ok(args);
    };
    if value.is_undefined() || value.is_null() {
        return Ok(args);
    }

    let Some(object) = value.as_object() else {
        return Err(Exception::throw_type(ctx, "extension arguments must be an object"));
    };
    for entry in object.props::<String, Coerced<String>>() {
        let (key, value) = entry?;
        args.insert(key, value.0);
    }
    Ok(args)
}

fn throw(ctx: &Ctx<'_>, err: ExtensionError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}
