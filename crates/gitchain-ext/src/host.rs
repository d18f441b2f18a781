//! Host capability surface exposed to script contexts
//!
//! The node's services (chain, tx, user, pushKey, ticket, repo, ns, dht, pool,
//! rpc, util) are injected into every interpreter context as namespaced
//! function tables. The runtime treats them as opaque: each namespace is a
//! [`HostModule`] that knows how to install itself into a context.

use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, Function, Object, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Global holding every namespace of the surface
pub const HOST_GLOBAL: &str = "host";

/// A namespace of host functionality installable into a script context.
///
/// Implementations are shared between the console and every extension context,
/// so any state they reach must be safe for concurrent use.
pub trait HostModule: Send + Sync {
    /// Namespace the module is installed under (e.g. `"chain"`)
    fn namespace(&self) -> &str;

    /// Install the module's members into the namespace object
    fn install<'js>(&self, ctx: &Ctx<'js>, target: &Object<'js>) -> rquickjs::Result<()>;
}

/// Host function taking and returning JSON values
pub type HostFn =
    Arc<dyn Fn(&[serde_json::Value]) -> anyhow::Result<serde_json::Value> + Send + Sync>;

/// A namespace of JSON-in/JSON-out host functions
#[derive(Clone)]
pub struct JsonModule {
    namespace: String,
    functions: BTreeMap<String, HostFn>,
}

impl JsonModule {
    /// Create an empty module for a namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            functions: BTreeMap::new(),
        }
    }

    /// Add a function to the namespace
    pub fn function<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[serde_json::Value]) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    /// Names of the functions in this module
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl fmt::Debug for JsonModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonModule")
            .field("namespace", &self.namespace)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HostModule for JsonModule {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn install<'js>(&self, ctx: &Ctx<'js>, target: &Object<'js>) -> rquickjs::Result<()> {
        for (name, func) in &self.functions {
            let func = Arc::clone(func);
            let qualified = format!("{}.{}", self.namespace, name);
            let js_fn = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                    let params = args
                        .0
                        .into_iter()
                        .map(|value| js_to_json(&ctx, value))
                        .collect::<rquickjs::Result<Vec<_>>>()?;
                    match func(&params) {
                        Ok(result) => json_to_js(&ctx, &result),
                        Err(err) => Err(Exception::throw_message(
                            &ctx,
                            &format!("{qualified}: {err:#}"),
                        )),
                    }
                },
            )?;
            target.set(name.as_str(), js_fn)?;
        }
        Ok(())
    }
}

/// The full set of namespaces injected into a context.
///
/// Cloning is cheap; every context gets the same modules and builds its own
/// JS objects from them.
#[derive(Clone, Default)]
pub struct HostSurface {
    modules: Vec<Arc<dyn HostModule>>,
}

impl HostSurface {
    /// Create an empty surface
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module; modules sharing a namespace are merged
    pub fn with_module(mut self, module: impl HostModule + 'static) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Add an already shared module
    pub fn with_shared(mut self, module: Arc<dyn HostModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Distinct namespaces, in installation order
    pub fn namespaces(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for module in &self.modules {
            if !seen.contains(&module.namespace()) {
                seen.push(module.namespace());
            }
        }
        seen
    }

    /// Whether the surface has no modules
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Install every namespace under the `host` global and as its own global
    pub fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let globals = ctx.globals();
        let root: Object<'js> = match globals.get::<_, Option<Object<'js>>>(HOST_GLOBAL)? {
            Some(existing) => existing,
            None => {
                let root = Object::new(ctx.clone())?;
                globals.set(HOST_GLOBAL, root.clone())?;
                root
            }
        };

        for module in &self.modules {
            let namespace = module.namespace();
            let target = match root.get::<_, Option<Object<'js>>>(namespace)? {
                Some(existing) => existing,
                None => {
                    let target = Object::new(ctx.clone())?;
                    root.set(namespace, target.clone())?;
                    globals.set(namespace, target.clone())?;
                    target
                }
            };
            module.install(ctx, &target)?;
            debug!(namespace, "Installed host module");
        }
        Ok(())
    }
}

impl fmt::Debug for HostSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSurface")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

/// Convert a JSON value into a JS value of the given context
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(value)
        .map_err(|err| Exception::throw_internal(ctx, &err.to_string()))?;
    ctx.json_parse(text)
}

/// Convert a JS value into JSON; `undefined` and functions become `null`
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    if value.is_undefined() || value.is_function() {
        return Ok(serde_json::Value::Null);
    }
    match ctx.json_stringify(value)? {
        Some(text) => serde_json::from_str(&text.to_string()?)
            .map_err(|err| Exception::throw_type(ctx, &err.to_string())),
        None => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_context<R>(f: impl FnOnce(Ctx<'_>) -> R) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(f)
    }

    fn util_module() -> JsonModule {
        JsonModule::new("util")
            .function("echo", |args| Ok(args.first().cloned().unwrap_or_default()))
            .function("fail", |_| Err(anyhow::anyhow!("boom")))
    }

    #[test]
    fn test_namespaces_are_deduplicated() {
        let surface = HostSurface::new()
            .with_module(JsonModule::new("chain"))
            .with_module(JsonModule::new("util"))
            .with_module(JsonModule::new("chain"));
        assert_eq!(surface.namespaces(), vec!["chain", "util"]);
    }

    #[test]
    fn test_functions_reachable_from_host_and_global() {
        let surface = HostSurface::new().with_module(util_module());
        with_context(|ctx| {
            surface.install(&ctx).unwrap();
            let via_host: i32 = ctx.eval("host.util.echo(41) + 1").unwrap();
            let via_global: String = ctx.eval("util.echo('hi')").unwrap();
            assert_eq!(via_host, 42);
            assert_eq!(via_global, "hi");
        });
    }

    #[test]
    fn test_host_error_becomes_exception() {
        let surface = HostSurface::new().with_module(util_module());
        with_context(|ctx| {
            surface.install(&ctx).unwrap();
            let message: String = ctx
                .eval("try { util.fail(); 'no' } catch (e) { e.message }")
                .unwrap();
            assert_eq!(message, "util.fail: boom");
        });
    }

    #[test]
    fn test_modules_merge_into_one_namespace() {
        let surface = HostSurface::new()
            .with_module(JsonModule::new("repo").function("a", |_| Ok(json!(1))))
            .with_module(JsonModule::new("repo").function("b", |_| Ok(json!(2))));
        with_context(|ctx| {
            surface.install(&ctx).unwrap();
            let sum: i32 = ctx.eval("repo.a() + host.repo.b()").unwrap();
            assert_eq!(sum, 3);
        });
    }

    #[test]
    fn test_json_round_trip_through_host_function() {
        let surface = HostSurface::new().with_module(util_module());
        with_context(|ctx| {
            surface.install(&ctx).unwrap();
            let value: Value = ctx
                .eval("util.echo({ name: 'repo1', tags: ['a', 'b'], fee: 1.5 })")
                .unwrap();
            let json = js_to_json(&ctx, value).unwrap();
            assert_eq!(json, json!({ "name": "repo1", "tags": ["a", "b"], "fee": 1.5 }));
        });
    }

    #[test]
    fn test_undefined_becomes_null() {
        with_context(|ctx| {
            let value: Value = ctx.eval("undefined").unwrap();
            assert_eq!(js_to_json(&ctx, value).unwrap(), serde_json::Value::Null);
        });
    }
}
