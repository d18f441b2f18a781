//! Host surface offered by the CLI node

use anyhow::Context;
use gitchain_ext::{HostSurface, JsonModule};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// Surface injected into every extension and the console
pub fn node_surface() -> HostSurface {
    HostSurface::new().with_module(util_module())
}

fn util_module() -> JsonModule {
    JsonModule::new("util")
        .function("version", |_| Ok(json!(env!("CARGO_PKG_VERSION"))))
        .function("now", |_| {
            let elapsed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("system clock is before the Unix epoch")?;
            Ok(json!(elapsed.as_millis() as u64))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_surface_namespaces() {
        let surface = node_surface();
        assert_eq!(surface.namespaces(), vec!["util"]);

        let module = util_module();
        let names: Vec<&str> = module.function_names().collect();
        assert_eq!(names, vec!["now", "version"]);
    }
}
