//! Policy inspection.

use gatekeeper::{GatekeeperConfig, GatekeeperResult, MethodPolicy};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

/// Load `path` if given, otherwise the layered configuration.
pub fn load_config(path: Option<&Path>) -> GatekeeperResult<GatekeeperConfig> {
    match path {
        Some(path) => GatekeeperConfig::from_file(path),
        None => GatekeeperConfig::load(),
    }
}

/// Print resolved policies for `methods` as JSON.
///
/// With no methods named, prints the defaults followed by every configured
/// method.
pub fn print_policies(
    path: Option<&Path>,
    methods: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;

    let resolve = |names: Vec<String>| -> BTreeMap<String, MethodPolicy> {
        names
            .into_iter()
            .map(|name| {
                let policy = config.for_method(&name);
                (name, policy)
            })
            .collect()
    };

    let output = if methods.is_empty() {
        let configured = config.methods.iter().map(|o| o.name.clone()).collect();
        json!({ "defaults": config.defaults, "methods": resolve(configured) })
    } else {
        json!(resolve(methods.to_vec()))
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
