//! Dynamic block expansion
//!
//! ```json
//! "dynamic": {
//!   "set": {
//!     "for_each": {"clusterName": "demo", "region": "us-east-1"},
//!     "content": {"name": "${each.key}", "value": "${each.value}"}
//!   }
//! }
//! ```
//!
//! expands into `"set": [{"name": "clusterName", ...}, {"name": "region", ...}]`,
//! appended after any static `set` entries. Evaluated once at build time.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::reference;
use crate::resource::{Config, NodeKey};

/// Config key holding dynamic block definitions
pub const DYNAMIC: &str = "dynamic";

const ITERATOR: &str = "each";

/// Expand the `dynamic` entry of a config, if present
pub fn expand(node: &NodeKey, config: &Config) -> Result<Config> {
    let Some(blocks) = config.get(DYNAMIC) else {
        return Ok(config.clone());
    };

    let invalid = |message: String| Error::InvalidConfig {
        node: node.clone(),
        message,
    };

    let Value::Object(blocks) = blocks else {
        return Err(invalid(format!("'{DYNAMIC}' must be an object of blocks")));
    };

    let mut expanded = config.clone();
    expanded.remove(DYNAMIC);

    for (block, definition) in blocks {
        let for_each = definition
            .get("for_each")
            .ok_or_else(|| invalid(format!("dynamic block '{block}' has no for_each")))?;
        let content = definition.get("content").cloned().unwrap_or(Value::Null);

        let iterations: Vec<(Value, &Value)> = match for_each {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::from(i), v))
                .collect(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v))
                .collect(),
            other => {
                return Err(invalid(format!(
                    "for_each of dynamic block '{block}' must be a literal list or map, got {other}"
                )));
            }
        };

        let mut rendered = match expanded.remove(block) {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
        };

        for (key, value) in iterations {
            let item = reference::transform(&content, &mut |path: &str| {
                render_iterator(path, &key, value).map_err(&invalid)
            })?;
            rendered.push(item);
        }

        expanded.insert(block.clone(), Value::Array(rendered));
    }

    Ok(expanded)
}

fn render_iterator(path: &str, key: &Value, value: &Value) -> std::result::Result<Option<Value>, String> {
    let mut parts = path.split('.');
    if parts.next() != Some(ITERATOR) {
        return Ok(None);
    }
    match parts.next() {
        Some("key") if parts.next().is_none() => Ok(Some(key.clone())),
        Some("value") => {
            let attrs: Vec<&str> = parts.collect();
            reference::lookup(value, &attrs)
                .cloned()
                .map(Some)
                .ok_or_else(|| format!("${{{path}}} does not exist in the iterated value"))
        }
        _ => Err(format!("unknown iterator reference ${{{path}}}")),
    }
}
