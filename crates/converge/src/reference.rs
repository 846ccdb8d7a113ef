//! `${...}` references inside configuration payloads
//!
//! A reference names another node's output: `${aws_eks_cluster.main.endpoint}`.
//! The longest dot-separated prefix that is a node key selects the node, the
//! rest is an attribute path into that node's state blob.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

use crate::resource::Config;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z0-9_\-\.]+)\s*\}").expect("reference pattern is valid")
});

/// Every reference path appearing in the payload, in first-seen order
pub fn collect(config: &Config) -> Vec<String> {
    let mut paths = Vec::new();
    for value in config.values() {
        collect_value(value, &mut paths);
    }
    paths
}

/// Every reference path appearing in one value
pub fn collect_value(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in REFERENCE.captures_iter(s) {
                let path = caps[1].to_string();
                if !out.contains(&path) {
                    out.push(path);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_value(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_value(v, out)),
        _ => {}
    }
}

/// Split a reference path into (node key, attribute path)
///
/// Picks the longest prefix for which `is_node` holds.
pub fn split<'a>(path: &'a str, is_node: impl Fn(&str) -> bool) -> Option<(&'a str, Vec<&'a str>)> {
    let boundaries: Vec<usize> = path
        .match_indices('.')
        .map(|(i, _)| i)
        .chain(std::iter::once(path.len()))
        .collect();

    boundaries.iter().rev().find_map(|&end| {
        let key = &path[..end];
        if is_node(key) {
            let attrs = if end < path.len() {
                path[end + 1..].split('.').collect()
            } else {
                Vec::new()
            };
            Some((key, attrs))
        } else {
            None
        }
    })
}

/// Walk an attribute path through a JSON value (object keys, array indices)
pub fn lookup<'a>(value: &'a Value, attrs: &[&str]) -> Option<&'a Value> {
    attrs.iter().try_fold(value, |current, attr| match current {
        Value::Object(map) => map.get(*attr),
        Value::Array(items) => attr.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Rewrite every reference in a value
///
/// `replace` receives each reference path and returns the replacement value,
/// or `None` to leave the reference untouched. A string consisting of a single
/// reference becomes the replacement value itself; references embedded in
/// longer strings are interpolated as text.
pub fn transform<E>(
    value: &Value,
    replace: &mut impl FnMut(&str) -> Result<Option<Value>, E>,
) -> Result<Value, E> {
    match value {
        Value::String(s) => render(s, replace),
        Value::Array(items) => items
            .iter()
            .map(|v| transform(v, replace))
            .collect::<Result<Vec<_>, E>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), transform(v, replace)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// [`transform`] over a whole config mapping
pub fn transform_config<E>(
    config: &Config,
    replace: &mut impl FnMut(&str) -> Result<Option<Value>, E>,
) -> Result<Config, E> {
    config
        .iter()
        .map(|(k, v)| Ok((k.clone(), transform(v, replace)?)))
        .collect()
}

fn render<E>(
    s: &str,
    replace: &mut impl FnMut(&str) -> Result<Option<Value>, E>,
) -> Result<Value, E> {
    if let Some(path) = single(s) {
        return Ok(replace(path)?.unwrap_or_else(|| Value::String(s.to_string())));
    }

    let mut error = None;
    let rendered = REFERENCE.replace_all(s, |caps: &Captures<'_>| {
        if error.is_some() {
            return caps[0].to_string();
        }
        match replace(&caps[1]) {
            Ok(Some(Value::String(text))) => text,
            Ok(Some(other)) => other.to_string(),
            Ok(None) => caps[0].to_string(),
            Err(e) => {
                error = Some(e);
                caps[0].to_string()
            }
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(Value::String(rendered.into_owned())),
    }
}

/// The path of a string that consists of exactly one reference
pub fn single(s: &str) -> Option<&str> {
    let caps = REFERENCE.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Wrap a path back into reference syntax
pub fn token(path: &str) -> Value {
    Value::String(format!("${{{path}}}"))
}
