//! Helpers for extracting values from KDL nodes.

use kdl::KdlNode;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Every value of a repeated property (`branches="a" branches="b"`), or the
/// arguments of a child node with that name.
pub(crate) fn string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return string_args(child);
            }
        }
    }

    Vec::new()
}

/// Integer argument of a node such as `desired-count 2`.
pub(crate) fn u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    let int = value
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(field, format!("expected an integer, got {}", value)))?;
    u64::try_from(int).map_err(|_| ConfigError::invalid(field, format!("{} is out of range", int)))
}

pub(crate) fn u32_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = u64_arg(node, field)?;
    u32::try_from(value).map_err(|_| ConfigError::invalid(field, format!("{} is out of range", value)))
}

pub(crate) fn secs_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    u64_arg(node, field).map(Duration::from_secs)
}

/// Boolean argument; accepts `#true`/`#false` as well as the strings "true"/"false".
pub(crate) fn bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if let Some(b) = value.as_bool() {
        return Ok(b);
    }
    match value.as_string() {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        _ => Err(ConfigError::invalid(
            field,
            format!("expected a boolean, got {}", value),
        )),
    }
}

/// Children written as `KEY "value"` (env blocks).
pub(crate) fn string_map(node: &KdlNode) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if let Some(val) = first_string_arg(child) {
                map.insert(child.name().value().to_string(), val);
            }
        }
    }
    map
}
