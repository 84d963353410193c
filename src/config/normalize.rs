//! Generic YAML normalization helpers.
//!
//! The configuration accepts loose shapes: singular aliases, scalars where
//! lists are expected, deprecated keys. These helpers rewrite a
//! `serde_yaml::Value` tree into the canonical shape before it is decoded
//! into the typed model.

use crate::errors::{Error, Result};
use serde_yaml::{Mapping, Value};

pub fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

pub fn into_mapping(value: Value, what: &str) -> Result<Mapping> {
    match value {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        other => Err(Error::Config(format!(
            "{}: must be a map, got {}",
            what,
            type_name(&other)
        ))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a map",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Move `alias` to `canonical`. Both present is an error, not a merge.
pub fn alias(map: &mut Mapping, canonical: &str, alias: &str) -> Result<()> {
    if let Some(value) = map.remove(&key(alias)) {
        if map.contains_key(&key(canonical)) {
            return Err(Error::Config(format!(
                "both {} and {} defined",
                canonical, alias
            )));
        }
        map.insert(key(canonical), value);
    }
    Ok(())
}

/// Wrap a scalar or map in a single-item list; null becomes empty.
pub fn list(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Sequence(items) => items,
        other => vec![other],
    }
}

/// Accept a string or a list of strings; null becomes empty.
pub fn string_list(value: Value, what: &str) -> Result<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(Error::Config(format!(
                    "{}: must be a string, got {}",
                    what,
                    type_name(&other)
                ))),
            })
            .collect(),
        other => Err(Error::Config(format!(
            "{}: must be a string or a list of strings, got {}",
            what,
            type_name(&other)
        ))),
    }
}

/// Reject keys outside `allowed`, naming the offending key and path.
pub fn spurious_keys(map: &Mapping, allowed: &[&str], path: &str) -> Result<()> {
    for name in map.keys() {
        let name = match name {
            Value::String(s) => s.as_str(),
            other => {
                return Err(Error::Config(format!(
                    "{}: keys must be strings, got {}",
                    path,
                    type_name(other)
                )))
            }
        };
        if !allowed.contains(&name) {
            return Err(Error::Config(format!("{}: unknown key: {}", path, name)));
        }
    }
    Ok(())
}

/// Collapse a YAML scalar to its string form. Inspect queries and role
/// configuration values accept bare booleans and numbers.
pub fn yaml_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::Config(format!(
            "must be a scalar, got {}",
            type_name(other)
        ))),
    }
}

pub fn get_string(map: &Mapping, name: &str, path: &str) -> Result<Option<String>> {
    match map.get(&key(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => yaml_to_string(value)
            .map(Some)
            .map_err(|e| e.in_path(&format!("{}{}", path, name))),
    }
}

/// Insert a default value when the key is absent.
pub fn default_key(map: &mut Mapping, name: &str, value: &str) {
    if !map.contains_key(&key(name)) {
        map.insert(key(name), Value::String(value.to_string()));
    }
}
