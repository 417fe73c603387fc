//! The universal data quantum flowing between ports: a dynamic, type-agnostic tree.
//!
//! Rather than port a closed, statically-typed enum of payload kinds, values here are plain
//! `serde_json::Value` trees extended by convention with a File handle shape
//! (`{"@type": "File", "path": <absolute path>}`). Depth and File-ness are structural
//! properties of the tree, not a separate type tag.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

pub const FILE_TYPE_TAG: &str = "@type";
pub const FILE_TYPE_VALUE: &str = "File";
pub const FILE_PATH_KEY: &str = "path";

/// Depth of a Value: 0 for anything that is not a sequence, or an empty sequence;
/// otherwise 1 + depth of its first element.
pub fn depth_of(value: &Value) -> usize {
    match value.as_array() {
        Some(items) => match items.first() {
            Some(first) => 1 + depth_of(first),
            None => 0,
        },
        None => 0,
    }
}

/// Build a File handle for an absolute path.
pub fn file_handle(path: &Path) -> Value {
    let mut map = Map::new();
    map.insert(FILE_TYPE_TAG.to_string(), Value::String(FILE_TYPE_VALUE.to_string()));
    map.insert(
        FILE_PATH_KEY.to_string(),
        Value::String(path.to_string_lossy().into_owned()),
    );
    Value::Object(map)
}

/// True if a Value is a File handle mapping.
pub fn is_file_handle(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|m| m.get(FILE_TYPE_TAG))
        .and_then(Value::as_str)
        == Some(FILE_TYPE_VALUE)
}

/// Extract the path from a File handle, if the value is one.
pub fn file_handle_path(value: &Value) -> Option<PathBuf> {
    if !is_file_handle(value) {
        return None;
    }
    value
        .as_object()?
        .get(FILE_PATH_KEY)?
        .as_str()
        .map(PathBuf::from)
}

/// Strip a leading `#` from a port id, yielding the bare port name.
pub fn bare_name(port_id: &str) -> &str {
    port_id.strip_prefix('#').unwrap_or(port_id)
}

/// The substring after the final `/` in a port id, used to key step-result mappings.
pub fn last_segment(port_id: &str) -> &str {
    match port_id.rsplit_once('/') {
        Some((_, tail)) => tail,
        None => port_id,
    }
}
