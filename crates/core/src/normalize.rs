//! Document Normalizer: coerce scalar-valued list fields into singleton sequences.
//!
//! Applied in place before any semantic interpretation, so downstream code (port/step/link
//! decoding) may assume list shape for these fields regardless of how the author wrote them.

use serde_json::Value;

const LISTIFIED_KEYS: &[&str] = &[
    "inputs",
    "outputs",
    "links",
    "baseCmd",
    "arguments",
    "inputBindings",
    "schemaDefs",
    "steps",
];

/// Recursively listify reserved keys throughout a decoded document tree.
pub fn normalize(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                normalize(item);
            }
        }
        Value::Object(map) => {
            for key in LISTIFIED_KEYS {
                if let Some(entry) = map.get_mut(*key) {
                    if !entry.is_array() {
                        let scalar = entry.take();
                        *entry = Value::Array(vec![scalar]);
                    }
                }
            }
            for (_, entry) in map.iter_mut() {
                normalize(entry);
            }
        }
        _ => {}
    }
}
