//! Deep merging of YAML documents.
//!
//! Mappings merge recursively and the overlay wins on scalar conflicts.
//! Sequences are replaced wholesale, never concatenated, which keeps a merge
//! idempotent: applying the same overlay twice yields the same document.

use serde_yaml::Value;

/// Merges `overlay` into `base` in place.
///
/// - mapping + mapping: keys merge recursively
/// - anything else: the overlay value replaces the base value
///
/// `Null` overlays are ignored so that an empty YAML block (`key:`) never
/// erases configuration that is already present.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
