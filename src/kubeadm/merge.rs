//! Field-level merge of YAML documents

use serde_yaml::Value;

/// Merge `overlay` into `base`.
///
/// Mappings merge key by key; any other explicit overlay value replaces the
/// base value. Null in the overlay means "unspecified" and keeps the base.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(over_map)) => {
            for (key, over_value) in over_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge(base_value, over_value),
                    None => {
                        if !over_value.is_null() {
                            base_map.insert(key.clone(), over_value.clone());
                        }
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Walk a dotted path, creating mappings as needed, and set the leaf
pub fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = doc;
    for key in parents {
        if !current.is_mapping() {
            *current = Value::Mapping(Default::default());
        }
        let Value::Mapping(map) = current else {
            return;
        };
        current = map
            .entry(Value::String(key.to_string()))
            .or_insert_with(|| Value::Mapping(Default::default()));
    }
    if !current.is_mapping() {
        *current = Value::Mapping(Default::default());
    }
    if let Value::Mapping(map) = current {
        map.insert(Value::String(last.to_string()), value);
    }
}

/// Read a string at a dotted path
pub fn get_str<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = doc;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}
