//! C1 — stable string hashing for advisory-lock ids, and the bidirectional
//! column-name/property-name remapping used when decoding raw rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Deterministic 31-bit non-negative hash of `key`, used to derive a
/// session advisory-lock id (spec §4.1). Total on every `&str`, including
/// the empty string, and pure.
///
/// Mirrors the source algorithm bit-for-bit:
/// `h = ((h << 5) - h + charCode) | 0` over UTF-16 code units, then
/// `abs(h) mod (2^31 - 1)`.
pub fn advisory_lock_key(key: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in key.encode_utf16() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32);
    }
    // Widen to i64 before abs(): i32::MIN.abs() overflows i32.
    let widened = h as i64;
    (widened.abs() % (2_i64.pow(31) - 1)) as i32
}

/// Bidirectional map between database column names and entity property
/// names for one table (§3.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnMap {
    column_to_prop: HashMap<String, String>,
    prop_to_column: HashMap<String, String>,
}

impl ColumnMap {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut column_to_prop = HashMap::new();
        let mut prop_to_column = HashMap::new();
        for (column, prop) in pairs {
            prop_to_column.insert(prop.clone(), column.clone());
            column_to_prop.insert(column, prop);
        }
        Self {
            column_to_prop,
            prop_to_column,
        }
    }

    /// A map where every column name equals its property name (the common
    /// case when the ORM does not rename fields).
    pub fn identity(columns: impl IntoIterator<Item = String>) -> Self {
        Self::new(columns.into_iter().map(|c| (c.clone(), c)))
    }

    pub fn prop_for_column(&self, column: &str) -> Option<&str> {
        self.column_to_prop.get(column).map(String::as_str)
    }

    pub fn column_for_prop(&self, prop: &str) -> Option<&str> {
        self.prop_to_column.get(prop).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.column_to_prop.keys().map(String::as_str)
    }

    /// Remap a decoded row's keys from database column names to property
    /// names (§4.6 step 3). Unknown keys pass through unchanged.
    pub fn remap_to_props(&self, row: &Value) -> Value {
        remap(row, &self.column_to_prop)
    }

    /// Inverse of [`ColumnMap::remap_to_props`]; used when restricting a
    /// trigger payload to a configured property list (§4.4).
    pub fn remap_to_columns(&self, row: &Value) -> Value {
        remap(row, &self.prop_to_column)
    }
}

fn remap(row: &Value, rename: &HashMap<String, String>) -> Value {
    match row {
        Value::Object(obj) => {
            let mut out = serde_json::Map::with_capacity(obj.len());
            for (k, v) in obj {
                let renamed = rename.get(k).cloned().unwrap_or_else(|| k.clone());
                out.insert(renamed, v.clone());
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Compute `updatedFields` for an UPDATE payload (§3.5): the set of
/// property names whose `old` and `new` scalar values differ. Keys whose
/// new or old value is an object or array are never included, even if
/// they differ, per spec §3.5.
pub fn updated_fields(new: &Value, old: &Value) -> Vec<String> {
    let (Value::Object(new_map), Value::Object(old_map)) = (new, old) else {
        return Vec::new();
    };

    let mut keys: Vec<&String> = new_map.keys().chain(old_map.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut fields = Vec::new();
    for key in keys {
        let nv = new_map.get(key).unwrap_or(&Value::Null);
        let ov = old_map.get(key).unwrap_or(&Value::Null);
        if is_object_or_array(nv) || is_object_or_array(ov) {
            continue;
        }
        if nv != ov {
            fields.push(key.clone());
        }
    }
    fields
}

fn is_object_or_array(v: &Value) -> bool {
    matches!(v, Value::Object(_) | Value::Array(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_pure_and_in_range() {
        for s in ["", "a", "pg_pubsub", "table with spaces", "😀"] {
            let h1 = advisory_lock_key(s);
            let h2 = advisory_lock_key(s);
            assert_eq!(h1, h2);
            assert!(h1 >= 0 && h1 <= (2i64.pow(31) - 2) as i32);
        }
    }

    #[test]
    fn hash_of_empty_string_is_zero() {
        assert_eq!(advisory_lock_key(""), 0);
    }

    #[test]
    fn column_map_remaps_both_directions() {
        let map = ColumnMap::new([
            ("user_name".to_string(), "userName".to_string()),
            ("id".to_string(), "id".to_string()),
        ]);
        let row = json!({"user_name": "ada", "id": 1, "unmapped": true});
        let remapped = map.remap_to_props(&row);
        assert_eq!(remapped["userName"], json!("ada"));
        assert_eq!(remapped["id"], json!(1));
        assert_eq!(remapped["unmapped"], json!(true));

        let back = map.remap_to_columns(&remapped);
        assert_eq!(back["user_name"], json!("ada"));
    }

    #[test]
    fn updated_fields_ignores_object_and_array_values() {
        let new = json!({"name": "Updated User", "tags": ["a"], "meta": {"k": 1}});
        let old = json!({"name": "Test User", "tags": ["b"], "meta": {"k": 2}});
        assert_eq!(updated_fields(&new, &old), vec!["name".to_string()]);
    }

    #[test]
    fn updated_fields_empty_when_unchanged() {
        let new = json!({"name": "same"});
        let old = json!({"name": "same"});
        assert!(updated_fields(&new, &old).is_empty());
    }
}
