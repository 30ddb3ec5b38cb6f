//! Purpose: Turn raw subtree reads into flat, key-tagged records.
//! Exports: `Snapshot`, `Record`, `normalize`, `entry`.
//! Role: First stage of the client-side query pipeline.
//! Invariants: Every record carries a string `key` field that overrides any stored `key`.
//! Invariants: Non-object values degenerate to `{key, value}`; a `null` snapshot yields nothing.
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use super::path::DbPath;

pub const KEY_FIELD: &str = "key";
pub const VALUE_FIELD: &str = "value";

/// Value read at one location. `Value::Null` means no data exists there.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    path: DbPath,
    value: Value,
}

impl Snapshot {
    pub fn new(path: DbPath, value: Value) -> Self {
        Self { path, value }
    }

    pub fn path(&self) -> &DbPath {
        &self.path
    }

    /// Leaf segment of the read location; empty at the root.
    pub fn key(&self) -> &str {
        self.path.leaf().unwrap_or_default()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Builds a record from a stored value, tagging it with `key`.
    pub fn from_value(key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        let mut fields = match value {
            Value::Object(map) => map,
            raw => {
                let mut map = Map::new();
                map.insert(VALUE_FIELD.to_string(), raw);
                map
            }
        };
        fields.insert(KEY_FIELD.to_string(), Value::String(key));
        Self { fields }
    }

    pub fn key(&self) -> &str {
        self.fields
            .get(KEY_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

pub fn normalize(snapshot: &Snapshot) -> Vec<Record> {
    match snapshot.value() {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Record::from_value(key.clone(), value.clone()))
            .collect(),
        // Null slots still occupy their index and become `{key, value: null}`.
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, value)| Record::from_value(idx.to_string(), value.clone()))
            .collect(),
        scalar => vec![Record::from_value(snapshot.key(), scalar.clone())],
    }
}

/// Wraps a single-location read as one record tagged with the caller's `key`,
/// or `None` when nothing is stored.
pub fn entry(snapshot: Snapshot, key: &str) -> Option<Record> {
    if !snapshot.exists() {
        return None;
    }
    Some(Record::from_value(key, snapshot.into_value()))
}

#[cfg(test)]
mod tests {
    use super::{Record, Snapshot, entry, normalize};
    use crate::core::path::DbPath;
    use serde_json::{Value, json};

    fn snapshot(path: &str, value: Value) -> Snapshot {
        Snapshot::new(DbPath::parse(path).expect("path"), value)
    }

    #[test]
    fn null_snapshot_is_empty() {
        assert!(normalize(&snapshot("chats_v2", Value::Null)).is_empty());
    }

    #[test]
    fn mapping_yields_one_record_per_key() {
        let snap = snapshot(
            "chats_v2",
            json!({"a": {"users": ["u1"], "t": 2}, "b": {"users": ["u3"], "t": 1}}),
        );
        let records = normalize(&snap);
        assert_eq!(records.len(), 2);
        let keys: Vec<_> = records.iter().map(Record::key).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(records[0].get("t"), Some(&json!(2)));
    }

    #[test]
    fn sequence_keys_are_indices() {
        let snap = snapshot("chat_v2", json!([{"text": "a"}, {"text": "b"}, {"text": "c"}]));
        let keys: Vec<_> = normalize(&snap)
            .iter()
            .map(|record| record.key().to_string())
            .collect();
        assert_eq!(keys, ["0", "1", "2"]);
    }

    #[test]
    fn sequence_null_slots_keep_their_index() {
        let snap = snapshot("chat_v2", json!([null, {"text": "b"}]));
        let records = normalize(&snap);
        assert_eq!(records.len(), 2);
        let keys: Vec<_> = records.iter().map(Record::key).collect();
        assert_eq!(keys, ["0", "1"]);
        assert_eq!(records[0].clone().into_value(), json!({"key": "0", "value": null}));

        let mixed = normalize(&snapshot("chat_v2", json!([null, {"text": "b"}, "c"])));
        let keys: Vec<_> = mixed.iter().map(Record::key).collect();
        assert_eq!(keys, ["0", "1", "2"]);
    }

    #[test]
    fn non_mapping_values_are_wrapped() {
        let snap = snapshot("flags", json!({"a": true, "b": "x"}));
        let records = normalize(&snap);
        assert_eq!(records[0].clone().into_value(), json!({"key": "a", "value": true}));
        assert_eq!(records[1].clone().into_value(), json!({"key": "b", "value": "x"}));
    }

    #[test]
    fn scalar_snapshot_becomes_single_record() {
        let records = normalize(&snapshot("counters/visits", json!(42)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].clone().into_value(), json!({"key": "visits", "value": 42}));
    }

    #[test]
    fn synthesized_key_overrides_stored_key() {
        let snap = snapshot("chats_v2", json!({"real": {"key": "stale", "n": 1}}));
        let records = normalize(&snap);
        assert_eq!(records[0].key(), "real");
    }

    #[test]
    fn entry_wraps_single_reads() {
        assert!(entry(snapshot("chat_v2/123", Value::Null), "123").is_none());
        let record =
            entry(snapshot("chat_v2/123", json!({"text": "hi"})), "123").expect("record");
        assert_eq!(record.into_value(), json!({"text": "hi", "key": "123"}));
        let record = entry(snapshot("chat_v2/7", json!("plain")), "7").expect("record");
        assert_eq!(record.into_value(), json!({"key": "7", "value": "plain"}));
    }

    #[test]
    fn entry_keeps_nested_keys_whole() {
        let record = entry(snapshot("chat_v2/a/b", json!({"text": "hi"})), "a/b").expect("record");
        assert_eq!(record.key(), "a/b");
    }
}
