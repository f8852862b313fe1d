//! Run metadata: an insertion-ordered map of heterogeneous values.
//!
//! Every run carries a [`RunMetadata`] block capturing its topology tag,
//! column schema, setpoint lists, timestamps, provenance snapshots, notes,
//! and the interruption flag. Values are `serde_json::Value`, so entries
//! may be numbers, strings, lists, or nested mappings, and the whole block
//! serializes to `metadata.json` with keys in the order they were
//! inserted (`serde_json` is built with `preserve_order`).
//!
//! Apart from the interruption flag and the end-of-run fields, the block
//! is assembled once, before the first row is written, and never mutated
//! mid-run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Insertion-ordered metadata for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunMetadata {
    entries: Map<String, Value>,
}

impl RunMetadata {
    /// Create an empty metadata block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value under `key`, converting it to JSON.
    ///
    /// Values that cannot be represented in JSON are stored as null.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.entries.insert(key.into(), value);
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// The declared column schema, if one has been recorded.
    pub fn columns(&self) -> Option<Vec<String>> {
        let values = self.entries.get("columns")?.as_array()?;
        values
            .iter()
            .map(|v| v.as_str().map(String::from))
            .collect()
    }

    /// Flip the interruption flag. The only field mutated mid-run.
    pub fn set_interrupted(&mut self, interrupted: bool) {
        self.insert("interrupted", interrupted);
    }

    /// Whether the run was interrupted.
    pub fn interrupted(&self) -> bool {
        self.get("interrupted").and_then(Value::as_bool) == Some(true)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the block holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the block as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.entries.clone())
    }
}

/// Current wall-clock time as fractional unix seconds, the value stored in
/// every row's time column.
pub fn unix_time() -> f64 {
    let now: DateTime<Utc> = Utc::now();
    now.timestamp_micros() as f64 / 1e6
}

/// Current wall-clock time as an RFC 3339 string for the human-readable
/// metadata fields.
pub fn utc_now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Format a duration in seconds as `"Xh Ym Zs"`.
pub fn fmt_elapsed(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    format!("{h}h {m}m {s}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut meta = RunMetadata::new();
        meta.insert("type", "1D");
        meta.insert("columns", vec!["time", "p1"]);
        meta.insert("interrupted", false);

        let json = serde_json::to_string(&meta).unwrap();
        let type_pos = json.find("\"type\"").unwrap();
        let cols_pos = json.find("\"columns\"").unwrap();
        let int_pos = json.find("\"interrupted\"").unwrap();
        assert!(type_pos < cols_pos && cols_pos < int_pos);
    }

    #[test]
    fn test_columns_roundtrip() {
        let mut meta = RunMetadata::new();
        meta.insert("columns", vec!["time", "p1", "p2"]);
        assert_eq!(
            meta.columns().unwrap(),
            vec!["time".to_string(), "p1".to_string(), "p2".to_string()]
        );
    }

    #[test]
    fn test_interrupted_flag() {
        let mut meta = RunMetadata::new();
        meta.set_interrupted(false);
        assert!(!meta.interrupted());
        meta.set_interrupted(true);
        assert!(meta.interrupted());
    }

    #[test]
    fn test_fmt_elapsed() {
        assert_eq!(fmt_elapsed(0.4), "0h 0m 0s");
        assert_eq!(fmt_elapsed(61.0), "0h 1m 1s");
        assert_eq!(fmt_elapsed(3723.0), "1h 2m 3s");
    }
}
