use std::collections::BTreeMap;

use apmtx_core::model::attribute::AttributeValue;
use serde_json::{Number, Value};
use tracing::trace;

/// Converts attribute values to collector primitives. `None` drops the
/// attribute.
pub trait AttributeFlattener: Send + Sync {
    fn flatten(&self, value: &AttributeValue) -> Option<Value>;
}

/// Strings truncated to `max_bytes` on a char boundary; non-finite floats
/// dropped since JSON cannot carry them.
#[derive(Debug, Clone, Copy)]
pub struct DefaultFlattener {
    pub max_bytes: usize,
}

impl Default for DefaultFlattener {
    fn default() -> Self {
        Self { max_bytes: 255 }
    }
}

impl AttributeFlattener for DefaultFlattener {
    fn flatten(&self, value: &AttributeValue) -> Option<Value> {
        match value {
            AttributeValue::Bool(v) => Some(Value::Bool(*v)),
            AttributeValue::Int(v) => Some(Value::from(*v)),
            AttributeValue::Float(v) => Number::from_f64(*v).map(Value::Number),
            AttributeValue::String(s) => {
                Some(Value::String(truncate_to_bytes(s, self.max_bytes).to_string()))
            }
        }
    }
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a char.
pub fn truncate_to_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Flattens `(key, value)` pairs into a key-sorted map. Later pairs override
/// earlier ones with the same key.
pub fn flatten_all<'a, I>(flattener: &dyn AttributeFlattener, pairs: I) -> BTreeMap<String, Value>
where
    I: IntoIterator<Item = (&'a str, &'a AttributeValue)>,
{
    let mut out = BTreeMap::new();
    for (key, value) in pairs {
        match flattener.flatten(value) {
            Some(flat) => {
                out.insert(key.to_string(), flat);
            }
            None => trace!(key, "attribute dropped by flattener"),
        }
    }
    out
}
