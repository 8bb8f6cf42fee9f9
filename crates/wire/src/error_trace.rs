//! Error trace records in the collector's positional array form.

use std::collections::BTreeMap;

use apmtx_core::time::epoch_millis;
use chrono::{DateTime, Utc};
use serde::ser::{SerializeTuple, Serializer};
use serde::Serialize;
use serde_json::Value;

/// Attribute bundle at position 4 of an error trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorTraceAttributes {
    pub stack_trace: Option<Vec<String>>,
    #[serde(rename = "agentAttributes")]
    pub agent_attributes: BTreeMap<String, Value>,
    #[serde(rename = "userAttributes")]
    pub user_attributes: BTreeMap<String, Value>,
    pub intrinsics: BTreeMap<String, Value>,
}

/// Serializes as `[timestamp_ms, path, message, exception_class, attributes, guid]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTraceWireModel {
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub message: String,
    pub exception_class_name: String,
    pub attributes: ErrorTraceAttributes,
    pub guid: String,
}

impl Serialize for ErrorTraceWireModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&epoch_millis(self.timestamp))?;
        tuple.serialize_element(&self.path)?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&self.exception_class_name)?;
        tuple.serialize_element(&self.attributes)?;
        tuple.serialize_element(&self.guid)?;
        tuple.end()
    }
}

/// `[agent_run_id, [trace, ...]]` envelope for the error_data collector method.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTracePayload {
    pub agent_run_id: String,
    pub traces: Vec<ErrorTraceWireModel>,
}

impl Serialize for ErrorTracePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.agent_run_id)?;
        tuple.serialize_element(&self.traces)?;
        tuple.end()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn model() -> ErrorTraceWireModel {
        let mut attributes = ErrorTraceAttributes::default();
        attributes
            .agent_attributes
            .insert("request.uri".to_string(), json!("/checkout"));
        attributes.intrinsics.insert("error.expected".to_string(), json!(false));
        ErrorTraceWireModel {
            timestamp: Utc.timestamp_millis_opt(1_769_904_000_123).unwrap(),
            path: "WebTransaction/checkout".to_string(),
            message: "card declined".to_string(),
            exception_class_name: "PaymentError".to_string(),
            attributes,
            guid: "4bf92f3577b34da6".to_string(),
        }
    }

    #[test]
    fn serializes_positionally() {
        let value = serde_json::to_value(model()).unwrap();
        assert_eq!(
            value,
            json!([
                1_769_904_000_123_i64,
                "WebTransaction/checkout",
                "card declined",
                "PaymentError",
                {
                    "stack_trace": null,
                    "agentAttributes": {"request.uri": "/checkout"},
                    "userAttributes": {},
                    "intrinsics": {"error.expected": false}
                },
                "4bf92f3577b34da6"
            ])
        );
    }

    #[test]
    fn payload_wraps_run_id() {
        let payload = ErrorTracePayload {
            agent_run_id: "run-1".to_string(),
            traces: vec![model()],
        };
        let value = serde_json::to_value(payload).unwrap();
        assert_eq!(value[0], json!("run-1"));
        assert_eq!(value[1][0][3], json!("PaymentError"));
    }
}
