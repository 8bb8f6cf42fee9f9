use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::attribute::AttributeValue;

/// One error observed during a transaction, either an exception caught by
/// instrumentation or one reported through the public notice-error API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub error_type: String,
    pub stack_trace: Option<Vec<String>>,
    pub custom_attributes: Vec<(String, AttributeValue)>,
}

impl ErrorData {
    pub fn new(
        timestamp: DateTime<Utc>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            message: message.into(),
            error_type: error_type.into(),
            stack_trace: None,
            custom_attributes: Vec::new(),
        }
    }

    pub fn with_stack_trace(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = Some(frames);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.custom_attributes.push((key.into(), value.into()));
        self
    }
}
