use std::collections::BTreeMap;

use apmtx_agent::FinishedTransaction;
use apmtx_core::config::AgentConfig;
use apmtx_core::model::attribute::AttributeValue;
use apmtx_core::model::error::ErrorData;
use serde_json::Value;
use tracing::debug;

use crate::attributes::{AttributeFlattener, DefaultFlattener, flatten_all};
use crate::error_trace::{ErrorTraceAttributes, ErrorTraceWireModel};

/// Builds error traces for every error a finished transaction recorded.
pub struct ErrorTraceMaker {
    flattener: Box<dyn AttributeFlattener>,
    max_frames: usize,
}

impl ErrorTraceMaker {
    pub fn new(flattener: Box<dyn AttributeFlattener>, max_frames: usize) -> Self {
        Self {
            flattener,
            max_frames,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            Box::new(DefaultFlattener {
                max_bytes: config.attribute_value_max_bytes,
            }),
            config.error_stack_trace_max_frames,
        )
    }

    /// Instrumentation-observed exceptions first, then API-noticed errors.
    pub fn make_error_traces(&self, finished: &FinishedTransaction) -> Vec<ErrorTraceWireModel> {
        let metadata = &finished.metadata;
        let traces: Vec<_> = metadata
            .transaction_exceptions()
            .iter()
            .chain(metadata.custom_errors())
            .map(|error| self.make_error_trace(finished, error))
            .collect();
        if !traces.is_empty() {
            debug!(guid = %finished.guid, count = traces.len(), "error traces built");
        }
        traces
    }

    pub fn make_error_trace(
        &self,
        finished: &FinishedTransaction,
        error: &ErrorData,
    ) -> ErrorTraceWireModel {
        let stack_trace = error
            .stack_trace
            .as_ref()
            .map(|frames| frames.iter().take(self.max_frames).cloned().collect());

        ErrorTraceWireModel {
            timestamp: error.timestamp,
            path: finished.name.clone(),
            message: error.message.clone(),
            exception_class_name: error.error_type.clone(),
            attributes: ErrorTraceAttributes {
                stack_trace,
                agent_attributes: self.agent_attributes(finished),
                user_attributes: self.user_attributes(finished, error),
                intrinsics: self.intrinsics(finished),
            },
            guid: finished.guid.to_string(),
        }
    }

    fn agent_attributes(&self, finished: &FinishedTransaction) -> BTreeMap<String, Value> {
        let metadata = &finished.metadata;
        let request = metadata.request();

        let mut pairs: Vec<(String, AttributeValue)> = Vec::new();
        if let Some(uri) = request.uri.as_ref().or(request.original_uri.as_ref()) {
            pairs.push(("request.uri".to_string(), uri.as_str().into()));
        }
        if let Some(referrer) = &request.referrer_uri {
            pairs.push(("request.referer".to_string(), referrer.as_str().into()));
        }
        if let Some(status) = request.http_response_status_code {
            pairs.push(("response.status".to_string(), status.to_string().into()));
        }
        if let Some(queue) = request.queue_time {
            pairs.push(("queue_duration".to_string(), queue.as_secs_f64().into()));
        }
        for (key, value) in metadata.request_parameters() {
            pairs.push((format!("request.parameters.{key}"), value.as_str().into()));
        }

        flatten_all(
            self.flattener.as_ref(),
            pairs.iter().map(|(k, v)| (k.as_str(), v)),
        )
    }

    /// User attributes, then user-error attributes, then the error's own.
    fn user_attributes(
        &self,
        finished: &FinishedTransaction,
        error: &ErrorData,
    ) -> BTreeMap<String, Value> {
        let metadata = &finished.metadata;
        let pairs = metadata
            .user_attributes()
            .iter()
            .chain(metadata.user_error_attributes())
            .chain(&error.custom_attributes)
            .map(|(k, v)| (k.as_str(), v));
        flatten_all(self.flattener.as_ref(), pairs)
    }

    fn intrinsics(&self, finished: &FinishedTransaction) -> BTreeMap<String, Value> {
        let metadata = &finished.metadata;
        let mut pairs: Vec<(String, AttributeValue)> = vec![
            ("guid".to_string(), finished.guid.as_str().into()),
            ("traceId".to_string(), finished.trace_id.as_str().into()),
            ("priority".to_string(), f64::from(metadata.priority()).into()),
            (
                "totalTime".to_string(),
                finished.duration().as_secs_f64().into(),
            ),
        ];
        if let Some(sampled) = metadata.distributed_trace().sampled {
            pairs.push(("sampled".to_string(), sampled.into()));
        }

        let synthetics = metadata.synthetics();
        if metadata.is_synthetics() {
            let fields = [
                ("synthetics_resource_id", &synthetics.resource_id),
                ("synthetics_job_id", &synthetics.job_id),
                ("synthetics_monitor_id", &synthetics.monitor_id),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    pairs.push((key.to_string(), value.as_str().into()));
                }
            }
        }

        let cat = metadata.cross_application();
        let cat_fields = [
            ("client_cross_process_id", &cat.referrer_process_id),
            ("referring_transaction_guid", &cat.referrer_transaction_guid),
            ("trip_id", &cat.referrer_trip_id),
            ("path_hash", &cat.path_hash),
        ];
        for (key, value) in cat_fields {
            if let Some(value) = value {
                pairs.push((key.to_string(), value.as_str().into()));
            }
        }
        if !cat.alternate_path_hashes.is_empty() {
            pairs.push((
                "cat_alternate_path_hashes".to_string(),
                cat.alternate_path_hashes.join(",").into(),
            ));
        }

        flatten_all(
            self.flattener.as_ref(),
            pairs.iter().map(|(k, v)| (k.as_str(), v)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apmtx_agent::Agent;
    use apmtx_core::time::{Clock, ManualClock};

    use super::*;

    fn finished_with_error(config: &AgentConfig) -> Arc<FinishedTransaction> {
        let clock = Arc::new(ManualClock::at_epoch_millis(1_769_904_000_000).unwrap());
        let agent = Agent::builder(config.clone()).clock(clock.clone()).build();
        let tx = agent.start_transaction("WebTransaction/orders");
        tx.metadata().update_request(|r| {
            r.uri = Some("/orders/7".to_string());
            r.http_response_status_code = Some(500);
        });
        tx.metadata().add_request_parameter("id", "7");
        tx.metadata().add_user_attribute("tier", "gold");
        tx.metadata().add_user_error_attribute("tier", "platinum");

        clock.advance_ms(250);
        let error = ErrorData::new(clock.now(), "OrderError", "order not found")
            .with_stack_trace((0..5).map(|i| format!("frame{i}")).collect())
            .with_attribute("order_id", 7_i64);
        tx.notice_error(error);
        tx.end().unwrap()
    }

    #[test]
    fn builds_trace_from_transaction() {
        let config = AgentConfig {
            error_stack_trace_max_frames: 3,
            ..AgentConfig::default()
        };
        let finished = finished_with_error(&config);
        let traces = ErrorTraceMaker::from_config(&config).make_error_traces(&finished);
        assert_eq!(traces.len(), 1);

        let trace = &traces[0];
        assert_eq!(trace.path, "WebTransaction/orders");
        assert_eq!(trace.exception_class_name, "OrderError");
        assert_eq!(trace.guid, finished.guid.to_string());
        assert_eq!(trace.attributes.stack_trace.as_ref().map(Vec::len), Some(3));

        let agent = &trace.attributes.agent_attributes;
        assert_eq!(agent["request.uri"], Value::from("/orders/7"));
        assert_eq!(agent["response.status"], Value::from("500"));
        assert_eq!(agent["request.parameters.id"], Value::from("7"));

        let user = &trace.attributes.user_attributes;
        assert_eq!(user["tier"], Value::from("platinum"));
        assert_eq!(user["order_id"], Value::from(7));

        assert_eq!(trace.attributes.intrinsics["totalTime"], Value::from(0.25));
    }

    #[test]
    fn long_attribute_values_are_truncated() {
        let config = AgentConfig {
            attribute_value_max_bytes: 4,
            ..AgentConfig::default()
        };
        let finished = finished_with_error(&config);
        let traces = ErrorTraceMaker::from_config(&config).make_error_traces(&finished);
        assert_eq!(traces[0].attributes.user_attributes["tier"], Value::from("plat"));
        assert_eq!(traces[0].message, "order not found");
    }

    #[test]
    fn no_errors_no_traces() {
        let agent = Agent::new(AgentConfig::default());
        let finished = agent.start_transaction("t").end().unwrap();
        assert!(ErrorTraceMaker::from_config(agent.config())
            .make_error_traces(&finished)
            .is_empty());
    }
}
