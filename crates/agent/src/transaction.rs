use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use apmtx_core::error::{ApmError, Result};
use apmtx_core::ids::{SegmentId, TraceId, TransactionGuid};
use apmtx_core::model::error::ErrorData;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::metadata::TransactionMetadata;
use crate::segment::{
    DatastoreSegmentData, DatastoreVendor, ExternalSegmentData, Segment, SegmentKind,
};
use crate::snapshot::{FinishedTransaction, compute_exclusive_times};
use crate::wrapper::MethodCall;

pub const CAT_APP_DATA_HEADER: &str = "X-NewRelic-App-Data";
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

#[derive(Debug, Default)]
struct Lifecycle {
    holds: u32,
    end_requested: bool,
    finalizing: bool,
}

pub(crate) struct TransactionInner {
    guid: TransactionGuid,
    trace_id: TraceId,
    name: String,
    start: DateTime<Utc>,
    end: OnceLock<DateTime<Utc>>,
    agent: Agent,
    next_segment_id: AtomicU64,
    segments: Mutex<Vec<Arc<Segment>>>,
    call_stack: Mutex<Vec<SegmentId>>,
    attached_to_async: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    metadata: TransactionMetadata,
    finished: OnceLock<Arc<FinishedTransaction>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransactionInner {
    pub(crate) fn pop_call_stack(&self, id: SegmentId) {
        let mut stack = lock(&self.call_stack);
        if let Some(pos) = stack.iter().rposition(|s| *s == id) {
            stack.remove(pos);
        }
    }
}

/// Per-request aggregate. Clones are handles to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("guid", &self.inner.guid)
            .field("name", &self.inner.name)
            .field("hold_count", &self.hold_count())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(agent: Agent, name: String) -> Self {
        let start = agent.clock().now();
        let guid = TransactionGuid::generate();
        debug!(guid = %guid, name = %name, "transaction started");
        Self {
            inner: Arc::new(TransactionInner {
                guid,
                trace_id: TraceId::generate(),
                name,
                start,
                end: OnceLock::new(),
                agent,
                next_segment_id: AtomicU64::new(1),
                segments: Mutex::new(Vec::new()),
                call_stack: Mutex::new(Vec::new()),
                attached_to_async: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
                metadata: TransactionMetadata::new(),
                finished: OnceLock::new(),
            }),
        }
    }

    pub fn guid(&self) -> &TransactionGuid {
        &self.inner.guid
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.inner.trace_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start
    }

    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.inner.metadata
    }

    /// Starts a segment nested under the current top of the call stack.
    pub fn start_segment(&self, kind: SegmentKind) -> Arc<Segment> {
        let id = SegmentId::new(self.inner.next_segment_id.fetch_add(1, Ordering::Relaxed));
        let segment = {
            let mut stack = lock(&self.inner.call_stack);
            let parent = stack.last().copied();
            let segment = Arc::new(Segment::new(
                id,
                parent,
                kind,
                self.inner.agent.clock(),
                Arc::downgrade(&self.inner),
            ));
            stack.push(id);
            segment
        };
        lock(&self.inner.segments).push(Arc::clone(&segment));
        debug!(
            guid = %self.inner.guid,
            segment = %id,
            parent = ?segment.parent_id(),
            name = %segment.kind().name(),
            "segment started"
        );
        segment
    }

    pub fn start_datastore_segment(
        &self,
        call: &MethodCall,
        vendor: DatastoreVendor,
        model: impl Into<String>,
        operation: impl Into<String>,
        command_text: Option<String>,
    ) -> Arc<Segment> {
        debug!(method = %call.method, "datastore call instrumented");
        self.start_segment(SegmentKind::Datastore(DatastoreSegmentData {
            vendor,
            model: model.into(),
            operation: operation.into(),
            command_text,
        }))
    }

    pub fn start_external_request_segment(
        &self,
        call: &MethodCall,
        uri: &url::Url,
        method: impl Into<String>,
    ) -> Arc<Segment> {
        debug!(method = %call.method, "external call instrumented");
        self.start_segment(SegmentKind::External(ExternalSegmentData {
            uri: uri.to_string(),
            method: method.into(),
        }))
    }

    pub fn current_segment_id(&self) -> Option<SegmentId> {
        lock(&self.inner.call_stack).last().copied()
    }

    pub fn segment_count(&self) -> usize {
        lock(&self.inner.segments).len()
    }

    /// Marks that this request's context must survive a thread hand-off.
    pub fn attach_to_async(&self) {
        if !self.inner.attached_to_async.swap(true, Ordering::AcqRel) {
            debug!(guid = %self.inner.guid, "transaction attached to async context");
        }
    }

    pub fn is_attached_to_async(&self) -> bool {
        self.inner.attached_to_async.load(Ordering::Acquire)
    }

    /// Defers finalize until a matching `release`. Refused (returns `false`)
    /// once finalize has started.
    pub fn hold(&self) -> bool {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.finalizing {
            warn!(guid = %self.inner.guid, "hold refused: transaction already finalized");
            return false;
        }
        lifecycle.holds += 1;
        true
    }

    /// Drops one hold. Runs a pending finalize when the count reaches zero.
    pub fn release(&self) {
        let run_finalize = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.holds == 0 {
                warn!(guid = %self.inner.guid, "release without matching hold ignored");
                return;
            }
            lifecycle.holds -= 1;
            let ready = lifecycle.holds == 0 && lifecycle.end_requested && !lifecycle.finalizing;
            if ready {
                lifecycle.finalizing = true;
            }
            ready
        };
        if run_finalize {
            self.finalize();
        }
    }

    pub fn hold_count(&self) -> u32 {
        lock(&self.inner.lifecycle).holds
    }

    /// Signals that the request is logically complete. Finalizes immediately
    /// when nothing holds the transaction, otherwise on the last `release`.
    /// An outstanding hold that is never released keeps the transaction
    /// pending; `hold_count` lets the caller apply its own policy.
    pub fn end(&self) -> Option<Arc<FinishedTransaction>> {
        let run_finalize = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.end_requested {
                return self.finished();
            }
            lifecycle.end_requested = true;
            let _ = self.inner.end.set(self.inner.agent.clock().now());
            let ready = lifecycle.holds == 0;
            if ready {
                lifecycle.finalizing = true;
            } else {
                debug!(
                    guid = %self.inner.guid,
                    holds = lifecycle.holds,
                    "finalize deferred until holds are released"
                );
            }
            ready
        };
        run_finalize.then(|| self.finalize())
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.get().is_some()
    }

    pub fn finished(&self) -> Option<Arc<FinishedTransaction>> {
        self.inner.finished.get().cloned()
    }

    fn finalize(&self) -> Arc<FinishedTransaction> {
        let segments: Vec<Arc<Segment>> = lock(&self.inner.segments).clone();
        let mut snapshots: Vec<_> = segments.iter().map(|s| s.snapshot()).collect();
        compute_exclusive_times(&mut snapshots);

        let end = self
            .inner
            .end
            .get()
            .copied()
            .unwrap_or_else(|| self.inner.agent.clock().now());

        let finished = Arc::new(FinishedTransaction {
            guid: self.inner.guid.clone(),
            trace_id: self.inner.trace_id.clone(),
            name: self.inner.name.clone(),
            start: self.inner.start,
            end,
            attached_to_async: self.is_attached_to_async(),
            segments: snapshots,
            metadata: self.inner.metadata.snapshot(),
        });

        let finished = Arc::clone(self.inner.finished.get_or_init(|| finished));
        debug!(
            guid = %finished.guid,
            segments = finished.segments.len(),
            unfinished = finished.unfinished_segments(),
            "transaction finalized"
        );
        self.inner.agent.deliver(Arc::clone(&finished));
        finished
    }

    /// Records an exception observed by instrumentation.
    pub fn record_exception(&self, error: ErrorData) {
        self.inner.metadata.add_transaction_exception(error);
    }

    /// Records an error reported through the public API.
    pub fn notice_error(&self, error: ErrorData) {
        self.inner.metadata.add_custom_error(error);
    }

    /// Headers to attach to an outbound request so the callee can continue
    /// this trace. Empty when distributed tracing is disabled.
    pub fn outbound_request_headers(&self, segment: &Segment) -> Vec<(String, String)> {
        let config = self.inner.agent.config();
        if !config.distributed_tracing_enabled {
            return Vec::new();
        }

        let sampled = self.inner.metadata.sampled().unwrap_or(false);
        let flags = if sampled { "01" } else { "00" };
        let mut headers = vec![(
            TRACEPARENT_HEADER.to_string(),
            format!(
                "00-{}-{}-{flags}",
                self.inner.trace_id,
                segment.id().to_span_id()
            ),
        )];
        if let Some(key) = &config.trusted_account_key {
            headers.push((
                TRACESTATE_HEADER.to_string(),
                format!(
                    "{key}@apmtx={}-{}-{:.6}",
                    self.inner.guid,
                    u8::from(sampled),
                    self.inner.metadata.priority()
                ),
            ));
        }
        self.inner.metadata.mark_outgoing_distributed_trace_payload();
        headers
    }

    /// Applies response headers of a finished external call to `segment`
    /// and to this transaction. Multi-valued headers arrive comma-joined.
    pub fn process_inbound_response(
        &self,
        headers: &[(String, String)],
        segment: &Segment,
    ) -> Result<()> {
        if !self.inner.agent.config().cross_application_tracing_enabled {
            return Ok(());
        }
        let Some((_, raw)) = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(CAT_APP_DATA_HEADER))
        else {
            return Ok(());
        };

        let app_data = parse_app_data(raw)?;
        segment.add_attribute("cat.crossProcessId", app_data.cross_process_id);
        segment.add_attribute("cat.transactionName", app_data.transaction_name);
        segment.add_attribute("cat.responseTimeSecs", app_data.response_time_secs);
        if let Some(guid) = app_data.transaction_guid {
            segment.add_attribute("cat.transactionGuid", guid);
        }
        self.inner.metadata.mark_cat_response_headers();
        Ok(())
    }
}

#[derive(Debug)]
struct AppData {
    cross_process_id: String,
    transaction_name: String,
    response_time_secs: f64,
    transaction_guid: Option<String>,
}

/// Decodes `[cross_process_id, transaction_name, queue_secs, response_secs,
/// content_length, guid?]`.
fn parse_app_data(raw: &str) -> Result<AppData> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ApmError::Parse(format!("malformed {CAT_APP_DATA_HEADER}: {e}")))?;
    let fields = value
        .as_array()
        .ok_or_else(|| ApmError::Parse(format!("{CAT_APP_DATA_HEADER} is not an array")))?;

    let text = |i: usize| fields.get(i).and_then(|v| v.as_str()).map(str::to_string);
    let cross_process_id = text(0)
        .ok_or_else(|| ApmError::Parse(format!("{CAT_APP_DATA_HEADER} lacks a process id")))?;
    let transaction_name = text(1)
        .ok_or_else(|| ApmError::Parse(format!("{CAT_APP_DATA_HEADER} lacks a name")))?;

    Ok(AppData {
        cross_process_id,
        transaction_name,
        response_time_secs: fields.get(3).and_then(|v| v.as_f64()).unwrap_or(0.0),
        transaction_guid: text(5),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use apmtx_core::config::AgentConfig;
    use apmtx_core::model::attribute::AttributeValue;
    use apmtx_core::time::ManualClock;

    use super::*;
    use crate::agent::TransactionSink;
    use crate::segment::SegmentState;

    #[derive(Default)]
    struct Collect(StdMutex<Vec<Arc<FinishedTransaction>>>);

    impl TransactionSink for Collect {
        fn accept(&self, finished: Arc<FinishedTransaction>) {
            self.0.lock().unwrap().push(finished);
        }
    }

    fn agent_with(config: AgentConfig) -> (Agent, Arc<ManualClock>, Arc<Collect>) {
        let clock = Arc::new(ManualClock::at_epoch_millis(1_700_000_000_000).unwrap());
        let sink = Arc::new(Collect::default());
        let agent = Agent::builder(config)
            .clock(clock.clone())
            .transaction_sink(sink.clone())
            .build();
        (agent, clock, sink)
    }

    fn external_kind() -> SegmentKind {
        SegmentKind::External(ExternalSegmentData {
            uri: "https://api.example.com/".to_string(),
            method: "GET".to_string(),
        })
    }

    #[test]
    fn nesting_follows_call_stack() {
        let (agent, _, _) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("WebTransaction/orders");

        let outer = tx.start_segment(external_kind());
        let inner = tx.start_segment(external_kind());
        assert_eq!(inner.parent_id(), Some(outer.id()));
        assert_eq!(tx.current_segment_id(), Some(inner.id()));

        inner.end();
        assert_eq!(tx.current_segment_id(), Some(outer.id()));
        outer.end();
        assert_eq!(tx.current_segment_id(), None);
    }

    #[test]
    fn removed_segment_no_longer_parents_new_ones() {
        let (agent, _, _) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("t");

        let root = tx.start_segment(external_kind());
        let tail = tx.start_segment(external_kind());
        tail.remove_from_call_stack();
        let sibling = tx.start_segment(external_kind());

        assert_eq!(tail.state(), SegmentState::Detached);
        assert_eq!(sibling.parent_id(), Some(root.id()));
    }

    #[test]
    fn end_finalizes_once_when_not_held() {
        let (agent, _, sink) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("t");
        let first = tx.end().unwrap();
        let second = tx.end().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn finalize_waits_for_last_release() {
        let (agent, _, sink) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("t");

        assert!(tx.hold());
        assert!(tx.hold());
        assert!(tx.end().is_none());
        tx.release();
        assert!(!tx.is_finished());
        tx.release();
        assert!(tx.is_finished());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn release_without_hold_never_goes_negative() {
        let (agent, _, _) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("t");
        tx.release();
        assert_eq!(tx.hold_count(), 0);
        assert!(tx.hold());
        assert_eq!(tx.hold_count(), 1);
    }

    #[test]
    fn hold_after_finalize_is_refused() {
        let (agent, _, _) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("t");
        tx.end();
        assert!(!tx.hold());
        assert_eq!(tx.hold_count(), 0);
    }

    fn detached_child_exclusive(flagged: bool) -> Duration {
        let (agent, clock, _) = agent_with(AgentConfig::default());
        let tx = agent.start_transaction("t");

        let parent = tx.start_segment(external_kind());
        clock.advance_ms(10);
        let child = tx.start_segment(external_kind());
        child.set_deduct_from_parent(flagged);
        child.remove_from_call_stack();
        clock.advance_ms(50);
        child.end();
        clock.advance_ms(140);
        parent.end();

        let finished = tx.end().unwrap();
        assert_eq!(
            finished.segment(child.id()).unwrap().duration,
            Some(Duration::from_millis(50))
        );
        finished.segment(parent.id()).unwrap().exclusive.unwrap()
    }

    #[test]
    fn detached_child_deducted_only_when_flagged() {
        assert_eq!(detached_child_exclusive(false), Duration::from_millis(200));
        assert_eq!(detached_child_exclusive(true), Duration::from_millis(150));
    }

    #[test]
    fn outbound_headers_mark_payload() {
        let config = AgentConfig {
            trusted_account_key: Some("33".to_string()),
            ..AgentConfig::default()
        };
        let (agent, _, _) = agent_with(config);
        let tx = agent.start_transaction("t");
        let segment = tx.start_segment(external_kind());

        let headers = tx.outbound_request_headers(&segment);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, TRACEPARENT_HEADER);
        assert!(headers[0].1.starts_with(&format!("00-{}-", tx.trace_id())));
        assert!(headers[1].1.starts_with("33@apmtx="));

        let finished = tx.end().unwrap();
        assert!(finished.metadata.has_outgoing_distributed_trace_payload());
    }

    #[test]
    fn outbound_headers_empty_when_disabled() {
        let config = AgentConfig {
            distributed_tracing_enabled: false,
            ..AgentConfig::default()
        };
        let (agent, _, _) = agent_with(config);
        let tx = agent.start_transaction("t");
        let segment = tx.start_segment(external_kind());
        assert!(tx.outbound_request_headers(&segment).is_empty());
    }

    #[test]
    fn inbound_app_data_recorded() {
        let config = AgentConfig {
            cross_application_tracing_enabled: true,
            ..AgentConfig::default()
        };
        let (agent, _, _) = agent_with(config);
        let tx = agent.start_transaction("t");
        let segment = tx.start_segment(external_kind());

        let headers = vec![(
            "x-newrelic-app-data".to_string(),
            r#"["1#2","WebTransaction/inventory",0.0,0.25,-1,"abc123"]"#.to_string(),
        )];
        tx.process_inbound_response(&headers, &segment).unwrap();

        let attrs = segment.attributes();
        assert!(attrs.contains(&(
            "cat.crossProcessId".to_string(),
            AttributeValue::from("1#2")
        )));
        assert!(attrs.contains(&(
            "cat.transactionGuid".to_string(),
            AttributeValue::from("abc123")
        )));
        assert!(tx.end().unwrap().metadata.has_cat_response_headers());
    }

    #[test]
    fn malformed_app_data_is_an_error() {
        let config = AgentConfig {
            cross_application_tracing_enabled: true,
            ..AgentConfig::default()
        };
        let (agent, _, _) = agent_with(config);
        let tx = agent.start_transaction("t");
        let segment = tx.start_segment(external_kind());
        let headers = vec![(CAT_APP_DATA_HEADER.to_string(), "{nope".to_string())];
        assert!(tx.process_inbound_response(&headers, &segment).is_err());
    }
}
