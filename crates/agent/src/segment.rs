use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use apmtx_core::ids::SegmentId;
use apmtx_core::model::attribute::AttributeValue;
use apmtx_core::time::{Clock, elapsed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snapshot::SegmentSnapshot;
use crate::transaction::TransactionInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatastoreVendor {
    Couchbase,
    MongoDb,
}

impl DatastoreVendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Couchbase => "Couchbase",
            Self::MongoDb => "MongoDB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreSegmentData {
    pub vendor: DatastoreVendor,
    pub model: String,
    pub operation: String,
    pub command_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSegmentData {
    pub uri: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentKind {
    Datastore(DatastoreSegmentData),
    External(ExternalSegmentData),
}

impl SegmentKind {
    /// Metric-style name, e.g. `Datastore/statement/MongoDB/users/Find`.
    pub fn name(&self) -> String {
        match self {
            Self::Datastore(d) => format!(
                "Datastore/statement/{}/{}/{}",
                d.vendor.as_str(),
                d.model,
                d.operation
            ),
            Self::External(e) => {
                let host = url::Url::parse(&e.uri)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                format!("External/{host}/{}", e.method)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Open and on the transaction's call stack.
    Active,
    /// Open but removed from the call stack.
    Detached,
    Ended,
}

/// Timed unit of work for one instrumented call.
pub struct Segment {
    id: SegmentId,
    parent_id: Option<SegmentId>,
    kind: SegmentKind,
    start: DateTime<Utc>,
    end: OnceLock<DateTime<Utc>>,
    deduct_from_parent: AtomicBool,
    detached: AtomicBool,
    attributes: Mutex<Vec<(String, AttributeValue)>>,
    clock: Arc<dyn Clock>,
    transaction: Weak<TransactionInner>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Segment {
    pub(crate) fn new(
        id: SegmentId,
        parent_id: Option<SegmentId>,
        kind: SegmentKind,
        clock: Arc<dyn Clock>,
        transaction: Weak<TransactionInner>,
    ) -> Self {
        let start = clock.now();
        Self {
            id,
            parent_id,
            kind,
            start,
            end: OnceLock::new(),
            deduct_from_parent: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            attributes: Mutex::new(Vec::new()),
            clock,
            transaction,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn parent_id(&self) -> Option<SegmentId> {
        self.parent_id
    }

    pub fn kind(&self) -> &SegmentKind {
        &self.kind
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end.get().copied()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end_time().map(|end| elapsed(self.start, end))
    }

    pub fn is_ended(&self) -> bool {
        self.end.get().is_some()
    }

    pub fn state(&self) -> SegmentState {
        if self.is_ended() {
            SegmentState::Ended
        } else if self.detached.load(Ordering::Acquire) {
            SegmentState::Detached
        } else {
            SegmentState::Active
        }
    }

    /// Records the end time. Only the first call has any effect.
    pub fn end(&self) {
        let now = self.clock.now();
        if self.end.set(now).is_err() {
            return;
        }
        if let Some(tx) = self.transaction.upgrade() {
            tx.pop_call_stack(self.id);
        }
        debug!(segment = %self.id, name = %self.kind.name(), "segment ended");
    }

    /// Takes an open segment off the call stack without ending it. Its
    /// remaining time is then no longer attributed to the ambient parent.
    pub fn remove_from_call_stack(&self) {
        if self.is_ended() {
            return;
        }
        self.detached.store(true, Ordering::Release);
        if let Some(tx) = self.transaction.upgrade() {
            tx.pop_call_stack(self.id);
        }
    }

    pub fn set_deduct_from_parent(&self, deduct: bool) {
        self.deduct_from_parent.store(deduct, Ordering::Release);
    }

    pub fn deducts_from_parent(&self) -> bool {
        self.deduct_from_parent.load(Ordering::Acquire)
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let value = value.into();
        let mut attrs = self.attributes.lock().unwrap_or_else(PoisonError::into_inner);
        match attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => attrs.push((key, value)),
        }
    }

    pub fn attributes(&self) -> Vec<(String, AttributeValue)> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            id: self.id,
            parent_id: self.parent_id,
            name: self.kind.name(),
            kind: self.kind.clone(),
            start: self.start,
            end: self.end_time(),
            duration: self.duration(),
            exclusive: None,
            deducts_from_parent: self.deducts_from_parent(),
            detached: self.detached.load(Ordering::Acquire),
            attributes: self.attributes(),
        }
    }
}
