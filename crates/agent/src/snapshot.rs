use std::collections::HashMap;
use std::time::Duration;

use apmtx_core::ids::{SegmentId, TraceId, TransactionGuid};
use apmtx_core::model::attribute::AttributeValue;
use apmtx_core::time::elapsed;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metadata::ImmutableTransactionMetadata;
use crate::segment::SegmentKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSnapshot {
    pub id: SegmentId,
    pub parent_id: Option<SegmentId>,
    pub name: String,
    pub kind: SegmentKind,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub exclusive: Option<Duration>,
    pub deducts_from_parent: bool,
    pub detached: bool,
    pub attributes: Vec<(String, AttributeValue)>,
}

impl SegmentSnapshot {
    /// Whether this segment's time counts against its parent's exclusive time.
    fn attributable_to_parent(&self) -> bool {
        self.end.is_some() && (!self.detached || self.deducts_from_parent)
    }
}

/// Result of finalizing a transaction. Built once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedTransaction {
    pub guid: TransactionGuid,
    pub trace_id: TraceId,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attached_to_async: bool,
    pub segments: Vec<SegmentSnapshot>,
    pub metadata: ImmutableTransactionMetadata,
}

impl FinishedTransaction {
    pub fn duration(&self) -> Duration {
        elapsed(self.start, self.end)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&SegmentSnapshot> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn unfinished_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.end.is_none()).count()
    }
}

/// Fills in `exclusive` for every ended segment: its own duration minus the
/// union of its attributable children's intervals, floored at zero.
pub(crate) fn compute_exclusive_times(segments: &mut [SegmentSnapshot]) {
    let mut children: HashMap<SegmentId, Vec<(DateTime<Utc>, DateTime<Utc>)>> = HashMap::new();
    for child in segments.iter() {
        let (Some(parent), Some(end)) = (child.parent_id, child.end) else {
            continue;
        };
        if child.attributable_to_parent() {
            children.entry(parent).or_default().push((child.start, end));
        }
    }

    for segment in segments.iter_mut() {
        let Some(duration) = segment.duration else {
            continue;
        };
        let deducted = children
            .get_mut(&segment.id)
            .map(|intervals| union_length(intervals))
            .unwrap_or(Duration::ZERO);
        segment.exclusive = Some(duration.saturating_sub(deducted));
    }
}

fn union_length(intervals: &mut [(DateTime<Utc>, DateTime<Utc>)]) -> Duration {
    intervals.sort_by_key(|(start, _)| *start);

    let mut total = Duration::ZERO;
    let mut current: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for &(start, end) in intervals.iter() {
        current = match current {
            Some((cs, ce)) if start <= ce => Some((cs, ce.max(end))),
            Some((cs, ce)) => {
                total += elapsed(cs, ce);
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((cs, ce)) = current {
        total += elapsed(cs, ce);
    }
    total
}
