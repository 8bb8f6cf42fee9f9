use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use apmtx_core::model::attribute::AttributeValue;
use apmtx_core::model::error::ErrorData;
use serde::{Deserialize, Serialize};

/// Caps the alternate path hashes kept for cross-application tracing.
const MAX_ALTERNATE_PATH_HASHES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub uri: Option<String>,
    pub original_uri: Option<String>,
    pub referrer_uri: Option<String>,
    pub queue_time: Option<Duration>,
    pub http_response_status_code: Option<u16>,
    pub http_response_sub_status_code: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossApplicationData {
    pub referrer_path_hash: Option<String>,
    pub path_hash: Option<String>,
    pub alternate_path_hashes: Vec<String>,
    pub referrer_transaction_guid: Option<String>,
    pub referrer_process_id: Option<String>,
    pub referrer_trip_id: Option<String>,
    pub response_time_secs: f32,
}

impl CrossApplicationData {
    /// Records a path hash once; hashes beyond the cap are dropped.
    pub fn add_alternate_path_hash(&mut self, hash: impl Into<String>) {
        let hash = hash.into();
        if self.alternate_path_hashes.contains(&hash)
            || self.alternate_path_hashes.len() >= MAX_ALTERNATE_PATH_HASHES
        {
            return;
        }
        self.alternate_path_hashes.push(hash);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributedTraceData {
    pub parent_type: Option<String>,
    pub app_id: Option<String>,
    pub account_id: Option<String>,
    pub transport_type: Option<String>,
    pub guid: Option<String>,
    pub transport_duration: Duration,
    pub trace_id: Option<String>,
    pub trust_key: Option<String>,
    pub transaction_id: Option<String>,
    pub sampled: Option<bool>,
    pub has_incoming_payload: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntheticsData {
    pub resource_id: Option<String>,
    pub job_id: Option<String>,
    pub monitor_id: Option<String>,
}

impl SyntheticsData {
    pub fn is_synthetics(&self) -> bool {
        self.resource_id.is_some()
    }
}

/// Mutable per-transaction accumulator. Many threads write into it while the
/// request runs; `snapshot` copies it out once at finalize.
#[derive(Debug, Default)]
pub struct TransactionMetadata {
    request: Mutex<RequestData>,
    request_parameters: Mutex<Vec<(String, String)>>,
    user_attributes: Mutex<BTreeMap<String, AttributeValue>>,
    user_error_attributes: Mutex<BTreeMap<String, AttributeValue>>,
    transaction_exceptions: Mutex<Vec<ErrorData>>,
    custom_errors: Mutex<Vec<ErrorData>>,
    cross_application: Mutex<CrossApplicationData>,
    distributed_trace: Mutex<DistributedTraceData>,
    synthetics: Mutex<SyntheticsData>,
    priority: Mutex<f32>,
    has_outgoing_distributed_trace_payload: AtomicBool,
    has_cat_response_headers: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransactionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request parameter. Re-adding a key replaces its value in place.
    pub fn add_request_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut params = lock(&self.request_parameters);
        match params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => params.push((key, value)),
        }
    }

    pub fn add_user_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        lock(&self.user_attributes).insert(key.into(), value.into());
    }

    pub fn add_user_error_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        lock(&self.user_error_attributes).insert(key.into(), value.into());
    }

    pub fn add_transaction_exception(&self, error: ErrorData) {
        lock(&self.transaction_exceptions).push(error);
    }

    pub fn add_custom_error(&self, error: ErrorData) {
        lock(&self.custom_errors).push(error);
    }

    pub fn update_request(&self, f: impl FnOnce(&mut RequestData)) {
        f(&mut lock(&self.request));
    }

    pub fn update_cross_application(&self, f: impl FnOnce(&mut CrossApplicationData)) {
        f(&mut lock(&self.cross_application));
    }

    pub fn update_distributed_trace(&self, f: impl FnOnce(&mut DistributedTraceData)) {
        f(&mut lock(&self.distributed_trace));
    }

    pub fn update_synthetics(&self, f: impl FnOnce(&mut SyntheticsData)) {
        f(&mut lock(&self.synthetics));
    }

    pub fn set_priority(&self, priority: f32) {
        *lock(&self.priority) = priority;
    }

    pub fn priority(&self) -> f32 {
        *lock(&self.priority)
    }

    pub fn sampled(&self) -> Option<bool> {
        lock(&self.distributed_trace).sampled
    }

    pub fn mark_outgoing_distributed_trace_payload(&self) {
        self.has_outgoing_distributed_trace_payload
            .store(true, Ordering::Release);
    }

    pub fn mark_cat_response_headers(&self) {
        self.has_cat_response_headers.store(true, Ordering::Release);
    }

    /// Copies the accumulated state out. Each structure is read under its own
    /// lock, so every entry is either fully present or absent.
    pub fn snapshot(&self) -> ImmutableTransactionMetadata {
        ImmutableTransactionMetadata {
            request: lock(&self.request).clone(),
            request_parameters: lock(&self.request_parameters).clone(),
            user_attributes: to_pairs(&lock(&self.user_attributes)),
            user_error_attributes: to_pairs(&lock(&self.user_error_attributes)),
            transaction_exceptions: lock(&self.transaction_exceptions).clone(),
            custom_errors: lock(&self.custom_errors).clone(),
            cross_application: lock(&self.cross_application).clone(),
            distributed_trace: lock(&self.distributed_trace).clone(),
            has_outgoing_distributed_trace_payload: self
                .has_outgoing_distributed_trace_payload
                .load(Ordering::Acquire),
            synthetics: lock(&self.synthetics).clone(),
            has_cat_response_headers: self.has_cat_response_headers.load(Ordering::Acquire),
            priority: *lock(&self.priority),
        }
    }
}

fn to_pairs(map: &BTreeMap<String, AttributeValue>) -> Vec<(String, AttributeValue)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Point-in-time copy of everything a transaction accumulated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImmutableTransactionMetadata {
    request: RequestData,
    request_parameters: Vec<(String, String)>,
    user_attributes: Vec<(String, AttributeValue)>,
    user_error_attributes: Vec<(String, AttributeValue)>,
    transaction_exceptions: Vec<ErrorData>,
    custom_errors: Vec<ErrorData>,
    cross_application: CrossApplicationData,
    distributed_trace: DistributedTraceData,
    has_outgoing_distributed_trace_payload: bool,
    synthetics: SyntheticsData,
    has_cat_response_headers: bool,
    priority: f32,
}

impl ImmutableTransactionMetadata {
    pub fn request(&self) -> &RequestData {
        &self.request
    }

    /// In insertion order.
    pub fn request_parameters(&self) -> &[(String, String)] {
        &self.request_parameters
    }

    pub fn user_attributes(&self) -> &[(String, AttributeValue)] {
        &self.user_attributes
    }

    pub fn user_error_attributes(&self) -> &[(String, AttributeValue)] {
        &self.user_error_attributes
    }

    pub fn transaction_exceptions(&self) -> &[ErrorData] {
        &self.transaction_exceptions
    }

    pub fn custom_errors(&self) -> &[ErrorData] {
        &self.custom_errors
    }

    pub fn cross_application(&self) -> &CrossApplicationData {
        &self.cross_application
    }

    pub fn distributed_trace(&self) -> &DistributedTraceData {
        &self.distributed_trace
    }

    pub fn has_outgoing_distributed_trace_payload(&self) -> bool {
        self.has_outgoing_distributed_trace_payload
    }

    pub fn synthetics(&self) -> &SyntheticsData {
        &self.synthetics
    }

    pub fn is_synthetics(&self) -> bool {
        self.synthetics.is_synthetics()
    }

    pub fn has_cat_response_headers(&self) -> bool {
        self.has_cat_response_headers
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn user_attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.user_attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}
