use std::sync::{Arc, Mutex};

use apmtx_agent::agent::{ExceptionSink, TransactionSink};
use apmtx_agent::wrapper::couchbase::{self, CouchbaseBucket, QueryRequest};
use apmtx_agent::wrapper::http_client::{self, HttpClient, HttpRequestMessage};
use apmtx_agent::wrapper::mongodb::{self, MongoCollection};
use apmtx_agent::wrapper::rest_client::{self, RestClient, RestRequest};
use apmtx_agent::wrapper::{
    InstrumentedMethodCall, InstrumentedMethodInfo, Method, MethodArguments, MethodCall, Value,
};
use apmtx_agent::{Agent, FinishedTransaction};
use apmtx_core::config::AgentConfig;
use apmtx_core::error::ApmError;
use apmtx_core::time::ManualClock;
use chrono::{TimeZone, Utc};

/// Fixed instant all fixture clocks start from.
pub fn base_millis() -> i64 {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

#[derive(Default)]
pub struct RecordingExceptionSink {
    errors: Mutex<Vec<String>>,
}

impl RecordingExceptionSink {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ExceptionSink for RecordingExceptionSink {
    fn report(&self, error: &ApmError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

#[derive(Default)]
pub struct CollectingTransactionSink {
    finished: Mutex<Vec<Arc<FinishedTransaction>>>,
}

impl CollectingTransactionSink {
    pub fn finished(&self) -> Vec<Arc<FinishedTransaction>> {
        self.finished.lock().unwrap().clone()
    }
}

impl TransactionSink for CollectingTransactionSink {
    fn accept(&self, finished: Arc<FinishedTransaction>) {
        self.finished.lock().unwrap().push(finished);
    }
}

/// Agent on a manual clock with recording sinks.
pub struct Harness {
    pub agent: Agent,
    pub clock: Arc<ManualClock>,
    pub exceptions: Arc<RecordingExceptionSink>,
    pub transactions: Arc<CollectingTransactionSink>,
}

pub fn harness(config: AgentConfig) -> Harness {
    let clock = Arc::new(ManualClock::at_epoch_millis(base_millis()).unwrap());
    let exceptions = Arc::new(RecordingExceptionSink::default());
    let transactions = Arc::new(CollectingTransactionSink::default());
    let agent = Agent::builder(config)
        .clock(clock.clone())
        .exception_sink(exceptions.clone())
        .transaction_sink(transactions.clone())
        .build();
    Harness {
        agent,
        clock,
        exceptions,
        transactions,
    }
}

fn instrumented(
    method: Method,
    requested_wrapper_name: Option<&str>,
    is_async: bool,
    target: Arc<Value>,
    arguments: MethodArguments,
) -> InstrumentedMethodCall {
    InstrumentedMethodCall {
        info: InstrumentedMethodInfo {
            method: method.clone(),
            requested_wrapper_name: requested_wrapper_name.map(str::to_string),
            is_async,
        },
        call: MethodCall {
            method,
            invocation_target: Some(target),
            arguments,
        },
    }
}

/// `send_async` call. The request is returned so tests can inspect the
/// headers the wrapper attached.
pub fn http_send(
    base_address: Option<&str>,
    request: HttpRequestMessage,
) -> (InstrumentedMethodCall, Arc<HttpRequestMessage>) {
    let request = Arc::new(request);
    let shared: Arc<Value> = request.clone();
    let method = Method::new(
        http_client::ASSEMBLY_NAME,
        http_client::TYPE_NAME,
        http_client::METHOD_NAME,
    )
    .with_parameter_types(["HttpRequestMessage"]);
    let call = instrumented(
        method,
        None,
        true,
        Arc::new(HttpClient {
            base_address: base_address.map(str::to_string),
        }),
        MethodArguments::default().push_shared(shared),
    );
    (call, request)
}

pub fn rest_execute(base_url: Option<&str>, resource: &str, method: &str) -> InstrumentedMethodCall {
    instrumented(
        Method::new("rest", "rest::RestClient", "execute_task_async"),
        Some(rest_client::WRAPPER_NAME),
        true,
        Arc::new(RestClient {
            base_url: base_url.map(str::to_string),
        }),
        MethodArguments::default().push(RestRequest {
            resource: resource.to_string(),
            method: Some(method.to_string()),
        }),
    )
}

pub fn couchbase_query(bucket: &str, statement: &str) -> InstrumentedMethodCall {
    instrumented(
        Method::new(
            couchbase::ASSEMBLY_NAME,
            couchbase::TYPE_NAME,
            couchbase::METHOD_NAME,
        ),
        None,
        true,
        Arc::new(CouchbaseBucket {
            name: bucket.to_string(),
        }),
        MethodArguments::default().push(QueryRequest {
            statement: statement.to_string(),
        }),
    )
}

pub fn mongo_find(collection: &str, arguments: MethodArguments) -> InstrumentedMethodCall {
    instrumented(
        Method::new("mongodb", "mongodb::Collection", "find"),
        Some(mongodb::WRAPPER_NAME),
        false,
        Arc::new(MongoCollection {
            name: collection.to_string(),
        }),
        arguments,
    )
}
