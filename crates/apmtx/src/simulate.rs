use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use apmtx_agent::agent::{ExceptionSink, TransactionSink};
use apmtx_agent::wrapper::http_client::{self, HttpClient, HttpRequestMessage, HttpResponseMessage};
use apmtx_agent::wrapper::mongodb::{self, MongoCollection};
use apmtx_agent::wrapper::{
    InstrumentedMethodCall, InstrumentedMethodInfo, Method, MethodArguments, MethodCall, Value,
    WrapperRegistry,
};
use apmtx_agent::{Agent, Completion, FinishedTransaction};
use apmtx_core::config::AgentConfig;
use apmtx_core::error::ApmError;
use apmtx_core::model::error::ErrorData;
use apmtx_core::time::Clock;
use apmtx_wire::{ErrorTraceMaker, ErrorTraceWireModel};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SimulateOptions {
    pub completions: usize,
    pub delay_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub transaction: FinishedTransaction,
    pub error_traces: Vec<ErrorTraceWireModel>,
    pub suppressed_exceptions: usize,
}

struct ChannelSink(mpsc::UnboundedSender<Arc<FinishedTransaction>>);

impl TransactionSink for ChannelSink {
    fn accept(&self, finished: Arc<FinishedTransaction>) {
        let _ = self.0.send(finished);
    }
}

#[derive(Default)]
struct CountingExceptionSink(AtomicUsize);

impl ExceptionSink for CountingExceptionSink {
    fn report(&self, error: &ApmError) {
        warn!(error = %error, "instrumentation failure suppressed");
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// One transaction with a synchronous datastore call and `completions`
/// outbound HTTP sends whose responses arrive on runtime tasks after the
/// request has already ended.
pub async fn run(config: AgentConfig, opts: SimulateOptions) -> anyhow::Result<SimulationReport> {
    let (tx_finished, mut rx_finished) = mpsc::unbounded_channel();
    let exceptions = Arc::new(CountingExceptionSink::default());
    let agent = Agent::builder(config)
        .exception_sink(exceptions.clone())
        .transaction_sink(Arc::new(ChannelSink(tx_finished)))
        .build();
    let registry = WrapperRegistry::with_defaults();

    let transaction = agent.start_transaction("WebTransaction/simulate");
    transaction.metadata().update_request(|r| {
        r.uri = Some("/simulate".to_string());
        r.http_response_status_code = Some(200);
    });
    transaction
        .metadata()
        .add_request_parameter("completions", opts.completions.to_string());

    registry
        .before_call(&mongo_find("users"), &agent, Some(&transaction))
        .on_success(&());

    let mut tasks = Vec::with_capacity(opts.completions);
    for i in 0..opts.completions {
        let call = http_send(&format!("https://svc{i}.example.com/items/{i}"));
        let completion = Completion::<HttpResponseMessage>::new();
        registry
            .before_call(&call, &agent, Some(&transaction))
            .on_success(&completion);

        let writer = transaction.clone();
        let delay = Duration::from_millis(opts.delay_ms * (i as u64 % 3 + 1));
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            writer
                .metadata()
                .add_user_attribute(format!("completion.{i}"), i as i64);
            completion.complete(Ok(HttpResponseMessage {
                status_code: 200,
                headers: vec![("content-type".to_string(), vec!["application/json".to_string()])],
            }))
        }));
    }

    transaction.notice_error(
        ErrorData::new(agent.clock().now(), "SimulatedError", "simulated failure")
            .with_stack_trace(vec!["simulate::run".to_string(), "main".to_string()])
            .with_attribute("simulated", true),
    );
    if transaction.end().is_none() {
        info!(holds = transaction.hold_count(), "transaction ended; waiting for completions");
    }

    for joined in futures::future::join_all(tasks).await {
        joined.context("completion task failed")?;
    }

    let finished = tokio::time::timeout(FINALIZE_TIMEOUT, rx_finished.recv())
        .await
        .context("transaction did not finalize in time")?
        .context("transaction sink closed before finalize")?;

    let error_traces = ErrorTraceMaker::from_config(agent.config()).make_error_traces(&finished);
    Ok(SimulationReport {
        transaction: Arc::unwrap_or_clone(finished),
        error_traces,
        suppressed_exceptions: exceptions.0.load(Ordering::Relaxed),
    })
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

fn http_send(uri: &str) -> InstrumentedMethodCall {
    instrumented(
        Method::new(
            http_client::ASSEMBLY_NAME,
            http_client::TYPE_NAME,
            http_client::METHOD_NAME,
        ),
        None,
        true,
        Arc::new(HttpClient::default()),
        MethodArguments::default().push(HttpRequestMessage::new("GET", uri)),
    )
}

fn mongo_find(collection: &str) -> InstrumentedMethodCall {
    instrumented(
        Method::new("mongodb", "mongodb::Collection", "find"),
        Some(mongodb::WRAPPER_NAME),
        false,
        Arc::new(MongoCollection {
            name: collection.to_string(),
        }),
        MethodArguments::default().push_null(),
    )
}
