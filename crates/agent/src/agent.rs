use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use apmtx_core::config::AgentConfig;
use apmtx_core::error::{ApmError, Result};
use apmtx_core::time::{Clock, SystemClock};
use tracing::{debug, warn};

use crate::snapshot::FinishedTransaction;
use crate::transaction::Transaction;

/// Receives instrumentation failures so they never reach instrumented code.
pub trait ExceptionSink: Send + Sync {
    fn report(&self, error: &ApmError);
}

/// Downstream consumer of finalized transactions.
pub trait TransactionSink: Send + Sync {
    fn accept(&self, finished: Arc<FinishedTransaction>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionSink;

impl ExceptionSink for LoggingExceptionSink {
    fn report(&self, error: &ApmError) {
        warn!(error = %error, "instrumentation failure suppressed");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingTransactionSink;

impl TransactionSink for DiscardingTransactionSink {
    fn accept(&self, finished: Arc<FinishedTransaction>) {
        debug!(
            guid = %finished.guid,
            segments = finished.segments.len(),
            "finished transaction discarded"
        );
    }
}

struct AgentInner {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    exceptions: Arc<dyn ExceptionSink>,
    transactions: Arc<dyn TransactionSink>,
}

/// Runtime handle shared by wrappers and transactions.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

pub struct AgentBuilder {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    exceptions: Arc<dyn ExceptionSink>,
    transactions: Arc<dyn TransactionSink>,
}

impl AgentBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn exception_sink(mut self, sink: Arc<dyn ExceptionSink>) -> Self {
        self.exceptions = sink;
        self
    }

    pub fn transaction_sink(mut self, sink: Arc<dyn TransactionSink>) -> Self {
        self.transactions = sink;
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            inner: Arc::new(AgentInner {
                config: self.config,
                clock: self.clock,
                exceptions: self.exceptions,
                transactions: self.transactions,
            }),
        }
    }
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            clock: Arc::new(SystemClock),
            exceptions: Arc::new(LoggingExceptionSink),
            transactions: Arc::new(DiscardingTransactionSink),
        }
    }

    pub fn new(config: AgentConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Opens a transaction for one logical request. Deciding when a request
    /// starts and ends belongs to the caller.
    pub fn start_transaction(&self, name: impl Into<String>) -> Transaction {
        Transaction::new(self.clone(), name.into())
    }

    pub fn handle_wrapper_exception(&self, error: &ApmError) {
        self.inner.exceptions.report(error);
    }

    /// Runs `f`, reporting both errors and panics to the exception sink.
    pub fn handle_exceptions<F>(&self, f: F)
    where
        F: FnOnce() -> Result<()>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.handle_wrapper_exception(&e),
            Err(payload) => {
                let error = ApmError::Internal(format!(
                    "instrumentation panicked: {}",
                    panic_message(payload.as_ref())
                ));
                self.handle_wrapper_exception(&error);
            }
        }
    }

    pub(crate) fn deliver(&self, finished: Arc<FinishedTransaction>) {
        self.inner.transactions.accept(finished);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl ExceptionSink for Recording {
        fn report(&self, error: &ApmError) {
            self.0.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn handle_exceptions_reports_errors_and_panics() {
        let sink = Arc::new(Recording::default());
        let agent = Agent::builder(AgentConfig::default())
            .exception_sink(sink.clone())
            .build();

        agent.handle_exceptions(|| Ok(()));
        agent.handle_exceptions(|| Err(ApmError::Instrumentation("bad header".into())));
        agent.handle_exceptions(|| panic!("boom"));

        let reported = sink.0.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0], "instrumentation error: bad header");
        assert!(reported[1].contains("boom"));
    }
}
