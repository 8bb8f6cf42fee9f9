use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::agent::Agent;
use crate::transaction::Transaction;
use crate::wrapper::{
    AfterCall, InstrumentedMethodCall, InstrumentedMethodInfo, Wrapper, couchbase, http_client,
    mongodb, rest_client,
};

struct Entry {
    priority: i32,
    wrapper: Arc<dyn Wrapper>,
}

/// Picks the wrapper for a call site and runs it behind the exception
/// boundary. Applicability is resolved once per distinct call site.
#[derive(Default)]
pub struct WrapperRegistry {
    entries: Vec<Entry>,
    resolved: Mutex<HashMap<InstrumentedMethodInfo, Option<usize>>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every shipped wrapper.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http_client::SendAsync::default()), 0);
        registry.register(Arc::new(rest_client::ExecuteTaskAsync), 0);
        registry.register(Arc::new(couchbase::QueryAsync::default()), 0);
        registry.register(Arc::new(mongodb::CollectionFind), 0);
        registry
    }

    /// Higher priority is consulted first; ties keep registration order.
    pub fn register(&mut self, wrapper: Arc<dyn Wrapper>, priority: i32) {
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, Entry { priority, wrapper });
        self.resolved
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, info: &InstrumentedMethodInfo) -> Option<Arc<dyn Wrapper>> {
        let mut cache = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cache.entry(info.clone()).or_insert_with(|| {
            let found = self.entries.iter().position(|e| {
                let response = e.wrapper.can_wrap(info);
                if let (false, Some(reason)) = (response.can_wrap, &response.additional_info) {
                    debug!(wrapper = e.wrapper.name(), method = %info.method, reason, "wrapper declined");
                }
                response.can_wrap
            });
            trace!(method = %info.method, wrapper = ?found.map(|i| self.entries[i].wrapper.name()), "call site resolved");
            found
        });
        index.map(|i| Arc::clone(&self.entries[i].wrapper))
    }

    /// Runs the matching wrapper's before-logic. Calls outside a transaction,
    /// calls no wrapper accepts, and wrapper failures all yield a no-op.
    pub fn before_call(
        &self,
        call: &InstrumentedMethodCall,
        agent: &Agent,
        transaction: Option<&Transaction>,
    ) -> AfterCall {
        let Some(transaction) = transaction else {
            return AfterCall::no_op();
        };
        let Some(wrapper) = self.resolve(&call.info) else {
            return AfterCall::no_op();
        };

        let mut after = AfterCall::no_op();
        agent.handle_exceptions(|| {
            after = wrapper.before_wrapped_method(call, agent, transaction)?;
            Ok(())
        });
        after.guarded(agent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use apmtx_core::config::AgentConfig;
    use apmtx_core::error::{ApmError, Result};

    use super::*;
    use crate::wrapper::{CanWrapResponse, Method, MethodArguments, MethodCall};

    struct Counting {
        name: &'static str,
        checks: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(name: &'static str, fail: bool) -> Self {
            Self {
                name,
                checks: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl Wrapper for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn can_wrap(&self, _info: &InstrumentedMethodInfo) -> CanWrapResponse {
            self.checks.fetch_add(1, Ordering::SeqCst);
            CanWrapResponse::yes()
        }

        fn before_wrapped_method(
            &self,
            _call: &InstrumentedMethodCall,
            _agent: &Agent,
            _transaction: &Transaction,
        ) -> Result<AfterCall> {
            if self.fail {
                return Err(ApmError::Instrumentation("missing argument".into()));
            }
            Ok(AfterCall::new(|_| {}, |_| {}))
        }
    }

    fn call() -> InstrumentedMethodCall {
        let method = Method::new("app", "app::Service", "run");
        InstrumentedMethodCall {
            info: InstrumentedMethodInfo {
                method: method.clone(),
                requested_wrapper_name: None,
                is_async: false,
            },
            call: MethodCall {
                method,
                invocation_target: None,
                arguments: MethodArguments::default(),
            },
        }
    }

    #[test]
    fn resolution_is_cached_per_call_site() {
        let wrapper = Arc::new(Counting::new("a", false));
        let mut registry = WrapperRegistry::new();
        registry.register(wrapper.clone(), 0);

        let info = call().info;
        assert!(registry.resolve(&info).is_some());
        assert!(registry.resolve(&info).is_some());
        assert_eq!(wrapper.checks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn higher_priority_wins() {
        let mut registry = WrapperRegistry::new();
        registry.register(Arc::new(Counting::new("low", false)), 0);
        registry.register(Arc::new(Counting::new("high", false)), 10);
        assert_eq!(registry.resolve(&call().info).unwrap().name(), "high");
    }

    #[test]
    fn no_transaction_means_no_op() {
        let agent = Agent::new(AgentConfig::default());
        let mut registry = WrapperRegistry::new();
        registry.register(Arc::new(Counting::new("a", false)), 0);
        assert!(registry.before_call(&call(), &agent, None).is_no_op());
    }

    #[test]
    fn wrapper_error_becomes_no_op() {
        let agent = Agent::new(AgentConfig::default());
        let tx = agent.start_transaction("t");
        let mut registry = WrapperRegistry::new();
        registry.register(Arc::new(Counting::new("a", true)), 0);
        assert!(registry.before_call(&call(), &agent, Some(&tx)).is_no_op());
    }

    #[test]
    fn defaults_decline_unknown_methods() {
        let registry = WrapperRegistry::with_defaults();
        assert_eq!(registry.len(), 4);
        assert!(registry.resolve(&call().info).is_none());
    }
}
