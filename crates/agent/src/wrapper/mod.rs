//! Wrapper contract: the applicability check and the before/after logic the
//! interception host runs around each instrumented call.

pub mod couchbase;
pub mod delegates;
pub mod http_client;
pub mod mongodb;
pub mod registry;
pub mod rest_client;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use apmtx_core::error::{ApmError, Result};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::completion::CallFailure;
use crate::transaction::Transaction;

pub use registry::WrapperRegistry;

pub type Value = dyn Any + Send + Sync;

/// Identity of an instrumentable method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    pub assembly_name: String,
    pub type_name: String,
    pub method_name: String,
    pub parameter_type_names: Vec<String>,
}

impl Method {
    pub fn new(
        assembly_name: impl Into<String>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            assembly_name: assembly_name.into(),
            type_name: type_name.into(),
            method_name: method_name.into(),
            parameter_type_names: Vec::new(),
        }
    }

    pub fn with_parameter_types<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_type_names = names.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]{}::{}",
            self.assembly_name, self.type_name, self.method_name
        )
    }
}

/// Exact assembly/type/method matcher. Any component differing rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMatcher {
    assembly_name: String,
    type_name: String,
    method_names: Vec<String>,
}

impl MethodMatcher {
    pub fn new(assembly_name: &str, type_name: &str, method_names: &[&str]) -> Self {
        Self {
            assembly_name: assembly_name.to_string(),
            type_name: type_name.to_string(),
            method_names: method_names.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn matches(&self, method: &Method) -> bool {
        method.assembly_name == self.assembly_name
            && method.type_name == self.type_name
            && self.method_names.iter().any(|m| *m == method.method_name)
    }
}

/// Positional arguments of an intercepted call. `None` entries are nulls.
#[derive(Clone, Default)]
pub struct MethodArguments(Vec<Option<Arc<Value>>>);

impl fmt::Debug for MethodArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodArguments")
            .field("len", &self.0.len())
            .finish()
    }
}

impl MethodArguments {
    pub fn new(args: Vec<Option<Arc<Value>>>) -> Self {
        Self(args)
    }

    pub fn push<T: Any + Send + Sync>(mut self, value: T) -> Self {
        let value: Arc<Value> = Arc::new(value);
        self.0.push(Some(value));
        self
    }

    pub fn push_shared(mut self, value: Arc<Value>) -> Self {
        self.0.push(Some(value));
        self
    }

    pub fn push_null(mut self) -> Self {
        self.0.push(None);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` when the argument exists and is null.
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.0.get(index), Some(None))
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index).and_then(|a| a.as_deref())
    }

    pub fn extract<T: Any>(&self, index: usize) -> Option<&T> {
        self.get(index).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn extract_not_null<T: Any>(&self, index: usize) -> Result<&T> {
        self.extract(index).ok_or_else(|| {
            ApmError::Instrumentation(format!(
                "argument {index} is missing or not a {}",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// One concrete invocation: target, arguments and method identity.
#[derive(Clone)]
pub struct MethodCall {
    pub method: Method,
    pub invocation_target: Option<Arc<Value>>,
    pub arguments: MethodArguments,
}

impl fmt::Debug for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCall")
            .field("method", &self.method)
            .field("has_target", &self.invocation_target.is_some())
            .field("arguments", &self.arguments)
            .finish()
    }
}

impl MethodCall {
    pub fn target<T: Any>(&self) -> Result<&T> {
        self.invocation_target
            .as_deref()
            .and_then(|t| t.downcast_ref::<T>())
            .ok_or_else(|| {
                ApmError::Instrumentation(format!(
                    "invocation target of {} is not a {}",
                    self.method,
                    std::any::type_name::<T>()
                ))
            })
    }
}

/// What the host knows about a call site before any call happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentedMethodInfo {
    pub method: Method,
    pub requested_wrapper_name: Option<String>,
    pub is_async: bool,
}

#[derive(Debug, Clone)]
pub struct InstrumentedMethodCall {
    pub info: InstrumentedMethodInfo,
    pub call: MethodCall,
}

impl InstrumentedMethodCall {
    pub fn is_async(&self) -> bool {
        self.info.is_async
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanWrapResponse {
    pub can_wrap: bool,
    pub additional_info: Option<String>,
}

impl CanWrapResponse {
    pub fn yes() -> Self {
        Self {
            can_wrap: true,
            additional_info: None,
        }
    }

    pub fn no() -> Self {
        Self {
            can_wrap: false,
            additional_info: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }
}

impl From<bool> for CanWrapResponse {
    fn from(can_wrap: bool) -> Self {
        if can_wrap { Self::yes() } else { Self::no() }
    }
}

type SuccessFn = Box<dyn FnOnce(&Value) + Send>;
type FailureFn = Box<dyn FnOnce(&CallFailure) + Send>;

/// Continuation returned by `before_wrapped_method`. Consumed by exactly one
/// of `on_success` / `on_failure`.
#[derive(Default)]
pub struct AfterCall {
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
}

impl fmt::Debug for AfterCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterCall")
            .field("no_op", &self.is_no_op())
            .finish()
    }
}

impl AfterCall {
    pub fn no_op() -> Self {
        Self::default()
    }

    pub fn new<S, F>(on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(&Value) + Send + 'static,
        F: FnOnce(&CallFailure) + Send + 'static,
    {
        Self {
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.on_success.is_none() && self.on_failure.is_none()
    }

    pub fn on_success(self, value: &Value) {
        if let Some(f) = self.on_success {
            f(value);
        }
    }

    pub fn on_failure(self, failure: &CallFailure) {
        if let Some(f) = self.on_failure {
            f(failure);
        }
    }

    pub fn complete(self, outcome: std::result::Result<&Value, &CallFailure>) {
        match outcome {
            Ok(value) => self.on_success(value),
            Err(failure) => self.on_failure(failure),
        }
    }

    /// Runs both paths inside the agent's exception boundary.
    pub fn guarded(self, agent: &Agent) -> Self {
        let on_success = self.on_success.map(|f| {
            let agent = agent.clone();
            Box::new(move |value: &Value| {
                agent.handle_exceptions(|| {
                    f(value);
                    Ok(())
                })
            }) as SuccessFn
        });
        let on_failure = self.on_failure.map(|f| {
            let agent = agent.clone();
            Box::new(move |failure: &CallFailure| {
                agent.handle_exceptions(|| {
                    f(failure);
                    Ok(())
                })
            }) as FailureFn
        });
        Self {
            on_success,
            on_failure,
        }
    }
}

/// Instrumentation for one family of call sites.
pub trait Wrapper: Send + Sync {
    fn name(&self) -> &str;

    /// Pure and cacheable per call site.
    fn can_wrap(&self, info: &InstrumentedMethodInfo) -> CanWrapResponse;

    /// Starts instrumentation for one call. `Ok(AfterCall::no_op())` skips the
    /// call silently; `Err` is reported and also results in a no-op.
    fn before_wrapped_method(
        &self,
        call: &InstrumentedMethodCall,
        agent: &Agent,
        transaction: &Transaction,
    ) -> Result<AfterCall>;
}
