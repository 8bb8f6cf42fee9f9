use apmtx_core::error::{ApmError, Result};

use crate::agent::Agent;
use crate::segment::DatastoreVendor;
use crate::transaction::Transaction;
use crate::wrapper::delegates;
use crate::wrapper::{
    AfterCall, CanWrapResponse, InstrumentedMethodCall, InstrumentedMethodInfo, MethodMatcher,
    Wrapper,
};

pub const ASSEMBLY_NAME: &str = "couchbase";
pub const TYPE_NAME: &str = "couchbase::Bucket";
pub const METHOD_NAME: &str = "query_async";

#[derive(Debug, Clone)]
pub struct CouchbaseBucket {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub statement: String,
}

#[derive(Debug, Clone, Default)]
pub struct CouchbaseQueryResult {
    pub rows: Vec<String>,
}

/// Instruments N1QL queries issued through a bucket.
pub struct QueryAsync {
    matcher: MethodMatcher,
}

impl Default for QueryAsync {
    fn default() -> Self {
        Self {
            matcher: MethodMatcher::new(ASSEMBLY_NAME, TYPE_NAME, &[METHOD_NAME]),
        }
    }
}

impl Wrapper for QueryAsync {
    fn name(&self) -> &str {
        "couchbase::query_async"
    }

    fn can_wrap(&self, info: &InstrumentedMethodInfo) -> CanWrapResponse {
        self.matcher.matches(&info.method).into()
    }

    fn before_wrapped_method(
        &self,
        call: &InstrumentedMethodCall,
        agent: &Agent,
        transaction: &Transaction,
    ) -> Result<AfterCall> {
        if call.is_async() {
            transaction.attach_to_async();
        }

        let bucket = call.call.target::<CouchbaseBucket>()?;
        let statement = query_statement(call)?;
        let segment = transaction.start_datastore_segment(
            &call.call,
            DatastoreVendor::Couchbase,
            bucket.name.clone(),
            call.call.method.method_name.as_str(),
            Some(statement),
        );
        Ok(delegates::for_async_segment::<CouchbaseQueryResult>(
            agent,
            transaction,
            segment,
        ))
    }
}

/// Statement text from either a raw string or a `QueryRequest`.
fn query_statement(call: &InstrumentedMethodCall) -> Result<String> {
    let args = &call.call.arguments;
    if let Some(statement) = args.extract::<String>(0) {
        return Ok(statement.clone());
    }
    if let Some(request) = args.extract::<QueryRequest>(0) {
        return Ok(request.statement.clone());
    }
    Err(ApmError::Instrumentation(format!(
        "{} expects a statement or QueryRequest",
        call.call.method
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apmtx_core::config::AgentConfig;

    use super::*;
    use crate::completion::Completion;
    use crate::segment::SegmentKind;
    use crate::wrapper::{Method, MethodArguments, MethodCall};

    fn call(arg: MethodArguments) -> InstrumentedMethodCall {
        let method = Method::new(ASSEMBLY_NAME, TYPE_NAME, METHOD_NAME);
        InstrumentedMethodCall {
            info: InstrumentedMethodInfo {
                method: method.clone(),
                requested_wrapper_name: None,
                is_async: true,
            },
            call: MethodCall {
                method,
                invocation_target: Some(Arc::new(CouchbaseBucket {
                    name: "travel-sample".to_string(),
                })),
                arguments: arg,
            },
        }
    }

    #[test]
    fn records_statement_from_request() {
        let agent = Agent::new(AgentConfig::default());
        let tx = agent.start_transaction("t");
        let request = QueryRequest {
            statement: "SELECT * FROM `travel-sample`".to_string(),
        };
        let after = QueryAsync::default()
            .before_wrapped_method(&call(MethodArguments::default().push(request)), &agent, &tx)
            .unwrap();

        let completion = Completion::<CouchbaseQueryResult>::new();
        after.on_success(&completion);
        assert_eq!(tx.hold_count(), 1);
        completion.complete(Ok(CouchbaseQueryResult::default()));

        let finished = tx.end().unwrap();
        let segment = &finished.segments[0];
        assert_eq!(segment.name, "Datastore/statement/Couchbase/travel-sample/query_async");
        let SegmentKind::Datastore(data) = &segment.kind else {
            panic!("expected datastore segment");
        };
        assert_eq!(data.command_text.as_deref(), Some("SELECT * FROM `travel-sample`"));
    }

    #[test]
    fn operation_follows_called_method() {
        let agent = Agent::new(AgentConfig::default());
        let tx = agent.start_transaction("t");
        let mut call = call(MethodArguments::default().push("SELECT 1".to_string()));
        call.call.method.method_name = "analytics_query_async".to_string();

        QueryAsync::default()
            .before_wrapped_method(&call, &agent, &tx)
            .unwrap()
            .on_success(&Completion::<CouchbaseQueryResult>::resolved(Ok(
                CouchbaseQueryResult::default(),
            )));

        let finished = tx.end().unwrap();
        assert_eq!(
            finished.segments[0].name,
            "Datastore/statement/Couchbase/travel-sample/analytics_query_async"
        );
    }

    #[test]
    fn missing_statement_is_an_error() {
        let agent = Agent::new(AgentConfig::default());
        let tx = agent.start_transaction("t");
        let result = QueryAsync::default().before_wrapped_method(
            &call(MethodArguments::default().push(7_u32)),
            &agent,
            &tx,
        );
        assert!(result.is_err());
        assert_eq!(tx.segment_count(), 0);
    }
}
