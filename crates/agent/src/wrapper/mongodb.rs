use apmtx_core::error::Result;

use crate::agent::Agent;
use crate::segment::DatastoreVendor;
use crate::transaction::Transaction;
use crate::wrapper::delegates;
use crate::wrapper::{
    AfterCall, CanWrapResponse, InstrumentedMethodCall, InstrumentedMethodInfo, MethodArguments,
    Wrapper,
};

pub const WRAPPER_NAME: &str = "mongodb::collection_find";

#[derive(Debug, Clone)]
pub struct MongoCollection {
    pub name: String,
}

/// Marker argument selecting the single-document overload.
#[derive(Debug, Clone, Default)]
pub struct FindOneArgs {
    pub filter: Option<String>,
}

/// Instruments synchronous collection finds.
#[derive(Debug, Default)]
pub struct CollectionFind;

impl Wrapper for CollectionFind {
    fn name(&self) -> &str {
        WRAPPER_NAME
    }

    fn can_wrap(&self, info: &InstrumentedMethodInfo) -> CanWrapResponse {
        (info.requested_wrapper_name.as_deref() == Some(WRAPPER_NAME)).into()
    }

    fn before_wrapped_method(
        &self,
        call: &InstrumentedMethodCall,
        _agent: &Agent,
        transaction: &Transaction,
    ) -> Result<AfterCall> {
        let collection = call.call.target::<MongoCollection>()?;
        let segment = transaction.start_datastore_segment(
            &call.call,
            DatastoreVendor::MongoDb,
            collection.name.clone(),
            find_operation(&call.call.arguments),
            None,
        );
        Ok(delegates::for_segment(segment))
    }
}

/// `Find` with no arguments, `FindAll` for a null filter, `FindOne` for the
/// single-document overload.
pub fn find_operation(args: &MethodArguments) -> &'static str {
    if args.is_empty() {
        "Find"
    } else if args.is_null(0) {
        "FindAll"
    } else if args.extract::<FindOneArgs>(0).is_some() {
        "FindOne"
    } else {
        "Find"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apmtx_core::config::AgentConfig;

    use super::*;
    use crate::wrapper::{Method, MethodCall};

    #[test]
    fn operation_from_first_argument() {
        assert_eq!(find_operation(&MethodArguments::default()), "Find");
        assert_eq!(find_operation(&MethodArguments::default().push_null()), "FindAll");
        assert_eq!(
            find_operation(&MethodArguments::default().push(FindOneArgs::default())),
            "FindOne"
        );
        assert_eq!(
            find_operation(&MethodArguments::default().push("{\"age\":3}".to_string())),
            "Find"
        );
    }

    #[test]
    fn segment_ends_when_call_returns() {
        let agent = Agent::new(AgentConfig::default());
        let tx = agent.start_transaction("t");
        let method = Method::new("mongodb", "mongodb::Collection", "find");
        let call = InstrumentedMethodCall {
            info: InstrumentedMethodInfo {
                method: method.clone(),
                requested_wrapper_name: Some(WRAPPER_NAME.to_string()),
                is_async: false,
            },
            call: MethodCall {
                method,
                invocation_target: Some(Arc::new(MongoCollection {
                    name: "users".to_string(),
                })),
                arguments: MethodArguments::default().push_null(),
            },
        };

        let after = CollectionFind.before_wrapped_method(&call, &agent, &tx).unwrap();
        assert_eq!(tx.current_segment_id().map(|id| id.get()), Some(1));
        after.on_success(&());

        let finished = tx.end().unwrap();
        assert_eq!(finished.segments[0].name, "Datastore/statement/MongoDB/users/FindAll");
        assert!(finished.segments[0].end.is_some());
        assert!(!finished.attached_to_async);
    }
}
