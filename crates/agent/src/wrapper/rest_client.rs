use std::sync::Arc;

use apmtx_core::error::{ApmError, Result};
use tracing::debug;
use url::Url;

use crate::agent::Agent;
use crate::completion::CompletionResult;
use crate::segment::Segment;
use crate::transaction::Transaction;
use crate::wrapper::delegates;
use crate::wrapper::{
    AfterCall, CanWrapResponse, InstrumentedMethodCall, InstrumentedMethodInfo, Wrapper,
};

pub const WRAPPER_NAME: &str = "rest_client::execute_task_async";

#[derive(Debug, Clone, Default)]
pub struct RestClient {
    pub base_url: Option<String>,
}

impl RestClient {
    /// Resolves `request.resource` against the base URL.
    pub fn build_uri(&self, request: &RestRequest) -> Result<Url> {
        match Url::parse(&request.resource) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_deref().ok_or_else(|| {
                    ApmError::InvalidArgument(format!(
                        "relative resource {:?} without a base url",
                        request.resource
                    ))
                })?;
                let base = Url::parse(base)
                    .map_err(|e| ApmError::InvalidArgument(format!("base url {base:?}: {e}")))?;
                base.join(&request.resource)
                    .map_err(|e| ApmError::InvalidArgument(e.to_string()))
            }
            Err(e) => Err(ApmError::InvalidArgument(format!(
                "resource {:?}: {e}",
                request.resource
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestRequest {
    pub resource: String,
    pub method: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RestResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
}

/// Instruments a REST client's task-based execute, selected by requested
/// wrapper name rather than by method identity.
#[derive(Debug, Default)]
pub struct ExecuteTaskAsync;

impl Wrapper for ExecuteTaskAsync {
    fn name(&self) -> &str {
        WRAPPER_NAME
    }

    fn can_wrap(&self, info: &InstrumentedMethodInfo) -> CanWrapResponse {
        (info.requested_wrapper_name.as_deref() == Some(WRAPPER_NAME)).into()
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

        let client = call.call.target::<RestClient>()?;
        let request = call.call.arguments.extract_not_null::<RestRequest>(0)?;
        let uri = match client.build_uri(request) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(error = %e, "rest call not instrumented");
                return Ok(AfterCall::no_op());
            }
        };

        let method = request.method.as_deref().unwrap_or("<unknown>");
        let segment = transaction.start_external_request_segment(&call.call, &uri, method);

        let agent = agent.clone();
        let transaction = transaction.clone();
        let inner = Arc::clone(&segment);
        Ok(delegates::for_completion::<RestResponse, _>(
            segment,
            move |completion| {
                inner.remove_from_call_stack();
                let held = transaction.hold();
                completion.on_complete(move |result| {
                    agent.handle_exceptions(|| try_process_response(&transaction, &inner, result));
                    delegates::end_and_release(&agent, &transaction, &inner, held);
                });
            },
        ))
    }
}

fn try_process_response(
    transaction: &Transaction,
    segment: &Segment,
    result: &CompletionResult<RestResponse>,
) -> Result<()> {
    let Ok(response) = result else {
        return Ok(());
    };
    segment.add_attribute("http.statusCode", response.status_code);
    transaction.process_inbound_response(&response.headers, segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::Method;

    fn request(resource: &str) -> RestRequest {
        RestRequest {
            resource: resource.to_string(),
            method: Some("POST".to_string()),
        }
    }

    #[test]
    fn builds_relative_resource_against_base() {
        let client = RestClient {
            base_url: Some("https://api.example.com/v2/".to_string()),
        };
        let uri = client.build_uri(&request("carts/9")).unwrap();
        assert_eq!(uri.as_str(), "https://api.example.com/v2/carts/9");
    }

    #[test]
    fn relative_resource_without_base_fails() {
        let client = RestClient::default();
        assert!(client.build_uri(&request("carts/9")).is_err());
    }

    #[test]
    fn selected_by_requested_name_only() {
        let method = Method::new("rest", "rest::RestClient", "execute_task_async");
        let mut info = InstrumentedMethodInfo {
            method,
            requested_wrapper_name: None,
            is_async: true,
        };
        assert!(!ExecuteTaskAsync.can_wrap(&info).can_wrap);
        info.requested_wrapper_name = Some(WRAPPER_NAME.to_string());
        assert!(ExecuteTaskAsync.can_wrap(&info).can_wrap);
    }
}
