use std::sync::{Arc, Mutex, PoisonError};

use apmtx_core::error::Result;
use url::Url;

use crate::agent::Agent;
use crate::completion::CompletionResult;
use crate::segment::Segment;
use crate::transaction::Transaction;
use crate::wrapper::delegates;
use crate::wrapper::{
    AfterCall, CanWrapResponse, InstrumentedMethodCall, InstrumentedMethodInfo, MethodMatcher,
    Wrapper,
};

pub const ASSEMBLY_NAME: &str = "net-http";
pub const TYPE_NAME: &str = "net_http::HttpClient";
pub const METHOD_NAME: &str = "send_async";

/// Client object the instrumented `send_async` is invoked on.
#[derive(Debug, Clone, Default)]
pub struct HttpClient {
    pub base_address: Option<String>,
}

/// First argument of `send_async`. Headers are shared with the caller so the
/// wrapper can attach trace headers before the request leaves.
#[derive(Debug, Default)]
pub struct HttpRequestMessage {
    pub request_uri: Option<String>,
    pub method: Option<String>,
    headers: Mutex<Vec<(String, String)>>,
}

impl HttpRequestMessage {
    pub fn new(method: impl Into<String>, request_uri: impl Into<String>) -> Self {
        Self {
            request_uri: Some(request_uri.into()),
            method: Some(method.into()),
            headers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_request_uri(mut self, request_uri: impl Into<String>) -> Self {
        self.request_uri = Some(request_uri.into());
        self
    }

    /// Replaces any existing value for `name`.
    pub fn set_header(&self, name: &str, value: &str) {
        let mut headers = self.headers.lock().unwrap_or_else(PoisonError::into_inner);
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        headers.push((name.to_string(), value.to_string()));
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponseMessage {
    pub status_code: u16,
    pub headers: Vec<(String, Vec<String>)>,
}

/// Instruments `HttpClient::send_async` as an external request.
pub struct SendAsync {
    matcher: MethodMatcher,
}

impl Default for SendAsync {
    fn default() -> Self {
        Self {
            matcher: MethodMatcher::new(ASSEMBLY_NAME, TYPE_NAME, &[METHOD_NAME]),
        }
    }
}

impl Wrapper for SendAsync {
    fn name(&self) -> &str {
        "http_client::send_async"
    }

    fn can_wrap(&self, info: &InstrumentedMethodInfo) -> CanWrapResponse {
        if !self.matcher.matches(&info.method) {
            return CanWrapResponse::no();
        }
        if !info.is_async {
            return CanWrapResponse::no().with_info("send_async must be instrumented as async");
        }
        CanWrapResponse::yes()
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

        let request = call.call.arguments.extract_not_null::<HttpRequestMessage>(0)?;
        let client = call.call.target::<HttpClient>()?;
        let Some(uri) = try_get_absolute_uri(request, client) else {
            // The send itself will fail on a missing URI; nothing to time.
            return Ok(AfterCall::no_op());
        };

        let method = request.method.as_deref().unwrap_or("<unknown>");
        let segment = transaction.start_external_request_segment(&call.call, &uri, method);

        if agent.config().force_synchronous_timing_http_client {
            segment.set_deduct_from_parent(true);
        }

        for (name, value) in transaction.outbound_request_headers(&segment) {
            request.set_header(&name, &value);
        }

        let agent = agent.clone();
        let transaction = transaction.clone();
        let inner = Arc::clone(&segment);
        Ok(delegates::for_completion::<HttpResponseMessage, _>(
            segment,
            move |completion| {
                inner.remove_from_call_stack();
                // Completes on a background thread, possibly racing the end of
                // the transaction.
                let held = transaction.hold();
                completion.on_complete(move |result| {
                    agent.handle_exceptions(|| try_process_response(&transaction, &inner, result));
                    delegates::end_and_release(&agent, &transaction, &inner, held);
                });
            },
        ))
    }
}

/// Absolute request URI, else relative URI against an absolute base address,
/// else the base address alone.
pub fn try_get_absolute_uri(request: &HttpRequestMessage, client: &HttpClient) -> Option<Url> {
    let base = client
        .base_address
        .as_deref()
        .and_then(|b| Url::parse(b).ok());

    match request.request_uri.as_deref() {
        Some(raw) => match Url::parse(raw) {
            Ok(absolute) => Some(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok(),
            Err(_) => None,
        },
        None => base,
    }
}

fn try_process_response(
    transaction: &Transaction,
    segment: &Segment,
    result: &CompletionResult<HttpResponseMessage>,
) -> Result<()> {
    let Ok(response) = result else {
        return Ok(());
    };
    segment.add_attribute("http.statusCode", response.status_code);

    let flattened: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|(name, values)| (name.clone(), values.join(",")))
        .collect();
    transaction.process_inbound_response(&flattened, segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: Option<&str>) -> HttpClient {
        HttpClient {
            base_address: base.map(str::to_string),
        }
    }

    fn request(uri: Option<&str>) -> HttpRequestMessage {
        HttpRequestMessage {
            request_uri: uri.map(str::to_string),
            method: Some("GET".to_string()),
            ..HttpRequestMessage::default()
        }
    }

    #[test]
    fn absolute_request_uri_wins() {
        let uri = try_get_absolute_uri(
            &request(Some("https://api.example.com/a")),
            &client(Some("https://other.example.com/")),
        )
        .unwrap();
        assert_eq!(uri.as_str(), "https://api.example.com/a");
    }

    #[test]
    fn relative_uri_joins_base() {
        let uri = try_get_absolute_uri(
            &request(Some("orders/7")),
            &client(Some("https://api.example.com/v1/")),
        )
        .unwrap();
        assert_eq!(uri.as_str(), "https://api.example.com/v1/orders/7");
    }

    #[test]
    fn base_alone_when_no_request_uri() {
        let uri = try_get_absolute_uri(&request(None), &client(Some("https://api.example.com/")))
            .unwrap();
        assert_eq!(uri.as_str(), "https://api.example.com/");
    }

    #[test]
    fn unresolvable_without_absolute_base() {
        assert!(try_get_absolute_uri(&request(Some("orders/7")), &client(None)).is_none());
        assert!(try_get_absolute_uri(&request(Some("orders/7")), &client(Some("/v1/"))).is_none());
        assert!(try_get_absolute_uri(&request(None), &client(None)).is_none());
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let req = request(Some("https://api.example.com/"));
        req.set_header("Traceparent", "a");
        req.set_header("traceparent", "b");
        assert_eq!(req.headers(), vec![("traceparent".to_string(), "b".to_string())]);
    }
}
