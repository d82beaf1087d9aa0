//! Query-action dialect dispatcher.
//!
//! The SDK sends `Action=Operation` either as a form-urlencoded body or as
//! query parameters; responses are XML envelopes of the shape
//! `<OperationResponse><OperationResult>...</OperationResult>
//! <ResponseMetadata><RequestId/></ResponseMetadata></OperationResponse>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::Response;
use axum::Router;

use nimbus_core::EmulatorError;

use crate::envelope::{error_response, ErrorFormat, REQUEST_ID_HEADER};
use crate::target::OpContext;

/// Decoded query-action parameters (form fields merged over query params).
pub type ActionParams = HashMap<String, String>;

type ActionFuture = Pin<Box<dyn Future<Output = Result<String, EmulatorError>> + Send>>;
type ActionHandler = Arc<dyn Fn(ActionParams, OpContext) -> ActionFuture + Send + Sync>;

/// Operation table keyed by action name.
pub struct QueryDispatcher {
    xmlns: String,
    handlers: HashMap<String, ActionHandler>,
}

impl QueryDispatcher {
    pub fn new(xmlns: impl Into<String>) -> Self {
        Self {
            xmlns: xmlns.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. The handler returns the inner XML of the
    /// `<ActionResult>` element.
    pub fn register<F, Fut>(&mut self, action: &str, handler: F)
    where
        F: Fn(ActionParams, OpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, EmulatorError>> + Send + 'static,
    {
        self.handlers.insert(
            action.to_string(),
            Arc::new(move |params, ctx| Box::pin(handler(params, ctx))),
        );
    }

    pub async fn dispatch(&self, params: ActionParams, path: &str) -> Response {
        let mut ctx = OpContext::new();
        ctx.path_params
            .insert("path".to_string(), path.to_string());
        let request_id = ctx.request_id.clone();

        let action = params.get("Action").cloned().unwrap_or_default();
        let Some(handler) = self.handlers.get(&action) else {
            let err = EmulatorError::Validation(format!("unknown action: {action}"));
            return error_response(ErrorFormat::Xml, &err, &request_id);
        };

        match handler(params, ctx).await {
            Ok(inner) => {
                let body = format!(
                    "<{action}Response xmlns=\"{xmlns}\"><{action}Result>{inner}</{action}Result>\
                     <ResponseMetadata><RequestId>{request_id}</RequestId></ResponseMetadata>\
                     </{action}Response>",
                    xmlns = self.xmlns,
                );
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/xml")
                    .header(REQUEST_ID_HEADER, &request_id)
                    .body(axum::body::Body::from(body))
                    .expect("query response")
            }
            Err(err) => {
                tracing::debug!(action, error = %err, "action failed");
                error_response(ErrorFormat::Xml, &err, &request_id)
            }
        }
    }

    /// Wrap the dispatcher in an axum application. The action may arrive on
    /// any path (queue URLs carry the queue name in the path), so dispatch is
    /// the fallback for the whole surface.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(dispatch_handler)
            .with_state(Arc::new(self))
    }
}

/// Merge query parameters and a form-urlencoded body; form fields win.
pub fn decode_params(uri: &Uri, body: &[u8]) -> ActionParams {
    let mut params = HashMap::new();
    if let Some(query) = uri.query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            params.insert(key.into_owned(), value.into_owned());
        }
    }
    for (key, value) in form_urlencoded::parse(body) {
        params.insert(key.into_owned(), value.into_owned());
    }
    params
}

async fn dispatch_handler(
    State(dispatcher): State<Arc<QueryDispatcher>>,
    uri: Uri,
    body: Bytes,
) -> Response {
    let params = decode_params(&uri, &body);
    dispatcher.dispatch(params, uri.path()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn dispatcher() -> QueryDispatcher {
        let mut d = QueryDispatcher::new("http://queue.test/doc/2012-11-05/");
        d.register("GetQueueUrl", |params, _ctx| async move {
            let name = params.get("QueueName").cloned().unwrap_or_default();
            Ok(format!("<QueueUrl>http://localhost/{name}</QueueUrl>"))
        });
        d
    }

    async fn post_form(router: Router, path: &str, form: &str) -> (StatusCode, String) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(axum::body::Body::from(form.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn dispatches_form_action_with_envelope() {
        let (status, body) =
            post_form(dispatcher().into_router(), "/", "Action=GetQueueUrl&QueueName=jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("<GetQueueUrlResponse"));
        assert!(body.contains("<QueueUrl>http://localhost/jobs</QueueUrl>"));
        assert!(body.contains("<RequestId>"));
    }

    #[tokio::test]
    async fn action_from_query_params_on_any_path() {
        let (status, body) = post_form(
            dispatcher().into_router(),
            "/000000000000/jobs?Action=GetQueueUrl&QueueName=jobs",
            "",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("jobs"));
    }

    #[tokio::test]
    async fn unknown_action_is_xml_error() {
        let (status, body) = post_form(dispatcher().into_router(), "/", "Action=Missing").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("<Code>ValidationException</Code>"));
    }

    #[test]
    fn form_fields_win_over_query_params() {
        let uri: Uri = "/?Action=FromQuery&Extra=1".parse().unwrap();
        let params = decode_params(&uri, b"Action=FromForm");
        assert_eq!(params["Action"], "FromForm");
        assert_eq!(params["Extra"], "1");
    }
}
