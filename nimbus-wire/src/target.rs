//! JSON-target dialect dispatcher.
//!
//! The SDK posts to `/` with an `X-Amz-Target: ServicePrefix.Operation`
//! header and a JSON body. The dispatcher maintains an operation table and
//! serializes the handler's JSON result (or error envelope) back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use serde_json::Value;

use nimbus_core::EmulatorError;

use crate::envelope::{error_response, ErrorFormat, REQUEST_ID_HEADER};

/// Per-request context handed to operation handlers.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub request_id: String,
    pub path_params: HashMap<String, String>,
}

impl OpContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            path_params: HashMap::new(),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

type OpFuture = Pin<Box<dyn Future<Output = Result<Value, EmulatorError>> + Send>>;
type OpHandler = Arc<dyn Fn(Value, OpContext) -> OpFuture + Send + Sync>;

/// Operation table keyed by `ServicePrefix.Operation`.
pub struct TargetDispatcher {
    service_prefix: String,
    handlers: HashMap<String, OpHandler>,
}

impl TargetDispatcher {
    pub fn new(service_prefix: impl Into<String>) -> Self {
        Self {
            service_prefix: service_prefix.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for an operation name (without the prefix).
    pub fn register<F, Fut>(&mut self, operation: &str, handler: F)
    where
        F: Fn(Value, OpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, EmulatorError>> + Send + 'static,
    {
        let key = format!("{}.{operation}", self.service_prefix);
        self.handlers
            .insert(key, Arc::new(move |body, ctx| Box::pin(handler(body, ctx))));
    }

    pub fn operations(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatch one decoded request.
    pub async fn dispatch(&self, target: &str, body: Value) -> Response {
        let ctx = OpContext::new();
        let request_id = ctx.request_id.clone();

        let Some(handler) = self.handlers.get(target) else {
            let err = EmulatorError::Validation(format!("unknown target: {target}"));
            return error_response(ErrorFormat::Json, &err, &request_id);
        };

        match handler(body, ctx).await {
            Ok(result) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/x-amz-json-1.0")
                .header(REQUEST_ID_HEADER, &request_id)
                .body(axum::body::Body::from(result.to_string()))
                .expect("target response"),
            Err(err) => {
                tracing::debug!(target, error = %err, "operation failed");
                error_response(ErrorFormat::Json, &err, &request_id)
            }
        }
    }

    /// Wrap the dispatcher in an axum application.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/", post(dispatch_handler))
            .with_state(Arc::new(self))
    }
}

async fn dispatch_handler(
    State(dispatcher): State<Arc<TargetDispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let parsed: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    if parsed.is_null() {
        let err = EmulatorError::Validation("request body is not valid JSON".into());
        return error_response(ErrorFormat::Json, &err, &uuid::Uuid::new_v4().to_string());
    }
    dispatcher.dispatch(&target, parsed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn dispatcher() -> TargetDispatcher {
        let mut d = TargetDispatcher::new("TestService");
        d.register("Echo", |body, _ctx| async move { Ok(json!({"echo": body})) });
        d.register("Fail", |_body, _ctx| async move {
            Err(EmulatorError::NotFound("nothing here".into()))
        });
        d
    }

    async fn call(router: Router, target: &str, body: Value) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("x-amz-target", target)
            .header("content-type", "application/x-amz-json-1.0")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn routes_by_target_header() {
        let (status, body) =
            call(dispatcher().into_router(), "TestService.Echo", json!({"n": 1})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["echo"]["n"], 1);
    }

    #[tokio::test]
    async fn unknown_target_is_validation_error() {
        let (status, body) =
            call(dispatcher().into_router(), "TestService.Nope", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "ValidationException");
    }

    #[tokio::test]
    async fn handler_errors_use_taxonomy_status() {
        let (status, body) =
            call(dispatcher().into_router(), "TestService.Fail", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["__type"], "ResourceNotFoundException");
        assert_eq!(body["message"], "nothing here");
    }
}
