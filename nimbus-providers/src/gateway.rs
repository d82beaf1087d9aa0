//! HTTP gateway emulation.
//!
//! Routes compiled from the graph map incoming requests onto proxy events
//! (v1 for REST gateways, v2 for HTTP APIs and function URLs), invoke the
//! bound function, and translate the handler's response dict back into an
//! HTTP response.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::json;

use nimbus_core::{
    EmulatorError, FunctionInvoker, InvocationErrorKind, Provider, ProviderStatus,
};
use nimbus_wire::{
    build_v1_event, build_v2_event, transform_handler_response, HttpRequestParts, ProxyFormat,
    RouteSet,
};

struct RouteBinding {
    route_key: String,
    resource: String,
    invoker: Arc<dyn FunctionInvoker>,
}

/// One gateway surface (REST API, HTTP API, or a function URL).
pub struct ApiGatewayProvider {
    name: String,
    format: ProxyFormat,
    routes: Mutex<RouteSet<Arc<RouteBinding>>>,
    binary_types: Vec<String>,
    status: Mutex<ProviderStatus>,
}

impl ApiGatewayProvider {
    pub fn new(api_name: impl Into<String>, format: ProxyFormat, binary_types: Vec<String>) -> Self {
        Self {
            name: format!("gateway:{}", api_name.into()),
            format,
            routes: Mutex::new(RouteSet::new()),
            binary_types,
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    /// A function-URL surface: every request hits the one function with
    /// route key `$default`.
    pub fn function_url(
        function_name: &str,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Result<Self, EmulatorError> {
        let provider = Self::new(
            format!("url-{function_name}"),
            ProxyFormat::V2,
            Vec::new(),
        );
        for method in [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ] {
            provider.add_route(method.clone(), "/{proxy+}", "$default", invoker.clone())?;
            provider.add_route_exact(method, "/", "$default", invoker.clone())?;
        }
        Ok(provider)
    }

    /// Bind `method template` to a function. The route key is recorded as
    /// declared (`GET /items/{id}` or `$default`).
    pub fn add_route(
        &self,
        method: Method,
        template: &str,
        route_key: &str,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Result<(), EmulatorError> {
        self.add_route_exact(method, template, route_key, invoker)
    }

    fn add_route_exact(
        &self,
        method: Method,
        template: &str,
        route_key: &str,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Result<(), EmulatorError> {
        let binding = Arc::new(RouteBinding {
            route_key: route_key.to_string(),
            resource: template.to_string(),
            invoker,
        });
        self.routes
            .lock()
            .expect("routes lock")
            .add(method, template, binding)
    }

    /// Serve one request.
    pub async fn handle(&self, request: HttpRequestParts) -> Response {
        let method: Method = match request.method.parse() {
            Ok(method) => method,
            Err(_) => return error_json(StatusCode::BAD_REQUEST, "invalid method"),
        };
        let resolved = {
            let routes = self.routes.lock().expect("routes lock");
            routes
                .resolve(&method, &request.path)
                .map(|(binding, params)| (binding.clone(), params))
        };
        let Some((binding, params)) = resolved else {
            return error_json(
                StatusCode::NOT_FOUND,
                &format!(
                    "Nimbus API Gateway: no route matches {} {}",
                    request.method, request.path
                ),
            );
        };

        let path_params: BTreeMap<String, String> = params.into_iter().collect();
        let event = match self.format {
            ProxyFormat::V1 => build_v1_event(
                &request,
                &binding.resource,
                &path_params,
                &self.binary_types,
            ),
            ProxyFormat::V2 => build_v2_event(
                &request,
                &binding.route_key,
                &path_params,
                &self.binary_types,
            ),
        };

        let context = binding.invoker.make_context();
        let result = match binding.invoker.invoke(event, context).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(gateway = %self.name, error = %err, "invocation error");
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, err.message());
            }
        };

        if let Some(error) = result.error() {
            let status = match error.kind {
                InvocationErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return error_json(status, &error.message);
        }

        let payload = result.payload().cloned().unwrap_or(serde_json::Value::Null);
        match transform_handler_response(&payload, self.format) {
            Ok(parts) => {
                let mut builder = Response::builder()
                    .status(StatusCode::from_u16(parts.status).unwrap_or(StatusCode::OK));
                for (name, value) in &parts.headers {
                    builder = builder.header(name, value);
                }
                builder
                    .body(Body::from(parts.body))
                    .unwrap_or_else(|_| error_json(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
            }
            Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.message()),
        }
    }

    /// Wrap the gateway in an axum application.
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new().fallback(move |request: axum::extract::Request| {
            let gateway = self.clone();
            async move {
                let parts = match request_parts(request).await {
                    Ok(parts) => parts,
                    Err(err) => return error_json(StatusCode::BAD_REQUEST, err.message()),
                };
                gateway.handle(parts).await
            }
        })
    }
}

/// Decompose an axum request into the transport-neutral parts the event
/// builders consume.
pub async fn request_parts(request: axum::extract::Request) -> Result<HttpRequestParts, EmulatorError> {
    let (head, body) = request.into_parts();
    let body = axum::body::to_bytes(body, 64 * 1024 * 1024)
        .await
        .map_err(|err| EmulatorError::Validation(format!("unreadable body: {err}")))?;

    let headers = head
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    Ok(HttpRequestParts {
        method: head.method.as_str().to_string(),
        path: head.uri.path().to_string(),
        raw_query: head.uri.query().unwrap_or_default().to_string(),
        headers,
        body,
        source_ip: "127.0.0.1".to_string(),
        protocol: "HTTP/1.1".to_string(),
    })
}

fn error_json(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(json!({"message": message}).to_string()))
        .expect("error response")
}

#[async_trait]
impl Provider for ApiGatewayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
        *self.status.lock().expect("status lock") = ProviderStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EmulatorError> {
        *self.status.lock().expect("status lock") = ProviderStatus::Stopped;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.status.lock().expect("status lock").is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nimbus_core::{FunctionContext, InvocationResult};
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingInvoker {
        response: Value,
        seen: StdMutex<Vec<Value>>,
        fail_kind: Option<InvocationErrorKind>,
    }

    impl RecordingInvoker {
        fn ok(response: Value) -> Arc<Self> {
            Arc::new(Self {
                response,
                seen: StdMutex::new(Vec::new()),
                fail_kind: None,
            })
        }

        fn failing(kind: InvocationErrorKind) -> Arc<Self> {
            Arc::new(Self {
                response: Value::Null,
                seen: StdMutex::new(Vec::new()),
                fail_kind: Some(kind),
            })
        }
    }

    #[async_trait]
    impl FunctionInvoker for RecordingInvoker {
        fn function_name(&self) -> &str {
            "handler"
        }

        async fn invoke(
            &self,
            event: Value,
            context: FunctionContext,
        ) -> Result<InvocationResult, EmulatorError> {
            self.seen.lock().unwrap().push(event);
            match self.fail_kind {
                Some(kind) => Ok(InvocationResult::failure(
                    kind,
                    "it broke",
                    Duration::from_millis(1),
                    &context.request_id,
                )),
                None => Ok(InvocationResult::success(
                    self.response.clone(),
                    Duration::from_millis(1),
                    &context.request_id,
                )),
            }
        }
    }

    fn get_request(path: &str, query: &str, headers: Vec<(String, String)>) -> HttpRequestParts {
        HttpRequestParts {
            method: "GET".to_string(),
            path: path.to_string(),
            raw_query: query.to_string(),
            headers,
            body: Bytes::new(),
            source_ip: "127.0.0.1".to_string(),
            protocol: "HTTP/1.1".to_string(),
        }
    }

    async fn body_of(response: Response) -> (StatusCode, Vec<(String, String)>, String) {
        use http_body_util::BodyExt;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_str().unwrap().to_string()))
            .collect();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn v2_round_trip_with_cookies_and_multi_query() {
        let invoker = RecordingInvoker::ok(json!({
            "statusCode": 201,
            "body": "ok",
            "cookies": ["c=v"],
        }));
        let gateway = ApiGatewayProvider::new("http-api", ProxyFormat::V2, Vec::new());
        gateway
            .add_route(Method::GET, "/items/{id}", "GET /items/{id}", invoker.clone())
            .unwrap();

        let response = gateway
            .handle(get_request(
                "/items/abc",
                "x=1&x=2",
                vec![("cookie".into(), "s=1".into())],
            ))
            .await;
        let (status, headers, body) = body_of(response).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "ok");
        let cookies: Vec<_> = headers.iter().filter(|(n, _)| n == "set-cookie").collect();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].1, "c=v");

        let events = invoker.seen.lock().unwrap();
        let event = &events[0];
        assert_eq!(event["routeKey"], "GET /items/{id}");
        assert_eq!(event["rawPath"], "/items/abc");
        assert_eq!(event["pathParameters"]["id"], "abc");
        assert_eq!(event["queryStringParameters"]["x"], "1,2");
        assert_eq!(event["cookies"], json!(["s=1"]));
    }

    #[tokio::test]
    async fn unmatched_path_is_emulator_404() {
        let gateway = ApiGatewayProvider::new("api", ProxyFormat::V2, Vec::new());
        let response = gateway.handle(get_request("/nope", "", Vec::new())).await;
        let (status, _, body) = body_of(response).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("Nimbus API Gateway"));
    }

    #[tokio::test]
    async fn timeout_maps_to_gateway_timeout() {
        let gateway = ApiGatewayProvider::new("api", ProxyFormat::V1, Vec::new());
        gateway
            .add_route(
                Method::GET,
                "/slow",
                "GET /slow",
                RecordingInvoker::failing(InvocationErrorKind::Timeout),
            )
            .unwrap();
        let response = gateway.handle(get_request("/slow", "", Vec::new())).await;
        let (status, _, _) = body_of(response).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn handler_error_preserves_message() {
        let gateway = ApiGatewayProvider::new("api", ProxyFormat::V1, Vec::new());
        gateway
            .add_route(
                Method::GET,
                "/broken",
                "GET /broken",
                RecordingInvoker::failing(InvocationErrorKind::Handler),
            )
            .unwrap();
        let response = gateway.handle(get_request("/broken", "", Vec::new())).await;
        let (status, _, body) = body_of(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("it broke"));
    }

    #[tokio::test]
    async fn function_url_uses_default_route_key() {
        let invoker = RecordingInvoker::ok(json!({"statusCode": 200, "body": "hi"}));
        let gateway = ApiGatewayProvider::function_url("fn", invoker.clone()).unwrap();
        let response = gateway.handle(get_request("/any/path", "", Vec::new())).await;
        let (status, _, _) = body_of(response).await;
        assert_eq!(status, StatusCode::OK);

        let events = invoker.seen.lock().unwrap();
        assert_eq!(events[0]["routeKey"], "$default");
        assert_eq!(events[0]["rawPath"], "/any/path");
    }

    #[tokio::test]
    async fn v1_event_carries_resource_template() {
        let invoker = RecordingInvoker::ok(json!({"statusCode": 200, "body": ""}));
        let gateway = ApiGatewayProvider::new("rest", ProxyFormat::V1, Vec::new());
        gateway
            .add_route(Method::GET, "/orders/{id}", "GET /orders/{id}", invoker.clone())
            .unwrap();
        gateway.handle(get_request("/orders/9", "", Vec::new())).await;

        let events = invoker.seen.lock().unwrap();
        assert_eq!(events[0]["resource"], "/orders/{id}");
        assert_eq!(events[0]["pathParameters"]["id"], "9");
        assert_eq!(events[0]["httpMethod"], "GET");
    }
}
