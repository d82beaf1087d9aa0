//! Management API.
//!
//! Served on the primary port under `/_mgmt`: provider status, the resource
//! metadata tree, state reset, graceful shutdown, and direct function
//! invocation for poking at handlers without a gateway.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use nimbus_core::FunctionInvoker;

use crate::orchestrator::Orchestrator;

/// Shared state behind the management endpoints.
pub struct ManagementState {
    pub orchestrator: Arc<Orchestrator>,
    pub invokers: HashMap<String, Arc<dyn FunctionInvoker>>,
    /// Resource metadata tree handed to internal clients.
    pub resources: Value,
}

/// Build the `/_mgmt` router.
pub fn management_router(state: Arc<ManagementState>) -> Router {
    Router::new()
        .route("/_mgmt/status", get(handle_status))
        .route("/_mgmt/resources", get(handle_resources))
        .route("/_mgmt/reset", post(handle_reset))
        .route("/_mgmt/shutdown", post(handle_shutdown))
        .route("/_mgmt/invoke", post(handle_invoke))
        .with_state(state)
}

async fn handle_status(State(state): State<Arc<ManagementState>>) -> Response {
    let mut providers = Vec::new();
    for (id, provider) in state.orchestrator.providers() {
        let healthy = provider.health_check().await;
        providers.push(json!({
            "id": id,
            "name": provider.name(),
            "healthy": healthy,
        }));
    }
    Json(json!({
        "running": state.orchestrator.running(),
        "providers": providers,
    }))
    .into_response()
}

async fn handle_resources(State(state): State<Arc<ManagementState>>) -> Response {
    Json(state.resources.clone()).into_response()
}

async fn handle_reset(State(state): State<Arc<ManagementState>>) -> Response {
    tracing::info!("reset requested via management API");
    let mut reset_count = 0usize;
    for (_, provider) in state.orchestrator.providers() {
        if !provider.supports_reset() {
            continue;
        }
        match provider.reset().await {
            Ok(()) => reset_count += 1,
            Err(err) => {
                tracing::error!(provider = provider.name(), error = %err, "error resetting");
            }
        }
    }
    Json(json!({"status": "ok", "providers_reset": reset_count})).into_response()
}

async fn handle_shutdown(State(state): State<Arc<ManagementState>>) -> Response {
    tracing::info!("shutdown requested via management API");
    state.orchestrator.request_shutdown();
    Json(json!({"status": "shutting down"})).into_response()
}

async fn handle_invoke(
    State(state): State<Arc<ManagementState>>,
    Json(body): Json<Value>,
) -> Response {
    let Some(function_name) = body.get("function_name").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing function_name"})),
        )
            .into_response();
    };
    let Some(invoker) = state.invokers.get(function_name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Function not found: {function_name}")})),
        )
            .into_response();
    };

    let event = body.get("event").cloned().unwrap_or_else(|| json!({}));
    let context = invoker.make_context();
    match invoker.invoke(event, context).await {
        Ok(result) => {
            tracing::info!(
                function = function_name,
                outcome = if result.is_success() { "OK" } else { "ERROR" },
                "invoked via management API"
            );
            Json(json!({
                "payload": result.payload(),
                "error": result.error().map(|e| e.message.clone()),
            }))
            .into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}
