//! Workflow wire surface (JSON-target dialect).

use std::sync::Arc;

use axum::Router;
use serde_json::{json, Value};

use nimbus_core::{EmulatorError, LOCAL_ACCOUNT_ID, LOCAL_REGION};
use nimbus_wire::TargetDispatcher;

use crate::workflow::interpreter::HistoryEvent;
use crate::workflow::{WorkflowProvider, WorkflowType};

fn name_from_arn(arn: &str) -> &str {
    arn.rsplit(':').next().unwrap_or(arn)
}

fn execution_arn(machine_name: &str, execution_id: &str) -> String {
    format!(
        "arn:aws:states:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:execution:{machine_name}:{execution_id}"
    )
}

fn parse_input(body: &Value) -> Result<Value, EmulatorError> {
    match body.get("input") {
        None => Ok(json!({})),
        Some(Value::String(s)) if s.is_empty() => Ok(json!({})),
        Some(Value::String(s)) => serde_json::from_str(s).map_err(Into::into),
        Some(other) => Ok(other.clone()),
    }
}

fn execution_response(provider: &WorkflowProvider, execution_id: &str) -> Result<Value, EmulatorError> {
    let execution = provider.describe_execution(execution_id)?;
    let mut out = json!({
        "executionArn": execution_arn(&execution.workflow_name, &execution.execution_id),
        "status": execution.status.to_string(),
        "startDate": execution.started_at.to_rfc3339(),
        "input": execution.input.to_string(),
    });
    if let Some(output) = &execution.output {
        out["output"] = json!(output.to_string());
    }
    if let Some(failure) = &execution.failure {
        out["error"] = json!(failure.error);
        out["cause"] = json!(failure.cause);
    }
    if let Some(ended_at) = execution.ended_at {
        out["stopDate"] = json!(ended_at.to_rfc3339());
    }
    Ok(out)
}

/// Build the workflow app.
pub fn create_workflow_app(provider: Arc<WorkflowProvider>) -> Router {
    let mut dispatcher = TargetDispatcher::new("AWSStepFunctions");

    let for_create = provider.clone();
    dispatcher.register("CreateStateMachine", move |body, _ctx| {
        let provider = for_create.clone();
        async move {
            let name = body
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing name".into()))?;
            let definition: Value = match body.get("definition") {
                Some(Value::String(s)) => serde_json::from_str(s)?,
                Some(other) => other.clone(),
                None => return Err(EmulatorError::Validation("missing definition".into())),
            };
            let workflow_type = match body.get("type").and_then(Value::as_str) {
                Some("EXPRESS") => WorkflowType::Express,
                _ => WorkflowType::Standard,
            };
            let arn = provider.create_state_machine(name, &definition, workflow_type)?;
            Ok(json!({
                "stateMachineArn": arn,
                "creationDate": chrono::Utc::now().to_rfc3339(),
            }))
        }
    });

    let for_update = provider.clone();
    dispatcher.register("UpdateStateMachine", move |body, _ctx| {
        let provider = for_update.clone();
        async move {
            let arn = body
                .get("stateMachineArn")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing stateMachineArn".into()))?;
            let definition: Value = match body.get("definition") {
                Some(Value::String(s)) => serde_json::from_str(s)?,
                Some(other) => other.clone(),
                None => return Err(EmulatorError::Validation("missing definition".into())),
            };
            provider.update_state_machine(name_from_arn(arn), &definition)?;
            Ok(json!({"updateDate": chrono::Utc::now().to_rfc3339()}))
        }
    });

    let for_list = provider.clone();
    dispatcher.register("ListStateMachines", move |_body, _ctx| {
        let provider = for_list.clone();
        async move {
            let machines: Vec<Value> = provider
                .list_state_machines()
                .into_iter()
                .map(|(name, arn)| json!({"name": name, "stateMachineArn": arn}))
                .collect();
            Ok(json!({"stateMachines": machines}))
        }
    });

    let for_start = provider.clone();
    dispatcher.register("StartExecution", move |body, _ctx| {
        let provider = for_start.clone();
        async move {
            let arn = body
                .get("stateMachineArn")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing stateMachineArn".into()))?;
            let machine_name = name_from_arn(arn).to_string();
            let input = parse_input(&body)?;
            let execution_id = provider.start_execution(&machine_name, input).await?;
            Ok(json!({
                "executionArn": execution_arn(&machine_name, &execution_id),
                "startDate": chrono::Utc::now().to_rfc3339(),
            }))
        }
    });

    // Express-style synchronous start: waits for completion and returns the
    // final output inline.
    let for_sync = provider.clone();
    dispatcher.register("StartSyncExecution", move |body, _ctx| {
        let provider = for_sync.clone();
        async move {
            let arn = body
                .get("stateMachineArn")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing stateMachineArn".into()))?;
            let machine_name = name_from_arn(arn).to_string();
            let input = parse_input(&body)?;
            let execution_id = provider.start_execution(&machine_name, input).await?;
            // Standard machines spawn; poll the record briefly until done.
            for _ in 0..600 {
                let execution = provider.describe_execution(&execution_id)?;
                if execution.ended_at.is_some() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            execution_response(&provider, &execution_id)
        }
    });

    let for_describe = provider.clone();
    dispatcher.register("DescribeExecution", move |body, _ctx| {
        let provider = for_describe.clone();
        async move {
            let arn = body
                .get("executionArn")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing executionArn".into()))?;
            execution_response(&provider, name_from_arn(arn))
        }
    });

    let for_history = provider.clone();
    dispatcher.register("GetExecutionHistory", move |body, _ctx| {
        let provider = for_history.clone();
        async move {
            let arn = body
                .get("executionArn")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing executionArn".into()))?;
            let history = provider.execution_history(name_from_arn(arn))?;
            let mut events = Vec::new();
            for entry in history {
                match entry {
                    HistoryEvent::State(transition) => {
                        events.push(json!({
                            "type": "StateEntered",
                            "stateName": transition.state_name,
                            "timestamp": transition.entered_at.to_rfc3339(),
                            "input": transition.input.to_string(),
                        }));
                        let mut exited = json!({
                            "type": "StateExited",
                            "stateName": transition.state_name,
                            "timestamp": transition.exited_at.to_rfc3339(),
                        });
                        if let Some(output) = &transition.output {
                            exited["output"] = json!(output.to_string());
                        }
                        if let Some(failure) = &transition.failure {
                            exited["error"] = json!(failure.error);
                            exited["cause"] = json!(failure.cause);
                        }
                        events.push(exited);
                    }
                    HistoryEvent::Aborted { at } => {
                        events.push(json!({
                            "type": "ExecutionAborted",
                            "timestamp": at.to_rfc3339(),
                        }));
                    }
                }
            }
            Ok(json!({"events": events}))
        }
    });

    let for_stop = provider.clone();
    dispatcher.register("StopExecution", move |body, _ctx| {
        let provider = for_stop.clone();
        async move {
            let arn = body
                .get("executionArn")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing executionArn".into()))?;
            provider.stop_execution(name_from_arn(arn))?;
            Ok(json!({"stopDate": chrono::Utc::now().to_rfc3339()}))
        }
    });

    dispatcher.into_router()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use nimbus_core::Provider;
    use tower::ServiceExt;

    fn choice_definition() -> String {
        json!({
            "StartAt": "C",
            "States": {
                "C": {
                    "Type": "Choice",
                    "Choices": [{"Variable": "$.n", "NumericGreaterThan": 10, "Next": "Big"}],
                    "Default": "Small"
                },
                "Big": {"Type": "Pass", "Result": "big", "End": true},
                "Small": {"Type": "Pass", "Result": "small", "End": true}
            }
        })
        .to_string()
    }

    async fn call(router: &Router, target: &str, body: Value) -> (u16, Value) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("x-amz-target", format!("AWSStepFunctions.{target}"))
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn express_machine_full_round_trip() {
        let provider = Arc::new(WorkflowProvider::new(Arc::new(|_| None)));
        provider.start().await.unwrap();
        let router = create_workflow_app(provider);

        let (status, created) = call(
            &router,
            "CreateStateMachine",
            json!({"name": "decide", "definition": choice_definition(), "type": "EXPRESS"}),
        )
        .await;
        assert_eq!(status, 200);
        let arn = created["stateMachineArn"].as_str().unwrap().to_string();

        let (status, result) = call(
            &router,
            "StartSyncExecution",
            json!({"stateMachineArn": arn, "input": "{\"n\": 20}"}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(result["status"], "SUCCEEDED");
        assert_eq!(result["output"], "\"big\"");

        let execution_arn = result["executionArn"].as_str().unwrap().to_string();
        let (status, history) = call(
            &router,
            "GetExecutionHistory",
            json!({"executionArn": execution_arn}),
        )
        .await;
        assert_eq!(status, 200);
        let events = history["events"].as_array().unwrap();
        assert!(events.len() >= 4);
        assert_eq!(events[0]["type"], "StateEntered");
        assert_eq!(events[0]["stateName"], "C");
    }

    #[tokio::test]
    async fn describe_unknown_execution_is_404() {
        let provider = Arc::new(WorkflowProvider::new(Arc::new(|_| None)));
        let router = create_workflow_app(provider);
        let (status, body) = call(
            &router,
            "DescribeExecution",
            json!({"executionArn": "arn:aws:states:local:000000000000:execution:m:ghost"}),
        )
        .await;
        assert_eq!(status, 404);
        assert_eq!(body["__type"], "ResourceNotFoundException");
    }
}
