//! State machine execution.
//!
//! Every state runs the same input/output pipeline: InputPath, Parameters,
//! the state body, ResultSelector, ResultPath, OutputPath. Transitions are
//! appended to the execution history; failures end the execution with an
//! error kind and cause, and an external stop aborts between states.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use nimbus_core::{EmulatorError, FunctionInvoker, InvocationErrorKind};

use super::choice::evaluate_choice_rules;
use super::definition::{State, StateKind, StateMachineDef};
use super::paths::{apply_parameters, apply_result_path, apply_selection_path, resolve_path};

/// Guard against runaway definitions.
const MAX_TRANSITIONS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Aborted => "ABORTED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Error kind + cause of a failed execution.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub error: String,
    pub cause: String,
}

/// One state's passage through the pipeline.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub state_name: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub input: Value,
    pub output: Option<Value>,
    pub failure: Option<ExecutionFailure>,
}

/// History entries of one execution.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    State(StateTransition),
    Aborted { at: DateTime<Utc> },
}

/// One run of a workflow.
#[derive(Debug, Clone)]
pub struct Execution {
    pub execution_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub failure: Option<ExecutionFailure>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEvent>,
}

impl Execution {
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_name: workflow_name.into(),
            input,
            output: None,
            failure: None,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            history: Vec::new(),
        }
    }
}

/// Resolves a Task state's resource to an invoker.
pub type TaskResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn FunctionInvoker>> + Send + Sync>;

enum StepOutcome {
    Continue { output: Value, next: String },
    Succeed(Value),
    Fail(ExecutionFailure),
    Aborted,
}

/// Executes state machines against a task resolver.
pub struct Interpreter {
    def: Arc<StateMachineDef>,
    resolver: TaskResolver,
}

impl Interpreter {
    pub fn new(def: Arc<StateMachineDef>, resolver: TaskResolver) -> Self {
        Self { def, resolver }
    }

    /// Run one execution to completion, failure, or abort. Transitions are
    /// appended to the execution record as they happen.
    pub async fn run(&self, execution: Arc<Mutex<Execution>>, abort: CancellationToken) {
        let (mut value, execution_id, started_at, workflow_name) = {
            let guard = execution.lock().expect("execution lock");
            (
                guard.input.clone(),
                guard.execution_id.clone(),
                guard.started_at,
                guard.workflow_name.clone(),
            )
        };
        let mut state_name = self.def.start_at.clone();

        for _ in 0..MAX_TRANSITIONS {
            if abort.is_cancelled() {
                finish_aborted(&execution);
                return;
            }

            let Some(state) = self.def.states.get(&state_name) else {
                finish_failed(
                    &execution,
                    ExecutionFailure {
                        error: "States.Runtime".into(),
                        cause: format!("undefined state: {state_name}"),
                    },
                );
                return;
            };

            let entered_at = Utc::now();
            let context = json!({
                "Execution": {
                    "Id": &execution_id,
                    "StartTime": started_at.to_rfc3339(),
                },
                "State": {
                    "Name": &state_name,
                    "EnteredTime": entered_at.to_rfc3339(),
                },
                "StateMachine": {"Name": &workflow_name},
            });

            let outcome = self.step(state, &value, &context, &abort).await;
            let exited_at = Utc::now();

            match outcome {
                StepOutcome::Continue { output, next } => {
                    push_transition(&execution, &state_name, entered_at, exited_at, &value, Some(&output), None);
                    value = output;
                    state_name = next;
                }
                StepOutcome::Succeed(output) => {
                    push_transition(&execution, &state_name, entered_at, exited_at, &value, Some(&output), None);
                    let mut guard = execution.lock().expect("execution lock");
                    guard.status = ExecutionStatus::Succeeded;
                    guard.output = Some(output);
                    guard.ended_at = Some(exited_at);
                    return;
                }
                StepOutcome::Fail(failure) => {
                    push_transition(
                        &execution,
                        &state_name,
                        entered_at,
                        exited_at,
                        &value,
                        None,
                        Some(failure.clone()),
                    );
                    finish_failed(&execution, failure);
                    return;
                }
                StepOutcome::Aborted => {
                    finish_aborted(&execution);
                    return;
                }
            }
        }

        finish_failed(
            &execution,
            ExecutionFailure {
                error: "States.Runtime".into(),
                cause: format!("exceeded {MAX_TRANSITIONS} state transitions"),
            },
        );
    }

    async fn step(
        &self,
        state: &State,
        raw_input: &Value,
        context: &Value,
        abort: &CancellationToken,
    ) -> StepOutcome {
        let projected = match apply_selection_path(raw_input, &state.input_path) {
            Ok(value) => value,
            Err(err) => return runtime_failure(err),
        };
        let effective = match &state.parameters {
            Some(template) => match apply_parameters(template, &projected, context) {
                Ok(value) => value,
                Err(err) => return runtime_failure(err),
            },
            None => projected,
        };

        let body = match &state.kind {
            StateKind::Pass { result } => result.clone().unwrap_or(effective),
            StateKind::Succeed => {
                return match apply_selection_path(&effective, &state.output_path) {
                    Ok(output) => StepOutcome::Succeed(output),
                    Err(err) => runtime_failure(err),
                };
            }
            StateKind::Fail { error, cause } => {
                return StepOutcome::Fail(ExecutionFailure {
                    error: error.clone().unwrap_or_else(|| "States.Failed".into()),
                    cause: cause.clone().unwrap_or_default(),
                });
            }
            StateKind::Choice { choices, default } => {
                let next = evaluate_choice_rules(choices, &effective).or_else(|| default.clone());
                let Some(next) = next else {
                    return StepOutcome::Fail(ExecutionFailure {
                        error: "States.NoChoiceMatched".into(),
                        cause: "no choice rule matched and no default given".into(),
                    });
                };
                return match apply_selection_path(&effective, &state.output_path) {
                    Ok(output) => StepOutcome::Continue { output, next },
                    Err(err) => runtime_failure(err),
                };
            }
            StateKind::Wait {
                seconds,
                seconds_path,
            } => {
                let delay = match wait_seconds(seconds, seconds_path, &effective) {
                    Ok(delay) => delay,
                    Err(err) => return runtime_failure(err),
                };
                tokio::select! {
                    _ = abort.cancelled() => return StepOutcome::Aborted,
                    _ = tokio::time::sleep(delay) => {}
                }
                effective
            }
            StateKind::Task { resource } => {
                match self.run_task(resource, &effective).await {
                    Ok(payload) => payload,
                    Err(failure) => return StepOutcome::Fail(failure),
                }
            }
        };

        let selected = match &state.result_selector {
            Some(template) => match apply_parameters(template, &body, context) {
                Ok(value) => value,
                Err(err) => return runtime_failure(err),
            },
            None => body,
        };
        let combined = match apply_result_path(raw_input, selected, &state.result_path) {
            Ok(value) => value,
            Err(err) => return runtime_failure(err),
        };
        let output = match apply_selection_path(&combined, &state.output_path) {
            Ok(value) => value,
            Err(err) => return runtime_failure(err),
        };

        if state.end {
            StepOutcome::Succeed(output)
        } else if let Some(next) = &state.next {
            StepOutcome::Continue {
                output,
                next: next.clone(),
            }
        } else {
            StepOutcome::Fail(ExecutionFailure {
                error: "States.Runtime".into(),
                cause: "state has neither Next nor End".into(),
            })
        }
    }

    async fn run_task(&self, resource: &str, input: &Value) -> Result<Value, ExecutionFailure> {
        let Some(invoker) = (self.resolver)(resource) else {
            return Err(ExecutionFailure {
                error: "States.TaskFailed".into(),
                cause: format!("no function bound to resource: {resource}"),
            });
        };
        let context = invoker.make_context();
        match invoker.invoke(input.clone(), context).await {
            Ok(result) => match result.error() {
                None => Ok(result.payload().cloned().unwrap_or(Value::Null)),
                Some(error) => {
                    let kind = match error.kind {
                        InvocationErrorKind::Timeout => "States.Timeout",
                        _ => "States.TaskFailed",
                    };
                    Err(ExecutionFailure {
                        error: kind.into(),
                        cause: error.message.clone(),
                    })
                }
            },
            Err(err) => Err(ExecutionFailure {
                error: "States.TaskFailed".into(),
                cause: err.to_string(),
            }),
        }
    }
}

fn wait_seconds(
    seconds: &Option<f64>,
    seconds_path: &Option<String>,
    input: &Value,
) -> Result<Duration, EmulatorError> {
    let secs = match (seconds, seconds_path) {
        (Some(secs), _) => *secs,
        (None, Some(path)) => resolve_path(input, path)?.as_f64().ok_or_else(|| {
            EmulatorError::Validation(format!("SecondsPath {path} is not numeric"))
        })?,
        (None, None) => {
            return Err(EmulatorError::Validation(
                "wait state needs Seconds or SecondsPath".into(),
            ))
        }
    };
    if secs < 0.0 {
        return Err(EmulatorError::Validation("wait seconds must be positive".into()));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn runtime_failure(err: EmulatorError) -> StepOutcome {
    StepOutcome::Fail(ExecutionFailure {
        error: "States.Runtime".into(),
        cause: err.message().to_string(),
    })
}

#[allow(clippy::too_many_arguments)]
fn push_transition(
    execution: &Arc<Mutex<Execution>>,
    state_name: &str,
    entered_at: DateTime<Utc>,
    exited_at: DateTime<Utc>,
    input: &Value,
    output: Option<&Value>,
    failure: Option<ExecutionFailure>,
) {
    let mut guard = execution.lock().expect("execution lock");
    guard.history.push(HistoryEvent::State(StateTransition {
        state_name: state_name.to_string(),
        entered_at,
        exited_at,
        input: input.clone(),
        output: output.cloned(),
        failure,
    }));
}

fn finish_failed(execution: &Arc<Mutex<Execution>>, failure: ExecutionFailure) {
    let mut guard = execution.lock().expect("execution lock");
    guard.status = ExecutionStatus::Failed;
    guard.failure = Some(failure);
    guard.ended_at = Some(Utc::now());
}

fn finish_aborted(execution: &Arc<Mutex<Execution>>) {
    let mut guard = execution.lock().expect("execution lock");
    guard.status = ExecutionStatus::Aborted;
    let at = Utc::now();
    guard.history.push(HistoryEvent::Aborted { at });
    guard.ended_at = Some(at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nimbus_core::{FunctionContext, InvocationResult};

    fn interpreter(definition: Value) -> Interpreter {
        let def = Arc::new(StateMachineDef::parse(&definition).unwrap());
        Interpreter::new(def, Arc::new(|_| None))
    }

    async fn run_to_end(interpreter: &Interpreter, input: Value) -> Execution {
        let execution = Arc::new(Mutex::new(Execution::new("wf", input)));
        interpreter
            .run(execution.clone(), CancellationToken::new())
            .await;
        let guard = execution.lock().unwrap();
        guard.clone()
    }

    fn choice_definition() -> Value {
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
    }

    #[tokio::test]
    async fn choice_routes_by_rules_and_default() {
        let interp = interpreter(choice_definition());

        let big = run_to_end(&interp, json!({"n": 20})).await;
        assert_eq!(big.status, ExecutionStatus::Succeeded);
        assert_eq!(big.output, Some(json!("big")));

        let small = run_to_end(&interp, json!({"n": 5})).await;
        assert_eq!(small.output, Some(json!("small")));

        // Missing variable: rule false, default taken.
        let defaulted = run_to_end(&interp, json!({})).await;
        assert_eq!(defaulted.output, Some(json!("small")));
    }

    #[tokio::test]
    async fn pass_pipeline_with_result_path() {
        let interp = interpreter(json!({
            "StartAt": "P",
            "States": {
                "P": {
                    "Type": "Pass",
                    "Result": {"verdict": "ok"},
                    "ResultPath": "$.check",
                    "End": true
                }
            }
        }));
        let done = run_to_end(&interp, json!({"order": 7})).await;
        assert_eq!(done.output, Some(json!({"order": 7, "check": {"verdict": "ok"}})));
    }

    #[tokio::test]
    async fn fail_state_ends_with_error_and_cause() {
        let interp = interpreter(json!({
            "StartAt": "F",
            "States": {
                "F": {"Type": "Fail", "Error": "Boom", "Cause": "testing"}
            }
        }));
        let failed = run_to_end(&interp, json!({})).await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        let failure = failed.failure.unwrap();
        assert_eq!(failure.error, "Boom");
        assert_eq!(failure.cause, "testing");
    }

    #[tokio::test]
    async fn missing_input_path_fails_the_state() {
        let interp = interpreter(json!({
            "StartAt": "P",
            "States": {"P": {"Type": "Pass", "InputPath": "$.missing", "End": true}}
        }));
        let failed = run_to_end(&interp, json!({})).await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.failure.unwrap().error, "States.Runtime");
    }

    #[tokio::test]
    async fn history_records_every_transition() {
        let interp = interpreter(choice_definition());
        let done = run_to_end(&interp, json!({"n": 20})).await;
        let names: Vec<String> = done
            .history
            .iter()
            .map(|event| match event {
                HistoryEvent::State(t) => t.state_name.clone(),
                HistoryEvent::Aborted { .. } => "aborted".into(),
            })
            .collect();
        assert_eq!(names, vec!["C", "Big"]);
        if let HistoryEvent::State(first) = &done.history[0] {
            assert_eq!(first.input, json!({"n": 20}));
            assert!(first.output.is_some());
            assert!(first.exited_at >= first.entered_at);
        }
    }

    struct EchoInvoker;

    #[async_trait]
    impl FunctionInvoker for EchoInvoker {
        fn function_name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            event: Value,
            context: FunctionContext,
        ) -> Result<InvocationResult, EmulatorError> {
            Ok(InvocationResult::success(
                json!({"echoed": event}),
                Duration::from_millis(1),
                &context.request_id,
            ))
        }
    }

    #[tokio::test]
    async fn task_state_invokes_resolved_function() {
        let def = Arc::new(
            StateMachineDef::parse(&json!({
                "StartAt": "T",
                "States": {
                    "T": {"Type": "Task", "Resource": "arn:fn:echo", "End": true}
                }
            }))
            .unwrap(),
        );
        let interp = Interpreter::new(
            def,
            Arc::new(|resource| {
                (resource == "arn:fn:echo")
                    .then(|| Arc::new(EchoInvoker) as Arc<dyn FunctionInvoker>)
            }),
        );
        let done = run_to_end(&interp, json!({"n": 1})).await;
        assert_eq!(done.status, ExecutionStatus::Succeeded);
        assert_eq!(done.output, Some(json!({"echoed": {"n": 1}})));
    }

    #[tokio::test]
    async fn task_without_binding_fails_execution() {
        let interp = interpreter(json!({
            "StartAt": "T",
            "States": {"T": {"Type": "Task", "Resource": "arn:fn:ghost", "End": true}}
        }));
        let failed = run_to_end(&interp, json!({})).await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.failure.unwrap().error, "States.TaskFailed");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_state_sleeps_then_continues() {
        let interp = interpreter(json!({
            "StartAt": "W",
            "States": {
                "W": {"Type": "Wait", "Seconds": 300, "Next": "Done"},
                "Done": {"Type": "Succeed"}
            }
        }));
        let done = run_to_end(&interp, json!({"kept": true})).await;
        assert_eq!(done.status, ExecutionStatus::Succeeded);
        assert_eq!(done.output, Some(json!({"kept": true})));
    }

    #[tokio::test]
    async fn abort_before_wait_completes() {
        let interp = interpreter(json!({
            "StartAt": "W",
            "States": {
                "W": {"Type": "Wait", "Seconds": 3600, "Next": "Done"},
                "Done": {"Type": "Succeed"}
            }
        }));
        let execution = Arc::new(Mutex::new(Execution::new("wf", json!({}))));
        let abort = CancellationToken::new();
        let run = interp.run(execution.clone(), abort.clone());
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("should still be waiting"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        abort.cancel();
        run.await;

        let guard = execution.lock().unwrap();
        assert_eq!(guard.status, ExecutionStatus::Aborted);
        assert!(matches!(
            guard.history.last(),
            Some(HistoryEvent::Aborted { .. })
        ));
    }
}
