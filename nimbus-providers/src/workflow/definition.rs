//! State machine definition parsing.

use std::collections::HashMap;

use serde_json::Value;

use nimbus_core::EmulatorError;

use super::choice::ChoiceRule;
use super::paths::PathSpec;

/// A parsed state machine definition.
#[derive(Debug, Clone)]
pub struct StateMachineDef {
    pub start_at: String,
    pub states: HashMap<String, State>,
}

/// One state, with the common input/output processing fields.
#[derive(Debug, Clone)]
pub struct State {
    pub kind: StateKind,
    pub next: Option<String>,
    pub end: bool,
    pub input_path: PathSpec,
    pub output_path: PathSpec,
    pub result_path: PathSpec,
    pub parameters: Option<Value>,
    pub result_selector: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum StateKind {
    Pass {
        result: Option<Value>,
    },
    Succeed,
    Fail {
        error: Option<String>,
        cause: Option<String>,
    },
    Choice {
        choices: Vec<ChoiceRule>,
        default: Option<String>,
    },
    Wait {
        seconds: Option<f64>,
        seconds_path: Option<String>,
    },
    Task {
        resource: String,
    },
}

impl StateMachineDef {
    pub fn parse(definition: &Value) -> Result<Self, EmulatorError> {
        let start_at = definition
            .get("StartAt")
            .and_then(Value::as_str)
            .ok_or_else(|| EmulatorError::Validation("definition missing StartAt".into()))?
            .to_string();
        let Some(Value::Object(raw_states)) = definition.get("States") else {
            return Err(EmulatorError::Validation("definition missing States".into()));
        };

        let mut states = HashMap::with_capacity(raw_states.len());
        for (name, body) in raw_states {
            states.insert(name.clone(), parse_state(name, body)?);
        }

        let def = Self { start_at, states };
        def.validate_transitions()?;
        Ok(def)
    }

    fn validate_transitions(&self) -> Result<(), EmulatorError> {
        let check = |target: &str| {
            if self.states.contains_key(target) {
                Ok(())
            } else {
                Err(EmulatorError::Validation(format!(
                    "transition to undefined state: {target}"
                )))
            }
        };
        check(&self.start_at)?;
        for state in self.states.values() {
            if let Some(next) = &state.next {
                check(next)?;
            }
            if let StateKind::Choice { choices, default } = &state.kind {
                for rule in choices {
                    if let Some(next) = &rule.next_state {
                        check(next)?;
                    }
                }
                if let Some(default) = default {
                    check(default)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_state(name: &str, body: &Value) -> Result<State, EmulatorError> {
    let state_type = body
        .get("Type")
        .and_then(Value::as_str)
        .ok_or_else(|| EmulatorError::Validation(format!("state {name} missing Type")))?;

    let kind = match state_type {
        "Pass" => StateKind::Pass {
            result: body.get("Result").cloned(),
        },
        "Succeed" => StateKind::Succeed,
        "Fail" => StateKind::Fail {
            error: body.get("Error").and_then(Value::as_str).map(str::to_string),
            cause: body.get("Cause").and_then(Value::as_str).map(str::to_string),
        },
        "Choice" => {
            let raw = body
                .get("Choices")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    EmulatorError::Validation(format!("choice state {name} missing Choices"))
                })?;
            let choices: Result<Vec<_>, _> = raw.iter().map(ChoiceRule::parse).collect();
            StateKind::Choice {
                choices: choices?,
                default: body
                    .get("Default")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        "Wait" => StateKind::Wait {
            seconds: body.get("Seconds").and_then(Value::as_f64),
            seconds_path: body
                .get("SecondsPath")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "Task" => StateKind::Task {
            resource: body
                .get("Resource")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    EmulatorError::Validation(format!("task state {name} missing Resource"))
                })?
                .to_string(),
        },
        other => {
            return Err(EmulatorError::Validation(format!(
                "unsupported state type {other} in state {name}"
            )))
        }
    };

    let next = body.get("Next").and_then(Value::as_str).map(str::to_string);
    let end = body.get("End").and_then(Value::as_bool).unwrap_or(false);
    let terminal = matches!(kind, StateKind::Succeed | StateKind::Fail { .. })
        || matches!(kind, StateKind::Choice { .. });
    if !terminal && next.is_none() && !end {
        return Err(EmulatorError::Validation(format!(
            "state {name} needs Next or End"
        )));
    }

    Ok(State {
        kind,
        next,
        end,
        input_path: PathSpec::parse(body.get("InputPath")),
        output_path: PathSpec::parse(body.get("OutputPath")),
        result_path: PathSpec::parse(body.get("ResultPath")),
        parameters: body.get("Parameters").cloned(),
        result_selector: body.get("ResultSelector").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_the_basic_state_types() {
        let def = StateMachineDef::parse(&json!({
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
        }))
        .unwrap();
        assert_eq!(def.start_at, "C");
        assert_eq!(def.states.len(), 3);
        assert!(matches!(def.states["C"].kind, StateKind::Choice { .. }));
    }

    #[test]
    fn rejects_undefined_transitions() {
        let err = StateMachineDef::parse(&json!({
            "StartAt": "A",
            "States": {"A": {"Type": "Pass", "Next": "Ghost"}, "B": {"Type": "Succeed"}}
        }))
        .unwrap_err();
        assert!(err.message().contains("Ghost"));
    }

    #[test]
    fn rejects_dangling_states() {
        assert!(StateMachineDef::parse(&json!({
            "StartAt": "A",
            "States": {"A": {"Type": "Pass"}}
        }))
        .is_err());
        assert!(StateMachineDef::parse(&json!({"States": {}})).is_err());
    }

    #[test]
    fn path_fields_distinguish_absent_from_null() {
        let def = StateMachineDef::parse(&json!({
            "StartAt": "A",
            "States": {
                "A": {"Type": "Pass", "ResultPath": null, "InputPath": "$.x", "End": true}
            }
        }))
        .unwrap();
        let state = &def.states["A"];
        assert_eq!(state.result_path, PathSpec::Null);
        assert_eq!(state.input_path, PathSpec::Path("$.x".into()));
        assert_eq!(state.output_path, PathSpec::Default);
    }
}
