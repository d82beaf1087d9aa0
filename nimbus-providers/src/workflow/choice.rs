//! Choice rule evaluation.
//!
//! Rules are evaluated in order; the first match wins. A rule is either a
//! comparison (Variable + operator + operand) or a logical combinator
//! (And / Or / Not). A missing variable makes every comparison false,
//! except `IsPresent` which answers `!expected`.

use serde_json::Value;

use nimbus_core::EmulatorError;

use super::paths::resolve_path;

const COMPARISON_OPERATORS: &[&str] = &[
    "StringEquals",
    "StringLessThan",
    "StringGreaterThan",
    "StringLessThanEquals",
    "StringGreaterThanEquals",
    "NumericEquals",
    "NumericLessThan",
    "NumericGreaterThan",
    "NumericLessThanEquals",
    "NumericGreaterThanEquals",
    "BooleanEquals",
    "TimestampEquals",
    "TimestampLessThan",
    "TimestampGreaterThan",
    "TimestampLessThanEquals",
    "TimestampGreaterThanEquals",
    "IsNull",
    "IsPresent",
    "IsString",
    "IsNumeric",
    "IsBoolean",
];

/// One parsed choice rule.
#[derive(Debug, Clone)]
pub struct ChoiceRule {
    pub variable: Option<String>,
    pub operator: Option<String>,
    pub operand: Option<Value>,
    pub and_rules: Option<Vec<ChoiceRule>>,
    pub or_rules: Option<Vec<ChoiceRule>>,
    pub not_rule: Option<Box<ChoiceRule>>,
    /// Only top-level rules carry a transition.
    pub next_state: Option<String>,
}

impl ChoiceRule {
    pub fn parse(value: &Value) -> Result<Self, EmulatorError> {
        let Value::Object(map) = value else {
            return Err(EmulatorError::Validation("choice rule must be an object".into()));
        };

        let next_state = map.get("Next").and_then(Value::as_str).map(str::to_string);

        if let Some(Value::Array(rules)) = map.get("And") {
            let parsed: Result<Vec<_>, _> = rules.iter().map(ChoiceRule::parse).collect();
            return Ok(Self::combinator(next_state, Some(parsed?), None, None));
        }
        if let Some(Value::Array(rules)) = map.get("Or") {
            let parsed: Result<Vec<_>, _> = rules.iter().map(ChoiceRule::parse).collect();
            return Ok(Self::combinator(next_state, None, Some(parsed?), None));
        }
        if let Some(rule) = map.get("Not") {
            let parsed = ChoiceRule::parse(rule)?;
            return Ok(Self::combinator(next_state, None, None, Some(Box::new(parsed))));
        }

        let variable = map
            .get("Variable")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut operator = None;
        let mut operand = None;
        for candidate in COMPARISON_OPERATORS {
            if let Some(value) = map.get(*candidate) {
                operator = Some(candidate.to_string());
                operand = Some(value.clone());
                break;
            }
        }
        if variable.is_none() || operator.is_none() {
            return Err(EmulatorError::Validation(
                "choice rule needs Variable and a comparison operator".into(),
            ));
        }

        Ok(Self {
            variable,
            operator,
            operand,
            and_rules: None,
            or_rules: None,
            not_rule: None,
            next_state,
        })
    }

    fn combinator(
        next_state: Option<String>,
        and_rules: Option<Vec<ChoiceRule>>,
        or_rules: Option<Vec<ChoiceRule>>,
        not_rule: Option<Box<ChoiceRule>>,
    ) -> Self {
        Self {
            variable: None,
            operator: None,
            operand: None,
            and_rules,
            or_rules,
            not_rule,
            next_state,
        }
    }
}

/// Evaluate rules in order; the first match's `Next` wins. `None` means the
/// caller falls back to `Default`.
pub fn evaluate_choice_rules(rules: &[ChoiceRule], input: &Value) -> Option<String> {
    rules
        .iter()
        .find(|rule| evaluate_rule(rule, input))
        .and_then(|rule| rule.next_state.clone())
}

pub fn evaluate_rule(rule: &ChoiceRule, input: &Value) -> bool {
    if let Some(and_rules) = &rule.and_rules {
        return and_rules.iter().all(|r| evaluate_rule(r, input));
    }
    if let Some(or_rules) = &rule.or_rules {
        return or_rules.iter().any(|r| evaluate_rule(r, input));
    }
    if let Some(not_rule) = &rule.not_rule {
        return !evaluate_rule(not_rule, input);
    }

    let (Some(variable), Some(operator)) = (&rule.variable, &rule.operator) else {
        return false;
    };
    let operand = rule.operand.as_ref().unwrap_or(&Value::Null);

    let actual = match resolve_path(input, variable) {
        Ok(value) => value,
        Err(_) => return missing_variable(operator, operand),
    };
    dispatch_operator(operator, &actual, operand)
}

fn missing_variable(operator: &str, operand: &Value) -> bool {
    if operator == "IsPresent" {
        return !operand.as_bool().unwrap_or(false);
    }
    false
}

fn dispatch_operator(operator: &str, actual: &Value, expected: &Value) -> bool {
    match operator {
        "StringEquals" => string_cmp(actual, expected, |o| o == std::cmp::Ordering::Equal),
        "StringLessThan" => string_cmp(actual, expected, |o| o == std::cmp::Ordering::Less),
        "StringGreaterThan" => string_cmp(actual, expected, |o| o == std::cmp::Ordering::Greater),
        "StringLessThanEquals" => string_cmp(actual, expected, |o| o != std::cmp::Ordering::Greater),
        "StringGreaterThanEquals" => string_cmp(actual, expected, |o| o != std::cmp::Ordering::Less),
        "BooleanEquals" => match (actual.as_bool(), expected.as_bool()) {
            (Some(a), Some(e)) => a == e,
            _ => false,
        },
        "IsPresent" => expected.as_bool() == Some(true),
        "IsNull" => actual.is_null() == expected.as_bool().unwrap_or(false),
        "IsString" => actual.is_string() == expected.as_bool().unwrap_or(false),
        "IsNumeric" => actual.is_number() == expected.as_bool().unwrap_or(false),
        "IsBoolean" => actual.is_boolean() == expected.as_bool().unwrap_or(false),
        op if op.starts_with("Numeric") => numeric_cmp(op, actual, expected),
        // Timestamps compare as ISO-8601 strings.
        op if op.starts_with("Timestamp") => timestamp_cmp(op, actual, expected),
        _ => false,
    }
}

fn string_cmp(
    actual: &Value,
    expected: &Value,
    check: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(e)) => check(a.cmp(e)),
        _ => false,
    }
}

fn numeric_cmp(operator: &str, actual: &Value, expected: &Value) -> bool {
    let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) else {
        return false;
    };
    match operator {
        "NumericEquals" => a == e,
        "NumericLessThan" => a < e,
        "NumericGreaterThan" => a > e,
        "NumericLessThanEquals" => a <= e,
        "NumericGreaterThanEquals" => a >= e,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn timestamp_cmp(operator: &str, actual: &Value, expected: &Value) -> bool {
    let (Some(a), Some(e)) = (actual.as_str(), expected.as_str()) else {
        return false;
    };
    match operator {
        "TimestampEquals" => a == e,
        "TimestampLessThan" => a < e,
        "TimestampGreaterThan" => a > e,
        "TimestampLessThanEquals" => a <= e,
        "TimestampGreaterThanEquals" => a >= e,
        _ => false,
    }
}
