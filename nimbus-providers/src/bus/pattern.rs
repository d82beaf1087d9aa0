//! Event pattern matching.
//!
//! A pattern is a JSON object whose keys map to condition lists (or nested
//! sub-patterns). Every pattern key must match; within one key's condition
//! list, one match suffices. Supported conditions: exact value, prefix,
//! numeric comparisons, exists tests, and anything-but exclusions.
//!
//! A JSON `null` event value is treated as an absent key: it matches
//! `{"exists": false}` and fails every value condition.

use serde_json::Value;

/// Does `event` match `pattern`? An empty pattern matches everything.
pub fn match_event(pattern: &Value, event: &Value) -> bool {
    let Value::Object(pattern) = pattern else {
        return false;
    };
    if pattern.is_empty() {
        return true;
    }
    let empty = Value::Object(Default::default());
    let event = if event.is_object() { event } else { &empty };

    pattern.iter().all(|(key, conditions)| {
        let event_value = event.get(key).filter(|v| !v.is_null());
        key_matches(conditions, event_value)
    })
}

fn key_matches(conditions: &Value, event_value: Option<&Value>) -> bool {
    match conditions {
        // Nested sub-pattern: recurse into the event value.
        Value::Object(_) => match event_value {
            Some(nested @ Value::Object(_)) => match_event(conditions, nested),
            _ => false,
        },
        Value::Array(list) => list
            .iter()
            .any(|condition| condition_matches(condition, event_value)),
        _ => false,
    }
}

fn condition_matches(condition: &Value, event_value: Option<&Value>) -> bool {
    match condition {
        Value::Object(map) => {
            if let Some(expected) = map.get("exists").and_then(Value::as_bool) {
                return event_value.is_some() == expected;
            }
            if let Some(prefix) = map.get("prefix").and_then(Value::as_str) {
                return event_value
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.starts_with(prefix));
            }
            if let Some(Value::Array(operators)) = map.get("numeric") {
                return numeric_matches(operators, event_value);
            }
            if let Some(exclusions) = map.get("anything-but") {
                return anything_but_matches(exclusions, event_value);
            }
            false
        }
        // Exact value match (string, number, boolean).
        exact => event_value.is_some_and(|v| v == exact),
    }
}

/// `{"numeric": [">=", 100, "<", 200]}`: alternating operator/operand
/// pairs, all of which must hold.
fn numeric_matches(operators: &[Value], event_value: Option<&Value>) -> bool {
    let Some(value) = event_value.and_then(as_number) else {
        return false;
    };
    let mut i = 0;
    while i + 1 < operators.len() {
        let Some(op) = operators[i].as_str() else {
            return false;
        };
        let Some(operand) = as_number(&operators[i + 1]) else {
            return false;
        };
        let holds = match op {
            "=" => value == operand,
            ">" => value > operand,
            ">=" => value >= operand,
            "<" => value < operand,
            "<=" => value <= operand,
            _ => false,
        };
        if !holds {
            return false;
        }
        i += 2;
    }
    true
}

fn anything_but_matches(exclusions: &Value, event_value: Option<&Value>) -> bool {
    let Some(value) = event_value else {
        return false;
    };
    match exclusions {
        Value::Array(list) => list.iter().all(|excluded| value != excluded),
        single => value != single,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
