//! JSON-path projection for state input/output processing.
//!
//! Supports the reference-path subset the interpreter needs: `$`, dotted
//! keys, and bracketed indices (`$.items[0].name`). `set_at_path` writes
//! into a deep copy, creating intermediate containers and padding lists
//! with nulls when an index exceeds the current length.

use serde_json::{Map, Value};

use nimbus_core::EmulatorError;

/// How a state declared one of its path fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSpec {
    /// Field absent: the default behaviour for that field.
    Default,
    /// Field explicitly `null`.
    Null,
    /// A reference path.
    Path(String),
}

impl PathSpec {
    pub fn parse(field: Option<&Value>) -> Self {
        match field {
            None => PathSpec::Default,
            Some(Value::Null) => PathSpec::Null,
            Some(Value::String(path)) => PathSpec::Path(path.clone()),
            Some(other) => PathSpec::Path(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_segments(path: &str) -> Result<Vec<Segment>, EmulatorError> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        if let Some(bracket) = part.find('[') {
            let (key, indices) = part.split_at(bracket);
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = indices;
            for chunk in rest.split('[').filter(|c| !c.is_empty()) {
                let Some(number) = chunk.strip_suffix(']') else {
                    return Err(EmulatorError::Validation(format!(
                        "malformed path segment: {part}"
                    )));
                };
                let index: usize = number.parse().map_err(|_| {
                    EmulatorError::Validation(format!("bad array index in path: {part}"))
                })?;
                segments.push(Segment::Index(index));
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    Ok(segments)
}

/// Resolve a reference path against data. Missing paths are errors; callers
/// decide whether that fails the state or falls back.
pub fn resolve_path(data: &Value, path: &str) -> Result<Value, EmulatorError> {
    if path == "$" {
        return Ok(data.clone());
    }
    let Some(stripped) = path.strip_prefix("$.") else {
        return Err(EmulatorError::Validation(format!(
            "reference path must start with $: {path}"
        )));
    };
    let mut current = data;
    for segment in parse_segments(stripped)? {
        current = match segment {
            Segment::Key(key) => current.get(&key).ok_or_else(|| {
                EmulatorError::Validation(format!("path {path} not found in input"))
            })?,
            Segment::Index(index) => current.get(index).ok_or_else(|| {
                EmulatorError::Validation(format!("path {path} not found in input"))
            })?,
        };
    }
    Ok(current.clone())
}

/// Apply InputPath or OutputPath semantics.
pub fn apply_selection_path(data: &Value, spec: &PathSpec) -> Result<Value, EmulatorError> {
    match spec {
        PathSpec::Default => Ok(data.clone()),
        PathSpec::Null => Ok(Value::Object(Map::new())),
        PathSpec::Path(path) => resolve_path(data, path),
    }
}

/// Apply ResultPath semantics: where the state result lands relative to the
/// state's raw input.
pub fn apply_result_path(
    input: &Value,
    result: Value,
    spec: &PathSpec,
) -> Result<Value, EmulatorError> {
    match spec {
        // Absent: the result replaces the input.
        PathSpec::Default => Ok(result),
        // Explicit null: discard the result, pass the input through.
        PathSpec::Null => Ok(input.clone()),
        PathSpec::Path(path) => set_at_path(input, path, result),
    }
}

/// Set a value at a reference path inside a deep copy of `data`.
pub fn set_at_path(data: &Value, path: &str, value: Value) -> Result<Value, EmulatorError> {
    if path == "$" {
        return Ok(value);
    }
    let Some(stripped) = path.strip_prefix("$.") else {
        return Err(EmulatorError::Validation(format!(
            "reference path must start with $: {path}"
        )));
    };
    let segments = parse_segments(stripped)?;
    if segments.is_empty() {
        return Ok(value);
    }

    let mut result = if data.is_object() || data.is_array() {
        data.clone()
    } else {
        Value::Object(Map::new())
    };
    set_nested(&mut result, &segments, value);
    Ok(result)
}

fn set_nested(data: &mut Value, segments: &[Segment], value: Value) {
    let mut current = data;
    for (i, segment) in segments[..segments.len() - 1].iter().enumerate() {
        let next_is_index = matches!(segments[i + 1], Segment::Index(_));
        current = ensure_container(current, segment, next_is_index);
    }
    match (&segments[segments.len() - 1], current) {
        (Segment::Index(index), Value::Array(items)) => {
            while items.len() <= *index {
                items.push(Value::Null);
            }
            items[*index] = value;
        }
        (Segment::Key(key), Value::Object(map)) => {
            map.insert(key.clone(), value);
        }
        _ => {}
    }
}

fn ensure_container<'a>(
    current: &'a mut Value,
    segment: &Segment,
    next_is_index: bool,
) -> &'a mut Value {
    match segment {
        Segment::Key(key) => {
            if let Value::Object(map) = current {
                let slot = map.entry(key.clone()).or_insert(Value::Null);
                if !(slot.is_object() || slot.is_array()) {
                    *slot = if next_is_index {
                        Value::Array(Vec::new())
                    } else {
                        Value::Object(Map::new())
                    };
                }
                slot
            } else {
                current
            }
        }
        Segment::Index(index) => {
            if let Value::Array(items) = current {
                while items.len() <= *index {
                    items.push(Value::Object(Map::new()));
                }
                &mut items[*index]
            } else {
                current
            }
        }
    }
}

/// Apply a Parameters (or ResultSelector) template. Keys ending in `.$`
/// resolve their value as a reference path against the input; values
/// starting with `$$` resolve against the context object.
pub fn apply_parameters(
    template: &Value,
    input: &Value,
    context: &Value,
) -> Result<Value, EmulatorError> {
    let Value::Object(template) = template else {
        return Ok(template.clone());
    };
    let mut out = Map::with_capacity(template.len());
    for (key, value) in template {
        if let Some(actual_key) = key.strip_suffix(".$") {
            let resolved = match value {
                Value::String(path) if path.starts_with("$$") => {
                    resolve_context_path(path, context)?
                }
                Value::String(path) => resolve_path(input, path)?,
                other => other.clone(),
            };
            out.insert(actual_key.to_string(), resolved);
        } else if value.is_object() {
            out.insert(key.clone(), apply_parameters(value, input, context)?);
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(out))
}

fn resolve_context_path(path: &str, context: &Value) -> Result<Value, EmulatorError> {
    if path == "$$" {
        return Ok(context.clone());
    }
    resolve_path(context, &format!("${}", &path[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_dotted_and_indexed_paths() {
        let data = json!({"a": {"b": [10, {"c": "deep"}]}});
        assert_eq!(resolve_path(&data, "$").unwrap(), data);
        assert_eq!(resolve_path(&data, "$.a.b[0]").unwrap(), json!(10));
        assert_eq!(resolve_path(&data, "$.a.b[1].c").unwrap(), json!("deep"));
        assert!(resolve_path(&data, "$.a.missing").is_err());
        assert!(resolve_path(&data, "a.b").is_err());
    }

    #[test]
    fn selection_path_variants() {
        let data = json!({"n": 1});
        assert_eq!(
            apply_selection_path(&data, &PathSpec::Default).unwrap(),
            data
        );
        assert_eq!(apply_selection_path(&data, &PathSpec::Null).unwrap(), json!({}));
        assert_eq!(
            apply_selection_path(&data, &PathSpec::Path("$.n".into())).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn result_path_identity_round_trip() {
        // InputPath=$ then ResultPath=$ then OutputPath=$ yields the raw
        // result.
        let input = json!({"original": true});
        let result = json!("the-result");
        let projected = apply_selection_path(&input, &PathSpec::Path("$".into())).unwrap();
        assert_eq!(projected, input);
        let after_result =
            apply_result_path(&input, result.clone(), &PathSpec::Path("$".into())).unwrap();
        assert_eq!(after_result, result);
        let output = apply_selection_path(&after_result, &PathSpec::Path("$".into())).unwrap();
        assert_eq!(output, result);
    }

    #[test]
    fn result_path_null_preserves_input() {
        let input = json!({"original": true});
        let out = apply_result_path(&input, json!("ignored"), &PathSpec::Null).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn result_path_sets_nested_location() {
        let input = json!({"order": {"id": 1}});
        let out = apply_result_path(
            &input,
            json!({"ok": true}),
            &PathSpec::Path("$.order.outcome".into()),
        )
        .unwrap();
        assert_eq!(out, json!({"order": {"id": 1, "outcome": {"ok": true}}}));
        // Original untouched.
        assert_eq!(input, json!({"order": {"id": 1}}));
    }

    #[test]
    fn set_at_path_extends_lists_with_nulls() {
        let input = json!({"items": ["a"]});
        let out = set_at_path(&input, "$.items[3]", json!("d")).unwrap();
        assert_eq!(out, json!({"items": ["a", null, null, "d"]}));
    }

    #[test]
    fn set_at_path_creates_intermediate_containers() {
        let out = set_at_path(&json!({}), "$.a.b[1].c", json!(5)).unwrap();
        assert_eq!(out, json!({"a": {"b": [{}, {"c": 5}]}}));
    }

    #[test]
    fn parameters_resolve_path_suffixes() {
        let input = json!({"user": {"name": "sam"}, "count": 3});
        let template = json!({
            "who.$": "$.user.name",
            "static": "x",
            "nested": {"n.$": "$.count"},
        });
        let out = apply_parameters(&template, &input, &json!({})).unwrap();
        assert_eq!(out, json!({"who": "sam", "static": "x", "nested": {"n": 3}}));
    }

    #[test]
    fn parameters_resolve_context_references() {
        let context = json!({"Execution": {"Id": "exec-1"}});
        let template = json!({"id.$": "$$.Execution.Id", "all.$": "$$"});
        let out = apply_parameters(&template, &json!({}), &context).unwrap();
        assert_eq!(out["id"], "exec-1");
        assert_eq!(out["all"], context);
    }

    #[test]
    fn parameters_missing_path_is_an_error() {
        let template = json!({"v.$": "$.not.there"});
        assert!(apply_parameters(&template, &json!({}), &json!({})).is_err());
    }
}
