//! Intrinsic marker resolution.
//!
//! Resource properties may contain markers (`Ref`, `Fn::GetAtt`, `Fn::Join`,
//! `Fn::Sub`, `Fn::Select`, `Fn::If`) that must be substituted with the
//! concrete local values registered at startup. Markers are evaluated
//! bottom-up; anything that cannot be resolved degrades to a stand-in value
//! with a warning rather than failing the whole assembly.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use nimbus_core::{LOCAL_ACCOUNT_ID, LOCAL_REGION};

use crate::node::ResourceKind;

fn sub_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex"))
}

/// Resolves intrinsic markers against the registered resource values.
#[derive(Default)]
pub struct IntrinsicResolver {
    resource_map: HashMap<String, String>,
    resource_kinds: HashMap<String, ResourceKind>,
    conditions: HashMap<String, bool>,
}

impl IntrinsicResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(mut self, resource_map: HashMap<String, String>) -> Self {
        self.resource_map = resource_map;
        self
    }

    pub fn with_kinds(mut self, resource_kinds: HashMap<String, ResourceKind>) -> Self {
        self.resource_kinds = resource_kinds;
        self
    }

    pub fn with_conditions(mut self, conditions: HashMap<String, bool>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Fully substitute a property tree.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                if let Some(resolved) = self.try_intrinsic(map) {
                    return resolved;
                }
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            other => other.clone(),
        }
    }

    /// Resolve an environment-variable map into plain strings.
    pub fn resolve_env(&self, env: &Value) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Value::Object(map) = env {
            for (key, value) in map {
                out.insert(key.clone(), stringify(&self.resolve(value)));
            }
        }
        out
    }

    fn try_intrinsic(&self, map: &Map<String, Value>) -> Option<Value> {
        if map.len() != 1 {
            return None;
        }
        let (key, args) = map.iter().next()?;
        match key.as_str() {
            "Ref" => Some(self.resolve_ref(args)),
            "Fn::GetAtt" => Some(self.resolve_get_att(args)),
            "Fn::Join" => Some(self.resolve_join(args)),
            "Fn::Sub" => Some(self.resolve_sub(args)),
            "Fn::Select" => Some(self.resolve_select(args)),
            "Fn::If" => Some(self.resolve_if(args)),
            _ => None,
        }
    }

    fn resolve_ref(&self, args: &Value) -> Value {
        let Value::String(name) = args else {
            tracing::warn!(args = %args, "Unresolvable Ref");
            return Value::String(stringify(args));
        };
        if let Some(pseudo) = pseudo_parameter(name) {
            return Value::String(pseudo.to_string());
        }
        if let Some(value) = self.resource_map.get(name) {
            return Value::String(value.clone());
        }
        Value::String(self.standin_arn(name))
    }

    fn resolve_get_att(&self, args: &Value) -> Value {
        let (logical_id, attribute) = match args {
            Value::Array(items) if items.len() == 2 => {
                match (items[0].as_str(), items[1].as_str()) {
                    (Some(id), Some(attr)) => (id.to_string(), attr.to_string()),
                    _ => {
                        tracing::warn!(args = %args, "Unresolvable Fn::GetAtt");
                        return Value::String(stringify(args));
                    }
                }
            }
            Value::String(dotted) => match dotted.split_once('.') {
                Some((id, attr)) => (id.to_string(), attr.to_string()),
                None => {
                    tracing::warn!(args = %args, "Unresolvable Fn::GetAtt");
                    return Value::String(dotted.clone());
                }
            },
            other => {
                tracing::warn!(args = %other, "Unresolvable Fn::GetAtt");
                return Value::String(stringify(other));
            }
        };

        let composite = format!("{logical_id}.{attribute}");
        if let Some(value) = self.resource_map.get(&composite) {
            return Value::String(value.clone());
        }
        if let Some(value) = self.resource_map.get(&logical_id) {
            return Value::String(format!("{value}.{attribute}"));
        }
        Value::String(format!("{}.{attribute}", self.standin_arn(&logical_id)))
    }

    fn resolve_join(&self, args: &Value) -> Value {
        let Value::Array(items) = args else {
            tracing::warn!(args = %args, "Unresolvable Fn::Join");
            return Value::String(stringify(args));
        };
        let (Some(Value::String(delimiter)), Some(Value::Array(parts))) =
            (items.first(), items.get(1))
        else {
            tracing::warn!(args = %args, "Unresolvable Fn::Join");
            return Value::String(stringify(args));
        };
        let resolved: Vec<String> = parts.iter().map(|p| stringify(&self.resolve(p))).collect();
        Value::String(resolved.join(delimiter))
    }

    fn resolve_sub(&self, args: &Value) -> Value {
        match args {
            Value::String(template) => {
                Value::String(self.substitute(template, &HashMap::new()))
            }
            Value::Array(items) if items.len() == 2 => {
                let Some(template) = items[0].as_str() else {
                    tracing::warn!(args = %args, "Unresolvable Fn::Sub");
                    return Value::String(stringify(args));
                };
                let mut locals = HashMap::new();
                if let Value::Object(vars) = &items[1] {
                    for (name, value) in vars {
                        locals.insert(name.clone(), stringify(&self.resolve(value)));
                    }
                }
                Value::String(self.substitute(template, &locals))
            }
            other => {
                tracing::warn!(args = %other, "Unresolvable Fn::Sub");
                Value::String(stringify(other))
            }
        }
    }

    fn substitute(&self, template: &str, locals: &HashMap<String, String>) -> String {
        sub_placeholder_re()
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                if let Some(value) = locals.get(name) {
                    return value.clone();
                }
                if let Some(pseudo) = pseudo_parameter(name) {
                    return pseudo.to_string();
                }
                if let Some(value) = self.resource_map.get(name) {
                    return value.clone();
                }
                tracing::warn!(placeholder = name, "unresolvable Fn::Sub placeholder kept");
                caps[0].to_string()
            })
            .into_owned()
    }

    fn resolve_select(&self, args: &Value) -> Value {
        let Value::Array(items) = args else {
            tracing::warn!(args = %args, "Unresolvable Fn::Select");
            return Value::String(stringify(args));
        };
        let (Some(index), Some(Value::Array(options))) = (items.first(), items.get(1)) else {
            tracing::warn!(args = %args, "Unresolvable Fn::Select");
            return Value::String(stringify(args));
        };
        let idx = match index {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        };
        match idx {
            Some(i) if (i as usize) < options.len() => self.resolve(&options[i as usize]),
            _ => {
                tracing::warn!(index = %index, len = options.len(), "Fn::Select index out of range");
                Value::String(String::new())
            }
        }
    }

    fn resolve_if(&self, args: &Value) -> Value {
        let Value::Array(items) = args else {
            tracing::warn!(args = %args, "Unresolvable Fn::If");
            return Value::String(stringify(args));
        };
        let (Some(name), Some(then_branch), Some(else_branch)) =
            (items.first().and_then(Value::as_str), items.get(1), items.get(2))
        else {
            tracing::warn!(args = %args, "Unresolvable Fn::If");
            return Value::String(stringify(args));
        };
        // Unknown conditions default to the then-branch.
        let predicate = self.conditions.get(name).copied().unwrap_or(true);
        if predicate {
            self.resolve(then_branch)
        } else {
            self.resolve(else_branch)
        }
    }

    fn standin_arn(&self, logical_id: &str) -> String {
        match self.resource_kinds.get(logical_id) {
            Some(kind) => format!(
                "arn:nimbus:{}:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:{}/{logical_id}",
                kind.service_slug(),
                kind.arn_noun(),
            ),
            None => {
                tracing::warn!(logical_id, "unknown reference, synthesizing stand-in arn");
                format!(
                    "arn:nimbus:unknown:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:resource/{logical_id}"
                )
            }
        }
    }
}

/// Collapse a resolved value into the string form used by joins, subs, and
/// environment variables.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Fixed local defaults for pseudo-parameters.
fn pseudo_parameter(name: &str) -> Option<&'static str> {
    match name {
        "AWS::AccountId" => Some(LOCAL_ACCOUNT_ID),
        "AWS::Region" => Some(LOCAL_REGION),
        "AWS::Partition" => Some("aws"),
        "AWS::StackName" => Some("local-stack"),
        "AWS::URLSuffix" => Some("localhost"),
        "AWS::NoValue" => Some(""),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver_with(resources: &[(&str, &str)]) -> IntrinsicResolver {
        IntrinsicResolver::new().with_resources(
            resources
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn pseudo_parameters_resolve_to_local_defaults() {
        let r = IntrinsicResolver::new();
        assert_eq!(r.resolve(&json!({"Ref": "AWS::AccountId"})), json!("000000000000"));
        assert_eq!(r.resolve(&json!({"Ref": "AWS::Region"})), json!("local"));
    }

    #[test]
    fn ref_uses_registered_value() {
        let r = resolver_with(&[("MyBucket", "my-local-bucket")]);
        assert_eq!(r.resolve(&json!({"Ref": "MyBucket"})), json!("my-local-bucket"));
    }

    #[test]
    fn ref_with_known_kind_synthesizes_standin_arn() {
        let r = IntrinsicResolver::new().with_kinds(
            [("MyFunc".to_string(), ResourceKind::Function)].into_iter().collect(),
        );
        assert_eq!(
            r.resolve(&json!({"Ref": "MyFunc"})),
            json!("arn:nimbus:lambda:local:000000000000:function/MyFunc")
        );
    }

    #[test]
    fn ref_unknown_kind_synthesizes_unknown_arn() {
        let r = IntrinsicResolver::new();
        assert_eq!(
            r.resolve(&json!({"Ref": "SomeLogicalId"})),
            json!("arn:nimbus:unknown:local:000000000000:resource/SomeLogicalId")
        );
    }

    #[test]
    fn get_att_list_and_string_forms() {
        let r = resolver_with(&[("MyTable", "orders-table")]);
        assert_eq!(
            r.resolve(&json!({"Fn::GetAtt": ["MyTable", "Arn"]})),
            json!("orders-table.Arn")
        );
        assert_eq!(
            r.resolve(&json!({"Fn::GetAtt": "MyTable.StreamArn"})),
            json!("orders-table.StreamArn")
        );
    }

    #[test]
    fn get_att_composite_key_wins() {
        let r = resolver_with(&[
            ("MyTable", "orders-table"),
            ("MyTable.Arn", "arn:nimbus:dynamodb:local:000000000000:table/orders"),
        ]);
        assert_eq!(
            r.resolve(&json!({"Fn::GetAtt": ["MyTable", "Arn"]})),
            json!("arn:nimbus:dynamodb:local:000000000000:table/orders")
        );
    }

    #[test]
    fn get_att_unknown_generates_standin() {
        let r = IntrinsicResolver::new().with_kinds(
            [("Tbl".to_string(), ResourceKind::KvTable)].into_iter().collect(),
        );
        assert_eq!(
            r.resolve(&json!({"Fn::GetAtt": ["Tbl", "Arn"]})),
            json!("arn:nimbus:dynamodb:local:000000000000:table/Tbl.Arn")
        );
    }

    #[test]
    fn sub_short_form_resolves_pseudo_and_resources() {
        let r = resolver_with(&[("MyFunc", "my-function")]);
        let result = r.resolve(&json!({
            "Fn::Sub": "arn:aws:lambda:${AWS::Region}:${AWS::AccountId}:${MyFunc}"
        }));
        assert_eq!(result, json!("arn:aws:lambda:local:000000000000:my-function"));
    }

    #[test]
    fn sub_long_form_with_locals() {
        let r = IntrinsicResolver::new();
        let result = r.resolve(&json!({"Fn::Sub": ["Hello ${Name}", {"Name": "World"}]}));
        assert_eq!(result, json!("Hello World"));
    }

    #[test]
    fn sub_locals_may_be_nested_intrinsics() {
        let r = resolver_with(&[("Bucket", "local-bucket")]);
        let result =
            r.resolve(&json!({"Fn::Sub": ["s3://${BucketRef}", {"BucketRef": {"Ref": "Bucket"}}]}));
        assert_eq!(result, json!("s3://local-bucket"));
    }

    #[test]
    fn sub_unresolvable_placeholder_is_preserved() {
        let r = IntrinsicResolver::new();
        let result = r.resolve(&json!({"Fn::Sub": "prefix-${Unknown}"}));
        assert_eq!(result, json!("prefix-${Unknown}"));
    }

    #[test]
    fn join_basic_and_with_refs() {
        let r = resolver_with(&[("X", "hello")]);
        assert_eq!(
            r.resolve(&json!({"Fn::Join": ["-", ["a", "b", "c"]]})),
            json!("a-b-c")
        );
        assert_eq!(
            r.resolve(&json!({"Fn::Join": ["/", ["prefix", {"Ref": "X"}, "suffix"]]})),
            json!("prefix/hello/suffix")
        );
        assert_eq!(
            r.resolve(&json!({"Fn::Join": ["", ["abc", "def"]]})),
            json!("abcdef")
        );
    }

    #[test]
    fn select_in_and_out_of_range() {
        let r = IntrinsicResolver::new();
        assert_eq!(r.resolve(&json!({"Fn::Select": [1, ["a", "b", "c"]]})), json!("b"));
        assert_eq!(r.resolve(&json!({"Fn::Select": [0, ["first", "second"]]})), json!("first"));
        assert_eq!(r.resolve(&json!({"Fn::Select": [5, ["a"]]})), json!(""));
    }

    #[test]
    fn if_branches_and_unknown_condition() {
        let r = IntrinsicResolver::new()
            .with_conditions([("IsProd".to_string(), true)].into_iter().collect());
        assert_eq!(
            r.resolve(&json!({"Fn::If": ["IsProd", "prod-value", "dev-value"]})),
            json!("prod-value")
        );

        let r = IntrinsicResolver::new()
            .with_conditions([("IsProd".to_string(), false)].into_iter().collect());
        assert_eq!(
            r.resolve(&json!({"Fn::If": ["IsProd", "prod-value", "dev-value"]})),
            json!("dev-value")
        );

        let r = IntrinsicResolver::new();
        assert_eq!(r.resolve(&json!({"Fn::If": ["UnknownCond", "yes", "no"]})), json!("yes"));
    }

    #[test]
    fn nested_intrinsics_resolve_bottom_up() {
        let r = resolver_with(&[("Fn", "my-func")]);
        let result = r.resolve(&json!({
            "Fn::Join": [":", [{"Fn::Sub": "arn:aws:lambda:${AWS::Region}"}, {"Ref": "Fn"}]]
        }));
        assert_eq!(result, json!("arn:aws:lambda:local:my-func"));

        let r = resolver_with(&[("B", "bucket")])
            .with_conditions([("Go".to_string(), true)].into_iter().collect());
        let result = r.resolve(&json!({
            "Fn::If": ["Go", {"Fn::Join": ["/", ["s3:", {"Ref": "B"}]]}, "fallback"]
        }));
        assert_eq!(result, json!("s3:/bucket"));
    }

    #[test]
    fn plain_structures_pass_through_element_wise() {
        let r = resolver_with(&[("X", "val"), ("A", "a_val")]);
        assert_eq!(r.resolve(&json!("hello")), json!("hello"));
        assert_eq!(r.resolve(&json!(42)), json!(42));
        assert_eq!(
            r.resolve(&json!({"Key": {"Ref": "X"}, "Other": "literal"})),
            json!({"Key": "val", "Other": "literal"})
        );
        assert_eq!(r.resolve(&json!([{"Ref": "A"}, "plain"])), json!(["a_val", "plain"]));
    }

    #[test]
    fn env_maps_resolve_to_plain_strings() {
        let r = resolver_with(&[("Table", "orders")]);
        let env = json!({
            "TABLE_NAME": {"Ref": "Table"},
            "LIMIT": 25,
            "LITERAL": "x",
        });
        let resolved = r.resolve_env(&env);
        assert_eq!(resolved["TABLE_NAME"], "orders");
        assert_eq!(resolved["LIMIT"], "25");
        assert_eq!(resolved["LITERAL"], "x");
    }
}
