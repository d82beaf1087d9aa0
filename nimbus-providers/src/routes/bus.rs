//! Event bus wire surface (JSON-target dialect).

use std::sync::Arc;

use axum::Router;
use serde_json::{json, Value};

use nimbus_core::EmulatorError;
use nimbus_wire::TargetDispatcher;

use crate::bus::{BusTarget, EventBusProvider};

/// Build the event bus app.
pub fn create_bus_app(provider: Arc<EventBusProvider>) -> Router {
    let mut dispatcher = TargetDispatcher::new("AWSEvents");

    let for_put_events = provider.clone();
    dispatcher.register("PutEvents", move |body, _ctx| {
        let provider = for_put_events.clone();
        async move {
            let entries = body
                .get("Entries")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let results = provider.put_events(entries)?;
            Ok(json!({"Entries": results, "FailedEntryCount": 0}))
        }
    });

    let for_put_rule = provider.clone();
    dispatcher.register("PutRule", move |body, _ctx| {
        let provider = for_put_rule.clone();
        async move {
            let name = body
                .get("Name")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing rule Name".into()))?;
            let bus = body.get("EventBusName").and_then(Value::as_str);
            // The SDK sends the pattern as a JSON string.
            let pattern = match body.get("EventPattern") {
                Some(Value::String(s)) => Some(serde_json::from_str(s)?),
                Some(other) => Some(other.clone()),
                None => None,
            };
            let schedule = body
                .get("ScheduleExpression")
                .and_then(Value::as_str)
                .map(str::to_string);
            let arn = provider.put_rule(name, bus, pattern, schedule)?;
            Ok(json!({"RuleArn": arn}))
        }
    });

    let for_put_targets = provider.clone();
    dispatcher.register("PutTargets", move |body, _ctx| {
        let provider = for_put_targets.clone();
        async move {
            let rule = body
                .get("Rule")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing Rule".into()))?;
            let targets = body
                .get("Targets")
                .and_then(Value::as_array)
                .map(|targets| {
                    targets
                        .iter()
                        .map(|t| BusTarget {
                            id: t.get("Id").and_then(Value::as_str).unwrap_or_default().to_string(),
                            arn: t.get("Arn").and_then(Value::as_str).unwrap_or_default().to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            provider.put_targets(rule, targets)?;
            Ok(json!({"FailedEntryCount": 0, "FailedEntries": []}))
        }
    });

    let for_list_rules = provider.clone();
    dispatcher.register("ListRules", move |body, _ctx| {
        let provider = for_list_rules.clone();
        async move {
            let bus = body
                .get("EventBusName")
                .and_then(Value::as_str)
                .unwrap_or("default");
            let rules: Vec<Value> = provider
                .list_rules(bus)
                .into_iter()
                .map(|(name, pattern, schedule, enabled)| {
                    let state = if enabled { "ENABLED" } else { "DISABLED" };
                    let mut entry = json!({
                        "Name": name,
                        "EventBusName": bus,
                        "State": state,
                    });
                    if let Some(pattern) = pattern {
                        entry["EventPattern"] = json!(pattern.to_string());
                    }
                    if let Some(schedule) = schedule {
                        entry["ScheduleExpression"] = json!(schedule);
                    }
                    entry
                })
                .collect();
            Ok(json!({"Rules": rules}))
        }
    });

    let for_list_buses = provider.clone();
    dispatcher.register("ListEventBuses", move |_body, _ctx| {
        let provider = for_list_buses.clone();
        async move {
            let buses: Vec<Value> = provider
                .list_buses()
                .into_iter()
                .map(|(name, arn)| json!({"Name": name, "Arn": arn}))
                .collect();
            Ok(json!({"EventBuses": buses}))
        }
    });

    let for_delete_rule = provider.clone();
    dispatcher.register("DeleteRule", move |body, _ctx| {
        let provider = for_delete_rule.clone();
        async move {
            let name = body
                .get("Name")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing rule Name".into()))?;
            provider.delete_rule(name)?;
            Ok(json!({}))
        }
    });

    dispatcher.into_router()
}
