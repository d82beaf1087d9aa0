//! Graph construction from a parsed resource list.
//!
//! Two-pass build: first every logical identifier becomes a node, then
//! property trees are scanned for references so edges can point at resources
//! declared later in the template. Edge direction is depends-on: the source
//! starts after the target.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use nimbus_core::EmulatorError;

use crate::assembly::CfnResource;
use crate::graph::AppGraph;
use crate::node::{EdgeRelation, ResourceEdge, ResourceKind, ResourceNode};

/// Build the application graph from the declared resources.
pub fn build_graph(resources: &[CfnResource]) -> Result<AppGraph, EmulatorError> {
    let mut graph = AppGraph::new();
    for resource in resources {
        let kind = ResourceKind::from_resource_type(&resource.resource_type);
        // Template metadata (asset paths, mostly) rides along in the
        // property bag under its own key.
        let mut properties = resource.properties.clone();
        if let Some(metadata) = &resource.metadata {
            if properties.is_null() {
                properties = Value::Object(Default::default());
            }
            if let Value::Object(map) = &mut properties {
                map.insert("Metadata".to_string(), metadata.clone());
            }
        }
        graph.add_node(ResourceNode::new(
            resource.logical_id.clone(),
            kind,
            properties,
        ))?;
    }

    let kinds: HashMap<&str, ResourceKind> = resources
        .iter()
        .map(|r| {
            (
                r.logical_id.as_str(),
                ResourceKind::from_resource_type(&r.resource_type),
            )
        })
        .collect();

    for resource in resources {
        let source = resource.logical_id.as_str();
        let source_kind = &kinds[source];
        let referenced = collect_referenced_ids(&resource.properties, &kinds);

        for target in &referenced {
            let relation = relation_for(source_kind, &kinds[target.as_str()]);
            graph.add_edge(ResourceEdge::new(source, target.clone(), relation))?;
        }

        add_trigger_edges(&mut graph, resource, source_kind, &referenced, &kinds)?;
    }

    Ok(graph)
}

/// Relation used for a plain property reference.
fn relation_for(source: &ResourceKind, target: &ResourceKind) -> EdgeRelation {
    let storage_like = matches!(
        target,
        ResourceKind::KvTable
            | ResourceKind::ObjectBucket
            | ResourceKind::MessageQueue
            | ResourceKind::PubSubTopic
            | ResourceKind::EventBus
            | ResourceKind::Workflow
    );
    if matches!(source, ResourceKind::Function) && storage_like {
        EdgeRelation::DataDependency
    } else {
        EdgeRelation::References
    }
}

/// Kind-specific trigger and subscription edges.
fn add_trigger_edges(
    graph: &mut AppGraph,
    resource: &CfnResource,
    source_kind: &ResourceKind,
    referenced: &[String],
    kinds: &HashMap<&str, ResourceKind>,
) -> Result<(), EmulatorError> {
    let source = resource.logical_id.as_str();
    match source_kind {
        // queue -> function wiring: the mapping starts after both ends.
        ResourceKind::EventSourceMapping => {
            for target in referenced {
                let relation = match kinds[target.as_str()] {
                    ResourceKind::Function => EdgeRelation::Triggers,
                    _ => EdgeRelation::Subscribes,
                };
                graph.add_edge(ResourceEdge::new(source, target.clone(), relation))?;
            }
        }
        // rule -> target functions, rule -> bus.
        ResourceKind::EventRule => {
            for target in referenced {
                let relation = match kinds[target.as_str()] {
                    ResourceKind::Function | ResourceKind::Workflow => EdgeRelation::Triggers,
                    ResourceKind::EventBus => EdgeRelation::Subscribes,
                    _ => EdgeRelation::References,
                };
                graph.add_edge(ResourceEdge::new(source, target.clone(), relation))?;
            }
        }
        // bucket notifications: the bucket dispatches into functions, so the
        // functions must be up first.
        ResourceKind::ObjectBucket => {
            if resource.properties.get("NotificationConfiguration").is_some() {
                for target in referenced {
                    if matches!(kinds[target.as_str()], ResourceKind::Function) {
                        graph.add_edge(ResourceEdge::new(
                            source,
                            target.clone(),
                            EdgeRelation::Subscribes,
                        ))?;
                    }
                }
            }
        }
        ResourceKind::Unknown(type_name) => {
            add_route_edges(graph, type_name, referenced, kinds)?;
            if type_name == "AWS::SNS::Subscription" {
                for target in referenced {
                    let relation = match kinds[target.as_str()] {
                        ResourceKind::PubSubTopic => EdgeRelation::Subscribes,
                        ResourceKind::Function => EdgeRelation::Triggers,
                        _ => EdgeRelation::References,
                    };
                    graph.add_edge(ResourceEdge::new(source, target.clone(), relation))?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Gateway methods/routes link an API node to a function: the API triggers
/// the function, so the function must start first.
fn add_route_edges(
    graph: &mut AppGraph,
    type_name: &str,
    referenced: &[String],
    kinds: &HashMap<&str, ResourceKind>,
) -> Result<(), EmulatorError> {
    let is_route = matches!(
        type_name,
        "AWS::ApiGateway::Method" | "AWS::ApiGatewayV2::Route" | "AWS::ApiGatewayV2::Integration"
    );
    if !is_route {
        return Ok(());
    }
    let apis: Vec<&String> = referenced
        .iter()
        .filter(|id| {
            matches!(
                kinds[id.as_str()],
                ResourceKind::ApiGatewayV1 | ResourceKind::ApiGatewayV2
            )
        })
        .collect();
    let functions: Vec<&String> = referenced
        .iter()
        .filter(|id| matches!(kinds[id.as_str()], ResourceKind::Function))
        .collect();
    for api in &apis {
        for function in &functions {
            graph.add_edge(ResourceEdge::new(
                (*api).clone(),
                (*function).clone(),
                EdgeRelation::Triggers,
            ))?;
        }
    }
    Ok(())
}

/// Collect logical identifiers referenced by `Ref` / `Fn::GetAtt` markers,
/// in discovery order, deduplicated, restricted to declared resources.
pub fn collect_referenced_ids(
    properties: &Value,
    kinds: &HashMap<&str, ResourceKind>,
) -> Vec<String> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    walk_refs(properties, kinds, &mut found, &mut seen);
    found
}

fn walk_refs(
    value: &Value,
    kinds: &HashMap<&str, ResourceKind>,
    found: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(name)) = map.get("Ref") {
                    record(name, kinds, found, seen);
                    return;
                }
                if let Some(args) = map.get("Fn::GetAtt") {
                    match args {
                        Value::Array(items) => {
                            if let Some(Value::String(name)) = items.first() {
                                record(name, kinds, found, seen);
                            }
                        }
                        Value::String(dotted) => {
                            if let Some((name, _)) = dotted.split_once('.') {
                                record(name, kinds, found, seen);
                            }
                        }
                        _ => {}
                    }
                    return;
                }
            }
            for nested in map.values() {
                walk_refs(nested, kinds, found, seen);
            }
        }
        Value::Array(items) => {
            for nested in items {
                walk_refs(nested, kinds, found, seen);
            }
        }
        _ => {}
    }
}

fn record(
    name: &str,
    kinds: &HashMap<&str, ResourceKind>,
    found: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    if kinds.contains_key(name) && seen.insert(name.to_string()) {
        found.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(id: &str, resource_type: &str, properties: Value) -> CfnResource {
        CfnResource {
            logical_id: id.to_string(),
            resource_type: resource_type.to_string(),
            properties,
            metadata: None,
        }
    }

    #[test]
    fn function_env_ref_becomes_data_dependency() {
        let resources = vec![
            resource(
                "Handler",
                "AWS::Lambda::Function",
                json!({"Environment": {"Variables": {"TABLE": {"Ref": "Orders"}}}}),
            ),
            resource("Orders", "AWS::DynamoDB::Table", json!({})),
        ];
        let graph = build_graph(&resources).unwrap();
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["Orders", "Handler"]);

        let edge = graph.edges().next().unwrap();
        assert_eq!(edge.relation, EdgeRelation::DataDependency);
    }

    #[test]
    fn event_source_mapping_starts_after_both_ends() {
        let resources = vec![
            resource(
                "Mapping",
                "AWS::Lambda::EventSourceMapping",
                json!({
                    "EventSourceArn": {"Fn::GetAtt": ["Jobs", "Arn"]},
                    "FunctionName": {"Ref": "Worker"}
                }),
            ),
            resource("Jobs", "AWS::SQS::Queue", json!({})),
            resource("Worker", "AWS::Lambda::Function", json!({})),
        ];
        let graph = build_graph(&resources).unwrap();
        let order = graph.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("Jobs") < pos("Mapping"));
        assert!(pos("Worker") < pos("Mapping"));
    }

    #[test]
    fn api_route_orders_function_before_api() {
        let resources = vec![
            resource("HttpApi", "AWS::ApiGatewayV2::Api", json!({})),
            resource(
                "GetRoute",
                "AWS::ApiGatewayV2::Route",
                json!({
                    "ApiId": {"Ref": "HttpApi"},
                    "RouteKey": "GET /items/{id}",
                    "Target": {"Fn::Join": ["/", ["integrations", {"Ref": "Handler"}]]}
                }),
            ),
            resource("Handler", "AWS::Lambda::Function", json!({})),
        ];
        let graph = build_graph(&resources).unwrap();
        let order = graph.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("Handler") < pos("HttpApi"));
    }

    #[test]
    fn forward_references_resolve_via_two_pass() {
        // "Handler" references "Orders" declared after it.
        let resources = vec![
            resource(
                "Handler",
                "AWS::Lambda::Function",
                json!({"Environment": {"Variables": {"T": {"Fn::GetAtt": "Orders.Arn"}}}}),
            ),
            resource("Orders", "AWS::DynamoDB::Table", json!({})),
        ];
        let graph = build_graph(&resources).unwrap();
        assert_eq!(graph.edges().count(), 1);
    }

    #[test]
    fn references_to_undeclared_ids_are_ignored() {
        let resources = vec![resource(
            "Handler",
            "AWS::Lambda::Function",
            json!({"Environment": {"Variables": {"X": {"Ref": "NotDeclared"}}}}),
        )];
        let graph = build_graph(&resources).unwrap();
        assert_eq!(graph.edges().count(), 0);
    }

    #[test]
    fn bucket_notification_puts_function_first() {
        let resources = vec![
            resource(
                "Uploads",
                "AWS::S3::Bucket",
                json!({
                    "NotificationConfiguration": {
                        "LambdaConfigurations": [
                            {"Event": "s3:ObjectCreated:*", "Function": {"Fn::GetAtt": ["Thumb", "Arn"]}}
                        ]
                    }
                }),
            ),
            resource("Thumb", "AWS::Lambda::Function", json!({})),
        ];
        let graph = build_graph(&resources).unwrap();
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["Thumb", "Uploads"]);
    }
}
