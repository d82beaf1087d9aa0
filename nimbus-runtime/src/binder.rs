//! Graph-to-provider binding.
//!
//! Walks the application graph leaves-first, instantiates a provider per
//! declared resource, registers concrete names in the reference map,
//! resolves function environments, wires event sources, and assembles the
//! per-service HTTP surfaces.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::Method;
use axum::Router;
use serde_json::{json, Value};

use nimbus_compute::{FunctionProvider, FunctionSpec};
use nimbus_core::{
    EmulatorConfig, EmulatorError, FunctionInvoker, Provider, ReferenceMap, LOCAL_ACCOUNT_ID,
    LOCAL_REGION,
};
use nimbus_graph::{
    collect_referenced_ids, AppGraph, Assembly, IntrinsicResolver, ResourceKind, ResourceNode,
};
use nimbus_providers::{
    function_handler, routes, wiring, ApiGatewayProvider, BucketEventKind, EventBusProvider,
    EventSourceMapping, KvTableProvider, MessageQueueProvider, NotificationSelector,
    ObjectBucketProvider, PubSubTopicProvider, QueueConfig, QueuePoller, WorkflowProvider,
};
use nimbus_providers::bus::BusTarget;
use nimbus_providers::workflow::WorkflowType;
use nimbus_store::{KeySchema, ObjectStore, QueueSnapshotStore, SecondaryIndex};
use nimbus_wire::ProxyFormat;

use crate::ports::PortAllocator;

/// Everything the runtime needs to serve a bound assembly.
pub struct BoundApplication {
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub startup_order: Vec<String>,
    /// Service surfaces: (port, app). The primary port carries management.
    pub surfaces: Vec<(u16, Router)>,
    pub invokers: HashMap<String, Arc<dyn FunctionInvoker>>,
    /// Pollers to start once the orchestrator is up, and to stop first.
    pub pollers: Vec<Arc<QueuePoller>>,
    pub resources: Value,
    pub refs: Arc<ReferenceMap>,
}

impl std::fmt::Debug for BoundApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundApplication")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("startup_order", &self.startup_order)
            .field("surfaces", &self.surfaces.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .field("invokers", &self.invokers.keys().collect::<Vec<_>>())
            .field("pollers", &self.pollers.len())
            .field("resources", &self.resources)
            .finish()
    }
}

/// Bind every declared resource to a provider.
pub fn bind(
    assembly: &Assembly,
    graph: &AppGraph,
    config: &EmulatorConfig,
) -> Result<BoundApplication, EmulatorError> {
    let cycles = graph.detect_cycles();
    if !cycles.is_empty() {
        return Err(EmulatorError::Configuration(format!(
            "assembly has dependency cycles: {cycles:?}"
        )));
    }
    let startup_order = graph.topological_sort()?;

    let refs = Arc::new(ReferenceMap::new());
    let kinds: HashMap<&str, ResourceKind> = graph
        .nodes()
        .map(|node| (node.id.as_str(), node.kind.clone()))
        .collect();

    // Pass 1: register every logical identifier so forward references
    // resolve during pass 2.
    for node in graph.nodes() {
        let physical = physical_name(node);
        refs.register(&node.id, &physical);
        refs.register_attribute(&node.id, "Arn", physical_arn(&node.kind, &physical));
    }

    let ports = PortAllocator::new(config.port);
    let queue_port = ports.allocate();
    let table_port = ports.allocate();
    let bucket_port = ports.allocate();
    let bus_port = ports.allocate();
    let workflow_port = ports.allocate();

    let sdk_env = sdk_environment(config.port, queue_port, table_port, bucket_port);
    let resolver = IntrinsicResolver::new()
        .with_resources(refs.snapshot())
        .with_kinds(kinds.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    let mut invokers: HashMap<String, Arc<dyn FunctionInvoker>> = HashMap::new();

    // Functions first: nearly everything else wires into them.
    let shim_dir = config.data_dir.join("shims");
    for node in graph.nodes() {
        if node.kind != ResourceKind::Function {
            continue;
        }
        let spec = function_spec(node, assembly, &resolver, &refs)?;
        let provider = Arc::new(FunctionProvider::new(spec, sdk_env.clone(), &shim_dir)?);
        invokers.insert(
            refs.resolve(&node.id).unwrap_or_else(|| node.id.clone()),
            provider.clone() as Arc<dyn FunctionInvoker>,
        );
        providers.insert(node.id.clone(), provider);
    }

    // Queues.
    let snapshots = config
        .persist
        .then(|| QueueSnapshotStore::new(config.queue_dir()));
    let queue_provider = Arc::new(MessageQueueProvider::new(snapshots));
    for node in graph.nodes() {
        if node.kind != ResourceKind::MessageQueue {
            continue;
        }
        queue_provider.create_queue(queue_config(node, &refs))?;
        providers.insert(node.id.clone(), queue_provider.clone());
    }

    // Buckets.
    let bucket_provider = Arc::new(ObjectBucketProvider::new(
        ObjectStore::new(config.object_dir()),
        config.eventual_consistency_delay,
    ));
    for node in graph.nodes() {
        if node.kind != ResourceKind::ObjectBucket {
            continue;
        }
        let bucket = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
        bucket_provider.create_bucket(&bucket)?;
        wire_bucket_notifications(node, &bucket, &bucket_provider, &kinds, &refs, &invokers)?;
        providers.insert(node.id.clone(), bucket_provider.clone());
    }

    // Tables.
    let mut tables: HashMap<String, Arc<KvTableProvider>> = HashMap::new();
    for node in graph.nodes() {
        if node.kind != ResourceKind::KvTable {
            continue;
        }
        let table_name = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
        let (schema, indexes) = table_schema(node)?;
        let provider = Arc::new(KvTableProvider::new(
            config.kv_dir(),
            &table_name,
            schema,
            indexes,
            config.eventual_consistency_delay,
        ));
        tables.insert(table_name, provider.clone());
        providers.insert(node.id.clone(), provider);
    }

    // Topics.
    let topic_provider = Arc::new(PubSubTopicProvider::new());
    for node in graph.nodes() {
        if node.kind != ResourceKind::PubSubTopic {
            continue;
        }
        let topic = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
        topic_provider.create_topic(&topic)?;
        providers.insert(node.id.clone(), topic_provider.clone());
    }
    wire_topic_subscriptions(graph, &kinds, &refs, &topic_provider, &invokers)?;

    // The event bus, its rules, and their targets.
    let bus_provider = Arc::new(EventBusProvider::new());
    for node in graph.nodes() {
        if node.kind == ResourceKind::EventBus {
            let bus = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
            if bus != "default" {
                bus_provider.create_bus(&bus)?;
            }
            providers.insert(node.id.clone(), bus_provider.clone());
        }
    }
    for node in graph.nodes() {
        if node.kind == ResourceKind::EventRule {
            wire_event_rule(node, &resolver, &kinds, &refs, &bus_provider, &invokers)?;
            providers.insert(node.id.clone(), bus_provider.clone());
        }
    }

    // Workflows.
    let invokers_for_tasks = invokers.clone();
    let workflow_provider = Arc::new(WorkflowProvider::new(Arc::new(move |resource| {
        let function_name = wiring::extract_function_name(resource);
        invokers_for_tasks.get(&function_name).cloned()
    })));
    for node in graph.nodes() {
        if node.kind != ResourceKind::Workflow {
            continue;
        }
        let machine_name = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
        let definition = workflow_definition(node, &resolver)?;
        let workflow_type = match node
            .properties
            .get("StateMachineType")
            .and_then(Value::as_str)
        {
            Some("EXPRESS") => WorkflowType::Express,
            _ => WorkflowType::Standard,
        };
        workflow_provider.create_state_machine(&machine_name, &definition, workflow_type)?;
        providers.insert(node.id.clone(), workflow_provider.clone());
    }

    // Event-source mappings (queue -> function pollers).
    let mut pollers = Vec::new();
    for node in graph.nodes() {
        if node.kind != ResourceKind::EventSourceMapping {
            continue;
        }
        if let Some(poller) =
            bind_event_source(node, &kinds, &refs, &queue_provider, &invokers)?
        {
            pollers.push(poller);
        }
    }

    // Gateways and function URLs, each on its own port.
    let mut surfaces: Vec<(u16, Router)> = Vec::new();
    for node in graph.nodes() {
        match &node.kind {
            ResourceKind::ApiGatewayV2 => {
                let gateway = bind_gateway_v2(node, graph, &kinds, &refs, &invokers)?;
                providers.insert(node.id.clone(), gateway.clone());
                surfaces.push((ports.allocate(), gateway.into_router()));
            }
            ResourceKind::ApiGatewayV1 => {
                let gateway = bind_gateway_v1(node, graph, &kinds, &refs, &invokers)?;
                providers.insert(node.id.clone(), gateway.clone());
                surfaces.push((ports.allocate(), gateway.into_router()));
            }
            ResourceKind::Unknown(type_name) if type_name == "AWS::Lambda::Url" => {
                if let Some(function_id) =
                    collect_referenced_ids(&node.properties, &kinds)
                        .into_iter()
                        .find(|id| kinds[id.as_str()] == ResourceKind::Function)
                {
                    let function_name =
                        refs.resolve(&function_id).unwrap_or_else(|| function_id.clone());
                    if let Some(invoker) = invokers.get(&function_name) {
                        let gateway =
                            Arc::new(ApiGatewayProvider::function_url(&function_name, invoker.clone())?);
                        providers.insert(node.id.clone(), gateway.clone());
                        surfaces.push((ports.allocate(), gateway.into_router()));
                    }
                }
            }
            _ => {}
        }
    }

    surfaces.push((queue_port, routes::create_queue_app(queue_provider.clone(), queue_port)));
    surfaces.push((table_port, routes::create_table_app(tables.clone())));
    surfaces.push((bucket_port, routes::create_bucket_app(bucket_provider.clone())));
    surfaces.push((bus_port, routes::create_bus_app(bus_provider.clone())));
    surfaces.push((workflow_port, routes::create_workflow_app(workflow_provider.clone())));

    let resources = resource_metadata(graph, &refs);

    Ok(BoundApplication {
        providers,
        startup_order,
        surfaces,
        invokers,
        pollers,
        resources,
        refs,
    })
}

/// Concrete local name for a node: an explicit literal name property when
/// present, otherwise a name derived from the logical id.
fn physical_name(node: &ResourceNode) -> String {
    let name_keys = [
        "TableName",
        "QueueName",
        "BucketName",
        "TopicName",
        "FunctionName",
        "Name",
        "StateMachineName",
    ];
    for key in name_keys {
        if let Some(Value::String(name)) = node.properties.get(key) {
            return name.clone();
        }
    }
    format!("local-{}", node.id.to_lowercase())
}

fn physical_arn(kind: &ResourceKind, physical: &str) -> String {
    match kind {
        ResourceKind::Function => {
            format!("arn:aws:lambda:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:function:{physical}")
        }
        ResourceKind::MessageQueue => {
            format!("arn:aws:sqs:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:{physical}")
        }
        ResourceKind::PubSubTopic => {
            format!("arn:aws:sns:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:{physical}")
        }
        ResourceKind::ObjectBucket => format!("arn:aws:s3:::{physical}"),
        ResourceKind::KvTable => {
            format!("arn:aws:dynamodb:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:table/{physical}")
        }
        ResourceKind::Workflow => {
            format!("arn:aws:states:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:stateMachine:{physical}")
        }
        other => format!(
            "arn:aws:{}:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:{}/{physical}",
            other.service_slug(),
            other.arn_noun(),
        ),
    }
}

/// Endpoint overrides injected into every function invocation.
fn sdk_environment(
    primary: u16,
    queue_port: u16,
    table_port: u16,
    bucket_port: u16,
) -> HashMap<String, String> {
    HashMap::from([
        ("AWS_ENDPOINT_URL".to_string(), format!("http://localhost:{primary}")),
        ("AWS_REGION".to_string(), LOCAL_REGION.to_string()),
        ("AWS_ACCESS_KEY_ID".to_string(), "local".to_string()),
        ("AWS_SECRET_ACCESS_KEY".to_string(), "local".to_string()),
        (
            "AWS_ENDPOINT_URL_SQS".to_string(),
            format!("http://localhost:{queue_port}"),
        ),
        (
            "AWS_ENDPOINT_URL_DYNAMODB".to_string(),
            format!("http://localhost:{table_port}"),
        ),
        (
            "AWS_ENDPOINT_URL_S3".to_string(),
            format!("http://localhost:{bucket_port}"),
        ),
    ])
}

fn function_spec(
    node: &ResourceNode,
    assembly: &Assembly,
    resolver: &IntrinsicResolver,
    refs: &ReferenceMap,
) -> Result<FunctionSpec, EmulatorError> {
    let props = &node.properties;
    let name = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
    let runtime = props
        .get("Runtime")
        .and_then(Value::as_str)
        .unwrap_or("nodejs20.x");

    let mut spec = FunctionSpec::new(name, runtime);
    if let Some(handler) = props.get("Handler").and_then(Value::as_str) {
        spec.handler = handler.to_string();
    }
    if let Some(timeout) = props.get("Timeout").and_then(Value::as_u64) {
        spec.timeout = std::time::Duration::from_secs(timeout);
    }
    if let Some(memory) = props.get("MemorySize").and_then(Value::as_u64) {
        spec.memory_mb = memory as u32;
    }
    if let Some(env) = props.get("Environment").and_then(|e| e.get("Variables")) {
        spec.environment = resolver.resolve_env(env);
    }
    if let Some(image) = props
        .get("Code")
        .and_then(|code| code.get("ImageUri"))
        .and_then(Value::as_str)
    {
        spec.image = Some(image.to_string());
    }

    // Code location: the synthesizer records the staged asset path in the
    // node metadata; fall back to matching an asset manifest entry.
    if let Some(asset_path) = node
        .properties
        .get("Metadata")
        .and_then(|m| m.get("aws:asset:path"))
        .and_then(Value::as_str)
    {
        spec.code_path = asset_path.into();
    } else if let Some(key) = props
        .get("Code")
        .and_then(|code| code.get("S3Key"))
        .and_then(Value::as_str)
    {
        if let Some(asset) = assembly.file_asset_for(key) {
            spec.code_path = asset.path.clone();
        }
    }
    Ok(spec)
}

fn queue_config(node: &ResourceNode, refs: &ReferenceMap) -> QueueConfig {
    let props = &node.properties;
    let name = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
    let mut config = QueueConfig::new(name);
    if props.get("FifoQueue").and_then(Value::as_bool).unwrap_or(false) {
        config.fifo = true;
    }
    if let Some(timeout) = props.get("VisibilityTimeout").and_then(Value::as_u64) {
        config.visibility_timeout = std::time::Duration::from_secs(timeout);
    }
    if let Some(redrive) = props.get("RedrivePolicy") {
        let max = redrive
            .get("maxReceiveCount")
            .and_then(Value::as_u64)
            .unwrap_or(3) as u32;
        let dlq = redrive
            .get("deadLetterTargetArn")
            .map(|v| dlq_name_from(v, refs))
            .unwrap_or_default();
        if !dlq.is_empty() {
            config = config.with_redrive(max, &dlq);
        }
    }
    config
}

/// Resolve a dead-letter target, which is usually `Fn::GetAtt [Dlq, Arn]`.
fn dlq_name_from(value: &Value, refs: &ReferenceMap) -> String {
    let logical = match value {
        Value::Object(map) => match map.get("Fn::GetAtt") {
            Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
            Some(Value::String(dotted)) => dotted.split('.').next().map(str::to_string),
            _ => map
                .get("Ref")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        Value::String(arn) => return wiring::extract_queue_name(arn),
        _ => None,
    };
    logical
        .and_then(|id| refs.resolve(&id))
        .unwrap_or_default()
}

fn table_schema(node: &ResourceNode) -> Result<(KeySchema, Vec<SecondaryIndex>), EmulatorError> {
    let props = &node.properties;
    let parse_schema = |schema: &Value| -> (Option<String>, Option<String>) {
        let mut partition = None;
        let mut sort = None;
        if let Some(entries) = schema.as_array() {
            for entry in entries {
                let attr = entry.get("AttributeName").and_then(Value::as_str);
                match entry.get("KeyType").and_then(Value::as_str) {
                    Some("HASH") => partition = attr.map(str::to_string),
                    Some("RANGE") => sort = attr.map(str::to_string),
                    _ => {}
                }
            }
        }
        (partition, sort)
    };

    let (partition, sort) = parse_schema(props.get("KeySchema").unwrap_or(&Value::Null));
    let partition = partition.ok_or_else(|| {
        EmulatorError::Configuration(format!("table {} missing a HASH key", node.id))
    })?;

    let mut indexes = Vec::new();
    if let Some(gsis) = props.get("GlobalSecondaryIndexes").and_then(Value::as_array) {
        for gsi in gsis {
            let name = gsi
                .get("IndexName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let (ipk, isk) = parse_schema(gsi.get("KeySchema").unwrap_or(&Value::Null));
            if let (false, Some(ipk)) = (name.is_empty(), ipk) {
                indexes.push(SecondaryIndex {
                    name,
                    partition_key: ipk,
                    sort_key: isk,
                });
            }
        }
    }

    Ok((
        KeySchema {
            partition_key: partition,
            sort_key: sort,
        },
        indexes,
    ))
}

fn workflow_definition(
    node: &ResourceNode,
    resolver: &IntrinsicResolver,
) -> Result<Value, EmulatorError> {
    let props = &node.properties;
    let raw = match props.get("DefinitionString") {
        Some(Value::String(s)) => serde_json::from_str(s)?,
        Some(other) => resolver.resolve(other),
        None => props
            .get("Definition")
            .cloned()
            .ok_or_else(|| {
                EmulatorError::Configuration(format!("workflow {} has no definition", node.id))
            })?,
    };
    Ok(resolver.resolve(&raw))
}

fn wire_bucket_notifications(
    node: &ResourceNode,
    bucket: &str,
    provider: &Arc<ObjectBucketProvider>,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Result<(), EmulatorError> {
    let Some(configs) = node
        .properties
        .get("NotificationConfiguration")
        .and_then(|n| n.get("LambdaConfigurations"))
        .and_then(Value::as_array)
    else {
        return Ok(());
    };

    for config in configs {
        let function_ids = collect_referenced_ids(config, kinds);
        let Some(function_id) = function_ids
            .iter()
            .find(|id| kinds[id.as_str()] == ResourceKind::Function)
        else {
            continue;
        };
        let function_name = refs.resolve(function_id).unwrap_or_else(|| function_id.clone());
        let Some(invoker) = invokers.get(&function_name) else {
            continue;
        };

        let kind = config.get("Event").and_then(Value::as_str).map(|event| {
            if event.starts_with("s3:ObjectRemoved") {
                BucketEventKind::Removed
            } else {
                BucketEventKind::Created
            }
        });
        let mut selector = NotificationSelector {
            kind,
            ..Default::default()
        };
        if let Some(rules) = config
            .get("Filter")
            .and_then(|f| f.get("S3Key"))
            .and_then(|k| k.get("Rules"))
            .and_then(Value::as_array)
        {
            for rule in rules {
                let value = rule.get("Value").and_then(Value::as_str).map(str::to_string);
                match rule.get("Name").and_then(Value::as_str) {
                    Some("prefix") => selector.prefix = value,
                    Some("suffix") => selector.suffix = value,
                    _ => {}
                }
            }
        }
        provider.register_handler(bucket, selector, function_handler(invoker.clone()))?;
    }
    Ok(())
}

fn wire_topic_subscriptions(
    graph: &AppGraph,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    topic_provider: &Arc<PubSubTopicProvider>,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Result<(), EmulatorError> {
    for node in graph.nodes() {
        let ResourceKind::Unknown(type_name) = &node.kind else {
            continue;
        };
        if type_name != "AWS::SNS::Subscription" {
            continue;
        }
        let referenced = collect_referenced_ids(&node.properties, kinds);
        let topic_id = referenced
            .iter()
            .find(|id| kinds[id.as_str()] == ResourceKind::PubSubTopic);
        let function_id = referenced
            .iter()
            .find(|id| kinds[id.as_str()] == ResourceKind::Function);
        let (Some(topic_id), Some(function_id)) = (topic_id, function_id) else {
            continue;
        };
        let topic = refs.resolve(topic_id).unwrap_or_else(|| topic_id.clone());
        let function_name = refs.resolve(function_id).unwrap_or_else(|| function_id.clone());
        if let Some(invoker) = invokers.get(&function_name) {
            let filter = node.properties.get("FilterPolicy").cloned();
            topic_provider.subscribe(&topic, filter, function_handler(invoker.clone()))?;
        }
    }
    Ok(())
}

fn wire_event_rule(
    node: &ResourceNode,
    resolver: &IntrinsicResolver,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    bus_provider: &Arc<EventBusProvider>,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Result<(), EmulatorError> {
    let props = &node.properties;
    let rule_name = refs.resolve(&node.id).unwrap_or_else(|| node.id.clone());
    let pattern = props.get("EventPattern").map(|p| resolver.resolve(p));
    let schedule = props
        .get("ScheduleExpression")
        .and_then(Value::as_str)
        .map(str::to_string);
    if pattern.is_none() && schedule.is_none() {
        tracing::warn!(rule = %rule_name, "rule has neither pattern nor schedule, skipping");
        return Ok(());
    }

    let bus_name = props
        .get("EventBusName")
        .map(|b| match b {
            Value::String(s) => s.clone(),
            other => {
                let resolved = resolver.resolve(other);
                resolved.as_str().unwrap_or("default").to_string()
            }
        })
        .unwrap_or_else(|| "default".to_string());

    bus_provider.put_rule(&rule_name, Some(&bus_name), pattern, schedule)?;

    let mut targets = Vec::new();
    if let Some(raw_targets) = props.get("Targets").and_then(Value::as_array) {
        for (i, target) in raw_targets.iter().enumerate() {
            let id = target
                .get("Id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("target-{i}"));
            // Resolve the target ARN and bind its handler when it is a
            // declared function.
            let function_ids = collect_referenced_ids(target, kinds);
            let function_id = function_ids
                .iter()
                .find(|id| kinds[id.as_str()] == ResourceKind::Function);
            let arn = match function_id {
                Some(function_id) => {
                    let arn = refs
                        .resolve(&format!("{function_id}.Arn"))
                        .unwrap_or_else(|| function_id.clone());
                    let function_name =
                        refs.resolve(function_id).unwrap_or_else(|| function_id.clone());
                    if let Some(invoker) = invokers.get(&function_name) {
                        bus_provider
                            .register_target_handler(&arn, function_handler(invoker.clone()));
                    }
                    arn
                }
                None => {
                    let resolved = resolver.resolve(target.get("Arn").unwrap_or(&Value::Null));
                    resolved.as_str().unwrap_or_default().to_string()
                }
            };
            targets.push(BusTarget { id, arn });
        }
    }
    if !targets.is_empty() {
        bus_provider.put_targets(&rule_name, targets)?;
    }
    Ok(())
}

fn bind_event_source(
    node: &ResourceNode,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    queue_provider: &Arc<MessageQueueProvider>,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Result<Option<Arc<QueuePoller>>, EmulatorError> {
    let referenced = collect_referenced_ids(&node.properties, kinds);
    let queue_id = referenced
        .iter()
        .find(|id| kinds[id.as_str()] == ResourceKind::MessageQueue);
    let function_id = referenced
        .iter()
        .find(|id| kinds[id.as_str()] == ResourceKind::Function);
    let (Some(queue_id), Some(function_id)) = (queue_id, function_id) else {
        tracing::warn!(mapping = %node.id, "event source mapping missing queue or function");
        return Ok(None);
    };

    let queue_name = refs.resolve(queue_id).unwrap_or_else(|| queue_id.clone());
    let function_name = refs.resolve(function_id).unwrap_or_else(|| function_id.clone());
    let Some(invoker) = invokers.get(&function_name) else {
        return Ok(None);
    };

    let mut mapping = EventSourceMapping::new(queue_name, function_name);
    if let Some(batch) = node.properties.get("BatchSize").and_then(Value::as_u64) {
        mapping.batch_size = batch as usize;
    }
    if let Some(enabled) = node.properties.get("Enabled").and_then(Value::as_bool) {
        mapping.enabled = enabled;
    }
    Ok(Some(Arc::new(QueuePoller::new(
        queue_provider.clone(),
        invoker.clone(),
        mapping,
    ))))
}

fn bind_gateway_v2(
    api_node: &ResourceNode,
    graph: &AppGraph,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Result<Arc<ApiGatewayProvider>, EmulatorError> {
    let api_name = refs.resolve(&api_node.id).unwrap_or_else(|| api_node.id.clone());
    let gateway = Arc::new(ApiGatewayProvider::new(api_name, ProxyFormat::V2, Vec::new()));

    for node in graph.nodes() {
        let ResourceKind::Unknown(type_name) = &node.kind else {
            continue;
        };
        if type_name != "AWS::ApiGatewayV2::Route" {
            continue;
        }
        let referenced = collect_referenced_ids(&node.properties, kinds);
        if !referenced.iter().any(|id| id == &api_node.id) {
            continue;
        }
        let Some(route_key) = node.properties.get("RouteKey").and_then(Value::as_str) else {
            continue;
        };
        let Some((method, path)) = route_key.split_once(' ') else {
            continue;
        };
        let Ok(method) = method.parse::<Method>() else {
            continue;
        };
        if let Some(invoker) = route_function(node, graph, kinds, refs, invokers) {
            gateway.add_route(method, path, route_key, invoker)?;
        }
    }
    Ok(gateway)
}

fn bind_gateway_v1(
    api_node: &ResourceNode,
    graph: &AppGraph,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Result<Arc<ApiGatewayProvider>, EmulatorError> {
    let api_name = refs.resolve(&api_node.id).unwrap_or_else(|| api_node.id.clone());
    let gateway = Arc::new(ApiGatewayProvider::new(api_name, ProxyFormat::V1, Vec::new()));

    // Resource nodes give methods their human-readable paths.
    let mut path_parts: HashMap<&str, String> = HashMap::new();
    for node in graph.nodes() {
        if let ResourceKind::Unknown(type_name) = &node.kind {
            if type_name == "AWS::ApiGateway::Resource" {
                let part = node
                    .properties
                    .get("PathPart")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                path_parts.insert(node.id.as_str(), format!("/{part}"));
            }
        }
    }

    for node in graph.nodes() {
        let ResourceKind::Unknown(type_name) = &node.kind else {
            continue;
        };
        if type_name != "AWS::ApiGateway::Method" {
            continue;
        }
        let referenced = collect_referenced_ids(&node.properties, kinds);
        if !referenced.iter().any(|id| id == &api_node.id) {
            continue;
        }
        let Some(method) = node
            .properties
            .get("HttpMethod")
            .and_then(Value::as_str)
            .and_then(|m| m.parse::<Method>().ok())
        else {
            continue;
        };
        let path = node
            .properties
            .get("ResourceId")
            .and_then(|r| r.get("Ref"))
            .and_then(Value::as_str)
            .and_then(|id| path_parts.get(id).cloned())
            .unwrap_or_else(|| "/".to_string());
        if let Some(invoker) = route_function(node, graph, kinds, refs, invokers) {
            gateway.add_route(method, &path, &path, invoker)?;
        }
    }
    Ok(gateway)
}

/// Find the function a route or method integrates with: directly referenced,
/// or one hop away through an integration node.
fn route_function(
    node: &ResourceNode,
    graph: &AppGraph,
    kinds: &HashMap<&str, ResourceKind>,
    refs: &ReferenceMap,
    invokers: &HashMap<String, Arc<dyn FunctionInvoker>>,
) -> Option<Arc<dyn FunctionInvoker>> {
    let referenced = collect_referenced_ids(&node.properties, kinds);
    let direct = referenced
        .iter()
        .find(|id| kinds[id.as_str()] == ResourceKind::Function)
        .cloned();
    let function_id = direct.or_else(|| {
        referenced.iter().find_map(|id| {
            let intermediate = graph.node(id)?;
            collect_referenced_ids(&intermediate.properties, kinds)
                .into_iter()
                .find(|nested| kinds[nested.as_str()] == ResourceKind::Function)
        })
    })?;
    let function_name = refs.resolve(&function_id).unwrap_or(function_id);
    invokers.get(&function_name).cloned()
}

fn resource_metadata(graph: &AppGraph, refs: &ReferenceMap) -> Value {
    let mut by_kind: HashMap<&str, Vec<Value>> = HashMap::new();
    for node in graph.nodes() {
        let bucket_key = match node.kind {
            ResourceKind::Function => "functions",
            ResourceKind::KvTable => "tables",
            ResourceKind::MessageQueue => "queues",
            ResourceKind::ObjectBucket => "buckets",
            ResourceKind::PubSubTopic => "topics",
            ResourceKind::EventBus => "buses",
            ResourceKind::EventRule => "rules",
            ResourceKind::Workflow => "workflows",
            ResourceKind::ApiGatewayV1 | ResourceKind::ApiGatewayV2 => "apis",
            _ => continue,
        };
        by_kind.entry(bucket_key).or_default().push(json!({
            "logicalId": node.id,
            "name": refs.resolve(&node.id),
            "arn": refs.resolve(&format!("{}.Arn", node.id)),
        }));
    }
    json!(by_kind)
}
