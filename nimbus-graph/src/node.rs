//! Graph node and edge types.

use serde_json::Value;

/// The typed kind of a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Function,
    ApiGatewayV1,
    ApiGatewayV2,
    KvTable,
    ObjectBucket,
    MessageQueue,
    PubSubTopic,
    EventBus,
    EventRule,
    EventSourceMapping,
    Workflow,
    IdentityPool,
    ContainerService,
    Unknown(String),
}

impl ResourceKind {
    /// Map a CloudFormation resource type string to a kind.
    pub fn from_resource_type(resource_type: &str) -> Self {
        match resource_type {
            "AWS::Lambda::Function" => ResourceKind::Function,
            "AWS::ApiGateway::RestApi" => ResourceKind::ApiGatewayV1,
            "AWS::ApiGatewayV2::Api" => ResourceKind::ApiGatewayV2,
            "AWS::DynamoDB::Table" => ResourceKind::KvTable,
            "AWS::S3::Bucket" => ResourceKind::ObjectBucket,
            "AWS::SQS::Queue" => ResourceKind::MessageQueue,
            "AWS::SNS::Topic" => ResourceKind::PubSubTopic,
            "AWS::Events::EventBus" => ResourceKind::EventBus,
            "AWS::Events::Rule" => ResourceKind::EventRule,
            "AWS::Lambda::EventSourceMapping" => ResourceKind::EventSourceMapping,
            "AWS::StepFunctions::StateMachine" => ResourceKind::Workflow,
            "AWS::Cognito::UserPool" => ResourceKind::IdentityPool,
            "AWS::ECS::Service" => ResourceKind::ContainerService,
            other => ResourceKind::Unknown(other.to_string()),
        }
    }

    /// Service segment for stand-in ARNs.
    pub fn service_slug(&self) -> &str {
        match self {
            ResourceKind::Function => "lambda",
            ResourceKind::ApiGatewayV1 | ResourceKind::ApiGatewayV2 => "apigateway",
            ResourceKind::KvTable => "dynamodb",
            ResourceKind::ObjectBucket => "s3",
            ResourceKind::MessageQueue => "sqs",
            ResourceKind::PubSubTopic => "sns",
            ResourceKind::EventBus | ResourceKind::EventRule => "events",
            ResourceKind::EventSourceMapping => "lambda",
            ResourceKind::Workflow => "states",
            ResourceKind::IdentityPool => "cognito",
            ResourceKind::ContainerService => "ecs",
            ResourceKind::Unknown(_) => "unknown",
        }
    }

    /// Resource noun for stand-in ARNs.
    pub fn arn_noun(&self) -> &str {
        match self {
            ResourceKind::Function => "function",
            ResourceKind::ApiGatewayV1 | ResourceKind::ApiGatewayV2 => "api",
            ResourceKind::KvTable => "table",
            ResourceKind::ObjectBucket => "bucket",
            ResourceKind::MessageQueue => "queue",
            ResourceKind::PubSubTopic => "topic",
            ResourceKind::EventBus => "event-bus",
            ResourceKind::EventRule => "rule",
            ResourceKind::EventSourceMapping => "event-source-mapping",
            ResourceKind::Workflow => "stateMachine",
            ResourceKind::IdentityPool => "userpool",
            ResourceKind::ContainerService => "service",
            ResourceKind::Unknown(_) => "resource",
        }
    }
}

/// A declared resource. Immutable after assembly parse.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Unique logical identifier within the assembly.
    pub id: String,
    pub kind: ResourceKind,
    /// Untyped property bag as declared in the template.
    pub properties: Value,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: ResourceKind, properties: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            properties,
        }
    }
}

/// The typed relation an edge carries. Direction is "depends-on": the source
/// depends on the target, so the target starts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeRelation {
    Triggers,
    DataDependency,
    References,
    Subscribes,
}

impl EdgeRelation {
    /// Whether this relation constrains startup order.
    pub fn orders_startup(self) -> bool {
        matches!(
            self,
            EdgeRelation::Triggers | EdgeRelation::DataDependency | EdgeRelation::Subscribes
        )
    }
}

/// An ordered dependency pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceEdge {
    pub source: String,
    pub target: String,
    pub relation: EdgeRelation,
}

impl ResourceEdge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation: EdgeRelation,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation,
        }
    }
}
