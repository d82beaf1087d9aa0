//! Service emulators.
//!
//! One provider per emulated service: object buckets, message queues,
//! key-value tables, pub/sub topics, the event bus (with its pattern matcher
//! and schedule runner), the workflow engine, and HTTP gateways. The wiring
//! module bridges producers to function invocations with pollers and
//! dispatchers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use nimbus_core::FunctionInvoker;

pub mod bucket;
pub mod bus;
pub mod gateway;
pub mod queue;
pub mod routes;
pub mod table;
pub mod topic;
pub mod wiring;
pub mod workflow;

pub use bucket::{BucketEventKind, NotificationSelector, ObjectBucketProvider};
pub use bus::EventBusProvider;
pub use gateway::ApiGatewayProvider;
pub use queue::{MessageQueueProvider, QueueConfig, ReceivedMessage};
pub use table::KvTableProvider;
pub use topic::PubSubTopicProvider;
pub use wiring::{EventSourceManager, EventSourceMapping, QueuePoller};
pub use workflow::WorkflowProvider;

/// Future returned by a push-dispatch handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered push-dispatch callback. Producers schedule each matching
/// handler as an independent task; handler errors never reach the producer.
pub type EventHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Wrap a function invoker as a push-dispatch handler. Invocation failures
/// and handler errors are logged, not propagated.
pub fn function_handler(invoker: Arc<dyn FunctionInvoker>) -> EventHandler {
    Arc::new(move |event| {
        let invoker = invoker.clone();
        Box::pin(async move {
            let context = invoker.make_context();
            match invoker.invoke(event, context).await {
                Ok(result) => {
                    if let Some(error) = result.error() {
                        tracing::warn!(
                            function = invoker.function_name(),
                            kind = %error.kind,
                            message = %error.message,
                            "handler invocation failed"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(
                        function = invoker.function_name(),
                        error = %err,
                        "invocation error"
                    );
                }
            }
        })
    })
}
