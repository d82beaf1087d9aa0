//! Event-source wiring.
//!
//! The queue poller bridges a pull-based queue to a function: it receives a
//! batch, invokes the function with a records event, and acknowledges the
//! batch only when the invocation succeeds. The event-source manager
//! activates and deactivates these mappings at runtime from their ARNs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nimbus_core::{FunctionInvoker, LOCAL_ACCOUNT_ID, LOCAL_REGION};

use crate::queue::{MessageQueueProvider, ReceivedMessage};

/// One queue-to-function binding.
#[derive(Debug, Clone)]
pub struct EventSourceMapping {
    pub queue_name: String,
    pub function_name: String,
    pub batch_size: usize,
    pub enabled: bool,
}

impl EventSourceMapping {
    pub fn new(queue_name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            function_name: function_name.into(),
            batch_size: 10,
            enabled: true,
        }
    }
}

/// Cooperative poller owning one mapping.
pub struct QueuePoller {
    queue: Arc<MessageQueueProvider>,
    invoker: Arc<dyn FunctionInvoker>,
    mapping: EventSourceMapping,
    poll_interval: Duration,
    max_backoff: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<MessageQueueProvider>,
        invoker: Arc<dyn FunctionInvoker>,
        mapping: EventSourceMapping,
    ) -> Self {
        Self {
            queue,
            invoker,
            mapping,
            poll_interval: Duration::from_millis(250),
            max_backoff: Duration::from_secs(20),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_intervals(mut self, poll_interval: Duration, max_backoff: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_backoff = max_backoff;
        self
    }

    /// Spawn the polling loop.
    pub fn start(self: &Arc<Self>) {
        if !self.mapping.enabled {
            return;
        }
        let poller = self.clone();
        let handle = tokio::spawn(async move {
            poller.run().await;
        });
        *self.task.lock().expect("task lock") = Some(handle);
    }

    /// Cancel the loop and await its termination.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().expect("task lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// The loop survives arbitrary errors: failures log and back off, so a
    /// transiently broken queue never kills the poller.
    async fn run(&self) {
        let mut backoff = self.poll_interval;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let batch = match self
                .queue
                .receive_messages(&self.mapping.queue_name, self.mapping.batch_size)
            {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(
                        queue = %self.mapping.queue_name,
                        error = %err,
                        "poll failed"
                    );
                    if self.sleep(backoff).await {
                        return;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                backoff = (backoff * 2).min(self.max_backoff);
                if self.sleep(backoff).await {
                    return;
                }
                continue;
            }
            backoff = self.poll_interval;

            self.deliver(batch).await;
        }
    }

    async fn deliver(&self, batch: Vec<ReceivedMessage>) {
        let event = build_queue_event(&batch, &self.mapping.queue_name);
        let context = self.invoker.make_context();
        match self.invoker.invoke(event, context).await {
            Ok(result) if result.is_success() => {
                for message in &batch {
                    if let Err(err) = self
                        .queue
                        .delete_message(&self.mapping.queue_name, &message.receipt_handle)
                    {
                        tracing::warn!(
                            queue = %self.mapping.queue_name,
                            message_id = %message.message_id,
                            error = %err,
                            "failed to acknowledge message"
                        );
                    }
                }
            }
            Ok(result) => {
                // Left unacknowledged: the batch redelivers after the
                // visibility window.
                tracing::warn!(
                    function = %self.mapping.function_name,
                    queue = %self.mapping.queue_name,
                    error = %result.error().map(|e| e.message.clone()).unwrap_or_default(),
                    "function failed, leaving batch for redelivery"
                );
            }
            Err(err) => {
                tracing::error!(
                    function = %self.mapping.function_name,
                    queue = %self.mapping.queue_name,
                    error = %err,
                    "invocation error, leaving batch for redelivery"
                );
            }
        }
    }

    /// Returns true when cancelled during the sleep.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// The records event a batch delivery hands to the function.
fn build_queue_event(batch: &[ReceivedMessage], queue_name: &str) -> Value {
    let records: Vec<Value> = batch
        .iter()
        .map(|message| {
            json!({
                "messageId": message.message_id,
                "receiptHandle": message.receipt_handle,
                "body": message.body,
                "attributes": message.attributes,
                "messageAttributes": message.message_attributes,
                "eventSource": "aws:sqs",
                "eventSourceARN": queue_arn(queue_name),
                "awsRegion": LOCAL_REGION,
            })
        })
        .collect();
    json!({"Records": records})
}

fn queue_arn(queue_name: &str) -> String {
    format!("arn:aws:sqs:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:{queue_name}")
}

/// Activates and deactivates event-source mappings against live providers.
pub struct EventSourceManager {
    queue: Arc<MessageQueueProvider>,
    invokers: HashMap<String, Arc<dyn FunctionInvoker>>,
    pollers: Mutex<HashMap<String, Arc<QueuePoller>>>,
}

impl EventSourceManager {
    pub fn new(
        queue: Arc<MessageQueueProvider>,
        invokers: HashMap<String, Arc<dyn FunctionInvoker>>,
    ) -> Self {
        Self {
            queue,
            invokers,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Activate a mapping keyed by its identifier. The event source is
    /// recognized from its ARN.
    pub fn activate(
        &self,
        mapping_id: &str,
        event_source_arn: &str,
        function_ref: &str,
        batch_size: usize,
    ) {
        if !event_source_arn.contains(":sqs:") {
            tracing::warn!(arn = event_source_arn, "unsupported event source");
            return;
        }
        let queue_name = extract_queue_name(event_source_arn);
        let function_name = extract_function_name(function_ref);
        let Some(invoker) = self.invokers.get(&function_name) else {
            tracing::warn!(function = %function_name, "no invoker for event source mapping");
            return;
        };

        let mut mapping = EventSourceMapping::new(queue_name.clone(), function_name.clone());
        mapping.batch_size = batch_size;
        let poller = Arc::new(QueuePoller::new(
            self.queue.clone(),
            invoker.clone(),
            mapping,
        ));
        poller.start();
        self.pollers
            .lock()
            .expect("pollers lock")
            .insert(mapping_id.to_string(), poller);
        tracing::info!(queue = %queue_name, function = %function_name, "event source activated");
    }

    pub async fn deactivate(&self, mapping_id: &str) {
        let poller = self.pollers.lock().expect("pollers lock").remove(mapping_id);
        if let Some(poller) = poller {
            poller.stop().await;
            tracing::info!(mapping_id, "event source deactivated");
        }
    }

    pub async fn stop_all(&self) {
        let pollers: Vec<Arc<QueuePoller>> = {
            let mut guard = self.pollers.lock().expect("pollers lock");
            guard.drain().map(|(_, p)| p).collect()
        };
        for poller in pollers {
            poller.stop().await;
        }
    }
}

/// Queue name from `arn:aws:sqs:region:account:queue-name`.
pub fn extract_queue_name(arn: &str) -> String {
    arn.rsplit(':').next().unwrap_or(arn).to_string()
}

/// Function name from an ARN, or the reference itself.
pub fn extract_function_name(function_ref: &str) -> String {
    if function_ref.starts_with("arn:") {
        function_ref
            .rsplit(':')
            .next()
            .unwrap_or(function_ref)
            .to_string()
    } else {
        function_ref.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nimbus_core::{
        EmulatorError, FunctionContext, InvocationErrorKind, InvocationResult, Provider,
    };
    use crate::queue::QueueConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct BatchInvoker {
        events: Mutex<Vec<Value>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl BatchInvoker {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                fail: AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FunctionInvoker for BatchInvoker {
        fn function_name(&self) -> &str {
            "process"
        }

        async fn invoke(
            &self,
            event: Value,
            context: FunctionContext,
        ) -> Result<InvocationResult, EmulatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(event);
            if self.fail.load(Ordering::SeqCst) {
                Ok(InvocationResult::failure(
                    InvocationErrorKind::Handler,
                    "nope",
                    Duration::from_millis(1),
                    &context.request_id,
                ))
            } else {
                Ok(InvocationResult::success(
                    json!(null),
                    Duration::from_millis(1),
                    &context.request_id,
                ))
            }
        }
    }

    async fn queue_provider() -> Arc<MessageQueueProvider> {
        let provider = Arc::new(MessageQueueProvider::new(None));
        provider.create_queue(QueueConfig::new("q")).unwrap();
        provider.start().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn batch_invocation_acks_on_success() {
        let queue = queue_provider().await;
        for body in ["A", "B", "C"] {
            queue.send_message("q", body, json!({}), None, None).unwrap();
        }

        let invoker = BatchInvoker::new(false);
        let poller = Arc::new(QueuePoller::new(
            queue.clone(),
            invoker.clone(),
            EventSourceMapping::new("q", "process"),
        ));
        poller.start();

        // Wait for the poller to pick the batch up.
        for _ in 0..50 {
            if invoker.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        poller.stop().await;

        let events = invoker.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let records = events[0]["Records"].as_array().unwrap();
        assert_eq!(records.len(), 3);
        let bodies: Vec<&str> = records.iter().map(|r| r["body"].as_str().unwrap()).collect();
        assert_eq!(bodies, vec!["A", "B", "C"]);

        // Acked: nothing left to receive.
        assert!(queue.receive_messages("q", 10).unwrap().is_empty());
        let (visible, inflight) = queue.queue_depth("q").unwrap();
        assert_eq!((visible, inflight), (0, 0));
    }

    #[tokio::test]
    async fn failed_invocation_leaves_batch_for_redelivery() {
        let queue = queue_provider().await;
        queue.send_message("q", "X", json!({}), None, None).unwrap();

        let invoker = BatchInvoker::new(true);
        let poller = Arc::new(QueuePoller::new(
            queue.clone(),
            invoker.clone(),
            EventSourceMapping::new("q", "process"),
        ));
        poller.start();
        for _ in 0..50 {
            if invoker.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        poller.stop().await;

        // Message still owned by the queue, in flight until the visibility
        // window expires.
        let (visible, inflight) = queue.queue_depth("q").unwrap();
        assert_eq!(visible + inflight, 1);
    }

    #[tokio::test]
    async fn stop_cancels_promptly() {
        let queue = queue_provider().await;
        let poller = Arc::new(QueuePoller::new(
            queue,
            BatchInvoker::new(false),
            EventSourceMapping::new("q", "process"),
        ));
        poller.start();
        let started = std::time::Instant::now();
        poller.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn manager_activates_and_deactivates_by_arn() {
        let queue = queue_provider().await;
        queue.send_message("q", "hello", json!({}), None, None).unwrap();
        let invoker = BatchInvoker::new(false);
        let mut invokers: HashMap<String, Arc<dyn FunctionInvoker>> = HashMap::new();
        invokers.insert("process".to_string(), invoker.clone());

        let manager = EventSourceManager::new(queue, invokers);
        manager.activate(
            "esm-1",
            "arn:aws:sqs:local:000000000000:q",
            "arn:aws:lambda:local:000000000000:function:process",
            10,
        );
        for _ in 0..50 {
            if invoker.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(invoker.calls.load(Ordering::SeqCst) >= 1);
        manager.deactivate("esm-1").await;
        manager.stop_all().await;
    }

    #[test]
    fn arn_extraction() {
        assert_eq!(extract_queue_name("arn:aws:sqs:local:000000000000:jobs"), "jobs");
        assert_eq!(
            extract_function_name("arn:aws:lambda:local:000000000000:function:fn"),
            "fn"
        );
        assert_eq!(extract_function_name("plain-name"), "plain-name");
    }
}
