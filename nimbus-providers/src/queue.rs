//! Message queue emulation.
//!
//! Queues live in memory; when persistence is enabled the full contents are
//! snapshotted on `flush()` and restored on `start()`. Receives mark
//! messages in-flight for the visibility window and bump the delivery
//! counter; messages whose counter has reached the redrive limit are moved
//! to the dead-letter queue instead of being delivered again. FIFO queues
//! deliver each message group in send order with at most one in-flight
//! batch per group.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use nimbus_core::{EmulatorError, Provider, ProviderStatus};
use nimbus_store::{QueueMessage, QueueSnapshotStore};

/// Declared configuration of one queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout: Duration,
    pub fifo: bool,
    /// Deliveries after which a message is routed to the dead-letter queue.
    pub max_receive_count: Option<u32>,
    pub dead_letter_queue: Option<String>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(30),
            fifo: false,
            max_receive_count: None,
            dead_letter_queue: None,
        }
    }

    pub fn fifo(mut self) -> Self {
        self.fifo = true;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, max_receive_count: u32, dead_letter_queue: &str) -> Self {
        self.max_receive_count = Some(max_receive_count);
        self.dead_letter_queue = Some(dead_letter_queue.to_string());
        self
    }
}

/// A delivered message as seen by consumers.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub message_attributes: Value,
    pub receive_count: u32,
    pub group_id: Option<String>,
}

struct QueueState {
    config: QueueConfig,
    messages: Vec<QueueMessage>,
}

/// Provider owning every declared queue.
pub struct MessageQueueProvider {
    name: String,
    queues: Mutex<HashMap<String, QueueState>>,
    queue_order: Mutex<Vec<String>>,
    snapshots: Option<QueueSnapshotStore>,
    status: Mutex<ProviderStatus>,
}

impl MessageQueueProvider {
    /// `snapshots` enables persistence across restarts.
    pub fn new(snapshots: Option<QueueSnapshotStore>) -> Self {
        Self {
            name: "queue".to_string(),
            queues: Mutex::new(HashMap::new()),
            queue_order: Mutex::new(Vec::new()),
            snapshots,
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    /// Declare a queue. Duplicate names conflict.
    pub fn create_queue(&self, config: QueueConfig) -> Result<(), EmulatorError> {
        let mut queues = self.queues.lock().expect("queues lock");
        if queues.contains_key(&config.name) {
            return Err(EmulatorError::Conflict(format!(
                "queue already exists: {}",
                config.name
            )));
        }
        self.queue_order
            .lock()
            .expect("order lock")
            .push(config.name.clone());
        queues.insert(
            config.name.clone(),
            QueueState {
                config,
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn list_queues(&self) -> Vec<String> {
        self.queue_order.lock().expect("order lock").clone()
    }

    /// Enqueue a message. For FIFO queues a matching deduplication
    /// identifier short-circuits to the already-enqueued message.
    pub fn send_message(
        &self,
        queue_name: &str,
        body: impl Into<String>,
        message_attributes: Value,
        group_id: Option<String>,
        dedup_id: Option<String>,
    ) -> Result<String, EmulatorError> {
        let mut queues = self.queues.lock().expect("queues lock");
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such queue: {queue_name}")))?;

        if state.config.fifo {
            if group_id.is_none() {
                return Err(EmulatorError::Validation(
                    "fifo queues require a message group id".into(),
                ));
            }
            if let Some(dedup) = &dedup_id {
                if let Some(existing) = state
                    .messages
                    .iter()
                    .find(|m| m.dedup_id.as_deref() == Some(dedup))
                {
                    return Ok(existing.message_id.clone());
                }
            }
        }

        let mut message = QueueMessage::new(body);
        message
            .attributes
            .insert("SentTimestamp".to_string(), message.sent_at.to_string());
        message.message_attributes = message_attributes;
        message.group_id = group_id;
        message.dedup_id = dedup_id;
        let message_id = message.message_id.clone();
        state.messages.push(message);
        Ok(message_id)
    }

    /// Receive up to `max_messages` visible messages, marking them in-flight.
    pub fn receive_messages(
        &self,
        queue_name: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, EmulatorError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut queues = self.queues.lock().expect("queues lock");
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such queue: {queue_name}")))?;

        let visibility = state.config.visibility_timeout.as_millis() as i64;
        let max_receive = state.config.max_receive_count;
        let fifo = state.config.fifo;
        let dlq_name = state.config.dead_letter_queue.clone();

        // Groups with an in-flight message must not be delivered again until
        // the batch is acked or redelivered.
        let blocked_groups: HashSet<String> = if fifo {
            state
                .messages
                .iter()
                .filter(|m| !m.is_visible(now))
                .filter_map(|m| m.group_id.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut delivered = Vec::new();
        let mut dead_lettered = Vec::new();

        for message in state.messages.iter_mut() {
            if delivered.len() >= max_messages {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }
            if fifo {
                if let Some(group) = &message.group_id {
                    if blocked_groups.contains(group) {
                        continue;
                    }
                }
            }
            if let (Some(limit), Some(_)) = (max_receive, &dlq_name) {
                if message.receive_count >= limit {
                    dead_lettered.push(message.message_id.clone());
                    continue;
                }
            }

            message.receive_count += 1;
            if message.first_received_at == 0 {
                message.first_received_at = now;
            }
            message.invisible_until = now + visibility;
            let receipt_handle = uuid::Uuid::new_v4().to_string();
            message.receipt_handle = Some(receipt_handle.clone());
            message
                .attributes
                .insert("ApproximateReceiveCount".to_string(), message.receive_count.to_string());

            delivered.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                receipt_handle,
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                message_attributes: message.message_attributes.clone(),
                receive_count: message.receive_count,
                group_id: message.group_id.clone(),
            });
        }

        // Exhausted messages move to the dead-letter queue whole, with no
        // copy remaining at the source.
        if !dead_lettered.is_empty() {
            let dlq_name = dlq_name.expect("redrive checked above");
            let mut moved = Vec::new();
            let state = queues.get_mut(queue_name).expect("queue present");
            state.messages.retain_mut(|m| {
                if dead_lettered.contains(&m.message_id) {
                    moved.push(m.clone());
                    false
                } else {
                    true
                }
            });
            match queues.get_mut(&dlq_name) {
                Some(dlq) => {
                    for mut message in moved {
                        message.invisible_until = 0;
                        message.receipt_handle = None;
                        tracing::warn!(
                            queue = queue_name,
                            dlq = %dlq_name,
                            message_id = %message.message_id,
                            "message exhausted redeliveries, moved to dead-letter queue"
                        );
                        dlq.messages.push(message);
                    }
                }
                None => {
                    tracing::error!(queue = queue_name, dlq = %dlq_name, "dead-letter queue missing");
                }
            }
        }

        Ok(delivered)
    }

    /// Acknowledge (delete) a message by receipt handle.
    pub fn delete_message(
        &self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<bool, EmulatorError> {
        let mut queues = self.queues.lock().expect("queues lock");
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such queue: {queue_name}")))?;
        let before = state.messages.len();
        state
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(state.messages.len() < before)
    }

    pub fn purge_queue(&self, queue_name: &str) -> Result<(), EmulatorError> {
        let mut queues = self.queues.lock().expect("queues lock");
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such queue: {queue_name}")))?;
        state.messages.clear();
        Ok(())
    }

    /// (visible, in-flight) message counts.
    pub fn queue_depth(&self, queue_name: &str) -> Result<(usize, usize), EmulatorError> {
        let now = chrono::Utc::now().timestamp_millis();
        let queues = self.queues.lock().expect("queues lock");
        let state = queues
            .get(queue_name)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such queue: {queue_name}")))?;
        let visible = state.messages.iter().filter(|m| m.is_visible(now)).count();
        Ok((visible, state.messages.len() - visible))
    }

    fn snapshot(&self) -> Vec<(String, Vec<QueueMessage>)> {
        let queues = self.queues.lock().expect("queues lock");
        queues
            .iter()
            .map(|(name, state)| (name.clone(), state.messages.clone()))
            .collect()
    }
}

#[async_trait]
impl Provider for MessageQueueProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
        if self.status.lock().expect("status lock").is_running() {
            return Ok(());
        }
        if let Some(snapshots) = &self.snapshots {
            let names = self.list_queues();
            for queue_name in names {
                let restored = snapshots.load(&queue_name).await?;
                if !restored.is_empty() {
                    tracing::info!(queue = %queue_name, count = restored.len(), "restored queue state");
                    let mut queues = self.queues.lock().expect("queues lock");
                    if let Some(state) = queues.get_mut(&queue_name) {
                        state.messages = restored;
                    }
                }
            }
        }
        *self.status.lock().expect("status lock") = ProviderStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EmulatorError> {
        *self.status.lock().expect("status lock") = ProviderStatus::Stopped;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.status.lock().expect("status lock").is_running()
    }

    fn supports_flush(&self) -> bool {
        self.snapshots.is_some()
    }

    fn supports_reset(&self) -> bool {
        true
    }

    async fn flush(&self) -> Result<(), EmulatorError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(());
        };
        for (queue_name, messages) in self.snapshot() {
            snapshots.save(&queue_name, &messages).await?;
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), EmulatorError> {
        {
            let mut queues = self.queues.lock().expect("queues lock");
            for state in queues.values_mut() {
                state.messages.clear();
            }
        }
        if let Some(snapshots) = &self.snapshots {
            snapshots.reset_all().await?;
        }
        Ok(())
    }
}
