//! Pub/sub topic emulation.
//!
//! Publishing fans the message out to every subscription whose filter
//! policy (if any) matches the message attributes; each delivery is an
//! independent task.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use nimbus_core::{EmulatorError, Provider, ProviderStatus, LOCAL_ACCOUNT_ID, LOCAL_REGION};

use crate::bus::pattern::match_event;
use crate::EventHandler;

struct Subscription {
    filter_policy: Option<Value>,
    handler: EventHandler,
}

struct TopicState {
    arn: String,
    subscriptions: Vec<Subscription>,
}

/// Provider owning every declared topic.
pub struct PubSubTopicProvider {
    name: String,
    topics: Mutex<HashMap<String, TopicState>>,
    status: Mutex<ProviderStatus>,
}

impl Default for PubSubTopicProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubTopicProvider {
    pub fn new() -> Self {
        Self {
            name: "pubsub".to_string(),
            topics: Mutex::new(HashMap::new()),
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    pub fn create_topic(&self, topic: impl Into<String>) -> Result<String, EmulatorError> {
        let topic = topic.into();
        let mut topics = self.topics.lock().expect("topics lock");
        if topics.contains_key(&topic) {
            return Err(EmulatorError::Conflict(format!(
                "topic already exists: {topic}"
            )));
        }
        let arn = format!("arn:aws:sns:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:{topic}");
        topics.insert(
            topic,
            TopicState {
                arn: arn.clone(),
                subscriptions: Vec::new(),
            },
        );
        Ok(arn)
    }

    pub fn list_topics(&self) -> Vec<(String, String)> {
        let topics = self.topics.lock().expect("topics lock");
        let mut out: Vec<(String, String)> = topics
            .iter()
            .map(|(name, state)| (name.clone(), state.arn.clone()))
            .collect();
        out.sort();
        out
    }

    /// Subscribe a handler, optionally filtered by attribute pattern.
    pub fn subscribe(
        &self,
        topic: &str,
        filter_policy: Option<Value>,
        handler: EventHandler,
    ) -> Result<(), EmulatorError> {
        let mut topics = self.topics.lock().expect("topics lock");
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such topic: {topic}")))?;
        state.subscriptions.push(Subscription {
            filter_policy,
            handler,
        });
        Ok(())
    }

    /// Publish a message; returns the message identifier.
    pub fn publish(
        &self,
        topic: &str,
        message: &str,
        attributes: Value,
    ) -> Result<String, EmulatorError> {
        let topics = self.topics.lock().expect("topics lock");
        let state = topics
            .get(topic)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such topic: {topic}")))?;

        let message_id = uuid::Uuid::new_v4().to_string();
        let event = json!({
            "Records": [{
                "EventSource": "aws:sns",
                "Sns": {
                    "MessageId": message_id,
                    "TopicArn": state.arn,
                    "Message": message,
                    "MessageAttributes": attributes,
                    "Timestamp": chrono::Utc::now().to_rfc3339(),
                },
            }]
        });

        let mut matched = 0usize;
        for subscription in &state.subscriptions {
            if let Some(policy) = &subscription.filter_policy {
                if !match_event(policy, &attributes) {
                    continue;
                }
            }
            matched += 1;
            let handler = subscription.handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                handler(event).await;
            });
        }
        tracing::debug!(topic, matched, "published message");
        Ok(message_id)
    }
}

#[async_trait]
impl Provider for PubSubTopicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
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

    fn supports_reset(&self) -> bool {
        true
    }

    async fn reset(&self) -> Result<(), EmulatorError> {
        let mut topics = self.topics.lock().expect("topics lock");
        for state in topics.values_mut() {
            state.subscriptions.clear();
        }
        Ok(())
    }
}
