//! Object bucket emulation.
//!
//! Wraps the file-tree object store with bucket bookkeeping and push-style
//! change notifications: handlers register with a prefix/suffix/event-kind
//! selector and matching callbacks are scheduled as independent tasks after
//! the configured eventual-consistency delay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use nimbus_core::{EmulatorError, Provider, ProviderStatus};
use nimbus_store::{ObjectListing, ObjectMetadata, ObjectStore, StoredObject};

use crate::EventHandler;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketEventKind {
    Created,
    Removed,
}

impl BucketEventKind {
    fn event_name(self) -> &'static str {
        match self {
            BucketEventKind::Created => "ObjectCreated:Put",
            BucketEventKind::Removed => "ObjectRemoved:Delete",
        }
    }
}

/// Which object changes a handler wants.
#[derive(Debug, Clone, Default)]
pub struct NotificationSelector {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub kind: Option<BucketEventKind>,
}

impl NotificationSelector {
    fn matches(&self, key: &str, kind: BucketEventKind) -> bool {
        if let Some(expected) = self.kind {
            if expected != kind {
                return false;
            }
        }
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.suffix {
            if !key.ends_with(suffix.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Registration {
    selector: NotificationSelector,
    handler: EventHandler,
}

/// Provider owning every declared bucket.
pub struct ObjectBucketProvider {
    name: String,
    store: ObjectStore,
    buckets: Mutex<Vec<String>>,
    handlers: Mutex<HashMap<String, Vec<Registration>>>,
    eventual_consistency_delay: Duration,
    status: Mutex<ProviderStatus>,
}

impl ObjectBucketProvider {
    pub fn new(store: ObjectStore, eventual_consistency_delay: Duration) -> Self {
        Self {
            name: "object-store".to_string(),
            store,
            buckets: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            eventual_consistency_delay,
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    pub fn create_bucket(&self, bucket: impl Into<String>) -> Result<(), EmulatorError> {
        let bucket = bucket.into();
        let mut buckets = self.buckets.lock().expect("buckets lock");
        if buckets.contains(&bucket) {
            return Err(EmulatorError::Conflict(format!(
                "bucket already exists: {bucket}"
            )));
        }
        buckets.push(bucket);
        Ok(())
    }

    pub fn list_buckets(&self) -> Vec<String> {
        self.buckets.lock().expect("buckets lock").clone()
    }

    fn check_bucket(&self, bucket: &str) -> Result<(), EmulatorError> {
        if self.buckets.lock().expect("buckets lock").iter().any(|b| b == bucket) {
            Ok(())
        } else {
            Err(EmulatorError::NotFound(format!("no such bucket: {bucket}")))
        }
    }

    /// Register a change handler for one bucket.
    pub fn register_handler(
        &self,
        bucket: &str,
        selector: NotificationSelector,
        handler: EventHandler,
    ) -> Result<(), EmulatorError> {
        self.check_bucket(bucket)?;
        self.handlers
            .lock()
            .expect("handlers lock")
            .entry(bucket.to_string())
            .or_default()
            .push(Registration { selector, handler });
        Ok(())
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectMetadata, EmulatorError> {
        self.check_bucket(bucket)?;
        let meta = self
            .store
            .put_object(bucket, key, body, content_type, metadata)
            .await?;
        self.dispatch(bucket, key, BucketEventKind::Created, meta.size, &meta.etag);
        Ok(meta)
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<StoredObject>, EmulatorError> {
        self.check_bucket(bucket)?;
        self.store.get_object(bucket, key).await
    }

    pub async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, EmulatorError> {
        self.check_bucket(bucket)?;
        self.store.head_object(bucket, key).await
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, EmulatorError> {
        self.check_bucket(bucket)?;
        let existed = self.store.delete_object(bucket, key).await?;
        if existed {
            self.dispatch(bucket, key, BucketEventKind::Removed, 0, "");
        }
        Ok(existed)
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> Result<ObjectListing, EmulatorError> {
        self.check_bucket(bucket)?;
        self.store
            .list_objects(bucket, prefix, max_keys, continuation_token)
            .await
    }

    /// Schedule matching handlers for one object change. Handlers run in
    /// parallel with the producer; their failures are their own problem.
    fn dispatch(&self, bucket: &str, key: &str, kind: BucketEventKind, size: u64, etag: &str) {
        let handlers = self.handlers.lock().expect("handlers lock");
        let Some(registrations) = handlers.get(bucket) else {
            return;
        };
        let event = object_event(bucket, key, kind, size, etag);
        let delay = self.eventual_consistency_delay;
        for registration in registrations {
            if !registration.selector.matches(key, kind) {
                continue;
            }
            let handler = registration.handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                handler(event).await;
            });
        }
    }
}

/// The notification event a bucket change hands to subscribers.
fn object_event(bucket: &str, key: &str, kind: BucketEventKind, size: u64, etag: &str) -> Value {
    json!({
        "Records": [{
            "eventSource": "aws:s3",
            "eventName": kind.event_name(),
            "eventTime": chrono::Utc::now().to_rfc3339(),
            "s3": {
                "bucket": {"name": bucket},
                "object": {"key": key, "size": size, "eTag": etag},
            },
        }]
    })
}

#[async_trait]
impl Provider for ObjectBucketProvider {
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
        let buckets = self.list_buckets();
        for bucket in buckets {
            self.store.reset_bucket(&bucket).await?;
        }
        Ok(())
    }
}
