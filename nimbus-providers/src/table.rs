//! Key-value table emulation.
//!
//! Thin CRUD over the SQLite table store plus a stream-style item-change
//! dispatcher: every successful write produces an insert/modify/remove
//! record handed to registered handlers as independent tasks.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use nimbus_core::{EmulatorError, Provider, ProviderStatus};
use nimbus_store::{KeySchema, KvTableStore, SecondaryIndex};

use crate::EventHandler;

/// Provider owning one logical table.
pub struct KvTableProvider {
    name: String,
    table_name: String,
    dir: std::path::PathBuf,
    schema: KeySchema,
    indexes: Vec<SecondaryIndex>,
    store: RwLock<Option<KvTableStore>>,
    handlers: Mutex<Vec<EventHandler>>,
    eventual_consistency_delay: Duration,
    status: Mutex<ProviderStatus>,
}

impl KvTableProvider {
    pub fn new(
        dir: impl Into<std::path::PathBuf>,
        table_name: impl Into<String>,
        schema: KeySchema,
        indexes: Vec<SecondaryIndex>,
        eventual_consistency_delay: Duration,
    ) -> Self {
        let table_name = table_name.into();
        Self {
            name: format!("table:{table_name}"),
            table_name,
            dir: dir.into(),
            schema,
            indexes,
            store: RwLock::new(None),
            handlers: Mutex::new(Vec::new()),
            eventual_consistency_delay,
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Subscribe to item-change records.
    pub fn register_handler(&self, handler: EventHandler) {
        self.handlers.lock().expect("handlers lock").push(handler);
    }

    pub async fn put_item(&self, item: &Value) -> Result<(), EmulatorError> {
        let guard = self.store.read().await;
        let store = open_store(&guard, &self.table_name)?;
        let key = store.key_of(item)?;
        let old = store.get_item(&key).await?;
        store.put_item(item).await?;
        let event_name = if old.is_some() { "MODIFY" } else { "INSERT" };
        self.dispatch(event_name, key, old, Some(item.clone()));
        Ok(())
    }

    pub async fn get_item(&self, key: &Value) -> Result<Option<Value>, EmulatorError> {
        let guard = self.store.read().await;
        open_store(&guard, &self.table_name)?.get_item(key).await
    }

    pub async fn delete_item(&self, key: &Value) -> Result<Option<Value>, EmulatorError> {
        let guard = self.store.read().await;
        let store = open_store(&guard, &self.table_name)?;
        let removed = store.delete_item(key).await?;
        if removed.is_some() {
            self.dispatch("REMOVE", key.clone(), removed.clone(), None);
        }
        Ok(removed)
    }

    pub async fn query(
        &self,
        partition_value: &str,
        sort_prefix: Option<&str>,
    ) -> Result<Vec<Value>, EmulatorError> {
        let guard = self.store.read().await;
        open_store(&guard, &self.table_name)?
            .query(partition_value, sort_prefix)
            .await
    }

    pub async fn query_index(
        &self,
        index_name: &str,
        partition_value: &str,
    ) -> Result<Vec<Value>, EmulatorError> {
        let guard = self.store.read().await;
        open_store(&guard, &self.table_name)?
            .query_index(index_name, partition_value)
            .await
    }

    pub async fn scan(&self) -> Result<Vec<Value>, EmulatorError> {
        let guard = self.store.read().await;
        open_store(&guard, &self.table_name)?.scan().await
    }

    fn dispatch(&self, event_name: &str, key: Value, old: Option<Value>, new: Option<Value>) {
        let handlers = self.handlers.lock().expect("handlers lock").clone();
        if handlers.is_empty() {
            return;
        }
        let mut change = json!({"Keys": key});
        if let Some(new_image) = new {
            change["NewImage"] = new_image;
        }
        if let Some(old_image) = old {
            change["OldImage"] = old_image;
        }
        let event = json!({
            "Records": [{
                "eventSource": "aws:dynamodb",
                "eventName": event_name,
                "dynamodb": change,
            }]
        });
        let delay = self.eventual_consistency_delay;
        for handler in handlers {
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

fn open_store<'a>(
    guard: &'a Option<KvTableStore>,
    table_name: &str,
) -> Result<&'a KvTableStore, EmulatorError> {
    guard
        .as_ref()
        .ok_or_else(|| EmulatorError::NotFound(format!("table not started: {table_name}")))
}

#[async_trait]
impl Provider for KvTableProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
        let mut guard = self.store.write().await;
        if guard.is_none() {
            let store = KvTableStore::open(
                &self.dir,
                &self.table_name,
                self.schema.clone(),
                self.indexes.clone(),
            )
            .await
            .map_err(|err| {
                EmulatorError::ProviderStart(format!(
                    "table {} failed to open: {err}",
                    self.table_name
                ))
            })?;
            *guard = Some(store);
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
            && self.store.read().await.is_some()
    }

    fn supports_reset(&self) -> bool {
        true
    }

    async fn reset(&self) -> Result<(), EmulatorError> {
        let guard = self.store.read().await;
        if let Some(store) = guard.as_ref() {
            store.reset().await?;
        }
        Ok(())
    }
}
