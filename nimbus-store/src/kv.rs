//! SQLite-backed key-value table storage.
//!
//! One database file per logical table. Items are JSON documents keyed by a
//! partition key and an optional sort key; each secondary index gets its own
//! key table pointing back at the primary key.

use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use nimbus_core::EmulatorError;

/// Primary key layout of a table.
#[derive(Debug, Clone)]
pub struct KeySchema {
    pub partition_key: String,
    pub sort_key: Option<String>,
}

/// A secondary index definition.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

/// Storage for one logical table.
pub struct KvTableStore {
    pool: SqlitePool,
    schema: KeySchema,
    indexes: Vec<SecondaryIndex>,
    db_path: PathBuf,
}

fn db_error(err: sqlx::Error) -> EmulatorError {
    EmulatorError::Internal(format!("kv store: {err}"))
}

/// Render a key attribute into its canonical text form.
fn key_text(item: &Value, attribute: &str) -> Result<String, EmulatorError> {
    match item.get(attribute) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(EmulatorError::Validation(format!(
            "key attribute {attribute} must be a string or number, got {other}"
        ))),
        None => Err(EmulatorError::Validation(format!(
            "missing key attribute: {attribute}"
        ))),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl KvTableStore {
    /// Open (creating if needed) the database for a logical table.
    pub async fn open(
        dir: &Path,
        table_name: &str,
        schema: KeySchema,
        indexes: Vec<SecondaryIndex>,
    ) -> Result<Self, EmulatorError> {
        tokio::fs::create_dir_all(dir).await?;
        let db_path = dir.join(format!("{}.db", sanitize(table_name)));
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS items (
                pk TEXT NOT NULL,
                sk TEXT NOT NULL DEFAULT '',
                payload TEXT NOT NULL,
                PRIMARY KEY (pk, sk)
            )",
        )
        .execute(&pool)
        .await
        .map_err(db_error)?;

        for index in &indexes {
            let table = format!("idx_{}", sanitize(&index.name));
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    ipk TEXT NOT NULL,
                    isk TEXT NOT NULL DEFAULT '',
                    pk TEXT NOT NULL,
                    sk TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (ipk, isk, pk, sk)
                )"
            ))
            .execute(&pool)
            .await
            .map_err(db_error)?;
        }

        Ok(Self {
            pool,
            schema,
            indexes,
            db_path,
        })
    }

    fn primary_key(&self, item: &Value) -> Result<(String, String), EmulatorError> {
        let pk = key_text(item, &self.schema.partition_key)?;
        let sk = match &self.schema.sort_key {
            Some(attr) => key_text(item, attr)?,
            None => String::new(),
        };
        Ok((pk, sk))
    }

    /// Insert or replace an item.
    pub async fn put_item(&self, item: &Value) -> Result<(), EmulatorError> {
        if !item.is_object() {
            return Err(EmulatorError::Validation("item must be an object".into()));
        }
        let (pk, sk) = self.primary_key(item)?;
        let payload = item.to_string();

        sqlx::query("INSERT OR REPLACE INTO items (pk, sk, payload) VALUES (?, ?, ?)")
            .bind(&pk)
            .bind(&sk)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        for index in &self.indexes {
            let table = format!("idx_{}", sanitize(&index.name));
            sqlx::query(&format!("DELETE FROM {table} WHERE pk = ? AND sk = ?"))
                .bind(&pk)
                .bind(&sk)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

            // Items missing the index key simply do not appear in the index.
            let Ok(ipk) = key_text(item, &index.partition_key) else {
                continue;
            };
            let isk = match &index.sort_key {
                Some(attr) => key_text(item, attr).unwrap_or_default(),
                None => String::new(),
            };
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO {table} (ipk, isk, pk, sk) VALUES (?, ?, ?, ?)"
            ))
            .bind(&ipk)
            .bind(&isk)
            .bind(&pk)
            .bind(&sk)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        }
        Ok(())
    }

    /// Fetch one item by its full key, `None` when missing.
    pub async fn get_item(&self, key: &Value) -> Result<Option<Value>, EmulatorError> {
        let (pk, sk) = self.primary_key(key)?;
        let row = sqlx::query("SELECT payload FROM items WHERE pk = ? AND sk = ?")
            .bind(&pk)
            .bind(&sk)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Delete an item by key. Returns the previous item when it existed.
    pub async fn delete_item(&self, key: &Value) -> Result<Option<Value>, EmulatorError> {
        let existing = self.get_item(key).await?;
        if existing.is_none() {
            return Ok(None);
        }
        let (pk, sk) = self.primary_key(key)?;
        sqlx::query("DELETE FROM items WHERE pk = ? AND sk = ?")
            .bind(&pk)
            .bind(&sk)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        for index in &self.indexes {
            let table = format!("idx_{}", sanitize(&index.name));
            sqlx::query(&format!("DELETE FROM {table} WHERE pk = ? AND sk = ?"))
                .bind(&pk)
                .bind(&sk)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        Ok(existing)
    }

    /// All items sharing a partition key, optionally narrowed by a sort-key
    /// prefix, in sort-key order.
    pub async fn query(
        &self,
        partition_value: &str,
        sort_prefix: Option<&str>,
    ) -> Result<Vec<Value>, EmulatorError> {
        let rows = match sort_prefix {
            Some(prefix) => {
                sqlx::query(
                    "SELECT payload FROM items WHERE pk = ? AND sk LIKE ? || '%' ORDER BY sk",
                )
                .bind(partition_value)
                .bind(prefix)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT payload FROM items WHERE pk = ? ORDER BY sk")
                    .bind(partition_value)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_error)?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload).map_err(Into::into)
            })
            .collect()
    }

    /// Query through a secondary index.
    pub async fn query_index(
        &self,
        index_name: &str,
        partition_value: &str,
    ) -> Result<Vec<Value>, EmulatorError> {
        if !self.indexes.iter().any(|i| i.name == index_name) {
            return Err(EmulatorError::NotFound(format!(
                "unknown index: {index_name}"
            )));
        }
        let table = format!("idx_{}", sanitize(index_name));
        let rows = sqlx::query(&format!(
            "SELECT items.payload FROM {table}
             JOIN items ON items.pk = {table}.pk AND items.sk = {table}.sk
             WHERE {table}.ipk = ? ORDER BY {table}.isk"
        ))
        .bind(partition_value)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload).map_err(Into::into)
            })
            .collect()
    }

    /// Every item in the table.
    pub async fn scan(&self) -> Result<Vec<Value>, EmulatorError> {
        let rows = sqlx::query("SELECT payload FROM items ORDER BY pk, sk")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload).map_err(Into::into)
            })
            .collect()
    }

    /// Drop every item and index entry.
    pub async fn reset(&self) -> Result<(), EmulatorError> {
        sqlx::query("DELETE FROM items")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        for index in &self.indexes {
            let table = format!("idx_{}", sanitize(&index.name));
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    /// Extract the table key attributes from a full item.
    pub fn key_of(&self, item: &Value) -> Result<Value, EmulatorError> {
        let mut key = serde_json::Map::new();
        let (pk, _) = self.primary_key(item)?;
        key.insert(self.schema.partition_key.clone(), Value::String(pk));
        if let Some(attr) = &self.schema.sort_key {
            key.insert(attr.clone(), Value::String(key_text(item, attr)?));
        }
        Ok(Value::Object(key))
    }

    pub fn indexes(&self) -> &[SecondaryIndex] {
        &self.indexes
    }

    /// Borrowed by providers that need ad-hoc statistics.
    pub async fn item_count(&self) -> Result<u64, EmulatorError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM items")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn orders_table(dir: &Path) -> KvTableStore {
        KvTableStore::open(
            dir,
            "orders",
            KeySchema {
                partition_key: "orderId".to_string(),
                sort_key: Some("itemId".to_string()),
            },
            vec![SecondaryIndex {
                name: "by-status".to_string(),
                partition_key: "status".to_string(),
                sort_key: None,
            }],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_returns_exact_item() {
        let dir = tempfile::tempdir().unwrap();
        let table = orders_table(dir.path()).await;

        let item = json!({"orderId": "o1", "itemId": "i1", "quantity": 5});
        table.put_item(&item).await.unwrap();

        let found = table
            .get_item(&json!({"orderId": "o1", "itemId": "i1"}))
            .await
            .unwrap();
        assert_eq!(found, Some(item));
    }

    #[tokio::test]
    async fn get_with_wrong_sort_key_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let table = orders_table(dir.path()).await;
        table
            .put_item(&json!({"orderId": "o1", "itemId": "i1", "quantity": 5}))
            .await
            .unwrap();

        let found = table
            .get_item(&json!({"orderId": "o1", "itemId": "i9"}))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn query_by_partition_orders_by_sort_key() {
        let dir = tempfile::tempdir().unwrap();
        let table = orders_table(dir.path()).await;
        for (order, item) in [("o1", "i2"), ("o1", "i1"), ("o2", "i1")] {
            table
                .put_item(&json!({"orderId": order, "itemId": item}))
                .await
                .unwrap();
        }

        let results = table.query("o1", None).await.unwrap();
        let items: Vec<&str> = results.iter().map(|v| v["itemId"].as_str().unwrap()).collect();
        assert_eq!(items, vec!["i1", "i2"]);

        let narrowed = table.query("o1", Some("i2")).await.unwrap();
        assert_eq!(narrowed.len(), 1);
    }

    #[tokio::test]
    async fn secondary_index_query() {
        let dir = tempfile::tempdir().unwrap();
        let table = orders_table(dir.path()).await;
        table
            .put_item(&json!({"orderId": "o1", "itemId": "i1", "status": "open"}))
            .await
            .unwrap();
        table
            .put_item(&json!({"orderId": "o2", "itemId": "i1", "status": "done"}))
            .await
            .unwrap();

        let open = table.query_index("by-status", "open").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0]["orderId"], "o1");

        assert!(table.query_index("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn delete_returns_previous_item() {
        let dir = tempfile::tempdir().unwrap();
        let table = orders_table(dir.path()).await;
        let item = json!({"orderId": "o1", "itemId": "i1"});
        table.put_item(&item).await.unwrap();

        let removed = table.delete_item(&item).await.unwrap();
        assert_eq!(removed, Some(item.clone()));
        assert!(table.delete_item(&item).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_key_attribute_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = orders_table(dir.path()).await;
        let err = table.put_item(&json!({"orderId": "o1"})).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = orders_table(dir.path()).await;
            table
                .put_item(&json!({"orderId": "o1", "itemId": "i1"}))
                .await
                .unwrap();
        }
        let table = orders_table(dir.path()).await;
        assert_eq!(table.item_count().await.unwrap(), 1);
    }
}
