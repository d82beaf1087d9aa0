//! Key-value table wire surface (JSON-target dialect).

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use serde_json::{json, Value};

use nimbus_core::EmulatorError;
use nimbus_wire::TargetDispatcher;

use crate::table::KvTableProvider;

type Tables = Arc<HashMap<String, Arc<KvTableProvider>>>;

fn lookup(tables: &Tables, body: &Value) -> Result<Arc<KvTableProvider>, EmulatorError> {
    let name = body
        .get("TableName")
        .and_then(Value::as_str)
        .ok_or_else(|| EmulatorError::Validation("missing TableName".into()))?;
    tables
        .get(name)
        .cloned()
        .ok_or_else(|| EmulatorError::NotFound(format!("no such table: {name}")))
}

/// Build the table service app over the declared tables.
pub fn create_table_app(tables: HashMap<String, Arc<KvTableProvider>>) -> Router {
    let tables: Tables = Arc::new(tables);
    let mut dispatcher = TargetDispatcher::new("DynamoDB_20120810");

    let for_put = tables.clone();
    dispatcher.register("PutItem", move |body, _ctx| {
        let tables = for_put.clone();
        async move {
            let table = lookup(&tables, &body)?;
            let item = body
                .get("Item")
                .ok_or_else(|| EmulatorError::Validation("missing Item".into()))?;
            table.put_item(item).await?;
            Ok(json!({}))
        }
    });

    let for_get = tables.clone();
    dispatcher.register("GetItem", move |body, _ctx| {
        let tables = for_get.clone();
        async move {
            let table = lookup(&tables, &body)?;
            let key = body
                .get("Key")
                .ok_or_else(|| EmulatorError::Validation("missing Key".into()))?;
            match table.get_item(key).await? {
                Some(item) => Ok(json!({"Item": item})),
                None => Ok(json!({})),
            }
        }
    });

    let for_delete = tables.clone();
    dispatcher.register("DeleteItem", move |body, _ctx| {
        let tables = for_delete.clone();
        async move {
            let table = lookup(&tables, &body)?;
            let key = body
                .get("Key")
                .ok_or_else(|| EmulatorError::Validation("missing Key".into()))?;
            let removed = table.delete_item(key).await?;
            match removed {
                Some(item) => Ok(json!({"Attributes": item})),
                None => Ok(json!({})),
            }
        }
    });

    let for_query = tables.clone();
    dispatcher.register("Query", move |body, _ctx| {
        let tables = for_query.clone();
        async move {
            let table = lookup(&tables, &body)?;
            let partition = body
                .get("PartitionValue")
                .and_then(Value::as_str)
                .ok_or_else(|| EmulatorError::Validation("missing PartitionValue".into()))?;
            let sort_prefix = body.get("SortPrefix").and_then(Value::as_str);
            let items = match body.get("IndexName").and_then(Value::as_str) {
                Some(index) => table.query_index(index, partition).await?,
                None => table.query(partition, sort_prefix).await?,
            };
            let count = items.len();
            Ok(json!({"Items": items, "Count": count}))
        }
    });

    let for_scan = tables.clone();
    dispatcher.register("Scan", move |body, _ctx| {
        let tables = for_scan.clone();
        async move {
            let table = lookup(&tables, &body)?;
            let items = table.scan().await?;
            let count = items.len();
            Ok(json!({"Items": items, "Count": count}))
        }
    });

    let for_list = tables.clone();
    dispatcher.register("ListTables", move |_body, _ctx| {
        let tables = for_list.clone();
        async move {
            let mut names: Vec<&String> = tables.keys().collect();
            names.sort();
            Ok(json!({"TableNames": names}))
        }
    });

    dispatcher.into_router()
}
