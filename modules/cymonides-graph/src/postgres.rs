//! Postgres-backed NodeStore.
//!
//! One table per partition: `(id TEXT PK, version BIGINT, doc JSONB)`.
//! Compare-and-swap is a `WHERE version = $expected` update, which gives
//! row-level optimistic locking without holding transactions open across the
//! read-modify-write cycle.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::types::Json;
use tracing::warn;

use cymonides_common::Node;

use crate::migrate::{migrate, quote_ident};
use crate::store::{NodeFilter, NodeStore, StoreError, Versioned};
use crate::GraphClient;

const UNDEFINED_TABLE: &str = "42P01";

pub struct PgNodeStore {
    client: GraphClient,
    ensured: Mutex<HashSet<String>>,
}

impl PgNodeStore {
    pub fn new(client: GraphClient) -> Self {
        Self {
            client,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    fn already_ensured(&self, partition: &str) -> bool {
        self.ensured
            .lock()
            .map(|set| set.contains(partition))
            .unwrap_or(false)
    }
}

/// Connection-level failures are fatal; everything else is scoped to one operation.
fn classify(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn is_undefined_table(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE))
}

fn to_version(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[async_trait]
impl NodeStore for PgNodeStore {
    async fn ensure_partition(&self, partition: &str) -> Result<(), StoreError> {
        if self.already_ensured(partition) {
            return Ok(());
        }
        migrate(&self.client, partition).await.map_err(classify)?;
        if let Ok(mut set) = self.ensured.lock() {
            set.insert(partition.to_string());
        }
        Ok(())
    }

    async fn get(&self, partition: &str, id: &str) -> Result<Option<Versioned>, StoreError> {
        let sql = format!("SELECT version, doc FROM {} WHERE id = $1", quote_ident(partition));
        let row = sqlx::query_as::<_, (i64, Json<Node>)>(&sql)
            .bind(id)
            .fetch_optional(&self.client.pool)
            .await;

        match row {
            Ok(row) => Ok(row.map(|(version, Json(node))| Versioned {
                node,
                version: u64::try_from(version).unwrap_or_default(),
            })),
            Err(e) if is_undefined_table(&e) => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    async fn insert(&self, partition: &str, node: &Node) -> Result<bool, StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, version, doc) VALUES ($1, 1, $2) ON CONFLICT (id) DO NOTHING",
            quote_ident(partition)
        );
        let result = sqlx::query(&sql)
            .bind(&node.id)
            .bind(Json(node))
            .execute(&self.client.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace(&self, partition: &str, node: &Node, expected: u64) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET doc = $2, version = version + 1, updated_at = now()
             WHERE id = $1 AND version = $3",
            quote_ident(partition)
        );
        let result = sqlx::query(&sql)
            .bind(&node.id)
            .bind(Json(node))
            .bind(to_version(expected))
            .execute(&self.client.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, partition: &str, id: &str, expected: u64) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND version = $2",
            quote_ident(partition)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(to_version(expected))
            .execute(&self.client.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, partition: &str, filter: &NodeFilter) -> Result<Vec<Node>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE doc @> $1 ORDER BY id",
            quote_ident(partition)
        );
        let rows = sqlx::query_as::<_, (Json<Node>,)>(&sql)
            .bind(Json(filter.containment()))
            .fetch_all(&self.client.pool)
            .await;

        match rows {
            Ok(rows) => Ok(rows.into_iter().map(|(Json(node),)| node).collect()),
            Err(e) if is_undefined_table(&e) => {
                warn!(partition, "Lookup against a partition that was never created");
                Ok(Vec::new())
            }
            Err(e) => Err(classify(e)),
        }
    }
}
