//! Turso Embedded / libSQL store (offline mode).
//!
//! [`SqlStore`] keeps every record table as JSON documents in one `records`
//! table and captures writes to change-tracked tables into `changes`, all
//! inside the same transaction as the write. Consumers track their progress
//! through the feed in `change_cursor`.
//!
//! **Access rules:**
//! - CLI commands that write: read-write via [`SqlStore::open`]
//! - catalog browsing: read-only via [`SqlStore::open_readonly`]

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use lexiforge_shared::{LexiforgeError, Result};

use crate::changes::{ChangeFeed, ChangeRecord, EVENT_INSERT, EVENT_MODIFY, EVENT_REMOVE};
use crate::kv::{
    Condition, Filter, KeyValueStore, Mutation, Page, PageRequest, Record, apply_mutation,
    validate_index,
};
use crate::migrations;

/// Consumer name used for the change cursor unless overridden.
pub const DEFAULT_CONSUMER: &str = "dispatcher";

fn storage_err(e: libsql::Error) -> LexiforgeError {
    LexiforgeError::Storage(e.to_string())
}

fn encode<R: Record>(record: &R) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|e| LexiforgeError::Storage(format!("failed to encode {} record: {e}", R::TABLE)))
}

fn decode<R: Record>(body: &str) -> Result<R> {
    serde_json::from_str(body)
        .map_err(|e| LexiforgeError::Storage(format!("corrupt {} record: {e}", R::TABLE)))
}

/// Primary storage handle wrapping a libSQL database.
///
/// A single connection serves all operations; the mutex keeps each
/// read-check-write transaction from interleaving with another.
pub struct SqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
    readonly: bool,
    consumer: String,
}

impl SqlStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LexiforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let store = Self {
            db,
            conn: Mutex::new(conn),
            readonly: false,
            consumer: DEFAULT_CONSUMER.to_string(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn: Mutex::new(conn),
            readonly: true,
            consumer: DEFAULT_CONSUMER.to_string(),
        })
    }

    /// Track change-feed progress under a different consumer name.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    LexiforgeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LexiforgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

async fn fetch_body(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "SELECT body FROM records WHERE tbl = ?1 AND pk = ?2",
            params![table, key],
        )
        .await
        .map_err(storage_err)?;

    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
        None => Ok(None),
    }
}

async fn upsert_body(conn: &Connection, table: &str, key: &str, body: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO records (tbl, pk, body, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(tbl, pk) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![table, key, body, now.as_str()],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn capture(
    conn: &Connection,
    table: &str,
    event_name: &str,
    keys: &Map<String, Value>,
    old_image: Option<&str>,
    new_image: Option<&str>,
) -> Result<()> {
    let keys = serde_json::to_string(keys)
        .map_err(|e| LexiforgeError::Storage(format!("failed to encode change keys: {e}")))?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO changes (tbl, event_name, keys, old_image, new_image, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![table, event_name, keys.as_str(), old_image, new_image, now.as_str()],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn collect_page<R: Record>(mut rows: libsql::Rows) -> Result<Vec<R>> {
    let mut items = Vec::new();
    while let Some(row) = rows.next().await.map_err(storage_err)? {
        let body = row.get::<String>(0).map_err(storage_err)?;
        items.push(decode(&body)?);
    }
    Ok(items)
}

#[async_trait]
impl<R: Record> KeyValueStore<R> for SqlStore {
    async fn get(&self, key: &str) -> Result<Option<R>> {
        let conn = self.conn.lock().await;
        fetch_body(&conn, R::TABLE, key)
            .await?
            .as_deref()
            .map(decode)
            .transpose()
    }

    async fn put(&self, record: &R, condition: Condition) -> Result<()> {
        self.check_writable()?;
        let key = record.key();
        let body = encode(record)?;

        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let current_body = fetch_body(&tx, R::TABLE, &key).await?;
        let current: Option<R> = current_body.as_deref().map(decode).transpose()?;

        if !condition.evaluate(current.as_ref())? {
            tx.rollback().await.map_err(storage_err)?;
            return Err(LexiforgeError::condition_failed(key));
        }

        upsert_body(&tx, R::TABLE, &key, &body).await?;
        if R::CAPTURE_CHANGES {
            let event = if current.is_some() { EVENT_MODIFY } else { EVENT_INSERT };
            capture(
                &tx,
                R::TABLE,
                event,
                &record.key_attributes(),
                current_body.as_deref(),
                Some(&body),
            )
            .await?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn update(&self, key: &str, mutation: Mutation<R>, condition: Condition) -> Result<R> {
        self.check_writable()?;

        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let current_body = fetch_body(&tx, R::TABLE, key).await?;
        let current: Option<R> = current_body.as_deref().map(decode).transpose()?;

        if !condition.evaluate(current.as_ref())? {
            tx.rollback().await.map_err(storage_err)?;
            return Err(LexiforgeError::condition_failed(key));
        }
        let Some(current) = current else {
            tx.rollback().await.map_err(storage_err)?;
            return Err(LexiforgeError::not_found(key));
        };

        let updated = apply_mutation(current, mutation)?;
        let body = encode(&updated)?;
        upsert_body(&tx, R::TABLE, key, &body).await?;
        if R::CAPTURE_CHANGES {
            capture(
                &tx,
                R::TABLE,
                EVENT_MODIFY,
                &updated.key_attributes(),
                current_body.as_deref(),
                Some(&body),
            )
            .await?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;

        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;
        let Some(old_body) = fetch_body(&tx, R::TABLE, key).await? else {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(());
        };

        tx.execute(
            "DELETE FROM records WHERE tbl = ?1 AND pk = ?2",
            params![R::TABLE, key],
        )
        .await
        .map_err(storage_err)?;
        if R::CAPTURE_CHANGES {
            let old: R = decode(&old_body)?;
            capture(
                &tx,
                R::TABLE,
                EVENT_REMOVE,
                &old.key_attributes(),
                Some(&old_body),
                None,
            )
            .await?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        value: &str,
        filter: Option<Filter<R>>,
        page: PageRequest,
    ) -> Result<Page<R>> {
        validate_index(index)?;
        let path = format!("$.{index}");
        let after = page.start_after.clone().unwrap_or_default();

        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                "SELECT body FROM records
                 WHERE tbl = ?1 AND pk > ?2 AND json_extract(body, ?3) = ?4
                 ORDER BY pk LIMIT ?5",
                params![R::TABLE, after.as_str(), path.as_str(), value, page.limit as i64],
            )
            .await
            .map_err(storage_err)?;
        let evaluated: Vec<R> = collect_page(rows).await?;

        let next = (evaluated.len() == page.limit)
            .then(|| evaluated.last().map(Record::key))
            .flatten();
        let items = match filter {
            Some(f) => evaluated.into_iter().filter(|r| f(r)).collect(),
            None => evaluated,
        };
        Ok(Page { items, next })
    }

    async fn scan(&self, page: PageRequest) -> Result<Page<R>> {
        let after = page.start_after.clone().unwrap_or_default();

        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                "SELECT body FROM records WHERE tbl = ?1 AND pk > ?2 ORDER BY pk LIMIT ?3",
                params![R::TABLE, after.as_str(), page.limit as i64],
            )
            .await
            .map_err(storage_err)?;
        let items: Vec<R> = collect_page(rows).await?;

        let next = (items.len() == page.limit)
            .then(|| items.last().map(Record::key))
            .flatten();
        Ok(Page { items, next })
    }
}

fn parse_image(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| LexiforgeError::Storage(format!("corrupt change image: {e}")))
    })
    .transpose()
}

#[async_trait]
impl ChangeFeed for SqlStore {
    async fn read_batch(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT seq, tbl, event_name, keys, old_image, new_image FROM changes
                 WHERE seq > COALESCE((SELECT seq FROM change_cursor WHERE consumer = ?1), 0)
                 ORDER BY seq LIMIT ?2",
                params![self.consumer.as_str(), limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let keys = row.get::<String>(3).map_err(storage_err)?;
            let keys: Map<String, Value> = serde_json::from_str(&keys)
                .map_err(|e| LexiforgeError::Storage(format!("corrupt change keys: {e}")))?;
            records.push(ChangeRecord {
                seq: row.get::<i64>(0).map_err(storage_err)?,
                table: row.get::<String>(1).map_err(storage_err)?,
                event_name: row.get::<String>(2).map_err(storage_err)?,
                keys,
                old_image: parse_image(row.get::<String>(4).ok())?,
                new_image: parse_image(row.get::<String>(5).ok())?,
            });
        }
        Ok(records)
    }

    async fn ack(&self, seq: i64) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO change_cursor (consumer, seq) VALUES (?1, ?2)
             ON CONFLICT(consumer) DO UPDATE SET seq = MAX(seq, excluded.seq)",
            params![self.consumer.as_str(), seq],
        )
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}
