//! Append-only SQLite event store + HTTP client utilities for SAPN.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sapn_core::{CanonicalEvent, EventDraft, EventType};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "sapn-storage";

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database cannot be reached or is locked by another writer.
    #[error("event store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("event store query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("event store row is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unavailable(&err) {
            StoreError::Unavailable(err)
        } else {
            StoreError::Query(err)
        }
    }
}

fn is_unavailable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // extended result codes keep the primary code in the low byte
            .map(|code| {
                matches!(
                    code & 0xff,
                    SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_FULL | SQLITE_CANTOPEN
                )
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    AlreadyExisted,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl EventStore {
    /// Open (creating if needed) the SQLite file and ensure the schema exists.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);
        // one connection: the store assumes a single writer
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.busy_timeout.max(Duration::from_secs(1)))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: config.path.clone(),
        };
        store.migrate().await?;
        info!(path = %config.path.display(), "event store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                date TEXT NOT NULL,
                description TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                notified INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alert_events_type ON alert_events(event_type)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alert_events_pending
             ON alert_events(notified) WHERE notified = 0",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn exists(&self, event_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM alert_events WHERE event_id = ?1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Idempotent insert; an existing row is left untouched.
    pub async fn insert(&self, draft: &EventDraft, notified: bool) -> Result<InsertResult, StoreError> {
        let result = insert_query(draft, notified, Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(insert_result(result.rows_affected(), &draft.event_id))
    }

    /// Insert every draft inside one transaction; either all rows land or none do.
    pub async fn insert_batch(
        &self,
        drafts: &[EventDraft],
        notified: bool,
    ) -> Result<Vec<InsertResult>, StoreError> {
        let first_seen = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let result = insert_query(draft, notified, first_seen)
                .execute(&mut *tx)
                .await?;
            results.push(insert_result(result.rows_affected(), &draft.event_id));
        }
        tx.commit().await?;
        Ok(results)
    }

    pub async fn all_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT event_id FROM alert_events")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("event_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<CanonicalEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT event_id, event_type, date, description, raw_payload, first_seen, notified
             FROM alert_events WHERE event_id = ?1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Events persisted while their notification failed, oldest first.
    pub async fn pending_notification(&self) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT event_id, event_type, date, description, raw_payload, first_seen, notified
             FROM alert_events WHERE notified = 0 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Flip `notified` to true; rows already notified are not counted.
    pub async fn mark_notified(&self, event_ids: &[String]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for event_id in event_ids {
            let result = sqlx::query(
                "UPDATE alert_events SET notified = 1 WHERE event_id = ?1 AND notified = 0",
            )
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn list_recent(&self, limit: u32) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT event_id, event_type, date, description, raw_payload, first_seen, notified
             FROM alert_events ORDER BY id DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alert_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn insert_query(
    draft: &EventDraft,
    notified: bool,
    first_seen: DateTime<Utc>,
) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO alert_events
            (event_id, event_type, date, description, raw_payload, first_seen, notified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(event_id) DO NOTHING",
    )
    .bind(draft.event_id.as_str())
    .bind(draft.event_type.as_str())
    .bind(draft.date)
    .bind(draft.description.as_str())
    .bind(draft.raw_payload.as_str())
    .bind(first_seen)
    .bind(notified)
}

fn insert_result(rows_affected: u64, event_id: &str) -> InsertResult {
    if rows_affected == 0 {
        debug!(event_id, "event already stored, insert skipped");
        InsertResult::AlreadyExisted
    } else {
        InsertResult::Inserted
    }
}

/// Reads one column; a value that does not decode marks the row corrupt.
fn column<'r, T>(row: &'r SqliteRow, event_id: &str, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("{event_id}: column `{name}`: {e}")))
}

fn row_to_event(row: &SqliteRow) -> Result<CanonicalEvent, StoreError> {
    let event_id: String = column(row, "<unknown>", "event_id")?;
    let event_type: String = column(row, &event_id, "event_type")?;
    let event_type = event_type
        .parse::<EventType>()
        .map_err(|e| StoreError::Corrupt(format!("{event_id}: {e}")))?;
    Ok(CanonicalEvent {
        event_type,
        date: column(row, &event_id, "date")?,
        description: column(row, &event_id, "description")?,
        raw_payload: column(row, &event_id, "raw_payload")?,
        first_seen: column(row, &event_id, "first_seen")?,
        notified: column(row, &event_id, "notified")?,
        event_id,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            proxy_url: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    // only the configured proxy is used, never one from the environment
    builder = match &config.proxy_url {
        Some(proxy_url) => {
            builder.proxy(reqwest::Proxy::all(proxy_url).context("parsing proxy url")?)
        }
        None => builder.no_proxy(),
    };

    builder.build().context("building reqwest client")
}
