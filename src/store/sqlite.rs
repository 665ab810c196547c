// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store backed by SQLite.
//!
//! # Schema
//!
//! ```text
//! remote_clusters(remote_id PK, display_name, site_url, token,
//!                 topics, creator_id, create_at, last_ping_at, enabled)
//! users(id PK, username, email)
//! ```
//!
//! `topics` holds the padded encoding from [`crate::model::encode_topics`],
//! so topic lookup is a `LIKE '% topic %'` scan. SQL narrows the candidate
//! set; [`QueryFilter::matches`] has the final word on every row.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (5 attempts, 10ms
//! doubling to 500ms) before surfacing the error.

use super::{RemoteClusterStore, Store, StoreFuture, UserStore};
use crate::config::StoreConfig;
use crate::error::{RemoteClusterError, Result};
use crate::model::{decode_topics, encode_topics, QueryFilter, RemoteCluster, User};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Escape `%`, `_` and the escape char itself for a LIKE pattern.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(sqlx::FromRow)]
struct RemoteClusterRow {
    remote_id: String,
    display_name: String,
    site_url: String,
    token: String,
    topics: String,
    creator_id: Option<String>,
    create_at: i64,
    last_ping_at: i64,
    enabled: bool,
}

impl From<RemoteClusterRow> for RemoteCluster {
    fn from(row: RemoteClusterRow) -> Self {
        Self {
            remote_id: row.remote_id,
            display_name: row.display_name,
            site_url: row.site_url,
            token: row.token,
            topics: decode_topics(&row.topics),
            creator_id: row.creator_id,
            create_at: row.create_at,
            last_ping_at: row.last_ping_at,
            enabled: row.enabled,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT remote_id, display_name, site_url, token, topics, creator_id, \
     create_at, last_ping_at, enabled FROM remote_clusters";

/// Store backed by a SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing remote cluster store");

        let (options, pool_options) = if config.is_in_memory() {
            // Every connection to :memory: is its own database, so pin one.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| RemoteClusterError::Config(format!("Invalid SQLite path: {}", e)))?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| RemoteClusterError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            (options, SqlitePoolOptions::new().max_connections(4))
        };

        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS remote_clusters (
                remote_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                site_url TEXT NOT NULL,
                token TEXT NOT NULL,
                topics TEXT NOT NULL DEFAULT '',
                creator_id TEXT,
                create_at INTEGER NOT NULL,
                last_ping_at INTEGER NOT NULL DEFAULT 0,
                enabled BOOLEAN NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM remote_clusters")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            info!(count, "Restored remote clusters from previous run");
        }

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    /// Open a database file with default settings.
    pub async fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let config = StoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::open(&config).await
    }

    /// Add or replace a user.
    pub async fn save_user(&self, user: &User) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("save_user", || async {
            sqlx::query(
                r#"
                INSERT INTO users (id, username, email) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    email = excluded.email
                "#,
            )
            .bind(&user.id)
            .bind(&user.username)
            .bind(&user.email)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    async fn select(&self, filter: &QueryFilter) -> Result<Vec<RemoteCluster>> {
        let mut sql = String::from(SELECT_COLUMNS);
        let mut clauses: Vec<&str> = Vec::new();
        if filter.enabled_only {
            clauses.push("enabled = 1");
        }
        if filter.topic.is_some() {
            clauses.push("topics LIKE ? ESCAPE '\\'");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY create_at ASC, remote_id ASC");

        let mut query = sqlx::query_as::<_, RemoteClusterRow>(&sql);
        if let Some(topic) = &filter.topic {
            query = query.bind(format!("% {} %", escape_like(topic)));
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(RemoteCluster::from)
            .filter(|rc| filter.matches(rc))
            .collect())
    }

    async fn fetch_one(&self, remote_id: &str) -> Result<Option<RemoteCluster>> {
        let sql = format!("{} WHERE remote_id = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, RemoteClusterRow>(&sql)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RemoteCluster::from))
    }
}

impl RemoteClusterStore for SqliteStore {
    fn get(&self, remote_id: &str) -> StoreFuture<'_, Option<RemoteCluster>> {
        let remote_id = remote_id.to_string();
        Box::pin(async move { self.fetch_one(&remote_id).await })
    }

    fn get_by_topic(&self, topic: &str, filter: &QueryFilter) -> StoreFuture<'_, Vec<RemoteCluster>> {
        let filter = filter.clone().with_topic(topic);
        Box::pin(async move { self.select(&filter).await })
    }

    fn get_all(&self, filter: &QueryFilter) -> StoreFuture<'_, Vec<RemoteCluster>> {
        let filter = filter.clone();
        Box::pin(async move { self.select(&filter).await })
    }

    fn save(&self, rc: RemoteCluster) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let topics = encode_topics(&rc.topics);
            let result = execute_with_retry("save", || async {
                sqlx::query(
                    r#"
                    INSERT INTO remote_clusters
                        (remote_id, display_name, site_url, token, topics, creator_id,
                         create_at, last_ping_at, enabled)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(remote_id) DO NOTHING
                    "#,
                )
                .bind(&rc.remote_id)
                .bind(&rc.display_name)
                .bind(&rc.site_url)
                .bind(&rc.token)
                .bind(&topics)
                .bind(&rc.creator_id)
                .bind(rc.create_at)
                .bind(rc.last_ping_at)
                .bind(rc.enabled)
                .execute(pool)
                .await
            })
            .await?;

            if result.rows_affected() == 0 {
                return Err(RemoteClusterError::validation(format!(
                    "remote cluster '{}' already exists",
                    rc.remote_id
                )));
            }
            Ok(())
        })
    }

    fn update(&self, rc: RemoteCluster) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let topics = encode_topics(&rc.topics);
            let result = execute_with_retry("update", || async {
                sqlx::query(
                    r#"
                    UPDATE remote_clusters SET
                        display_name = ?, site_url = ?, token = ?, topics = ?,
                        creator_id = ?, last_ping_at = ?, enabled = ?
                    WHERE remote_id = ?
                    "#,
                )
                .bind(&rc.display_name)
                .bind(&rc.site_url)
                .bind(&rc.token)
                .bind(&topics)
                .bind(&rc.creator_id)
                .bind(rc.last_ping_at)
                .bind(rc.enabled)
                .bind(&rc.remote_id)
                .execute(pool)
                .await
            })
            .await?;

            if result.rows_affected() == 0 {
                return Err(RemoteClusterError::not_found(rc.remote_id));
            }
            Ok(())
        })
    }

    fn update_topics(&self, remote_id: &str, topics: BTreeSet<String>) -> StoreFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let encoded = encode_topics(&topics);
            let result = execute_with_retry("update_topics", || async {
                sqlx::query("UPDATE remote_clusters SET topics = ? WHERE remote_id = ?")
                    .bind(&encoded)
                    .bind(&remote_id)
                    .execute(pool)
                    .await
            })
            .await?;

            if result.rows_affected() == 0 {
                return Err(RemoteClusterError::not_found(remote_id));
            }
            Ok(())
        })
    }

    fn set_last_ping_at(&self, remote_id: &str, at_ms: i64) -> StoreFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("set_last_ping_at", || async {
                sqlx::query("UPDATE remote_clusters SET last_ping_at = ? WHERE remote_id = ?")
                    .bind(at_ms)
                    .bind(&remote_id)
                    .execute(pool)
                    .await
            })
            .await?;

            if result.rows_affected() == 0 {
                return Err(RemoteClusterError::not_found(remote_id));
            }
            Ok(())
        })
    }

    fn delete(&self, remote_id: &str) -> StoreFuture<'_, bool> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("delete", || async {
                sqlx::query("DELETE FROM remote_clusters WHERE remote_id = ?")
                    .bind(&remote_id)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }
}

impl UserStore for SqliteStore {
    fn get(&self, user_id: &str) -> StoreFuture<'_, User> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let row: Option<(String, String, String)> =
                sqlx::query_as("SELECT id, username, email FROM users WHERE id = ?")
                    .bind(&user_id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(|(id, username, email)| User { id, username, email })
                .ok_or(RemoteClusterError::UserNotFound { user_id })
        })
    }
}

impl Store for SqliteStore {
    fn remote_cluster(&self) -> &dyn RemoteClusterStore {
        self
    }

    fn user(&self) -> &dyn UserStore {
        self
    }

    /// Checkpoints the WAL and closes the pool.
    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.path != ":memory:" {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Failed to checkpoint WAL on close");
                }
            }
            self.pool.close().await;
            info!("Remote cluster store closed");
            Ok(())
        })
    }
}
