//! Long-term conversation archive: SQLite with a triggered FTS5 index.
//!
//! Turns evicted from the in-memory buffers land here, as do retired
//! world-model lines. Two search paths are exposed (an exact substring scan
//! and a BM25-ranked keyword scan) plus the merge policy management clients
//! rely on: BM25 results first, then grep-only results, deduplicated by id.

use crate::error::ArchiveError;
use crate::session::{Role, SessionKey, Turn};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::path::Path;

pub struct Archive {
    pool: SqlitePool,
}

/// A persisted archive row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArchiveRecord {
    pub id: i64,
    pub session_key: String,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    pub tags: Option<String>,
}

impl Archive {
    /// Open (or create) the archive database and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, ArchiveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| ArchiveError::Open(error.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory archive for tests. Single connection, because each pooled
    /// connection to `sqlite::memory:` would otherwise get its own database.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, ArchiveError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a batch of turns in one transaction. Callers pass disjoint
    /// batches; no duplicate check is made here.
    pub async fn archive(&self, turns: &[Turn]) -> Result<(), ArchiveError> {
        if turns.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for turn in turns {
            sqlx::query(
                "INSERT INTO turns (session_key, role, content, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(turn.session_key.to_string())
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(turn.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Attach a comma-joined tag string to already-inserted rows.
    pub async fn update_tags(&self, ids: &[i64], tags: &[String]) -> Result<(), ArchiveError> {
        if ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        let joined = tags.join(",");
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE turns SET tags = ? WHERE id = ?")
                .bind(&joined)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record a removed world-model line with the reason it was retired.
    pub async fn archive_world_model_item(
        &self,
        section: &str,
        field: &str,
        value: Option<&str>,
        reason: &str,
    ) -> Result<(), ArchiveError> {
        sqlx::query(
            "INSERT INTO world_model_history (section, field, value, reason, removed_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(section)
        .bind(field)
        .bind(value)
        .bind(reason)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Exact substring scan, newest first.
    pub async fn search_grep(&self, query: &str, limit: i64) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let pattern = format!("%{}%", escape_like(query));
        let rows = sqlx::query(
            "SELECT id, session_key, role, content, timestamp, tags \
             FROM turns WHERE content LIKE ? ESCAPE '\\' \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    /// BM25-ranked keyword scan. Malformed FTS queries return an empty
    /// result, never an error.
    pub async fn search_bm25(&self, query: &str, limit: i64) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let result = sqlx::query(
            "SELECT t.id, t.session_key, t.role, t.content, t.timestamp, t.tags \
             FROM turns t JOIN turns_fts ON turns_fts.rowid = t.id \
             WHERE turns_fts MATCH ? \
             ORDER BY bm25(turns_fts) LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => Ok(rows.iter().map(record_from_row).collect()),
            Err(error) => {
                tracing::debug!(%error, query, "full-text query rejected, returning empty");
                Ok(Vec::new())
            }
        }
    }

    /// Run grep and BM25 concurrently and merge: BM25 results first, then
    /// grep-only contributions, deduplicated by id, truncated to `limit`.
    /// This ordering is the only contract clients may rely on.
    pub async fn search_merged(&self, query: &str, limit: i64) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let (bm25, grep) = tokio::join!(
            self.search_bm25(query, limit),
            self.search_grep(query, limit)
        );

        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for record in bm25?.into_iter().chain(grep?) {
            if seen.insert(record.id) {
                merged.push(record);
            }
            if merged.len() as i64 >= limit {
                break;
            }
        }
        Ok(merged)
    }

    /// Newest-first rows for one session.
    pub async fn get_recent_turns(
        &self,
        key: &SessionKey,
        limit: i64,
    ) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let rows = sqlx::query(
            "SELECT id, session_key, role, content, timestamp, tags \
             FROM turns WHERE session_key = ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(key.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn read(&self, id: i64) -> Result<Option<ArchiveRecord>, ArchiveError> {
        let row = sqlx::query(
            "SELECT id, session_key, role, content, timestamp, tags FROM turns WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl ArchiveRecord {
    /// Convert back into a buffered turn. Rows with keys or roles written by
    /// a newer schema are dropped by the caller.
    pub fn into_turn(self) -> Option<Turn> {
        let session_key = SessionKey::parse(&self.session_key).ok()?;
        let role = Role::parse(&self.role)?;
        Some(Turn {
            role,
            content: self.content,
            timestamp: self.timestamp,
            session_key,
        })
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> ArchiveRecord {
    ArchiveRecord {
        id: row.try_get("id").unwrap_or_default(),
        session_key: row.try_get("session_key").unwrap_or_default(),
        role: row.try_get("role").unwrap_or_default(),
        content: row.try_get("content").unwrap_or_default(),
        timestamp: row.try_get("timestamp").unwrap_or_default(),
        tags: row.try_get("tags").ok(),
    }
}

fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
