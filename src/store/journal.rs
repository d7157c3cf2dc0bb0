//! SQLite journal under the state store.
//!
//! Persists entries and their metadata JSON so processing state survives
//! restart. The journal sits strictly behind the store actor: it never
//! publishes state itself, and a journal failure degrades durability,
//! not visibility.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::types::{Entry, EntryKind, EntryMetadata, EntryStatus};

/// Journal operation errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// SQLite database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Metadata (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS entries (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    status      TEXT NOT NULL,
    metadata    TEXT NOT NULL
)";

fn kind_to_str(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Task => "task",
        EntryKind::Note => "note",
    }
}

fn str_to_kind(s: &str) -> EntryKind {
    match s {
        "note" => EntryKind::Note,
        _ => EntryKind::Task,
    }
}

fn status_to_str(status: EntryStatus) -> &'static str {
    match status {
        EntryStatus::Unprocessed => "unprocessed",
        EntryStatus::Processing => "processing",
        EntryStatus::Processed => "processed",
        EntryStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> EntryStatus {
    match s {
        "processing" => EntryStatus::Processing,
        "processed" => EntryStatus::Processed,
        "failed" => EntryStatus::Failed,
        _ => EntryStatus::Unprocessed,
    }
}

fn parse_rfc3339_or_now(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-backed persistence for entries and their metadata.
pub struct Journal {
    pool: SqlitePool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish()
    }
}

impl Journal {
    /// Open (creating if missing) a journal backed by a file.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Database`] when the file cannot be opened
    /// or the schema cannot be applied.
    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory journal for testing.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Database`] when the schema cannot be
    /// applied.
    pub async fn open_in_memory() -> Result<Self, JournalError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert or update one entry and its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on serialization or database failure.
    pub async fn upsert_entry(
        &self,
        entry: &Entry,
        metadata: &EntryMetadata,
    ) -> Result<(), JournalError> {
        let metadata_json = serde_json::to_string(metadata)?;
        sqlx::query(
            "INSERT INTO entries (id, kind, content, created_at, status, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 metadata = excluded.metadata",
        )
        .bind(entry.id.to_string())
        .bind(kind_to_str(entry.kind))
        .bind(&entry.content)
        .bind(entry.created_at.to_rfc3339())
        .bind(status_to_str(entry.status))
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load every persisted entry with its metadata.
    ///
    /// Rows that fail to parse are skipped with a warning rather than
    /// poisoning the whole restore.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Database`] when the query itself fails.
    pub async fn load_entries(&self) -> Result<Vec<(Entry, EntryMetadata)>, JournalError> {
        let rows = sqlx::query(
            "SELECT id, kind, content, created_at, status, metadata
             FROM entries ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id_text: String = row.try_get("id")?;
            let id = match uuid::Uuid::parse_str(&id_text) {
                Ok(id) => id,
                Err(e) => {
                    warn!(id = %id_text, error = %e, "skipping journal row with bad id");
                    continue;
                }
            };
            let kind: String = row.try_get("kind")?;
            let content: String = row.try_get("content")?;
            let created_at: String = row.try_get("created_at")?;
            let status: String = row.try_get("status")?;
            let metadata_json: String = row.try_get("metadata")?;

            let metadata = match serde_json::from_str(&metadata_json) {
                Ok(m) => m,
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping journal row with bad metadata");
                    continue;
                }
            };

            out.push((
                Entry {
                    id,
                    kind: str_to_kind(&kind),
                    content,
                    created_at: parse_rfc3339_or_now(&created_at),
                    status: str_to_status(&status),
                },
                metadata,
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, ActionPayload, ActionSpec, ReminderPayload};

    fn make_entry(content: &str) -> Entry {
        Entry::new(EntryKind::Task, content)
    }

    #[tokio::test]
    async fn upsert_then_load_roundtrips() {
        let journal = Journal::open_in_memory().await.expect("open");
        let entry = make_entry("call Jane");
        let metadata = EntryMetadata {
            actions: vec![Action::from_spec(ActionSpec {
                payload: ActionPayload::Reminder(ReminderPayload {
                    title: "call Jane".to_owned(),
                    notes: None,
                    time_expression: None,
                    due: None,
                }),
                reversible: true,
            })],
            processing_meta: None,
            research: Some("notes".to_owned()),
        };

        journal.upsert_entry(&entry, &metadata).await.expect("upsert");

        let loaded = journal.load_entries().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.id, entry.id);
        assert_eq!(loaded[0].0.content, "call Jane");
        assert_eq!(loaded[0].1.actions.len(), 1);
        assert_eq!(loaded[0].1.research.as_deref(), Some("notes"));
    }

    #[tokio::test]
    async fn upsert_twice_updates_status() {
        let journal = Journal::open_in_memory().await.expect("open");
        let mut entry = make_entry("buy milk");
        let metadata = EntryMetadata::default();

        journal.upsert_entry(&entry, &metadata).await.expect("insert");
        entry.status = EntryStatus::Processed;
        journal.upsert_entry(&entry, &metadata).await.expect("update");

        let loaded = journal.load_entries().await.expect("load");
        assert_eq!(loaded.len(), 1, "upsert must not duplicate rows");
        assert_eq!(loaded[0].0.status, EntryStatus::Processed);
    }

    #[tokio::test]
    async fn file_journal_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.db");

        let entry = make_entry("persisted");
        {
            let journal = Journal::open(&path).await.expect("open");
            journal
                .upsert_entry(&entry, &EntryMetadata::default())
                .await
                .expect("upsert");
        }

        let journal = Journal::open(&path).await.expect("reopen");
        let loaded = journal.load_entries().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.id, entry.id);
    }
}
