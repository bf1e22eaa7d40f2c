//! SQLite storage for conversations and notes.
//!
//! Uses a single SQLite database file with three tables:
//! - `conversations` — one row per conversation, with its owner
//! - `chat_history` — append-only turns, ordered by `created_at`
//! - `notes` — user notes plus their last computed embedding (f32 LE blob)

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use fastrag_core::error::StoreError;
use fastrag_core::message::{
    Conversation, ConversationId, ConversationTurn, OwnerId, Role, TurnOrigin,
};
use fastrag_core::note::{Note, NoteEvent, NoteUpdate};
use fastrag_core::store::{HistoryStore, NoteStore, Page};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::vector::{blob_to_embedding, embedding_to_blob};
use crate::{NOTE_EVENT_CAPACITY, next_timestamp};

/// Conversation history and notes in one SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    events: broadcast::Sender<NoteEvent>,
    /// Serializes appends so `created_at` stays strictly increasing
    append_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (or create) the database at `url`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to ":memory:" is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let (events, _) = broadcast::channel(NOTE_EVENT_CAPACITY);
        let store = Self {
            pool,
            events,
            append_lock: Mutex::new(()),
        };
        store.create_tables().await?;
        Ok(store)
    }

    /// Create tables and indexes if they are missing.
    async fn create_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                owner_id        TEXT NOT NULL,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_history (
                iid             INTEGER PRIMARY KEY AUTOINCREMENT,
                turn_id         TEXT UNIQUE NOT NULL,
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
                role            TEXT NOT NULL,
                message         TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                token_count     INTEGER NOT NULL,
                llm_provider    TEXT,
                llm_model       TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("chat_history table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_history_conv ON chat_history(conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("chat_history index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                note_id    TEXT PRIMARY KEY,
                owner_id   TEXT NOT NULL,
                title      TEXT NOT NULL,
                body       TEXT NOT NULL,
                tags       TEXT NOT NULL DEFAULT '[]',
                url        TEXT,
                comments   TEXT,
                embedding  BLOB,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("notes table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_notes_owner ON notes(owner_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("notes index: {e}")))?;

        // Databases created before these columns existed.
        for (table, column) in [
            ("chat_history", "llm_provider"),
            ("chat_history", "llm_model"),
            ("notes", "url"),
            ("notes", "comments"),
        ] {
            self.ensure_column(table, column).await?;
        }

        debug!("SQLite tables ready");
        Ok(())
    }

    /// Add a nullable TEXT column when an older schema lacks it.
    async fn ensure_column(&self, table: &str, column: &str) -> Result<(), StoreError> {
        let existing: Vec<String> =
            sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{table}')"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{table} columns: {e}")))?;
        if existing.iter().any(|name| name == column) {
            return Ok(());
        }

        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} TEXT"))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("{table}.{column}: {e}")))?;
        info!(table, column, "Added missing column");
        Ok(())
    }

    fn publish(&self, event: NoteEvent) {
        let _ = self.events.send(event);
    }

    fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationTurn, StoreError> {
        let turn_id: String = column(row, "turn_id")?;
        let conversation_id: String = column(row, "conversation_id")?;
        let role: String = column(row, "role")?;
        let text: String = column(row, "message")?;
        let created_at: String = column(row, "created_at")?;
        let token_count: i64 = column(row, "token_count")?;
        let llm_provider: Option<String> = column(row, "llm_provider")?;
        let llm_model: Option<String> = column(row, "llm_model")?;

        let role = Role::parse(&role)
            .ok_or_else(|| StoreError::QueryFailed(format!("unknown role {role:?}")))?;

        Ok(ConversationTurn {
            turn_id,
            conversation_id: ConversationId(conversation_id),
            role,
            text,
            created_at: parse_timestamp(&created_at)?,
            token_count: token_count.max(0) as usize,
            llm_provider,
            llm_model,
        })
    }

    fn row_to_note(row: &sqlx::sqlite::SqliteRow) -> Result<Note, StoreError> {
        let note_id: String = column(row, "note_id")?;
        let owner_id: String = column(row, "owner_id")?;
        let title: String = column(row, "title")?;
        let body: String = column(row, "body")?;
        let tags_json: String = column(row, "tags")?;
        let url: Option<String> = column(row, "url")?;
        let comments: Option<String> = column(row, "comments")?;
        let embedding: Option<Vec<u8>> = column(row, "embedding")?;
        let updated_at: String = column(row, "updated_at")?;

        let tags: Vec<String> = serde_json::from_str(&tags_json)
            .map_err(|e| StoreError::QueryFailed(format!("tags column: {e}")))?;

        Ok(Note {
            note_id,
            owner_id: OwnerId(owner_id),
            title,
            body,
            tags,
            url,
            comments,
            embedding: embedding.map(|blob| blob_to_embedding(&blob)),
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    async fn fetch_note(&self, note_id: &str) -> Result<Option<Note>, StoreError> {
        let row = sqlx::query("SELECT * FROM notes WHERE note_id = ?1")
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET note: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_note(r)?)),
            None => Ok(None),
        }
    }
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

/// Fixed-width RFC 3339 so lexical order matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn ensure_conversation(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
    ) -> Result<Conversation, StoreError> {
        let created = Conversation::new(conversation_id.clone(), owner_id.clone());
        sqlx::query(
            "INSERT INTO conversations (conversation_id, owner_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id) DO NOTHING",
        )
        .bind(conversation_id.as_str())
        .bind(owner_id.as_str())
        .bind(format_timestamp(&created.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT conversation failed: {e}")))?;

        let row = sqlx::query("SELECT * FROM conversations WHERE conversation_id = ?1")
            .bind(conversation_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET conversation: {e}")))?;

        let stored_owner: String = column(&row, "owner_id")?;
        if stored_owner != owner_id.as_str() {
            return Err(StoreError::OwnerMismatch {
                conversation_id: conversation_id.to_string(),
            });
        }
        let created_at: String = column(&row, "created_at")?;

        Ok(Conversation {
            conversation_id: conversation_id.clone(),
            owner_id: owner_id.clone(),
            created_at: parse_timestamp(&created_at)?,
        })
    }

    async fn append_turn_from(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        text: &str,
        origin: Option<&TurnOrigin>,
    ) -> Result<String, StoreError> {
        let _guard = self.append_lock.lock().await;

        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM conversations WHERE conversation_id = ?1) AS known,
                (SELECT MAX(created_at) FROM chat_history WHERE conversation_id = ?1) AS last",
        )
        .bind(conversation_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("last turn lookup: {e}")))?;

        let known: i64 = column(&row, "known")?;
        if known == 0 {
            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
        }
        let last: Option<String> = column(&row, "last")?;
        let last = last.as_deref().map(parse_timestamp).transpose()?;

        let mut turn = ConversationTurn::new(conversation_id.clone(), role, text).with_origin(origin);
        turn.created_at = next_timestamp(last);

        sqlx::query(
            r#"
            INSERT INTO chat_history
                (turn_id, conversation_id, role, message, created_at, token_count, llm_provider, llm_model)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&turn.turn_id)
        .bind(conversation_id.as_str())
        .bind(role.as_str())
        .bind(&turn.text)
        .bind(format_timestamp(&turn.created_at))
        .bind(turn.token_count as i64)
        .bind(turn.llm_provider.as_deref())
        .bind(turn.llm_model.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT turn failed: {e}")))?;

        debug!(conversation = %conversation_id, role = %role, "Stored turn {}", turn.turn_id);
        Ok(turn.turn_id)
    }

    async fn get_recent(
        &self,
        conversation_id: &ConversationId,
        k: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM chat_history WHERE conversation_id = ?1
             ORDER BY created_at DESC, iid DESC LIMIT ?2",
        )
        .bind(conversation_id.as_str())
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("recent turns: {e}")))?;

        let mut turns = rows
            .iter()
            .map(Self::row_to_turn)
            .collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn get_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM chat_history WHERE conversation_id = ?1 ORDER BY created_at ASC, iid ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("history: {e}")))?;

        rows.iter().map(Self::row_to_turn).collect()
    }

    async fn get_history_page(
        &self,
        conversation_id: &ConversationId,
        page: Page,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM chat_history WHERE conversation_id = ?1
             ORDER BY created_at ASC, iid ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(conversation_id.as_str())
        .bind(page.limit as i64)
        .bind(page.skip as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("history page: {e}")))?;

        rows.iter().map(Self::row_to_turn).collect()
    }
}

#[async_trait]
impl NoteStore for SqliteStore {
    async fn list_notes(&self, owner_id: &OwnerId) -> Result<Vec<Note>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notes WHERE owner_id = ?1 ORDER BY updated_at DESC, note_id ASC",
        )
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list notes: {e}")))?;

        rows.iter().map(Self::row_to_note).collect()
    }

    async fn list_notes_page(&self, owner_id: &OwnerId, page: Page) -> Result<Vec<Note>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notes WHERE owner_id = ?1 ORDER BY updated_at DESC, note_id ASC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(owner_id.as_str())
        .bind(page.limit as i64)
        .bind(page.skip as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list notes page: {e}")))?;

        rows.iter().map(Self::row_to_note).collect()
    }

    async fn list_owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let owners: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT owner_id FROM notes ORDER BY owner_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("list owners: {e}")))?;
        Ok(owners.into_iter().map(OwnerId).collect())
    }

    async fn get_note(&self, note_id: &str) -> Result<Option<Note>, StoreError> {
        self.fetch_note(note_id).await
    }

    async fn create_note(&self, mut note: Note) -> Result<Note, StoreError> {
        note.updated_at = note.updated_at.trunc_subsecs(6);
        let tags_json = serde_json::to_string(&note.tags)
            .map_err(|e| StoreError::Storage(format!("Tags serialization: {e}")))?;
        let embedding_blob = note.embedding.as_deref().map(embedding_to_blob);

        sqlx::query(
            r#"
            INSERT INTO notes (note_id, owner_id, title, body, tags, url, comments, embedding, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&note.note_id)
        .bind(note.owner_id.as_str())
        .bind(&note.title)
        .bind(&note.body)
        .bind(&tags_json)
        .bind(note.url.as_deref())
        .bind(note.comments.as_deref())
        .bind(embedding_blob.as_deref())
        .bind(format_timestamp(&note.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT note failed: {e}")))?;

        self.publish(NoteEvent::Upserted(note.clone()));
        Ok(note)
    }

    async fn update_note(&self, note_id: &str, update: NoteUpdate) -> Result<Note, StoreError> {
        let tags_json = serde_json::to_string(&update.tags)
            .map_err(|e| StoreError::Storage(format!("Tags serialization: {e}")))?;

        let current = self
            .fetch_note(note_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))?;

        let result = sqlx::query(
            r#"
            UPDATE notes
            SET title = ?2, body = ?3, tags = ?4, url = ?5, comments = ?6,
                embedding = NULL, updated_at = ?7
            WHERE note_id = ?1
            "#,
        )
        .bind(note_id)
        .bind(&update.title)
        .bind(&update.body)
        .bind(&tags_json)
        .bind(update.url.as_deref())
        .bind(update.comments.as_deref())
        .bind(format_timestamp(&next_timestamp(Some(current.updated_at))))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE note failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("note {note_id}")));
        }

        let note = self
            .fetch_note(note_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))?;
        self.publish(NoteEvent::Upserted(note.clone()));
        Ok(note)
    }

    async fn delete_note(&self, note_id: &str) -> Result<Note, StoreError> {
        let note = self
            .fetch_note(note_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))?;

        sqlx::query("DELETE FROM notes WHERE note_id = ?1")
            .bind(note_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE note failed: {e}")))?;

        self.publish(NoteEvent::Deleted {
            note_id: note.note_id.clone(),
            owner_id: note.owner_id.clone(),
        });
        Ok(note)
    }

    async fn record_embedding(
        &self,
        note_id: &str,
        embedding: &[f32],
        computed_for: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notes SET embedding = ?2 WHERE note_id = ?1 AND updated_at = ?3",
        )
        .bind(note_id)
        .bind(embedding_to_blob(embedding))
        .bind(format_timestamp(&computed_for))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE embedding failed: {e}")))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.fetch_note(note_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("note {note_id}"))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<NoteEvent> {
        self.events.subscribe()
    }
}
