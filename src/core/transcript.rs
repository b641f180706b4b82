//! Conversation transcripts stored in SQLite
//!
//! Recording is best effort: callers log failures and carry on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::conversation::ChatTurn;

/// A stored turn with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTurn {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub mood: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct TranscriptStore {
    pool: SqlitePool,
}

impl TranscriptStore {
    /// Open (or create) the store at the given SQLite database path
    pub async fn new(db_path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory store
    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                mood TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_turns_conversation
            ON turns(conversation_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append turns to a conversation atomically, in order
    pub async fn record_turns(
        &self,
        conversation_id: &str,
        turns: &[ChatTurn],
    ) -> Result<(), sqlx::Error> {
        if turns.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for turn in turns {
            sqlx::query(
                r#"
                INSERT INTO turns (conversation_id, role, content, mood, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(conversation_id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(turn.mood.map(|m| m.as_str()))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    /// Every turn of a conversation in insertion order
    pub async fn conversation(&self, conversation_id: &str) -> Result<Vec<StoredTurn>, sqlx::Error> {
        let rows: Vec<(i64, String, String, String, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, role, content, mood, created_at
            FROM turns
            WHERE conversation_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, conversation_id, role, content, mood, created_at)| StoredTurn {
                id,
                conversation_id,
                role,
                content,
                mood,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }

    /// Conversation ids, most recently updated first
    pub async fn list_conversations(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM conversations ORDER BY updated_at DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Mood;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let store = TranscriptStore::new_in_memory().await.unwrap();

        store
            .record_turns(
                "conv-1",
                &[
                    ChatTurn::user("I passed the exam").with_mood(Mood::Excited),
                    ChatTurn::assistant("Congratulations!"),
                ],
            )
            .await
            .unwrap();
        store
            .record_turns("conv-1", &[ChatTurn::user("thanks")])
            .await
            .unwrap();

        let turns = store.conversation("conv-1").await.unwrap();
        let rows: Vec<(&str, &str, Option<&str>)> = turns
            .iter()
            .map(|t| (t.role.as_str(), t.content.as_str(), t.mood.as_deref()))
            .collect();

        assert_eq!(
            rows,
            vec![
                ("user", "I passed the exam", Some("excited")),
                ("assistant", "Congratulations!", None),
                ("user", "thanks", None),
            ]
        );
        assert!(turns.iter().all(|t| t.conversation_id == "conv-1"));
        assert!(turns.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_list_conversations() {
        let store = TranscriptStore::new_in_memory().await.unwrap();

        store.record_turns("conv1", &[ChatTurn::user("a")]).await.unwrap();
        store.record_turns("conv2", &[ChatTurn::user("b")]).await.unwrap();
        store.record_turns("conv3", &[]).await.unwrap();

        let mut conversations = store.list_conversations().await.unwrap();
        conversations.sort();
        assert_eq!(conversations, vec!["conv1", "conv2"]);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_empty() {
        let store = TranscriptStore::new_in_memory().await.unwrap();
        assert!(store.conversation("missing").await.unwrap().is_empty());
    }
}
