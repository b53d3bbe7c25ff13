//! SQLite-backed conversation memory.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{KbError, Result};
use crate::models::{ConversationTurn, Role};
use crate::traits::ConversationMemory;

#[derive(Clone)]
pub struct SqliteMemory {
    pool: SqlitePool,
}

impl SqliteMemory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationMemory for SqliteMemory {
    async fn append(&self, session_id: &str, turns: &[ConversationTurn]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for turn in turns {
            sqlx::query(
                "INSERT INTO turns (session_id, role, text, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(turn.role.as_str())
            .bind(&turn.text)
            .bind(turn.timestamp.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn last_turns(&self, session_id: &str, k: usize) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT role, text, created_at FROM turns
            WHERE session_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = rows
            .iter()
            .map(|row| {
                let role: String = row.get("role");
                let created_at: i64 = row.get("created_at");
                Ok(ConversationTurn {
                    role: Role::parse(&role)
                        .ok_or_else(|| KbError::Storage(format!("unknown role '{}'", role)))?,
                    text: row.get("text"),
                    timestamp: Utc
                        .timestamp_millis_opt(created_at)
                        .single()
                        .unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_memory() -> (tempfile::TempDir, SqliteMemory) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("kb.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        (dir, SqliteMemory::new(pool))
    }

    #[tokio::test]
    async fn returns_last_turns_oldest_first() {
        let (_dir, memory) = test_memory().await;
        for i in 0..4 {
            memory
                .append(
                    "s1",
                    &[
                        ConversationTurn::user(format!("q{}", i)),
                        ConversationTurn::assistant(format!("a{}", i)),
                    ],
                )
                .await
                .unwrap();
        }
        memory
            .append("s2", &[ConversationTurn::user("other")])
            .await
            .unwrap();

        let turns = memory.last_turns("s1", 3).await.unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a2", "q3", "a3"]);
        assert_eq!(turns[1].role, Role::User);

        assert!(memory.last_turns("unknown", 3).await.unwrap().is_empty());
        assert!(memory.last_turns("s1", 0).await.unwrap().is_empty());
    }
}
