//! Message persistence and conversational-context queries

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::message::{content_from_value, content_to_value};
use crate::models::{ContentBlock, Message, Role};

use super::Store;

pub(super) fn message_from_row(row: &PgRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    let content: serde_json::Value = row.try_get("content")?;

    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        run_id: row.try_get("run_id")?,
        role: role.parse().map_err(Error::Database)?,
        content: content_from_value(&content),
        is_preserved: row.try_get("is_preserved")?,
        is_summary: row.try_get("is_summary")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Append a message to a session's history
    pub async fn insert_message(
        &self,
        session_id: Uuid,
        run_id: Option<Uuid>,
        role: Role,
        content: &[ContentBlock],
    ) -> Result<Message> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages (session_id, run_id, role, content)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(run_id)
        .bind(role.to_string())
        .bind(content_to_value(content))
        .fetch_one(self.pool())
        .await?;

        message_from_row(&row)
    }

    /// A session's full active history, oldest first
    pub async fn get_session_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = $1 ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// A run's conversational context: the session history minus any message
    /// produced by a descendant run. Descendants normally live in child
    /// sessions, so this filter is the backstop that keeps a delegate's
    /// internal tool traffic out of its caller's context no matter where it
    /// was written.
    pub async fn get_context_messages(
        &self,
        session_id: Uuid,
        run_id: Uuid,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE descendants AS (
                SELECT id FROM runs WHERE parent_run_id = $2
                UNION ALL
                SELECT r.id
                FROM runs r
                JOIN descendants d ON r.parent_run_id = d.id
            )
            SELECT m.*
            FROM messages m
            WHERE m.session_id = $1
              AND (
                  m.run_id IS NULL
                  OR m.run_id NOT IN (SELECT id FROM descendants)
              )
            ORDER BY m.created_at, m.id
            "#,
        )
        .bind(session_id)
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// The final assistant message a run produced, if any
    pub async fn get_last_assistant_message(&self, run_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE run_id = $1
              AND role = 'assistant'
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }
}
