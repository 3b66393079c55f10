//! Transactional application of a compaction pass

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::message::content_to_value;
use crate::models::{CompactionEvent, CompactionStrategy, ContentBlock};

use super::Store;

fn event_from_row(row: &PgRow) -> Result<CompactionEvent> {
    let strategy: String = row.try_get("strategy")?;
    Ok(CompactionEvent {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        strategy: strategy.parse().map_err(Error::Database)?,
        tokens_before: row.try_get("tokens_before")?,
        tokens_after: row.try_get("tokens_after")?,
        messages_removed: row.try_get("messages_removed")?,
        removed_message_ids: row.try_get("removed_message_ids")?,
        summary: row.try_get("summary")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Everything one compaction pass decided to do to a session
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub strategy: CompactionStrategy,
    pub tokens_before: i64,
    pub tokens_after: i64,
    /// Message ids whose content is rewritten in place (tool-output pruning)
    pub pruned: Vec<(Uuid, Vec<ContentBlock>)>,
    /// Message ids removed from the active history
    pub removed: Vec<Uuid>,
    /// Replacement summary for the removed span
    pub summary: Option<String>,
    pub duration_ms: i64,
}

impl Store {
    /// Apply a compaction plan in one transaction: archive originals,
    /// rewrite pruned messages, replace the removed span with a summary
    /// message, record the audit event, bump the session counter.
    pub async fn apply_compaction(
        &self,
        session_id: Uuid,
        plan: &CompactionPlan,
    ) -> Result<CompactionEvent> {
        let mut tx = self.pool().begin().await?;

        let event_row = sqlx::query(
            r#"
            INSERT INTO compaction_events (
                session_id, strategy, tokens_before, tokens_after,
                messages_removed, removed_message_ids, summary, duration_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(plan.strategy.to_string())
        .bind(plan.tokens_before)
        .bind(plan.tokens_after)
        .bind(plan.removed.len() as i32)
        .bind(&plan.removed)
        .bind(&plan.summary)
        .bind(plan.duration_ms)
        .fetch_one(&mut *tx)
        .await?;

        let event = event_from_row(&event_row)?;

        // Archive every message this pass touches before changing anything.
        let mut touched: Vec<Uuid> = plan.removed.clone();
        touched.extend(plan.pruned.iter().map(|(id, _)| *id));

        if !touched.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO message_archive (
                    message_id, session_id, run_id, role, content,
                    compaction_event_id, original_created_at
                )
                SELECT id, session_id, run_id, role, content, $2, created_at
                FROM messages
                WHERE id = ANY($1)
                "#,
            )
            .bind(&touched)
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
        }

        for (message_id, content) in &plan.pruned {
            sqlx::query(
                r#"
                UPDATE messages
                SET content = $2
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(content_to_value(content))
            .execute(&mut *tx)
            .await?;
        }

        if !plan.removed.is_empty() {
            // The summary takes the removed span's place in the ordering.
            if let Some(summary) = &plan.summary {
                let span_start: Option<chrono::DateTime<chrono::Utc>> = sqlx::query_scalar(
                    "SELECT MIN(created_at) FROM messages WHERE id = ANY($1)",
                )
                .bind(&plan.removed)
                .fetch_one(&mut *tx)
                .await?;

                let content =
                    content_to_value(&[ContentBlock::text(format!(
                        "[conversation summary] {}",
                        summary
                    ))]);

                sqlx::query(
                    r#"
                    INSERT INTO messages (
                        session_id, role, content, is_summary, created_at
                    ) VALUES ($1, 'assistant', $2, true, COALESCE($3, now()))
                    "#,
                )
                .bind(session_id)
                .bind(&content)
                .bind(span_start)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query("DELETE FROM messages WHERE id = ANY($1)")
                .bind(&plan.removed)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE sessions
            SET compaction_count = compaction_count + 1,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    /// Compaction history for a session, newest first
    pub async fn get_compaction_events(&self, session_id: Uuid) -> Result<Vec<CompactionEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM compaction_events WHERE session_id = $1 ORDER BY created_at DESC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(event_from_row).collect()
    }
}
