//! Session persistence

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Session;

use super::Store;

fn session_from_row(row: &PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        parent_session_id: row.try_get("parent_session_id")?,
        depth: row.try_get("depth")?,
        metadata: row.try_get("metadata")?,
        compaction_count: row.try_get("compaction_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    /// Create a new top-level session
    pub async fn create_session(&self, metadata: Value) -> Result<Session> {
        let mut conn = self.pool().acquire().await?;
        Self::create_session_on(&mut conn, metadata, None, 0).await
    }

    /// Create a session inside the caller's transaction; it becomes visible
    /// at commit
    pub async fn create_session_tx(
        &self,
        conn: &mut PgConnection,
        metadata: Value,
    ) -> Result<Session> {
        Self::create_session_on(conn, metadata, None, 0).await
    }

    /// Create a child session for a delegate run
    pub async fn create_child_session(
        &self,
        parent_session_id: Uuid,
        depth: i32,
    ) -> Result<Session> {
        let mut conn = self.pool().acquire().await?;
        Self::create_session_on(&mut conn, serde_json::json!({}), Some(parent_session_id), depth)
            .await
    }

    async fn create_session_on(
        conn: &mut PgConnection,
        metadata: Value,
        parent_session_id: Option<Uuid>,
        depth: i32,
    ) -> Result<Session> {
        let row = sqlx::query(
            r#"
            INSERT INTO sessions (parent_session_id, depth, metadata)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(parent_session_id)
        .bind(depth)
        .bind(&metadata)
        .fetch_one(conn)
        .await?;

        session_from_row(&row)
    }

    /// Get a session by ID
    pub async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Session not found: {}", session_id)))?;

        session_from_row(&row)
    }

    /// Replace a session's metadata mapping
    pub async fn update_session_metadata(&self, session_id: Uuid, metadata: Value) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE sessions
            SET metadata = $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(&metadata)
        .execute(self.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(Error::NotFound(format!("Session not found: {}", session_id)));
        }

        Ok(())
    }
}
