//! Leader election over a single-row TTL lease
//!
//! Any instance may try to take the lease when it is free or expired; the
//! holder refreshes it. Only the leader runs the rescuer and stale-instance
//! cleanup.

use uuid::Uuid;

use crate::error::Result;

use super::Store;

impl Store {
    /// Try to acquire (or re-acquire) leadership. Returns whether this
    /// instance now holds the lease.
    pub async fn try_acquire_leadership(
        &self,
        instance_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            INSERT INTO leader (singleton, instance_id, expires_at)
            VALUES (true, $1, now() + make_interval(secs => $2))
            ON CONFLICT (singleton) DO UPDATE SET
                instance_id = EXCLUDED.instance_id,
                expires_at = EXCLUDED.expires_at,
                acquired_at = now()
            WHERE leader.instance_id = EXCLUDED.instance_id
               OR leader.expires_at < now()
            "#,
        )
        .bind(instance_id)
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Give up the lease if this instance holds it
    pub async fn release_leadership(&self, instance_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM leader WHERE instance_id = $1")
            .bind(instance_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// The instance currently holding an unexpired lease, if any
    pub async fn current_leader(&self) -> Result<Option<Uuid>> {
        let leader = sqlx::query_scalar::<_, Uuid>(
            "SELECT instance_id FROM leader WHERE expires_at >= now()",
        )
        .fetch_optional(self.pool())
        .await?;

        Ok(leader)
    }
}
