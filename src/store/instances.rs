//! Instance registration, heartbeat, and stale cleanup

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;
use crate::models::Instance;

use super::Store;

fn instance_from_row(row: &PgRow) -> Result<Instance> {
    Ok(Instance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        hostname: row.try_get("hostname")?,
        pid: row.try_get("pid")?,
        max_concurrent_runs: row.try_get("max_concurrent_runs")?,
        max_concurrent_tools: row.try_get("max_concurrent_tools")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Register this process and advertise its tool capabilities, in one
    /// transaction
    pub async fn register_instance(
        &self,
        instance_id: Uuid,
        name: &str,
        hostname: &str,
        pid: i32,
        max_concurrent_runs: i32,
        max_concurrent_tools: i32,
        tool_names: &[String],
    ) -> Result<Instance> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO instances (
                id, name, hostname, pid, max_concurrent_runs, max_concurrent_tools
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(instance_id)
        .bind(name)
        .bind(hostname)
        .bind(pid)
        .bind(max_concurrent_runs)
        .bind(max_concurrent_tools)
        .fetch_one(&mut *tx)
        .await?;

        let instance = instance_from_row(&row)?;

        for tool_name in tool_names {
            sqlx::query(
                r#"
                INSERT INTO instance_tools (instance_id, tool_name)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(instance_id)
            .bind(tool_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(instance)
    }

    /// Refresh this instance's liveness timestamp
    pub async fn heartbeat(&self, instance_id: Uuid) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE instances SET last_heartbeat_at = now() WHERE id = $1",
        )
        .bind(instance_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Delete this instance. The delete trigger releases every claim it
    /// still holds.
    pub async fn delete_instance(&self, instance_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(instance_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete instances whose heartbeat went silent. Returns how many were
    /// removed; each removal fires the claim-release trigger.
    pub async fn delete_stale_instances(&self, ttl: std::time::Duration) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            DELETE FROM instances
            WHERE last_heartbeat_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(affected)
    }

    /// All live instances, oldest first
    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY created_at")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(instance_from_row).collect()
    }
}
