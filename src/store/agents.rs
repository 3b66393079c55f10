//! Agent and tool catalog persistence

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    delegate_tool_name, delegate_tool_schema, Agent, AgentSpec, ToolRow,
};

use super::Store;

fn agent_from_row(row: &PgRow) -> Result<Agent> {
    Ok(Agent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        model: row.try_get("model")?,
        system_prompt: row.try_get("system_prompt")?,
        tools: row.try_get("tools")?,
        agent_ids: row.try_get("agent_ids")?,
        max_tokens: row.try_get("max_tokens")?,
        temperature: row.try_get("temperature")?,
        top_k: row.try_get("top_k")?,
        top_p: row.try_get("top_p")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tool_row_from_row(row: &PgRow) -> Result<ToolRow> {
    Ok(ToolRow {
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        input_schema: row.try_get("input_schema")?,
        is_agent_tool: row.try_get("is_agent_tool")?,
        agent_id: row.try_get("agent_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    /// Insert or update an agent by its unique name. Also refreshes the
    /// delegate tool row other agents use to call this one.
    pub async fn upsert_agent(&self, spec: &AgentSpec) -> Result<Agent> {
        if spec.name.is_empty() {
            return Err(Error::InvalidInput("agent name is required".to_string()));
        }
        if spec.model.is_empty() {
            return Err(Error::InvalidInput("agent model is required".to_string()));
        }

        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO agents (
                name, model, system_prompt, tools, agent_ids,
                max_tokens, temperature, top_k, top_p, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                model = EXCLUDED.model,
                system_prompt = EXCLUDED.system_prompt,
                tools = EXCLUDED.tools,
                agent_ids = EXCLUDED.agent_ids,
                max_tokens = EXCLUDED.max_tokens,
                temperature = EXCLUDED.temperature,
                top_k = EXCLUDED.top_k,
                top_p = EXCLUDED.top_p,
                metadata = EXCLUDED.metadata,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.model)
        .bind(&spec.system_prompt)
        .bind(&spec.tools)
        .bind(&spec.agent_ids)
        .bind(spec.max_tokens)
        .bind(spec.temperature)
        .bind(spec.top_k)
        .bind(spec.top_p)
        .bind(&spec.metadata)
        .fetch_one(&mut *tx)
        .await?;

        let agent = agent_from_row(&row)?;

        // An agent must not delegate to itself.
        if agent.agent_ids.contains(&agent.id) {
            tx.rollback().await?;
            return Err(Error::Validation(format!(
                "agent '{}' lists itself as a delegate",
                agent.name
            )));
        }

        // Every delegate must exist.
        for delegate_id in &agent.agent_ids {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM agents WHERE id = $1)",
            )
            .bind(delegate_id)
            .fetch_one(&mut *tx)
            .await?;
            if !exists {
                tx.rollback().await?;
                return Err(Error::Validation(format!(
                    "agent '{}' references unknown delegate {}",
                    agent.name, delegate_id
                )));
            }
        }

        // Refresh this agent's own delegate tool row.
        let description = if agent.system_prompt.is_empty() {
            format!("Delegate a task to the '{}' agent.", agent.name)
        } else {
            format!(
                "Delegate a task to the '{}' agent. {}",
                agent.name, agent.system_prompt
            )
        };
        sqlx::query(
            r#"
            INSERT INTO tools (name, description, input_schema, is_agent_tool, agent_id)
            VALUES ($1, $2, $3, true, $4)
            ON CONFLICT (name) DO UPDATE SET
                description = EXCLUDED.description,
                input_schema = EXCLUDED.input_schema,
                agent_id = EXCLUDED.agent_id,
                updated_at = now()
            "#,
        )
        .bind(delegate_tool_name(&agent.name))
        .bind(&description)
        .bind(delegate_tool_schema())
        .bind(agent.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(agent)
    }

    /// Get an agent by ID
    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Agent not found: {}", agent_id)))?;

        agent_from_row(&row)
    }

    /// Get an agent by its unique name
    pub async fn get_agent_by_name(&self, name: &str) -> Result<Agent> {
        let row = sqlx::query("SELECT * FROM agents WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Agent not found: {}", name)))?;

        agent_from_row(&row)
    }

    /// List all agents, oldest first
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY created_at")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(agent_from_row).collect()
    }

    /// Fetch several agents at once (delegate resolution)
    pub async fn get_agents(&self, agent_ids: &[Uuid]) -> Result<Vec<Agent>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM agents WHERE id = ANY($1) ORDER BY created_at")
            .bind(agent_ids)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(agent_from_row).collect()
    }

    /// Advertise a regular tool in the catalog
    pub async fn upsert_tool_row(
        &self,
        name: &str,
        description: &str,
        input_schema: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tools (name, description, input_schema, is_agent_tool, agent_id)
            VALUES ($1, $2, $3, false, NULL)
            ON CONFLICT (name) DO UPDATE SET
                description = EXCLUDED.description,
                input_schema = EXCLUDED.input_schema,
                updated_at = now()
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(input_schema)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Look up tool catalog rows by name
    pub async fn get_tool_rows(&self, names: &[String]) -> Result<Vec<ToolRow>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM tools WHERE name = ANY($1)")
            .bind(names)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(tool_row_from_row).collect()
    }
}
