/// SQLite persistence layer for pipeline definitions
///
/// Pipelines are stored as JSON for flexibility while keeping the id and name
/// as indexed columns. The scheduler loads graphs from here when a due
/// connection's sync step names the pipelines to run.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::PipelineDefinition;
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-based pipeline storage manager
#[derive(Debug, Clone)]
pub struct PipelineStore {
    pool: SqlitePool,
}

/// Basic pipeline metadata for listing operations
#[derive(Debug, serde::Serialize)]
pub struct PipelineMetadata {
    pub id: String,
    pub name: String,
    pub updated_at: String,
}

fn store_err(e: sqlx::Error) -> PipelineError {
    PipelineError::Persistence(format!("pipeline store: {}", e))
}

impl PipelineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the pipelines table. Safe to call multiple times.
    pub async fn init_schema(&self) -> PipelineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Store a new pipeline or update an existing one (UPSERT)
    pub async fn save(&self, pipeline: &PipelineDefinition) -> PipelineResult<()> {
        let definition_json = serde_json::to_string(pipeline)?;

        sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&pipeline.id)
        .bind(&pipeline.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> PipelineResult<Option<PipelineDefinition>> {
        let row = sqlx::query("SELECT definition FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> PipelineResult<Vec<PipelineMetadata>> {
        let rows = sqlx::query("SELECT id, name, updated_at FROM pipelines ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|row| PipelineMetadata {
                id: row.get("id"),
                name: row.get("name"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    pub async fn delete(&self, id: &str) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{PipelineEdge, PipelineGraph, PipelineNode};
    use serde_json::json;

    async fn store() -> PipelineStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = PipelineStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn definition(name: &str) -> PipelineDefinition {
        PipelineDefinition {
            id: "pl-1".to_string(),
            name: name.to_string(),
            graph: PipelineGraph {
                nodes: vec![
                    PipelineNode::new("src", "source", json!({})),
                    PipelineNode::new("out", "file-destination", json!({"filename": "out.json"})),
                ],
                edges: vec![PipelineEdge::new("src", "out")],
            },
        }
    }

    #[tokio::test]
    async fn save_get_update_delete() {
        let store = store().await;
        store.save(&definition("first")).await.unwrap();
        store.save(&definition("second")).await.unwrap();

        let loaded = store.get("pl-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "second");
        assert_eq!(loaded.graph.edges, vec![PipelineEdge::new("src", "out")]);
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert!(store.delete("pl-1").await.unwrap());
        assert!(!store.delete("pl-1").await.unwrap());
        assert!(store.get("pl-1").await.unwrap().is_none());
    }
}
