/// Database destination nodes
///
/// One handler drives every dialect: open a connection, then pull an item,
/// map it to a row, insert it, await the insert and only then pull the next
/// item. The connection is closed on every exit path and the node returns
/// an inline `{rowsInserted, table}` summary.
///
/// Config shared by all dialects:
/// ```json
/// { "table": "orders",
///   "mapping": [{ "column": "order_id", "source": "id" }],
///   "connection": { ... dialect specific ... } }
/// ```

use super::path::FieldPath;
use super::{NodeExecutionContext, NodeHandler, NodeOutput, NodeResult};
use crate::error::{PipelineError, PipelineResult};
use crate::stream::{ItemStream, ReadOptions};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};

pub mod clickhouse;
pub mod postgres;
pub mod sqlite;

/// One column <- field path pair
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub column: String,
    pub source: FieldPath,
}

/// Validated destination config
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub table: String,
    pub mappings: Vec<ColumnMapping>,
    pub connection: Value,
}

impl DestinationConfig {
    pub fn from_config(config: &Value, node_id: &str) -> PipelineResult<Self> {
        let table = config
            .get("table")
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PipelineError::config(format!("destination '{}' missing 'table'", node_id)))?;
        validate_identifier(table)?;

        let raw = config
            .get("mapping")
            .and_then(|m| m.as_array())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| PipelineError::config(format!("destination '{}' missing 'mapping'", node_id)))?;

        let mut mappings = Vec::with_capacity(raw.len());
        for entry in raw {
            let column = entry.get("column").and_then(|c| c.as_str());
            let source = entry.get("source").and_then(|s| s.as_str());
            let (Some(column), Some(source)) = (column, source) else {
                return Err(PipelineError::config(format!(
                    "destination '{}' mapping entry needs column and source: {}",
                    node_id, entry
                )));
            };
            validate_identifier(column)?;
            mappings.push(ColumnMapping {
                column: column.to_string(),
                source: FieldPath::compile(source)?,
            });
        }

        Ok(Self {
            table: table.to_string(),
            mappings,
            connection: config.get("connection").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn columns(&self) -> Vec<String> {
        self.mappings.iter().map(|m| m.column.clone()).collect()
    }

    /// Column -> value for one item; unresolved paths become null
    pub fn map_row(&self, item: &Value) -> PipelineResult<Map<String, Value>> {
        let mut row = Map::new();
        for mapping in &self.mappings {
            let value = mapping.source.resolve(item)?.unwrap_or(Value::Null);
            row.insert(mapping.column.clone(), value);
        }
        Ok(row)
    }
}

/// Table and column names are interpolated into SQL, so only plain identifiers pass
pub fn validate_identifier(name: &str) -> PipelineResult<()> {
    let ok = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit())
        });
    if ok {
        Ok(())
    } else {
        Err(PipelineError::config(format!("invalid SQL identifier '{}'", name)))
    }
}

/// Quote a possibly schema-qualified identifier with `quote`
pub fn quote_identifier(name: &str, quote: char) -> String {
    name.split('.')
        .map(|part| format!("{q}{part}{q}", q = quote))
        .collect::<Vec<_>>()
        .join(".")
}

/// An open connection accepting one row at a time
#[async_trait]
pub trait RowSink: Send {
    /// `row` holds one value per configured column, in mapping order
    async fn insert(&mut self, row: &Map<String, Value>) -> PipelineResult<()>;

    async fn close(self: Box<Self>) -> PipelineResult<()>;
}

/// Connection factory for one database family
#[async_trait]
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, destination: &DestinationConfig) -> PipelineResult<Box<dyn RowSink>>;
}

#[derive(Debug, Clone)]
pub struct DatabaseDestinationHandler<D> {
    dialect: D,
}

impl<D: Dialect> DatabaseDestinationHandler<D> {
    pub fn new(dialect: D) -> Self {
        Self { dialect }
    }
}

/// Pull-insert-await loop; stops at the first failing item or insert
async fn insert_all(
    sink: &mut dyn RowSink,
    items: &mut ItemStream,
    destination: &DestinationConfig,
) -> PipelineResult<u64> {
    let mut inserted = 0u64;
    while let Some(item) = items.next().await {
        let row = destination.map_row(&item?)?;
        sink.insert(&row).await?;
        inserted += 1;
    }
    Ok(inserted)
}

#[async_trait]
impl<D: Dialect + 'static> NodeHandler for DatabaseDestinationHandler<D> {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult {
        let destination = DestinationConfig::from_config(&ctx.config, &ctx.node_id)?;
        let mut items = ctx.items(ReadOptions::lockstep()).await?;

        tracing::info!("🗄️ {} inserting into {} table {}", ctx.node_id, self.dialect.name(), destination.table);
        let mut sink = self.dialect.connect(&destination).await?;

        let inserted = insert_all(sink.as_mut(), &mut items, &destination).await;
        let closed = sink.close().await;
        let inserted = inserted?;
        closed?;

        tracing::info!("✅ {} inserted {} rows into {}", ctx.node_id, inserted, destination.table);
        let mut summary = Map::new();
        summary.insert("rowsInserted".to_string(), Value::from(inserted));
        summary.insert("table".to_string(), Value::String(destination.table));
        Ok(NodeOutput::Summary(summary))
    }
}
