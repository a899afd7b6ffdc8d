/// SQLite dialect
///
/// Opens a dedicated `SqliteConnection` to the file named in
/// `connection.path` and inserts with bound parameters. The target table
/// must already exist unless `createTable` is set, in which case it is
/// created with untyped columns.

use super::{quote_identifier, DestinationConfig, Dialect, RowSink};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

fn sqlite_err(e: sqlx::Error) -> PipelineError {
    PipelineError::external(format!("sqlite: {}", e))
}

pub fn insert_sql(table: &str, columns: &[String]) -> String {
    let quoted = columns
        .iter()
        .map(|c| quote_identifier(c, '"'))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!("INSERT INTO {} ({}) VALUES ({})", quote_identifier(table, '"'), quoted, placeholders)
}

struct SqliteSink {
    connection: SqliteConnection,
    sql: String,
    columns: Vec<String>,
}

#[async_trait]
impl RowSink for SqliteSink {
    async fn insert(&mut self, row: &Map<String, Value>) -> PipelineResult<()> {
        let mut query = sqlx::query(&self.sql);
        for column in &self.columns {
            query = match row.get(column).unwrap_or(&Value::Null) {
                Value::String(s) => query.bind(s.clone()),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else if let Some(f) = n.as_f64() {
                        query.bind(f)
                    } else {
                        query.bind(n.to_string())
                    }
                }
                Value::Bool(b) => query.bind(*b),
                Value::Null => query.bind(None::<String>),
                nested => query.bind(nested.to_string()),
            };
        }
        query.execute(&mut self.connection).await.map_err(sqlite_err)?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> PipelineResult<()> {
        self.connection.close().await.map_err(sqlite_err)
    }
}

#[async_trait]
impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self, destination: &DestinationConfig) -> PipelineResult<Box<dyn RowSink>> {
        let path = destination
            .connection
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| PipelineError::config("sqlite connection needs 'path'"))?;
        let create_table = destination
            .connection
            .get("createTable")
            .and_then(|c| c.as_bool())
            .unwrap_or(false);

        let mut connection = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create_table)
            .connect()
            .await
            .map_err(sqlite_err)?;

        let columns = destination.columns();
        if create_table {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_identifier(&destination.table, '"'),
                columns.iter().map(|c| quote_identifier(c, '"')).collect::<Vec<_>>().join(", ")
            );
            if let Err(e) = sqlx::query(&ddl).execute(&mut connection).await {
                let _ = connection.close().await;
                return Err(sqlite_err(e));
            }
        }

        Ok(Box::new(SqliteSink {
            connection,
            sql: insert_sql(&destination.table, &columns),
            columns,
        }))
    }
}
