/// ClickHouse dialect over the HTTP interface
///
/// `connect` pings the server; every row is one
/// `INSERT INTO t (cols) FORMAT JSONEachRow` request. The sink holds no
/// socket of its own, so closing is a no-op beyond logging.
///
/// `connection`: `{"url": "http://localhost:8123", "user", "password", "database"}`

use super::{quote_identifier, DestinationConfig, Dialect, RowSink};
use crate::error::{PipelineError, PipelineResult};
use crate::nodes::http::error_for_status;
use async_trait::async_trait;
use serde_json::{Map, Value};

const DEFAULT_URL: &str = "http://localhost:8123";

#[derive(Debug, Clone)]
pub struct ClickHouseDialect {
    client: reqwest::Client,
}

impl ClickHouseDialect {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone)]
struct ClickHouseEndpoint {
    url: String,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
}

impl ClickHouseEndpoint {
    fn from_connection(connection: &Value) -> Self {
        let field = |key: &str| connection.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            url: field("url")
                .unwrap_or_else(|| DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            user: field("user"),
            password: field("password"),
            database: field("database"),
        }
    }

    fn request(&self, client: &reqwest::Client, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = client.request(method, format!("{}{}", self.url, path));
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user.as_str());
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password.as_str());
        }
        if let Some(database) = &self.database {
            request = request.query(&[("database", database.as_str())]);
        }
        request
    }
}

pub fn insert_query(table: &str, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_identifier(c, '`'))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) FORMAT JSONEachRow", quote_identifier(table, '`'), columns)
}

struct ClickHouseSink {
    client: reqwest::Client,
    endpoint: ClickHouseEndpoint,
    query: String,
    inserted: u64,
}

#[async_trait]
impl RowSink for ClickHouseSink {
    async fn insert(&mut self, row: &Map<String, Value>) -> PipelineResult<()> {
        let mut body = serde_json::to_vec(row)?;
        body.push(b'\n');

        let response = self
            .endpoint
            .request(&self.client, reqwest::Method::POST, "/")
            .query(&[("query", self.query.as_str())])
            .body(body)
            .send()
            .await?;
        error_for_status(response, "clickhouse insert").await?;
        self.inserted += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> PipelineResult<()> {
        tracing::debug!("🔌 clickhouse session closed after {} rows", self.inserted);
        Ok(())
    }
}

#[async_trait]
impl Dialect for ClickHouseDialect {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn connect(&self, destination: &DestinationConfig) -> PipelineResult<Box<dyn RowSink>> {
        let endpoint = ClickHouseEndpoint::from_connection(&destination.connection);
        let ping = self
            .client
            .get(format!("{}/ping", endpoint.url))
            .send()
            .await
            .map_err(|e| PipelineError::external(format!("clickhouse unreachable at {}: {}", endpoint.url, e)))?;
        error_for_status(ping, "clickhouse ping").await?;

        Ok(Box::new(ClickHouseSink {
            client: self.client.clone(),
            endpoint,
            query: insert_query(&destination.table, &destination.columns()),
            inserted: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::database::DatabaseDestinationHandler;
    use crate::nodes::testing::{context, input_file};
    use crate::nodes::{NodeHandler, NodeOutput};
    use axum::{
        extract::{Query, State},
        routing::{get, post},
        Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Inserts = Arc<Mutex<Vec<(HashMap<String, String>, String)>>>;

    async fn fake_clickhouse() -> (String, Inserts) {
        let inserts: Inserts = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/ping", get(|| async { "Ok.\n" }))
            .route(
                "/",
                post(
                    |State(inserts): State<Inserts>, Query(params): Query<HashMap<String, String>>, body: String| async move {
                        inserts.lock().unwrap().push((params, body));
                        ""
                    },
                ),
            )
            .with_state(inserts.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), inserts)
    }

    #[test]
    fn insert_query_quotes_identifiers() {
        assert_eq!(
            insert_query("analytics.events", &["id".to_string(), "kind".to_string()]),
            "INSERT INTO `analytics`.`events` (`id`, `kind`) FORMAT JSONEachRow"
        );
    }

    #[tokio::test]
    async fn inserts_one_request_per_row() {
        let (url, inserts) = fake_clickhouse().await;
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(dir.path(), "in.json", &json!([{"id": 1, "kind": "a"}, {"id": 2}]));
        let config = json!({
            "table": "events",
            "mapping": [{"column": "id", "source": "id"}, {"column": "kind", "source": "kind"}],
            "connection": {"url": url, "database": "analytics"}
        });

        let handler = DatabaseDestinationHandler::new(ClickHouseDialect::new(reqwest::Client::new()));
        let out = handler.execute(context(dir.path(), config, vec![input])).await.unwrap();
        let NodeOutput::Summary(summary) = out else {
            panic!("expected summary");
        };
        assert_eq!(summary["rowsInserted"], json!(2));

        let inserts = inserts.lock().unwrap();
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0].0["database"], "analytics");
        assert_eq!(inserts[0].0["query"], "INSERT INTO `events` (`id`, `kind`) FORMAT JSONEachRow");
        let second: Value = serde_json::from_str(inserts[1].1.trim()).unwrap();
        assert_eq!(second, json!({"id": 2, "kind": null}));
    }

    #[tokio::test]
    async fn unreachable_server_is_external_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(dir.path(), "in.json", &json!([{"id": 1}]));
        let config = json!({
            "table": "events",
            "mapping": [{"column": "id", "source": "id"}],
            "connection": {"url": "http://127.0.0.1:1"}
        });
        let handler = DatabaseDestinationHandler::new(ClickHouseDialect::new(reqwest::Client::new()));
        let err = handler.execute(context(dir.path(), config, vec![input])).await.unwrap_err();
        assert_eq!(err.kind(), "ExternalCallError");
    }
}
