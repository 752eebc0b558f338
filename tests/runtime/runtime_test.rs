//! The runtime: fetching, compiling and running against connections.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use quiver::compiler::CompileOptions;
use quiver::model::{AtomicType, StructDef};
use quiver::runtime::{
    CompileOutcome, Connection, ConnectionMap, FetchError, FetchResult, FetchedBatch,
    InMemoryUrlReader, NeedFetcher, QueryData, QueryRequest, RunOptions, Runtime, RuntimeError,
    StaticConnection,
};
use quiver::translator::CompilerNeeds;

const ROOT: &str = "file:///models/flights.json";
const CARRIERS: &str = "file:///models/carriers.json";

// ============================================================================
// Documents
// ============================================================================

fn field(path: &[&str]) -> Value {
    json!({ "kind": "field", "path": path })
}

fn table(connection: &str, path: &str) -> Value {
    json!({ "type": "table", "connection": connection, "path": path })
}

fn group_by(fields: &[&[&str]], aggregates: &[&str]) -> Value {
    let groups: Vec<Value> = fields.iter().map(|p| json!({ "expr": field(p) })).collect();
    let aggs: Vec<Value> = aggregates.iter().map(|a| json!({ "expr": field(&[a]) })).collect();
    json!({
        "type": "body",
        "items": [
            { "node": { "type": "group_by", "fields": groups } },
            { "node": { "type": "aggregate", "fields": aggs } }
        ]
    })
}

fn on_flights(segment: Value) -> Value {
    json!({ "source": { "type": "named", "name": "flights" }, "segments": [segment] })
}

fn doc(statements: Vec<Value>) -> String {
    json!({ "statements": statements.into_iter().map(|s| json!({ "node": s })).collect::<Vec<_>>() })
        .to_string()
}

fn flights_doc() -> String {
    doc(vec![
        json!({ "type": "import", "url": "carriers.json" }),
        json!({
            "type": "source",
            "name": "flights",
            "source": { "type": "extend", "base": table("duck", "flights"), "properties": [
                { "node": { "type": "measure", "name": "flight_count",
                    "expr": { "kind": "call", "name": "count", "args": [] } } },
                { "node": { "type": "join", "name": "carriers",
                    "source": { "type": "named", "name": "carriers" },
                    "relationship": "one", "with": field(&["carrier"]) } }
            ] }
        }),
        json!({
            "type": "query",
            "name": "by_carrier",
            "query": on_flights(group_by(&[&["carrier"]], &["flight_count"])),
            "persist": { "table_name": "flights_by_carrier" }
        }),
        json!({ "type": "run", "query": on_flights(group_by(&[&["carrier"]], &["flight_count"])) }),
        json!({ "type": "run", "query": on_flights(group_by(&[&["origin"]], &["flight_count"])) }),
    ])
}

fn carriers_doc() -> String {
    doc(vec![json!({ "type": "source", "name": "carriers", "source": table("duck", "carriers") })])
}

fn duck() -> StaticConnection {
    StaticConnection::new("duck", "duckdb")
        .with_table(
            "flights",
            &[
                ("carrier", AtomicType::String),
                ("origin", AtomicType::String),
                ("distance", AtomicType::Number),
            ],
        )
        .with_keyed_table(
            "carriers",
            "code",
            &[("code", AtomicType::String), ("nickname", AtomicType::String)],
        )
}

fn reader() -> Arc<InMemoryUrlReader> {
    Arc::new(
        InMemoryUrlReader::new()
            .with_file(ROOT, flights_doc())
            .with_file(CARRIERS, carriers_doc()),
    )
}

fn runtime() -> Runtime {
    Runtime::new(reader(), Arc::new(ConnectionMap::new().with(Arc::new(duck()))))
}

fn problems<T>(outcome: &CompileOutcome<T>) -> Vec<String> {
    outcome.diagnostics().iter().map(|d| d.message.clone()).collect()
}

// ============================================================================
// Models
// ============================================================================

#[tokio::test]
async fn test_compile_model_follows_imports() {
    let outcome = runtime().compile_model(ROOT).await.unwrap();
    assert!(outcome.is_compiled(), "{:?}", problems(&outcome));
    assert!(outcome.diagnostics().is_empty());
    assert!(outcome.timing().iterations >= 3);

    let model = outcome.into_value().unwrap();
    assert!(model.source("flights").is_some());
    assert!(model.source("carriers").is_some());
    assert_eq!(model.queries.len(), 2);
    assert_eq!(model.dependencies.flatten(), vec![CARRIERS.to_string()]);
}

#[tokio::test]
async fn test_missing_document_fails() {
    let outcome = runtime().compile_model("file:///models/nope.json").await.unwrap();
    assert!(!outcome.is_compiled());
    assert!(
        problems(&outcome).iter().any(|m| m.contains("no document at 'file:///models/nope.json'")),
        "{:?}",
        problems(&outcome)
    );
}

#[tokio::test]
async fn test_unknown_connection_is_a_warning_until_used() {
    let reader = Arc::new(InMemoryUrlReader::new().with_file(
        ROOT,
        doc(vec![json!({ "type": "source", "name": "orders", "source": table("warehouse", "orders") })]),
    ));
    let runtime = Runtime::new(reader, Arc::new(ConnectionMap::new().with(Arc::new(duck()))));
    let outcome = runtime.compile_model(ROOT).await.unwrap();
    assert!(outcome.is_compiled());
    assert!(
        problems(&outcome).iter().any(|m| m.contains("unknown connection 'warehouse'")),
        "{:?}",
        problems(&outcome)
    );
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_named_query() {
    let outcome = runtime()
        .compile_query(&QueryRequest::named(ROOT, "by_carrier"))
        .await
        .unwrap();
    let compiled = outcome.into_value().unwrap();
    assert!(compiled.sql.contains("\"base\".\"carrier\" AS \"carrier\""), "{}", compiled.sql);
    assert_eq!(compiled.connection_name, "duck");
    assert_eq!(
        compiled.persist.and_then(|p| p.table_name).as_deref(),
        Some("flights_by_carrier")
    );
}

#[tokio::test]
async fn test_unknown_named_query() {
    let outcome = runtime()
        .compile_query(&QueryRequest::named(ROOT, "by_nothing"))
        .await
        .unwrap();
    assert!(!outcome.is_compiled());
    assert_eq!(problems(&outcome), vec!["unknown query 'by_nothing'".to_string()]);
}

#[tokio::test]
async fn test_run_statement_by_index() {
    let runtime = runtime();
    let second = runtime
        .compile_query(&QueryRequest::index(ROOT, 1))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert!(second.sql.contains("\"base\".\"origin\""), "{}", second.sql);

    let missing = runtime.compile_query(&QueryRequest::index(ROOT, 5)).await.unwrap();
    assert!(!missing.is_compiled());
    assert_eq!(
        problems(&missing),
        vec!["no run statement at index 5 (2 available)".to_string()]
    );
}

#[tokio::test]
async fn test_query_text_against_model() {
    let text = doc(vec![json!({
        "type": "run",
        "query": on_flights(group_by(&[&["carriers", "nickname"]], &["flight_count"]))
    })]);
    let compiled = runtime()
        .compile_query(&QueryRequest::text(ROOT, text))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert!(
        compiled.sql.contains("LEFT JOIN \"carriers\" AS \"carriers\""),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("\"carriers\".\"nickname\""), "{}", compiled.sql);
}

#[tokio::test]
async fn test_query_text_problems_point_at_the_text() {
    let text = doc(vec![json!({
        "type": "run",
        "query": on_flights(group_by(&[&["tail_number"]], &["flight_count"]))
    })]);
    let outcome = runtime()
        .compile_query(&QueryRequest::text(ROOT, text))
        .await
        .unwrap();
    assert!(!outcome.is_compiled());
    let problem = &outcome.diagnostics()[0];
    assert!(problem.url.starts_with("internal://query/"), "{}", problem.url);
    assert!(problem.message.contains("'tail_number' is not defined"));
}

#[tokio::test]
async fn test_compile_errors_point_at_the_statement() {
    let oracle = CompileOptions {
        dialect: Some("oracle".into()),
        default_row_limit: None,
    };
    let body = json!({ "type": "body", "items": [
        { "node": { "type": "group_by", "fields": [{ "expr": field(&["carrier"]) }] } }
    ] });
    let spanned = json!({ "statements": [
        { "node": { "type": "source", "name": "flights", "source": table("duck", "flights") },
          "span": { "start": 0, "end": 30 } },
        { "node": { "type": "query", "name": "carriers_seen", "query": on_flights(body.clone()) },
          "span": { "start": 31, "end": 90 } }
    ] });
    let reader = Arc::new(InMemoryUrlReader::new().with_file(ROOT, spanned.to_string()));
    let runtime = Runtime::new(reader, Arc::new(ConnectionMap::new().with(Arc::new(duck()))));

    let request = QueryRequest::named(ROOT, "carriers_seen").with_options(oracle.clone());
    let outcome = runtime.compile_query(&request).await.unwrap();
    assert!(!outcome.is_compiled());
    let problem = outcome.diagnostics().last().unwrap();
    assert_eq!(problem.url, ROOT);
    assert_eq!(problem.span, Some(31..90));
    assert!(problem.message.contains("unknown dialect 'oracle'"), "{}", problem.message);

    let text = json!({ "statements": [
        { "node": { "type": "run", "query": on_flights(body) }, "span": { "start": 4, "end": 40 } }
    ] });
    let request = QueryRequest::text(ROOT, text.to_string()).with_options(oracle);
    let outcome = runtime.compile_query(&request).await.unwrap();
    let problem = outcome.diagnostics().last().unwrap();
    assert!(problem.url.starts_with("internal://query/"), "{}", problem.url);
    assert_eq!(problem.span, Some(4..40));
}

#[tokio::test]
async fn test_dialect_override() {
    let request = QueryRequest::named(ROOT, "by_carrier").with_options(CompileOptions {
        dialect: Some("postgres".into()),
        default_row_limit: Some(50),
    });
    let compiled = runtime()
        .compile_query(&request)
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(compiled.dialect, "postgres");
    assert!(compiled.sql.contains("LIMIT 50"), "{}", compiled.sql);
}

// ============================================================================
// Running
// ============================================================================

#[tokio::test]
async fn test_static_connection_cannot_run() {
    let result = runtime().run_query(&QueryRequest::index(ROOT, 0)).await;
    match result {
        Err(RuntimeError::Run(FetchError::RunUnsupported(name))) => assert_eq!(name, "duck"),
        other => panic!("expected run error, got {:?}", other),
    }
}

/// Serves the static schemas and answers every query with one fixed row.
struct RecordingConnection {
    inner: StaticConnection,
    ran: Mutex<Vec<(String, RunOptions)>>,
}

#[async_trait]
impl Connection for RecordingConnection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dialect(&self) -> &str {
        self.inner.dialect()
    }

    async fn fetch_schema_for_table(&self, path: &str) -> FetchResult<StructDef> {
        self.inner.fetch_schema_for_table(path).await
    }

    async fn fetch_schema_for_sql(&self, sql: &str) -> FetchResult<StructDef> {
        self.inner.fetch_schema_for_sql(sql).await
    }

    async fn run_sql(&self, sql: &str, options: &RunOptions) -> FetchResult<QueryData> {
        self.ran.lock().push((sql.to_string(), options.clone()));
        let mut row = Map::new();
        row.insert("carrier".into(), json!("AA"));
        row.insert("flight_count".into(), json!(42));
        Ok(QueryData {
            rows: vec![row],
            total_rows: Some(1),
        })
    }
}

#[tokio::test]
async fn test_run_query_passes_row_limit() {
    let connection = Arc::new(RecordingConnection {
        inner: duck(),
        ran: Mutex::new(Vec::new()),
    });
    let runtime = Runtime::new(
        reader(),
        Arc::new(ConnectionMap::new().with(connection.clone())),
    );
    let request = QueryRequest::index(ROOT, 0).with_options(CompileOptions {
        dialect: None,
        default_row_limit: Some(10),
    });
    let result = runtime.run_query(&request).await.unwrap().into_value().unwrap();
    assert_eq!(result.data.rows.len(), 1);
    assert_eq!(result.data.rows[0]["flight_count"], json!(42));

    let ran = connection.ran.lock();
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].0, result.compiled.sql);
    assert_eq!(ran[0].1.row_limit, Some(10));
}

#[tokio::test]
async fn test_runtime_row_limit_wins() {
    let connection = Arc::new(RecordingConnection {
        inner: duck(),
        ran: Mutex::new(Vec::new()),
    });
    let runtime = Runtime::new(
        reader(),
        Arc::new(ConnectionMap::new().with(connection.clone())),
    )
    .with_run_options(RunOptions { row_limit: Some(3) });
    let request = QueryRequest::index(ROOT, 0).with_options(CompileOptions {
        dialect: None,
        default_row_limit: Some(10),
    });
    runtime.run_query(&request).await.unwrap();
    assert_eq!(connection.ran.lock()[0].1.row_limit, Some(3));
}

// ============================================================================
// Fetchers
// ============================================================================

/// Answers nothing.
struct SilentFetcher;

#[async_trait]
impl NeedFetcher for SilentFetcher {
    async fn fetch(&self, _needs: &CompilerNeeds) -> FetchedBatch {
        FetchedBatch::default()
    }
}

#[tokio::test]
async fn test_fetcher_must_answer_every_need() {
    let runtime = runtime().with_fetcher(Arc::new(SilentFetcher));
    match runtime.compile_model(ROOT).await {
        Err(RuntimeError::UnansweredNeeds(key)) => assert_eq!(key, format!("url {}", ROOT)),
        other => panic!("expected unanswered needs, got {:?}", other.map(|o| o.is_compiled())),
    }
}
