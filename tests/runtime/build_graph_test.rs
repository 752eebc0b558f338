//! Build graphs of persisted queries, compiled through the runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use quiver::build::{BuildGraph, BuildOptions};
use quiver::model::{AtomicType, ModelDef};
use quiver::runtime::{ConnectionMap, InMemoryUrlReader, Runtime, StaticConnection};

const ROOT: &str = "file:///models/flights.json";

fn group_by_carrier(source: Value) -> Value {
    json!({
        "source": source,
        "segments": [{
            "type": "body",
            "items": [{ "node": { "type": "group_by", "fields": [
                { "expr": { "kind": "field", "path": ["carrier"] } }
            ] } }]
        }]
    })
}

fn named(name: &str) -> Value {
    json!({ "type": "named", "name": name })
}

fn persisted(name: &str, from: &str, table_name: Option<&str>) -> Value {
    let persist = match table_name {
        Some(t) => json!({ "table_name": t }),
        None => json!({}),
    };
    json!({
        "node": {
            "type": "query",
            "name": name,
            "query": group_by_carrier(named(from)),
            "persist": persist
        }
    })
}

/// `daily` reads flights, `by_carrier` reads `daily`, `top` reads
/// `by_carrier`; `adhoc` is not persisted.
fn document() -> String {
    json!({ "statements": [
        { "node": {
            "type": "source",
            "name": "flights",
            "source": { "type": "table", "connection": "duck", "path": "flights" }
        } },
        persisted("daily", "flights", Some("flights_daily")),
        persisted("by_carrier", "daily", None),
        persisted("top", "by_carrier", None),
        { "node": { "type": "query", "name": "adhoc", "query": group_by_carrier(named("top")) } }
    ] })
    .to_string()
}

fn runtime() -> Runtime {
    let reader = Arc::new(InMemoryUrlReader::new().with_file(ROOT, document()));
    let duck = StaticConnection::new("duck", "duckdb").with_table(
        "flights",
        &[("carrier", AtomicType::String), ("origin", AtomicType::String)],
    );
    Runtime::new(reader, Arc::new(ConnectionMap::new().with(Arc::new(duck))))
}

async fn model() -> ModelDef {
    let outcome = runtime().compile_model(ROOT).await.unwrap();
    assert!(outcome.diagnostics().is_empty(), "{:?}", outcome.diagnostics());
    outcome.into_value().unwrap()
}

#[tokio::test]
async fn test_chain_is_leveled() {
    let graph = runtime()
        .build_graph(ROOT, &BuildOptions::default())
        .await
        .unwrap()
        .into_value()
        .unwrap();

    let levels: Vec<Vec<&str>> = graph
        .levels()
        .iter()
        .map(|level| level.iter().map(|n| n.name.as_str()).collect())
        .collect();
    assert_eq!(levels, vec![vec!["daily"], vec!["by_carrier"], vec!["top"]]);
    assert_eq!(graph.leaves(), ["top".to_string()]);
    assert_eq!(graph.level_of("top"), Some(2));
    assert_eq!(graph.level_of("adhoc"), None);

    let by_carrier = graph.node("by_carrier").unwrap();
    assert_eq!(by_carrier.dependencies, vec!["daily".to_string()]);
    assert_eq!(by_carrier.connection, "duck");
    assert!(by_carrier.sql.contains("\"carrier\""), "{}", by_carrier.sql);
}

#[tokio::test]
async fn test_table_names_are_carried() {
    let graph = BuildGraph::from_model(&model().await, &BuildOptions::default()).unwrap();
    assert_eq!(graph.node("daily").unwrap().table_name.as_deref(), Some("flights_daily"));
    assert_eq!(graph.node("top").unwrap().table_name, None);
}

#[tokio::test]
async fn test_digest_follows_connection_identity() {
    let model = model().await;
    let default = BuildGraph::from_model(&model, &BuildOptions::default()).unwrap();
    let again = BuildGraph::from_model(&model, &BuildOptions::default()).unwrap();
    let prod = BuildGraph::from_model(
        &model,
        &BuildOptions {
            connection_identities: BTreeMap::from([("duck".to_string(), "duck@prod".to_string())]),
            ..Default::default()
        },
    )
    .unwrap();

    let daily = |g: &BuildGraph| g.node("daily").cloned().unwrap();
    assert_eq!(daily(&default).digest, daily(&again).digest);
    assert_ne!(daily(&default).digest, daily(&prod).digest);
    assert_eq!(daily(&default).sql, daily(&prod).sql);
}

#[tokio::test]
async fn test_serialized_model_builds_the_same_graph() {
    let model = model().await;
    let json = serde_json::to_string(&model).unwrap();
    let restored: ModelDef = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, model);

    let original = BuildGraph::from_model(&model, &BuildOptions::default()).unwrap();
    let rebuilt = BuildGraph::from_model(&restored, &BuildOptions::default()).unwrap();
    assert_eq!(original.levels(), rebuilt.levels());
}

#[tokio::test]
async fn test_model_without_persisted_queries() {
    let reader = Arc::new(InMemoryUrlReader::new().with_file(ROOT, json!({ "statements": [] }).to_string()));
    let runtime = Runtime::new(reader, Arc::new(ConnectionMap::new()));
    let graph = runtime
        .build_graph(ROOT, &BuildOptions::default())
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert!(graph.is_empty());
    assert!(graph.leaves().is_empty());
}
