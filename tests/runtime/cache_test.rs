//! Model caching through the runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use quiver::cache::{CachedModel, InMemoryModelCache, ModelCache};
use quiver::model::AtomicType;
use quiver::runtime::{
    ConnectionMap, FetchedBatch, InMemoryUrlReader, NeedFetcher, QueryRequest, Runtime,
    StandardFetcher, StaticConnection,
};
use quiver::translator::CompilerNeeds;

const ROOT: &str = "file:///models/flights.json";
const CARRIERS: &str = "file:///models/carriers.json";

fn table(path: &str) -> serde_json::Value {
    json!({ "type": "table", "connection": "duck", "path": path })
}

fn flights_doc() -> String {
    json!({ "statements": [
        { "node": { "type": "import", "url": "carriers.json" } },
        { "node": { "type": "source", "name": "flights", "source": table("flights") } },
        { "node": { "type": "run", "query": {
            "source": { "type": "named", "name": "flights" },
            "segments": [{ "type": "body", "items": [
                { "node": { "type": "group_by", "fields": [
                    { "expr": { "kind": "field", "path": ["carrier"] } }
                ] } }
            ] }]
        } } }
    ] })
    .to_string()
}

fn carriers_doc(name: &str) -> String {
    json!({ "statements": [
        { "node": { "type": "source", "name": name, "source": table("carriers") } }
    ] })
    .to_string()
}

fn connections() -> Arc<ConnectionMap> {
    Arc::new(
        ConnectionMap::new().with(Arc::new(
            StaticConnection::new("duck", "duckdb")
                .with_table("flights", &[("carrier", AtomicType::String)])
                .with_table("carriers", &[("code", AtomicType::String)]),
        )),
    )
}

fn reader() -> Arc<InMemoryUrlReader> {
    Arc::new(
        InMemoryUrlReader::new()
            .with_file(ROOT, flights_doc())
            .with_file(CARRIERS, carriers_doc("carriers")),
    )
}

/// Counts fetch rounds on the way to the standard fetcher.
struct CountingFetcher {
    inner: StandardFetcher,
    rounds: AtomicUsize,
}

#[async_trait]
impl NeedFetcher for CountingFetcher {
    async fn fetch(&self, needs: &CompilerNeeds) -> FetchedBatch {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(needs).await
    }
}

fn cached_runtime(
    reader: Arc<InMemoryUrlReader>,
    cache: Arc<dyn ModelCache>,
) -> (Runtime, Arc<CountingFetcher>) {
    let fetcher = Arc::new(CountingFetcher {
        inner: StandardFetcher::new(reader.clone(), connections()),
        rounds: AtomicUsize::new(0),
    });
    let runtime = Runtime::new(reader, connections())
        .with_fetcher(fetcher.clone())
        .with_cache(cache);
    (runtime, fetcher)
}

#[tokio::test]
async fn test_second_compile_is_served_from_cache() {
    let cache = Arc::new(InMemoryModelCache::new());
    let (runtime, fetcher) = cached_runtime(reader(), cache.clone());

    let first = runtime.compile_model(ROOT).await.unwrap();
    assert!(first.is_compiled());
    assert!(first.timing().iterations > 0);
    let rounds = fetcher.rounds.load(Ordering::SeqCst);
    assert!(rounds > 0);
    assert_eq!(cache.len(), 1);

    let second = runtime.compile_model(ROOT).await.unwrap();
    assert_eq!(second.timing().iterations, 0);
    assert_eq!(fetcher.rounds.load(Ordering::SeqCst), rounds);
    assert_eq!(first.into_value(), second.into_value());
}

#[tokio::test]
async fn test_queries_reuse_the_cached_model() {
    let cache = Arc::new(InMemoryModelCache::new());
    let (runtime, fetcher) = cached_runtime(reader(), cache);
    runtime.compile_model(ROOT).await.unwrap();
    let rounds = fetcher.rounds.load(Ordering::SeqCst);

    let compiled = runtime
        .compile_query(&QueryRequest::index(ROOT, 0))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert!(compiled.sql.contains("\"base\".\"carrier\""), "{}", compiled.sql);
    assert_eq!(fetcher.rounds.load(Ordering::SeqCst), rounds);
}

#[tokio::test]
async fn test_editing_a_dependency_invalidates() {
    let reader = reader();
    let (runtime, _) = cached_runtime(reader.clone(), Arc::new(InMemoryModelCache::new()));
    let before = runtime.compile_model(ROOT).await.unwrap().into_value().unwrap();
    assert!(before.source("carriers").is_some());

    reader.insert(CARRIERS, carriers_doc("airlines"));
    let after = runtime.compile_model(ROOT).await.unwrap();
    assert!(after.timing().iterations > 0);
    let after = after.into_value().unwrap();
    assert!(after.source("carriers").is_none());
    assert!(after.source("airlines").is_some());
}

#[tokio::test]
async fn test_failed_models_are_not_cached() {
    let reader = Arc::new(InMemoryUrlReader::new().with_file(
        ROOT,
        json!({ "statements": [{ "node": { "type": "import", "url": "missing.json" } }] }).to_string(),
    ));
    let cache = Arc::new(InMemoryModelCache::new());
    let (runtime, _) = cached_runtime(reader, cache.clone());
    let outcome = runtime.compile_model(ROOT).await.unwrap();
    assert!(!outcome.is_compiled());
    assert!(cache.is_empty());
}

/// Stores entries as JSON text, the way an out-of-process backend would.
#[derive(Default)]
struct JsonCache {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ModelCache for JsonCache {
    async fn get(&self, url: &str) -> Option<CachedModel> {
        let text = self.entries.lock().get(url).cloned()?;
        serde_json::from_str(&text).ok()
    }

    async fn set(&self, url: &str, entry: CachedModel) -> bool {
        match serde_json::to_string(&entry) {
            Ok(text) => {
                self.entries.lock().insert(url.to_string(), text);
                true
            }
            Err(_) => false,
        }
    }
}

#[tokio::test]
async fn test_serializing_backend() {
    let cache = Arc::new(JsonCache::default());
    let (runtime, fetcher) = cached_runtime(reader(), cache.clone());
    let first = runtime.compile_model(ROOT).await.unwrap().into_value().unwrap();
    let rounds = fetcher.rounds.load(Ordering::SeqCst);

    let stored = cache.entries.lock().get(ROOT).cloned().unwrap();
    let entry: CachedModel = serde_json::from_str(&stored).unwrap();
    assert_eq!(entry.invalidation_keys.len(), 2);
    assert!(entry.invalidation_keys.values().all(Option::is_some));

    let second = runtime.compile_model(ROOT).await.unwrap().into_value().unwrap();
    assert_eq!(fetcher.rounds.load(Ordering::SeqCst), rounds);
    assert_eq!(first, second);
}
