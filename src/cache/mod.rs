//! Model cache.
//!
//! Finished models are cached per root URL together with the invalidation
//! key of every document they were built from. A hit is only served when
//! every stored key still equals the current one.
//!
//! # Design
//!
//! - Backends implement [`ModelCache`]: a plain get/set store.
//! - [`CacheManager`] owns validation; backends never compare keys.
//! - A `None` key (synthetic `internal://` documents, unreadable files) can
//!   never validate an entry, on either side of the comparison.
//!
//! # Entry Layout
//!
//! ```text
//! {root url} -> { model_def, invalidation_keys: { url -> key | null } }
//! ```

pub mod hash;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::ModelDef;
use crate::runtime::reader::UrlReader;

/// A cached model and the keys it was built under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedModel {
    pub model_def: ModelDef,
    pub invalidation_keys: BTreeMap<String, Option<String>>,
}

#[async_trait]
pub trait ModelCache: Send + Sync {
    async fn get(&self, url: &str) -> Option<CachedModel>;

    /// Store an entry. Returns `false` when the backend refused it.
    async fn set(&self, url: &str, entry: CachedModel) -> bool;
}

/// Process-local cache backend.
#[derive(Debug, Default)]
pub struct InMemoryModelCache {
    entries: RwLock<HashMap<String, CachedModel>>,
}

impl InMemoryModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[async_trait]
impl ModelCache for InMemoryModelCache {
    async fn get(&self, url: &str) -> Option<CachedModel> {
        self.entries.read().get(url).cloned()
    }

    async fn set(&self, url: &str, entry: CachedModel) -> bool {
        self.entries.write().insert(url.to_string(), entry);
        true
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Validating front for a [`ModelCache`].
#[derive(Clone)]
pub struct CacheManager {
    cache: Arc<dyn ModelCache>,
    reader: Arc<dyn UrlReader>,
}

impl CacheManager {
    pub fn new(cache: Arc<dyn ModelCache>, reader: Arc<dyn UrlReader>) -> Self {
        Self { cache, reader }
    }

    /// Every URL the model at `url` was built from: the root plus its
    /// flattened dependencies.
    pub fn tracked_urls(url: &str, model: &ModelDef) -> Vec<String> {
        let mut urls = vec![url.to_string()];
        for dep in model.dependencies.flatten() {
            if !urls.contains(&dep) {
                urls.push(dep);
            }
        }
        urls
    }

    /// A cached model whose every stored key still matches.
    pub async fn get(&self, url: &str) -> Option<ModelDef> {
        let Some(entry) = self.cache.get(url).await else {
            debug!(url = %url, "model cache miss");
            return None;
        };
        for tracked in Self::tracked_urls(url, &entry.model_def) {
            let stored = entry.invalidation_keys.get(&tracked).cloned().flatten();
            let current = self.reader.invalidation_key(&tracked).await.ok().flatten();
            match (stored, current) {
                (Some(stored), Some(current)) if stored == current => {}
                _ => {
                    debug!(url = %url, dependency = %tracked, "model cache entry stale");
                    return None;
                }
            }
        }
        debug!(url = %url, "model cache hit");
        Some(entry.model_def)
    }

    /// Store `model` under `url`. Refused unless every tracked URL has a
    /// known key in `keys`.
    pub async fn set(
        &self,
        url: &str,
        model: &ModelDef,
        keys: &BTreeMap<String, Option<String>>,
    ) -> bool {
        let tracked = Self::tracked_urls(url, model);
        let mut invalidation_keys = BTreeMap::new();
        for u in &tracked {
            match keys.get(u) {
                Some(Some(key)) => {
                    invalidation_keys.insert(u.clone(), Some(key.clone()));
                }
                _ => {
                    debug!(url = %url, dependency = %u, "model not cached: unknown key");
                    return false;
                }
            }
        }
        self.cache
            .set(
                url,
                CachedModel {
                    model_def: model.clone(),
                    invalidation_keys,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::reader::InMemoryUrlReader;

    const ROOT: &str = "file:///m/root.json";
    const DEP: &str = "file:///m/dep.json";

    fn model() -> ModelDef {
        let mut model = ModelDef::new(ROOT);
        model.dependencies.add_edge(ROOT, DEP);
        model
    }

    fn keys(reader_root: &str, reader_dep: &str) -> BTreeMap<String, Option<String>> {
        BTreeMap::from([
            (ROOT.to_string(), Some(hash::content_hash(reader_root))),
            (DEP.to_string(), Some(hash::content_hash(reader_dep))),
        ])
    }

    fn manager(reader: Arc<InMemoryUrlReader>) -> CacheManager {
        CacheManager::new(Arc::new(InMemoryModelCache::new()), reader)
    }

    #[tokio::test]
    async fn test_hit_then_stale_dependency() {
        let reader = Arc::new(InMemoryUrlReader::new().with_file(ROOT, "r").with_file(DEP, "d"));
        let cache = manager(reader.clone());
        assert!(cache.set(ROOT, &model(), &keys("r", "d")).await);
        assert_eq!(cache.get(ROOT).await, Some(model()));

        reader.insert(DEP, "changed");
        assert_eq!(cache.get(ROOT).await, None);

        reader.insert(DEP, "d");
        assert_eq!(cache.get(ROOT).await, Some(model()));
    }

    #[tokio::test]
    async fn test_set_refuses_unknown_keys() {
        let reader = Arc::new(InMemoryUrlReader::new().with_file(ROOT, "r"));
        let cache = manager(reader);
        let mut partial = keys("r", "d");
        partial.insert(DEP.to_string(), None);
        assert!(!cache.set(ROOT, &model(), &partial).await);
        partial.remove(DEP);
        assert!(!cache.set(ROOT, &model(), &partial).await);
        assert_eq!(cache.get(ROOT).await, None);
    }

    #[tokio::test]
    async fn test_unreadable_dependency_is_miss() {
        let reader = Arc::new(InMemoryUrlReader::new().with_file(ROOT, "r").with_file(DEP, "d"));
        let cache = manager(reader.clone());
        assert!(cache.set(ROOT, &model(), &keys("r", "d")).await);
        reader.remove(DEP);
        assert_eq!(cache.get(ROOT).await, None);
    }
}
