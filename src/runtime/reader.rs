//! URL readers: where document text comes from.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

use super::error::{FetchError, FetchResult};
use crate::cache::hash::content_hash;

/// Scheme for synthetic documents that never invalidate a cache entry.
pub const INTERNAL_SCHEME: &str = "internal";

/// Document text plus the fingerprint the cache compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlContents {
    pub contents: String,
    /// `None` for URLs that must never validate a cache entry.
    pub invalidation_key: Option<String>,
}

pub fn is_internal(url: &str) -> bool {
    url.strip_prefix(INTERNAL_SCHEME)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// Key for a document read from `url`.
pub fn key_for(url: &str, contents: &str) -> Option<String> {
    if is_internal(url) {
        None
    } else {
        Some(content_hash(contents))
    }
}

#[async_trait]
pub trait UrlReader: Send + Sync {
    async fn read_url(&self, url: &str) -> FetchResult<UrlContents>;

    /// Current key without keeping the contents.
    async fn invalidation_key(&self, url: &str) -> FetchResult<Option<String>> {
        if is_internal(url) {
            return Ok(None);
        }
        Ok(self.read_url(url).await?.invalidation_key)
    }
}

// ============================================================================
// file://
// ============================================================================

/// Reads `file://` URLs from the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FileUrlReader;

#[async_trait]
impl UrlReader for FileUrlReader {
    async fn read_url(&self, url: &str) -> FetchResult<UrlContents> {
        let parsed = Url::parse(url).map_err(|_| FetchError::UnsupportedUrl(url.to_string()))?;
        if parsed.scheme() != "file" {
            return Err(FetchError::UnsupportedUrl(url.to_string()));
        }
        let path = parsed
            .to_file_path()
            .map_err(|_| FetchError::UnsupportedUrl(url.to_string()))?;
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| FetchError::Io {
                url: url.to_string(),
                source,
            })?;
        let invalidation_key = key_for(url, &contents);
        Ok(UrlContents {
            contents,
            invalidation_key,
        })
    }
}

// ============================================================================
// In memory
// ============================================================================

/// Documents held in memory; edits through [`InMemoryUrlReader::insert`]
/// change the key on the next read.
#[derive(Debug, Default)]
pub struct InMemoryUrlReader {
    files: RwLock<HashMap<String, String>>,
}

impl InMemoryUrlReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, url: impl Into<String>, contents: impl Into<String>) -> Self {
        self.insert(url, contents);
        self
    }

    pub fn insert(&self, url: impl Into<String>, contents: impl Into<String>) {
        self.files.write().insert(url.into(), contents.into());
    }

    pub fn remove(&self, url: &str) -> Option<String> {
        self.files.write().remove(url)
    }
}

#[async_trait]
impl UrlReader for InMemoryUrlReader {
    async fn read_url(&self, url: &str) -> FetchResult<UrlContents> {
        let contents = self
            .files
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))?;
        let invalidation_key = key_for(url, &contents);
        Ok(UrlContents {
            contents,
            invalidation_key,
        })
    }
}
