//! Answering a batch of needs.
//!
//! Every need in a batch is fetched concurrently; each one either yields its
//! fact or the error message the translator reports where it matters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::connection::ConnectionLookup;
use super::reader::UrlReader;
use crate::translator::{CompilerNeeds, NeedKey, UpdateData};

/// Durations of one batch, per need kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchTiming {
    pub files: Duration,
    pub tables: Duration,
    pub sql: Duration,
}

/// Answers to one batch of needs.
#[derive(Debug, Default)]
pub struct FetchedBatch {
    pub data: UpdateData,
    /// Invalidation keys of the documents read.
    pub keys: Vec<(String, Option<String>)>,
    pub timing: BatchTiming,
}

/// Fetches a batch of needs. Must answer every need, with the fact or an
/// error message.
#[async_trait]
pub trait NeedFetcher: Send + Sync {
    async fn fetch(&self, needs: &CompilerNeeds) -> FetchedBatch;
}

/// Reads URLs through a [`UrlReader`] and schemas through connections.
#[derive(Clone)]
pub struct StandardFetcher {
    reader: Arc<dyn UrlReader>,
    connections: Arc<dyn ConnectionLookup>,
}

impl StandardFetcher {
    pub fn new(reader: Arc<dyn UrlReader>, connections: Arc<dyn ConnectionLookup>) -> Self {
        Self {
            reader,
            connections,
        }
    }
}

#[async_trait]
impl NeedFetcher for StandardFetcher {
    async fn fetch(&self, needs: &CompilerNeeds) -> FetchedBatch {
        let reader = self.reader.as_ref();
        let connections = self.connections.as_ref();
        let mut data = UpdateData::new();
        let mut keys = Vec::new();

        let files = async {
            let start = Instant::now();
            let results = join_all(needs.urls.iter().map(|url| async move {
                (url.clone(), reader.read_url(url).await)
            }))
            .await;
            (results, start.elapsed())
        };
        let tables = async {
            let start = Instant::now();
            let results = join_all(needs.tables.iter().map(|key| async move {
                let result = match connections.lookup(&key.connection) {
                    Ok(conn) => conn.fetch_schema_for_table(&key.path).await,
                    Err(e) => Err(e),
                };
                (key.clone(), result)
            }))
            .await;
            (results, start.elapsed())
        };
        let sql = async {
            let start = Instant::now();
            let results = join_all(needs.sql.iter().map(|key| async move {
                let result = match connections.lookup(&key.connection) {
                    Ok(conn) => conn.fetch_schema_for_sql(&key.sql).await,
                    Err(e) => Err(e),
                };
                (key.clone(), result)
            }))
            .await;
            (results, start.elapsed())
        };
        let ((files, files_time), (tables, tables_time), (sql, sql_time)) =
            futures::join!(files, tables, sql);

        for (url, result) in files {
            match result {
                Ok(contents) => {
                    keys.push((url.clone(), contents.invalidation_key));
                    data.urls.insert(url, Ok(contents.contents));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "read failed");
                    data.urls.insert(url, Err(e.to_string()));
                }
            }
        }
        for (key, result) in tables {
            if let Err(e) = &result {
                warn!(connection = %key.connection, table = %key.path, error = %e, "schema fetch failed");
            }
            data.tables.insert(key, result.map_err(|e| e.to_string()));
        }
        for (key, result) in sql {
            if let Err(e) = &result {
                warn!(connection = %key.connection, error = %e, "SQL schema fetch failed");
            }
            data.sql.insert(key, result.map_err(|e| e.to_string()));
        }

        debug!(
            urls = needs.urls.len(),
            tables = needs.tables.len(),
            sql = needs.sql.len(),
            "batch fetched"
        );
        FetchedBatch {
            data,
            keys,
            timing: BatchTiming {
                files: files_time,
                tables: tables_time,
                sql: sql_time,
            },
        }
    }
}

/// First need in `needs` that `data` leaves unanswered.
pub(crate) fn unanswered(needs: &CompilerNeeds, data: &UpdateData) -> Option<String> {
    needs
        .keys()
        .find(|key| match key {
            NeedKey::Url(url) => !data.urls.contains_key(url),
            NeedKey::Table(k) => !data.tables.contains_key(k),
            NeedKey::Sql(k) => !data.sql.contains_key(k),
        })
        .map(|key| key.to_string())
}
