//! Compile API.
//!
//! [`Runtime`] drives the translator's needs loop to completion: it fetches
//! every batch of needs concurrently, feeds the answers back, and compiles
//! queries against the finished model. Each call reports how long parsing,
//! fetching and compiling took.
//!
//! # Example
//!
//! ```ignore
//! let runtime = Runtime::new(Arc::new(FileUrlReader), Arc::new(connections));
//! let request = QueryRequest::named("file:///models/flights.json", "by_carrier");
//! match runtime.compile_query(&request).await? {
//!     CompileOutcome::Compiled { value, .. } => println!("{}", value.sql),
//!     CompileOutcome::Failed { problems, .. } => eprintln!("{:?}", problems),
//! }
//! ```

pub mod connection;
pub mod error;
pub mod fetch;
pub mod reader;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::build::{BuildGraph, BuildOptions};
use crate::cache::{CacheManager, ModelCache};
use crate::compiler::{CompileOptions, CompiledQuery, QueryCompiler, SqlBlocks};
use crate::diagnostics::Diagnostic;
use crate::model::ModelDef;
use crate::translator::{TranslateResponse, TranslateResult, Translator, UpdateData};

pub use connection::{
    CatalogColumn, Connection, ConnectionLookup, ConnectionMap, QueryData, RunOptions,
    SchemaCatalog, StaticConnection,
};
pub use error::{FetchError, FetchResult, RuntimeError, RuntimeResult};
pub use fetch::{BatchTiming, FetchedBatch, NeedFetcher, StandardFetcher};
pub use reader::{FileUrlReader, InMemoryUrlReader, UrlContents, UrlReader, INTERNAL_SCHEME};

use fetch::unanswered;

// ============================================================================
// Results
// ============================================================================

/// Where a compile call spent its time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    /// Parsing documents as they arrive.
    pub parse: Duration,
    pub fetch_files: Duration,
    pub fetch_tables: Duration,
    pub fetch_sql: Duration,
    /// Translation passes and SQL generation.
    pub compile: Duration,
    pub total: Duration,
    /// Number of translator `compile` calls.
    pub iterations: usize,
}

impl Timing {
    fn add_batch(&mut self, batch: &BatchTiming) {
        self.fetch_files += batch.files;
        self.fetch_tables += batch.tables;
        self.fetch_sql += batch.sql;
    }

    fn absorb(&mut self, other: &Timing) {
        self.parse += other.parse;
        self.fetch_files += other.fetch_files;
        self.fetch_tables += other.fetch_tables;
        self.fetch_sql += other.fetch_sql;
        self.compile += other.compile;
        self.iterations += other.iterations;
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        write!(
            f,
            "parse {:.2}ms, fetch files {:.2}ms / tables {:.2}ms / sql {:.2}ms, compile {:.2}ms, total {:.2}ms ({} iterations)",
            ms(self.parse),
            ms(self.fetch_files),
            ms(self.fetch_tables),
            ms(self.fetch_sql),
            ms(self.compile),
            ms(self.total),
            self.iterations
        )
    }
}

/// Either a value with non-fatal warnings, or the problems that prevented it.
#[derive(Debug, Clone)]
pub enum CompileOutcome<T> {
    Compiled {
        value: T,
        warnings: Vec<Diagnostic>,
        timing: Timing,
    },
    Failed {
        problems: Vec<Diagnostic>,
        timing: Timing,
    },
}

impl<T> CompileOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            CompileOutcome::Compiled { value, .. } => Some(value),
            CompileOutcome::Failed { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CompileOutcome::Compiled { value, .. } => Some(value),
            CompileOutcome::Failed { .. } => None,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, CompileOutcome::Compiled { .. })
    }

    /// Warnings of a compiled value, or the problems of a failure.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileOutcome::Compiled { warnings, .. } => warnings,
            CompileOutcome::Failed { problems, .. } => problems,
        }
    }

    pub fn timing(&self) -> &Timing {
        match self {
            CompileOutcome::Compiled { timing, .. } | CompileOutcome::Failed { timing, .. } => timing,
        }
    }

    fn timing_mut(&mut self) -> &mut Timing {
        match self {
            CompileOutcome::Compiled { timing, .. } | CompileOutcome::Failed { timing, .. } => timing,
        }
    }
}

/// Which query of a model to compile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    /// A named query.
    Named(String),
    /// The n-th `run` statement of the model document.
    Index(usize),
    /// A query document compiled against the model; its last `run`
    /// statement is the query.
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub model_url: String,
    pub target: QueryTarget,
    #[serde(default)]
    pub options: CompileOptions,
}

impl QueryRequest {
    pub fn named(model_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model_url: model_url.into(),
            target: QueryTarget::Named(name.into()),
            options: CompileOptions::default(),
        }
    }

    pub fn index(model_url: impl Into<String>, index: usize) -> Self {
        Self {
            model_url: model_url.into(),
            target: QueryTarget::Index(index),
            options: CompileOptions::default(),
        }
    }

    pub fn text(model_url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model_url: model_url.into(),
            target: QueryTarget::Text(text.into()),
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }
}

/// A compiled query and the rows it returned.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub compiled: CompiledQuery,
    pub data: QueryData,
}

// ============================================================================
// Runtime
// ============================================================================

pub struct Runtime {
    fetcher: Arc<dyn NeedFetcher>,
    connections: Arc<dyn ConnectionLookup>,
    cache: Option<CacheManager>,
    run_options: RunOptions,
    reader: Arc<dyn UrlReader>,
    next_query: AtomicUsize,
}

impl Runtime {
    pub fn new(reader: Arc<dyn UrlReader>, connections: Arc<dyn ConnectionLookup>) -> Self {
        Self {
            fetcher: Arc::new(StandardFetcher::new(reader.clone(), connections.clone())),
            connections,
            cache: None,
            run_options: RunOptions::default(),
            reader,
            next_query: AtomicUsize::new(0),
        }
    }

    /// Replace the default fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn NeedFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Cache finished models, validated against the runtime's URL reader.
    pub fn with_cache(mut self, cache: Arc<dyn ModelCache>) -> Self {
        self.cache = Some(CacheManager::new(cache, self.reader.clone()));
        self
    }

    pub fn with_run_options(mut self, options: RunOptions) -> Self {
        self.run_options = options;
        self
    }

    /// Drive one translator to its final result.
    async fn translate(
        &self,
        mut translator: Translator,
        timing: &mut Timing,
    ) -> RuntimeResult<(TranslateResult, BTreeMap<String, Option<String>>)> {
        let mut keys = BTreeMap::new();
        loop {
            let start = Instant::now();
            let response = translator.compile()?;
            timing.compile += start.elapsed();
            timing.iterations += 1;
            let needs = match response {
                TranslateResponse::Final(result) => return Ok((result, keys)),
                TranslateResponse::Needs(needs) => needs,
            };
            debug!(root = %translator.root(), needs = needs.len(), "fetching needs");
            let batch = self.fetcher.fetch(&needs).await;
            if let Some(missing) = unanswered(&needs, &batch.data) {
                return Err(RuntimeError::UnansweredNeeds(missing));
            }
            timing.add_batch(&batch.timing);
            keys.extend(batch.keys);
            let start = Instant::now();
            translator.update(batch.data);
            timing.parse += start.elapsed();
        }
    }

    /// Translate the model at `url`, consulting the cache when configured.
    pub async fn compile_model(&self, url: &str) -> RuntimeResult<CompileOutcome<ModelDef>> {
        let start = Instant::now();
        let mut timing = Timing::default();

        if let Some(cache) = &self.cache {
            if let Some(model) = cache.get(url).await {
                timing.total = start.elapsed();
                return Ok(CompileOutcome::Compiled {
                    value: model,
                    warnings: Vec::new(),
                    timing,
                });
            }
        }

        let translator = Translator::new(url).with_sql_compiler(Arc::new(SqlBlocks));
        let (result, keys) = self.translate(translator, &mut timing).await?;
        let outcome = if result.has_errors() {
            CompileOutcome::Failed {
                problems: result.problems,
                timing,
            }
        } else {
            if let Some(cache) = &self.cache {
                let stored = cache.set(url, &result.model, &keys).await;
                debug!(url = %url, stored, "model cache store");
            }
            CompileOutcome::Compiled {
                value: result.model,
                warnings: result.problems,
                timing,
            }
        };
        Ok(finish(outcome, start, url, "model"))
    }

    pub async fn compile_query(&self, request: &QueryRequest) -> RuntimeResult<CompileOutcome<CompiledQuery>> {
        let start = Instant::now();
        let (model, mut warnings, mut timing) = match self.compile_model(&request.model_url).await? {
            CompileOutcome::Compiled {
                value,
                warnings,
                timing,
            } => (value, warnings, timing),
            CompileOutcome::Failed { problems, timing } => {
                return Ok(CompileOutcome::Failed { problems, timing });
            }
        };

        let compile_start = Instant::now();
        let (compiled, location) = match &request.target {
            QueryTarget::Named(name) => (
                QueryCompiler::new(&model).compile_named(name, &request.options),
                model.named_query(name).and_then(|q| q.query.location.clone()),
            ),
            QueryTarget::Index(index) => match model.queries.get(*index) {
                Some(query) => (
                    QueryCompiler::new(&model).compile_with(query, &request.options),
                    query.location.clone(),
                ),
                None => {
                    let message = format!(
                        "no run statement at index {} ({} available)",
                        index,
                        model.queries.len()
                    );
                    return Ok(self.failed(&request.model_url, message, warnings, timing, start));
                }
            },
            QueryTarget::Text(text) => {
                let url = format!(
                    "{}://query/{}",
                    INTERNAL_SCHEME,
                    self.next_query.fetch_add(1, Ordering::Relaxed)
                );
                let mut translator = Translator::new(&url)
                    .with_base_model(model)
                    .with_sql_compiler(Arc::new(SqlBlocks));
                translator.update(UpdateData::new().file(&url, text.as_str()));
                let mut text_timing = Timing::default();
                let (result, _) = self.translate(translator, &mut text_timing).await?;
                timing.absorb(&text_timing);
                if result.has_errors() {
                    warnings.extend(result.problems);
                    timing.total = start.elapsed();
                    return Ok(CompileOutcome::Failed {
                        problems: warnings,
                        timing,
                    });
                }
                warnings.extend(result.problems);
                let Some(query) = result.model.queries.last() else {
                    return Ok(self.failed(&url, "query text has no run statement", warnings, timing, start));
                };
                (
                    QueryCompiler::new(&result.model).compile_with(query, &request.options),
                    query.location.clone(),
                )
            }
        };
        timing.compile += compile_start.elapsed();

        let outcome = match compiled {
            Ok(value) => CompileOutcome::Compiled {
                value,
                warnings,
                timing,
            },
            Err(e) => {
                let mut problems = warnings;
                problems.push(match location {
                    Some(at) => Diagnostic::error(at.url, Some(at.span), e.to_string()),
                    None => Diagnostic::error(&request.model_url, None, e.to_string()),
                });
                CompileOutcome::Failed { problems, timing }
            }
        };
        Ok(finish(outcome, start, &request.model_url, "query"))
    }

    /// Compile a query and run it on its connection.
    pub async fn run_query(&self, request: &QueryRequest) -> RuntimeResult<CompileOutcome<QueryResult>> {
        let (compiled, warnings, timing) = match self.compile_query(request).await? {
            CompileOutcome::Compiled {
                value,
                warnings,
                timing,
            } => (value, warnings, timing),
            CompileOutcome::Failed { problems, timing } => {
                return Ok(CompileOutcome::Failed { problems, timing });
            }
        };
        let connection = self.connections.lookup(&compiled.connection_name)?;
        let mut options = self.run_options.clone();
        if options.row_limit.is_none() {
            options.row_limit = request.options.default_row_limit;
        }
        let data = connection.run_sql(&compiled.sql, &options).await?;
        info!(
            connection = %compiled.connection_name,
            rows = data.rows.len(),
            "query ran"
        );
        Ok(CompileOutcome::Compiled {
            value: QueryResult { compiled, data },
            warnings,
            timing,
        })
    }

    /// Build graph of the persisted queries of the model at `url`.
    pub async fn build_graph(
        &self,
        url: &str,
        options: &BuildOptions,
    ) -> RuntimeResult<CompileOutcome<BuildGraph>> {
        let start = Instant::now();
        Ok(match self.compile_model(url).await? {
            CompileOutcome::Compiled {
                value,
                warnings,
                mut timing,
            } => {
                let build_start = Instant::now();
                let graph = BuildGraph::from_model(&value, options)?;
                timing.compile += build_start.elapsed();
                timing.total = start.elapsed();
                CompileOutcome::Compiled {
                    value: graph,
                    warnings,
                    timing,
                }
            }
            CompileOutcome::Failed { problems, timing } => CompileOutcome::Failed { problems, timing },
        })
    }

    fn failed<T>(
        &self,
        url: &str,
        message: impl Into<String>,
        mut problems: Vec<Diagnostic>,
        mut timing: Timing,
        start: Instant,
    ) -> CompileOutcome<T> {
        problems.push(Diagnostic::error(url, None, message));
        timing.total = start.elapsed();
        CompileOutcome::Failed { problems, timing }
    }
}

fn finish<T>(mut outcome: CompileOutcome<T>, start: Instant, url: &str, what: &str) -> CompileOutcome<T> {
    outcome.timing_mut().total = start.elapsed();
    let timing = *outcome.timing();
    match &outcome {
        CompileOutcome::Compiled { warnings, .. } => {
            info!(url = %url, what, warnings = warnings.len(), %timing, "compiled");
        }
        CompileOutcome::Failed { problems, .. } => {
            info!(url = %url, what, problems = problems.len(), %timing, "compile failed");
        }
    }
    outcome
}
