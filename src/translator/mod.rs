//! Incremental translator: documents to a [`ModelDef`].
//!
//! The translator never performs I/O. [`Translator::compile`] either returns
//! the final model or the batch of facts it still needs; the caller fetches
//! them and hands them back through [`Translator::update`].
//!
//! ```text
//! Gathering ──compile──▶ Needs(batch) ──update──▶ Gathering ──compile──▶ Final
//! ```
//!
//! Once final, the translator is frozen: updates are ignored and `compile`
//! returns the same result again.
//!
//! # Example
//!
//! ```ignore
//! let mut translator = Translator::new("file:///models/flights.json");
//! loop {
//!     match translator.compile()? {
//!         TranslateResponse::Final(result) => break result,
//!         TranslateResponse::Needs(needs) => translator.update(fetch(&needs).await),
//!     }
//! }
//! ```

pub mod ast;
pub mod functions;
pub mod needs;
pub mod parse;
mod resolve;
mod segment;
pub mod typecheck;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::diagnostics::{has_errors, Diagnostic};
use crate::model::{ModelDef, Query, StructDef};

pub use ast::Document;
pub use needs::{CompilerNeeds, NeedKey, SqlKey, TableKey, UpdateData};
pub use parse::{DocumentParser, JsonDocumentParser, ParseError};

use ast::Statement;
use needs::table_references;
use resolve::{resolve_url, Facts, FileState, Resolver};

/// Compiles a query against a partial model to SQL text.
///
/// Used to materialize SQL blocks that embed queries. Implemented by the
/// query compiler; kept as a trait so the translator does not depend on it.
pub trait SqlBlockCompiler: Send + Sync {
    fn compile_query_sql(&self, partial: &ModelDef, query: &Query) -> Result<String, String>;
}

/// Protocol violations. These are fatal; problems in the documents
/// themselves are diagnostics in [`TranslateResult::problems`].
#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("need was requested before and not satisfied: {0}")]
    NeedNotSatisfied(String),
}

/// The final answer of a translation.
#[derive(Debug, Clone)]
pub struct TranslateResult {
    pub model: ModelDef,
    pub problems: Vec<Diagnostic>,
}

impl TranslateResult {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.problems)
    }
}

#[derive(Debug, Clone)]
pub enum TranslateResponse {
    Final(TranslateResult),
    Needs(CompilerNeeds),
}

/// Translates one root document and its imports.
pub struct Translator {
    root: String,
    parser: Arc<dyn DocumentParser>,
    sql_compiler: Option<Arc<dyn SqlBlockCompiler>>,
    base: Option<ModelDef>,
    files: HashMap<String, FileState>,
    tables: HashMap<TableKey, Result<StructDef, String>>,
    sql: HashMap<SqlKey, Result<StructDef, String>>,
    requested: HashSet<NeedKey>,
    iterations: usize,
    result: Option<TranslateResult>,
}

impl Translator {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            parser: Arc::new(JsonDocumentParser),
            sql_compiler: None,
            base: None,
            files: HashMap::new(),
            tables: HashMap::new(),
            sql: HashMap::new(),
            requested: HashSet::new(),
            iterations: 0,
            result: None,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn DocumentParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Enable SQL blocks that embed queries.
    pub fn with_sql_compiler(mut self, compiler: Arc<dyn SqlBlockCompiler>) -> Self {
        self.sql_compiler = Some(compiler);
        self
    }

    /// Seed the root scope with the definitions of an already final model.
    pub fn with_base_model(mut self, model: ModelDef) -> Self {
        self.base = Some(model);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Number of `compile` calls that did work.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_final(&self) -> bool {
        self.result.is_some()
    }

    /// Supply facts. The first answer for a key wins; later ones are ignored.
    pub fn update(&mut self, data: UpdateData) {
        if self.result.is_some() {
            debug!(url = %self.root, "update after final result ignored");
            return;
        }
        for (url, contents) in data.urls {
            if self.files.contains_key(&url) {
                continue;
            }
            let state = match contents {
                Ok(text) => match self.parser.parse(&url, &text) {
                    Ok(doc) => FileState::Parsed(doc),
                    Err(e) => FileState::Invalid(e),
                },
                Err(message) => FileState::ReadFailed(message),
            };
            self.files.insert(url, state);
        }
        for (key, schema) in data.tables {
            self.tables.entry(key).or_insert(schema);
        }
        for (key, schema) in data.sql {
            self.sql.entry(key).or_insert(schema);
        }
    }

    pub fn compile(&mut self) -> Result<TranslateResponse, TranslatorError> {
        if let Some(result) = &self.result {
            return Ok(TranslateResponse::Final(result.clone()));
        }
        self.iterations += 1;

        let discovered = self.discover();
        if !discovered.is_empty() {
            return self.request(discovered);
        }

        let facts = Facts {
            files: &self.files,
            tables: &self.tables,
            sql: &self.sql,
            sql_compiler: self.sql_compiler.as_deref(),
            base: self.base.as_ref(),
        };
        let resolution = Resolver::new(&self.root, facts).run();
        if !resolution.needs.is_empty() {
            return self.request(resolution.needs);
        }

        let result = TranslateResult {
            model: resolution.model,
            problems: resolution.diagnostics,
        };
        info!(
            url = %self.root,
            iterations = self.iterations,
            problems = result.problems.len(),
            "translation final"
        );
        self.result = Some(result.clone());
        Ok(TranslateResponse::Final(result))
    }

    /// Missing files reachable through imports, plus tables named in the
    /// documents parsed so far.
    fn discover(&self) -> CompilerNeeds {
        let mut needs = CompilerNeeds::default();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.root.clone()]);
        while let Some(url) = queue.pop_front() {
            if !seen.insert(url.clone()) {
                continue;
            }
            let Some(state) = self.files.get(&url) else {
                needs.add_url(&url);
                continue;
            };
            let FileState::Parsed(doc) = state else {
                continue;
            };
            for statement in &doc.statements {
                if let Statement::Import { url: relative } = &statement.node {
                    if let Ok(target) = resolve_url(&url, relative) {
                        queue.push_back(target);
                    }
                }
            }
            for key in table_references(doc) {
                if !self.tables.contains_key(&key) {
                    needs.add_table(key);
                }
            }
        }
        needs
    }

    fn request(&mut self, needs: CompilerNeeds) -> Result<TranslateResponse, TranslatorError> {
        for key in needs.keys() {
            if !self.requested.insert(key.clone()) {
                return Err(TranslatorError::NeedNotSatisfied(key.to_string()));
            }
        }
        debug!(
            url = %self.root,
            iteration = self.iterations,
            urls = needs.urls.len(),
            tables = needs.tables.len(),
            sql = needs.sql.len(),
            "translator needs"
        );
        Ok(TranslateResponse::Needs(needs))
    }
}
