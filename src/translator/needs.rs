//! External facts the translator asks for, and the answers it gets back.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::StructDef;

use super::ast::{Document, NestItem, QueryExpr, SegmentAst, SegmentItem, SourceExpr, SourceProperty, SqlPart, Statement};

/// A table schema request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub connection: String,
    pub path: String,
}

impl TableKey {
    pub fn new(connection: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            path: path.into(),
        }
    }
}

/// A schema request for the result of a SQL statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SqlKey {
    pub connection: String,
    pub sql: String,
}

impl SqlKey {
    pub fn new(connection: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            sql: sql.into(),
        }
    }
}

/// One requested fact, for error reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NeedKey {
    Url(String),
    Table(TableKey),
    Sql(SqlKey),
}

impl fmt::Display for NeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NeedKey::Url(url) => write!(f, "url {}", url),
            NeedKey::Table(t) => write!(f, "table {}:{}", t.connection, t.path),
            NeedKey::Sql(s) => write!(f, "sql schema on {}: {}", s.connection, s.sql),
        }
    }
}

/// Everything the translator needs before it can continue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilerNeeds {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sql: Vec<SqlKey>,
}

impl CompilerNeeds {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.tables.is_empty() && self.sql.is_empty()
    }

    pub fn len(&self) -> usize {
        self.urls.len() + self.tables.len() + self.sql.len()
    }

    pub fn add_url(&mut self, url: &str) {
        if !self.urls.iter().any(|u| u == url) {
            self.urls.push(url.to_string());
        }
    }

    pub fn add_table(&mut self, key: TableKey) {
        if !self.tables.contains(&key) {
            self.tables.push(key);
        }
    }

    pub fn add_sql(&mut self, key: SqlKey) {
        if !self.sql.contains(&key) {
            self.sql.push(key);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = NeedKey> + '_ {
        self.urls
            .iter()
            .cloned()
            .map(NeedKey::Url)
            .chain(self.tables.iter().cloned().map(NeedKey::Table))
            .chain(self.sql.iter().cloned().map(NeedKey::Sql))
    }
}

/// Answers to a [`CompilerNeeds`] batch. Each item is either the fact or the
/// error message from fetching it.
#[derive(Debug, Clone, Default)]
pub struct UpdateData {
    pub urls: BTreeMap<String, Result<String, String>>,
    pub tables: BTreeMap<TableKey, Result<StructDef, String>>,
    pub sql: BTreeMap<SqlKey, Result<StructDef, String>>,
}

impl UpdateData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, url: impl Into<String>, contents: impl Into<String>) -> Self {
        self.urls.insert(url.into(), Ok(contents.into()));
        self
    }

    pub fn file_error(mut self, url: impl Into<String>, message: impl Into<String>) -> Self {
        self.urls.insert(url.into(), Err(message.into()));
        self
    }

    pub fn table(mut self, key: TableKey, schema: StructDef) -> Self {
        self.tables.insert(key, Ok(schema));
        self
    }

    pub fn table_error(mut self, key: TableKey, message: impl Into<String>) -> Self {
        self.tables.insert(key, Err(message.into()));
        self
    }

    pub fn sql_schema(mut self, key: SqlKey, schema: StructDef) -> Self {
        self.sql.insert(key, Ok(schema));
        self
    }

    pub fn sql_error(mut self, key: SqlKey, message: impl Into<String>) -> Self {
        self.sql.insert(key, Err(message.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.tables.is_empty() && self.sql.is_empty()
    }
}

// ============================================================================
// Syntactic prefetch
// ============================================================================

/// Every table a document names, found without resolving anything.
///
/// Lets the first round of needs carry table schemas together with imports
/// instead of discovering them one resolution pass at a time.
pub(crate) fn table_references(doc: &Document) -> Vec<TableKey> {
    let mut out = Vec::new();
    for statement in &doc.statements {
        match &statement.node {
            Statement::Import { .. } => {}
            Statement::Source { source, .. } => source_tables(source, &mut out),
            Statement::Query { query, .. } | Statement::Run { query } => query_tables(query, &mut out),
        }
    }
    out
}

fn push_unique(out: &mut Vec<TableKey>, key: TableKey) {
    if !out.contains(&key) {
        out.push(key);
    }
}

fn source_tables(expr: &SourceExpr, out: &mut Vec<TableKey>) {
    match expr {
        SourceExpr::Table { connection, path } => push_unique(out, TableKey::new(connection, path)),
        SourceExpr::Sql { parts, .. } => {
            for part in parts {
                if let SqlPart::Query { query } = part {
                    query_tables(query, out);
                }
            }
        }
        SourceExpr::Named { .. } => {}
        SourceExpr::Query { query } => query_tables(query, out),
        SourceExpr::Composite { sources } => sources.iter().for_each(|s| source_tables(s, out)),
        SourceExpr::Extend { base, properties } => {
            source_tables(base, out);
            for property in properties {
                match &property.node {
                    SourceProperty::Join { source, .. } => source_tables(source, out),
                    SourceProperty::View { pipeline, .. } => pipeline_tables(pipeline, out),
                    _ => {}
                }
            }
        }
    }
}

fn query_tables(query: &QueryExpr, out: &mut Vec<TableKey>) {
    source_tables(&query.source, out);
    pipeline_tables(&query.segments, out);
}

fn pipeline_tables(segments: &[SegmentAst], out: &mut Vec<TableKey>) {
    for segment in segments {
        let SegmentAst::Body { items } = segment else {
            continue;
        };
        for item in items {
            if let SegmentItem::Nest { nests } = &item.node {
                for nest in nests {
                    if let NestItem::Inline { pipeline, .. } = nest {
                        pipeline_tables(pipeline, out);
                    }
                }
            }
        }
    }
}
