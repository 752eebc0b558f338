//! Connections: schema fetches and query execution.
//!
//! The compiler never talks to a database. A [`Connection`] answers the
//! schema needs the translator raises and, optionally, runs compiled SQL.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{FetchError, FetchResult};
use crate::model::{AtomicType, StructDef};

/// Options for [`Connection::run_sql`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,
}

/// Rows returned by a query, one JSON object per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    /// Dialect name of the SQL this connection accepts.
    fn dialect(&self) -> &str;

    async fn fetch_schema_for_table(&self, path: &str) -> FetchResult<StructDef>;

    async fn fetch_schema_for_sql(&self, sql: &str) -> FetchResult<StructDef>;

    async fn run_sql(&self, sql: &str, options: &RunOptions) -> FetchResult<QueryData>;
}

/// Finds the connection for a connection name.
pub trait ConnectionLookup: Send + Sync {
    fn lookup(&self, name: &str) -> FetchResult<Arc<dyn Connection>>;
}

/// Connections by name.
#[derive(Default, Clone)]
pub struct ConnectionMap {
    connections: HashMap<String, Arc<dyn Connection>>,
    default: Option<String>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, connection: Arc<dyn Connection>) -> Self {
        self.insert(connection);
        self
    }

    pub fn insert(&mut self, connection: Arc<dyn Connection>) {
        self.connections
            .insert(connection.name().to_string(), connection);
    }

    /// Connection used for the empty name.
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ConnectionLookup for ConnectionMap {
    fn lookup(&self, name: &str) -> FetchResult<Arc<dyn Connection>> {
        let name = match (name, &self.default) {
            ("", Some(default)) => default.as_str(),
            _ => name,
        };
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| FetchError::UnknownConnection(name.to_string()))
    }
}

// ============================================================================
// Static connection
// ============================================================================

/// Column list of one table in a schema catalog file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AtomicType,
}

/// Schema catalog: table path to columns, plus SQL text to columns.
///
/// ```json
/// {"tables": {"flights": [{"name": "carrier", "type": "string"}]}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<CatalogColumn>>,
    #[serde(default)]
    pub sql: BTreeMap<String, Vec<CatalogColumn>>,
}

impl SchemaCatalog {
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(std::io::Error::other)
    }
}

/// A connection with fixed schemas and no query execution.
///
/// Compiles offline and in tests.
#[derive(Debug, Clone)]
pub struct StaticConnection {
    name: String,
    dialect: String,
    tables: HashMap<String, StructDef>,
    sql: HashMap<String, StructDef>,
}

impl StaticConnection {
    pub fn new(name: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dialect: dialect.into(),
            tables: HashMap::new(),
            sql: HashMap::new(),
        }
    }

    /// Register a table from `(column, type)` pairs.
    pub fn with_table(mut self, path: &str, columns: &[(&str, AtomicType)]) -> Self {
        let def = columns.iter().fold(
            StructDef::table(path, path, &self.dialect, &self.name),
            |def, (name, ty)| def.column(name, *ty),
        );
        self.tables.insert(path.to_string(), def);
        self
    }

    /// Register a table with a primary key.
    pub fn with_keyed_table(self, path: &str, key: &str, columns: &[(&str, AtomicType)]) -> Self {
        let mut this = self.with_table(path, columns);
        if let Some(def) = this.tables.remove(path) {
            this.tables.insert(path.to_string(), def.primary_key(key));
        }
        this
    }

    /// Register the result schema of a SQL statement.
    pub fn with_sql(mut self, sql: &str, columns: &[(&str, AtomicType)]) -> Self {
        let def = columns.iter().fold(
            StructDef::table("sql", "", &self.dialect, &self.name),
            |def, (name, ty)| def.column(name, *ty),
        );
        self.sql.insert(sql.to_string(), def);
        self
    }

    pub fn with_catalog(mut self, catalog: &SchemaCatalog) -> Self {
        for (path, columns) in &catalog.tables {
            let pairs: Vec<(&str, AtomicType)> =
                columns.iter().map(|c| (c.name.as_str(), c.ty)).collect();
            self = self.with_table(path, &pairs);
        }
        for (sql, columns) in &catalog.sql {
            let pairs: Vec<(&str, AtomicType)> =
                columns.iter().map(|c| (c.name.as_str(), c.ty)).collect();
            self = self.with_sql(sql, &pairs);
        }
        self
    }
}

#[async_trait]
impl Connection for StaticConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &str {
        &self.dialect
    }

    async fn fetch_schema_for_table(&self, path: &str) -> FetchResult<StructDef> {
        self.tables
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::TableNotFound(path.to_string()))
    }

    async fn fetch_schema_for_sql(&self, sql: &str) -> FetchResult<StructDef> {
        self.sql
            .get(sql.trim())
            .or_else(|| self.sql.get(sql))
            .cloned()
            .ok_or_else(|| FetchError::SqlSchema(sql.to_string()))
    }

    async fn run_sql(&self, _sql: &str, _options: &RunOptions) -> FetchResult<QueryData> {
        Err(FetchError::RunUnsupported(self.name.clone()))
    }
}
