//! Build graph over persisted queries.
//!
//! Every named query annotated `#@ persist` becomes a node carrying its
//! compiled SQL and a digest of (connection identity, SQL). Edges run from a
//! node to the persisted queries it reads, found by walking its source,
//! joins and query sources. Nodes are grouped into levels: level 0 depends
//! on nothing, and every node of level N+1 depends only on earlier levels.
//!
//! # Example
//!
//! ```ignore
//! let graph = BuildGraph::from_model(&model, &BuildOptions::default())?;
//! for level in graph.levels() {
//!     // everything in `level` may be built concurrently
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::hash::digest_parts;
use crate::compiler::{resolve_source, CompileError, CompileOptions, QueryCompiler};
use crate::model::{FieldDef, ModelDef, Query, SourceRef, StructDef, StructKind};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot compile persisted query '{name}': {source}")]
    Compile {
        name: String,
        #[source]
        source: CompileError,
    },

    #[error("persisted queries depend on each other in a cycle: {0}")]
    Cycle(String),
}

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub compile: CompileOptions,
    /// Identity per connection name (e.g. a fingerprint of its settings).
    /// Defaults to `name:dialect`.
    pub connection_identities: BTreeMap<String, String>,
}

impl BuildOptions {
    fn identity(&self, connection: &str, dialect: &str) -> String {
        self.connection_identities
            .get(connection)
            .cloned()
            .unwrap_or_else(|| format!("{}:{}", connection, dialect))
    }
}

/// One persisted query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildNode {
    pub name: String,
    pub sql: String,
    pub digest: String,
    pub connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Persisted queries this one reads, directly.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildGraph {
    levels: Vec<Vec<BuildNode>>,
    leaves: Vec<String>,
}

impl BuildGraph {
    pub fn from_model(model: &ModelDef, options: &BuildOptions) -> BuildResult<Self> {
        let compiler = QueryCompiler::new(model);
        let persisted: Vec<&str> = model.persisted_queries().map(|q| q.name.as_str()).collect();
        let persisted_set: HashSet<&str> = persisted.iter().copied().collect();

        let mut graph: DiGraph<BuildNode, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        for named in model.persisted_queries() {
            let compiled = compiler
                .compile_named(&named.name, &options.compile)
                .map_err(|source| BuildError::Compile {
                    name: named.name.clone(),
                    source,
                })?;
            let identity = options.identity(&compiled.connection_name, &compiled.dialect);
            let mut walker = DependencyWalker {
                model,
                persisted: &persisted_set,
                own: &named.name,
                found: Vec::new(),
                seen: HashSet::new(),
            };
            walker.query(&named.query);
            let node = BuildNode {
                name: named.name.clone(),
                digest: digest_parts(&[&identity, &compiled.sql]),
                sql: compiled.sql,
                connection: compiled.connection_name,
                table_name: named.persist.as_ref().and_then(|p| p.table_name.clone()),
                dependencies: walker.found,
            };
            index.insert(node.name.clone(), graph.add_node(node));
        }
        for name in &persisted {
            let to = index[*name];
            for dep in graph[to].dependencies.clone() {
                graph.add_edge(index[&dep], to, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| BuildError::Cycle(graph[cycle.node_id()].name.clone()))?;
        let mut level_of: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &order {
            let level = graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|dep| level_of.get(&dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(node, level);
        }

        let depth = level_of.values().max().map_or(0, |m| m + 1);
        let mut levels: Vec<Vec<BuildNode>> = vec![Vec::new(); depth];
        let mut leaves = Vec::new();
        // Definition order inside a level.
        for name in &persisted {
            let node = index[*name];
            if graph
                .neighbors_directed(node, Direction::Outgoing)
                .next()
                .is_none()
            {
                leaves.push(name.to_string());
            }
            levels[level_of[&node]].push(graph[node].clone());
        }
        info!(nodes = persisted.len(), levels = levels.len(), leaves = leaves.len(), "build graph leveled");
        Ok(Self { levels, leaves })
    }

    pub fn levels(&self) -> &[Vec<BuildNode>] {
        &self.levels
    }

    /// Nodes nothing else depends on; building these builds everything.
    pub fn leaves(&self) -> &[String] {
        &self.leaves
    }

    pub fn node(&self, name: &str) -> Option<&BuildNode> {
        self.levels.iter().flatten().find(|n| n.name == name)
    }

    pub fn level_of(&self, name: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|n| n.name == name))
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Collects the persisted queries a query reads, stopping at each one.
struct DependencyWalker<'a> {
    model: &'a ModelDef,
    persisted: &'a HashSet<&'a str>,
    own: &'a str,
    found: Vec<String>,
    seen: HashSet<String>,
}

impl DependencyWalker<'_> {
    fn query(&mut self, query: &Query) {
        match &query.source {
            SourceRef::Named(name) => self.named(name),
            SourceRef::Inline(def) => self.source(def),
        }
    }

    fn named(&mut self, name: &str) {
        if self.persisted.contains(name) && name != self.own {
            if !self.found.iter().any(|f| f == name) {
                debug!(query = %self.own, dependency = %name, "build dependency");
                self.found.push(name.to_string());
            }
            return;
        }
        if !self.seen.insert(name.to_string()) {
            return;
        }
        if let Some(named) = self.model.named_query(name) {
            self.query(&named.query);
        } else if let Ok(def) = resolve_source(self.model, &SourceRef::Named(name.to_string())) {
            self.source(&def);
        }
    }

    fn source(&mut self, def: &StructDef) {
        match &def.kind {
            StructKind::QuerySource { query, query_name } => match query_name {
                Some(name) if self.persisted.contains(name.as_str()) => self.named(name),
                _ => self.query(query),
            },
            StructKind::Composite { sources } => sources.iter().for_each(|s| self.source(s)),
            _ => {}
        }
        for field in &def.fields {
            if let FieldDef::Struct(joined) = field {
                self.source(joined);
            }
        }
    }
}
