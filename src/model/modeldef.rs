//! The compiled model: everything a document (and its imports) defines.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::dependency::DependencyTree;
use super::query::Query;
use super::structdef::StructDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    /// URL of the root document.
    pub name: String,
    /// Every name in scope, including imported ones, in definition order.
    pub contents: IndexMap<String, NamedObject>,
    /// Names defined by the root document itself.
    #[serde(default)]
    pub exports: Vec<String>,
    /// `run:` statements, in document order.
    #[serde(default)]
    pub queries: Vec<Query>,
    pub dependencies: DependencyTree,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NamedObject {
    Source(StructDef),
    Query(NamedQuery),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist: Option<PersistSpec>,
}

/// `#@ persist` annotation on a named query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            dependencies: DependencyTree::new(&name),
            name,
            contents: IndexMap::new(),
            exports: Vec::new(),
            queries: Vec::new(),
        }
    }

    pub fn source(&self, name: &str) -> Option<&StructDef> {
        match self.contents.get(name)? {
            NamedObject::Source(s) => Some(s),
            NamedObject::Query(_) => None,
        }
    }

    pub fn named_query(&self, name: &str) -> Option<&NamedQuery> {
        match self.contents.get(name)? {
            NamedObject::Query(q) => Some(q),
            NamedObject::Source(_) => None,
        }
    }

    /// Named queries carrying a persist annotation, in definition order.
    pub fn persisted_queries(&self) -> impl Iterator<Item = &NamedQuery> {
        self.contents.values().filter_map(|o| match o {
            NamedObject::Query(q) if q.persist.is_some() => Some(q),
            _ => None,
        })
    }
}
