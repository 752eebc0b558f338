//! Import dependency tree.
//!
//! Stored as an arena of interned URLs plus an adjacency list, so that
//! diamond imports share one node.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DependencyRepr", into = "DependencyRepr")]
pub struct DependencyTree {
    urls: Vec<String>,
    children: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct DependencyRepr {
    urls: Vec<String>,
    children: Vec<Vec<usize>>,
}

impl From<DependencyRepr> for DependencyTree {
    fn from(repr: DependencyRepr) -> Self {
        let index = repr
            .urls
            .iter()
            .enumerate()
            .map(|(i, u)| (u.clone(), i))
            .collect();
        let mut children = repr.children;
        children.resize(repr.urls.len(), Vec::new());
        let len = repr.urls.len();
        for edges in &mut children {
            edges.retain(|&c| c < len);
        }
        Self {
            urls: repr.urls,
            children,
            index,
        }
    }
}

impl From<DependencyTree> for DependencyRepr {
    fn from(tree: DependencyTree) -> Self {
        Self {
            urls: tree.urls,
            children: tree.children,
        }
    }
}

impl PartialEq for DependencyTree {
    fn eq(&self, other: &Self) -> bool {
        self.urls == other.urls && self.children == other.children
    }
}

impl DependencyTree {
    pub fn new(root: &str) -> Self {
        let mut tree = Self {
            urls: Vec::new(),
            children: Vec::new(),
            index: HashMap::new(),
        };
        tree.intern(root);
        tree
    }

    pub fn root(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }

    fn intern(&mut self, url: &str) -> usize {
        if let Some(&i) = self.index.get(url) {
            return i;
        }
        let i = self.urls.len();
        self.urls.push(url.to_string());
        self.children.push(Vec::new());
        self.index.insert(url.to_string(), i);
        i
    }

    /// Record that `from` imports `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let f = self.intern(from);
        let t = self.intern(to);
        if !self.children[f].contains(&t) {
            self.children[f].push(t);
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.contains_key(url)
    }

    /// Direct imports of `url`.
    pub fn direct(&self, url: &str) -> Vec<&str> {
        self.index
            .get(url)
            .map(|&i| self.children[i].iter().map(|&c| self.urls[c].as_str()).collect())
            .unwrap_or_default()
    }

    /// Every transitive dependency of the root, each once, in depth-first
    /// discovery order. The root itself is excluded.
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.urls.is_empty() {
            return out;
        }
        let mut seen = HashSet::from([0usize]);
        let mut stack: Vec<usize> = self.children[0].iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            out.push(self.urls[node].clone());
            stack.extend(self.children[node].iter().rev().copied());
        }
        out
    }
}
