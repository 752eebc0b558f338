//! The joins a segment touches.
//!
//! Every field reference adds its join path: through field definitions, join
//! `on` expressions, source filters and aggregate localities. The tree then
//! answers the fan-out questions symmetric aggregation depends on and fixes
//! the order joins are rendered in.

use std::collections::{HashMap, HashSet};

use crate::model::{Expr, FieldDef, JoinRelationship, StructDef, StructKind};
use crate::sql::dialect::{ParentKind, SqlDialect};

use super::error::{CompileError, CompileResult};

/// Alias of the segment's input rows.
pub const ROOT_ALIAS: &str = "base";

/// Column added by wrapping a table that has no primary key.
pub const DISTINCT_KEY: &str = "__distinct_key";

#[derive(Debug)]
pub struct JoinNode<'m> {
    pub path: Vec<String>,
    pub def: &'m StructDef,
    pub alias: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Other joins this join's `on` expression reads.
    pub depends_on: Vec<usize>,
}

impl JoinNode<'_> {
    pub fn relationship(&self) -> Option<JoinRelationship> {
        self.def.join.as_ref().map(|j| j.relationship)
    }

    /// Joining this node can repeat rows of its parent.
    pub fn fans_out(&self) -> bool {
        self.def.is_array() || self.relationship().is_some_and(|r| r.fans_out())
    }

    /// How fields of this node are stored.
    pub fn parent_kind(&self) -> ParentKind {
        match self.def.kind {
            StructKind::Record => ParentKind::Record,
            StructKind::Array { scalar: true } => ParentKind::ArrayScalar,
            StructKind::Array { scalar: false } => ParentKind::ArrayRecord,
            _ => ParentKind::Table,
        }
    }

    /// Accessed in place rather than joined.
    pub fn is_record(&self) -> bool {
        self.def.is_record()
    }
}

#[derive(Debug)]
pub struct JoinTree<'m> {
    nodes: Vec<JoinNode<'m>>,
    by_path: HashMap<Vec<String>, usize>,
    aliases: HashSet<String>,
    expanded: HashSet<Vec<String>>,
}

impl<'m> JoinTree<'m> {
    pub fn new(root: &'m StructDef) -> Self {
        let mut aliases = HashSet::new();
        aliases.insert(ROOT_ALIAS.to_string());
        let mut by_path = HashMap::new();
        by_path.insert(Vec::new(), 0);
        Self {
            nodes: vec![JoinNode {
                path: Vec::new(),
                def: root,
                alias: ROOT_ALIAS.to_string(),
                parent: None,
                children: Vec::new(),
                depends_on: Vec::new(),
            }],
            by_path,
            aliases,
            expanded: HashSet::new(),
        }
    }

    pub fn root(&self) -> &JoinNode<'m> {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> &JoinNode<'m> {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, path: &[String]) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    /// Add the join at `path` and every join above it.
    pub fn add_join_path(&mut self, path: &[String]) -> CompileResult<usize> {
        if let Some(index) = self.find(path) {
            return Ok(index);
        }
        let Some((name, parent_path)) = path.split_last() else {
            return Ok(0);
        };
        let parent = self.add_join_path(parent_path)?;
        let def = match self.nodes[parent].def.field(name) {
            Some(FieldDef::Struct(s)) => s,
            Some(other) => {
                return Err(CompileError::invalid(format!(
                    "'{}' is a {}, not a join",
                    path.join("."),
                    other.kind_name()
                )))
            }
            None => return Err(CompileError::UnknownField(path.join("."))),
        };

        let index = self.nodes.len();
        let alias = self.unique_alias(name);
        self.nodes.push(JoinNode {
            path: path.to_vec(),
            def,
            alias,
            parent: Some(parent),
            children: Vec::new(),
            depends_on: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        self.by_path.insert(path.to_vec(), index);

        if let Some(on) = def.join.as_ref().and_then(|j| j.on.as_ref()) {
            self.require_expr(on, parent_path)?;
            let mut deps = Vec::new();
            for field in on.field_paths() {
                let full: Vec<String> = parent_path.iter().chain(field).cloned().collect();
                if let Some((_, joins)) = full.split_last() {
                    if let Some(dep) = self.find(joins) {
                        if dep != index && !self.ancestors(index).contains(&dep) {
                            deps.push(dep);
                        }
                    }
                }
            }
            deps.sort_unstable();
            deps.dedup();
            self.nodes[index].depends_on = deps;
        }
        for filter in &def.filters {
            self.require_expr(&filter.expr, path)?;
        }
        Ok(index)
    }

    /// Register every join `expr` touches. Paths are relative to `prefix`.
    pub fn require_expr(&mut self, expr: &Expr, prefix: &[String]) -> CompileResult<()> {
        let mut fields = Vec::new();
        let mut localities = Vec::new();
        expr.walk(&mut |e| match e {
            Expr::Field { path } => fields.push(join(prefix, path)),
            Expr::Aggregate { locality, .. } if !locality.is_empty() => {
                localities.push(join(prefix, locality))
            }
            _ => {}
        });
        for path in localities {
            self.add_join_path(&path)?;
        }
        for path in fields {
            self.require_field(&path)?;
        }
        Ok(())
    }

    /// Register the joins above a field and, for computed fields, everything
    /// the definition reads.
    pub fn require_field(&mut self, full: &[String]) -> CompileResult<()> {
        let Some((_, joins)) = full.split_last() else {
            return Err(CompileError::UnknownField(String::new()));
        };
        self.add_join_path(joins)?;
        let (node, field) = self.resolve_field(full)?;
        if let FieldDef::Atomic(atomic) = field {
            if let Some(expr) = &atomic.expr {
                if self.expanded.insert(full.to_vec()) {
                    let owner = self.nodes[node].path.clone();
                    self.require_expr(expr, &owner)?;
                }
            }
        }
        Ok(())
    }

    /// Find the node that owns the last component of `full`, and the field.
    pub fn resolve_field(&self, full: &[String]) -> CompileResult<(usize, &'m FieldDef)> {
        let Some((name, joins)) = full.split_last() else {
            return Err(CompileError::UnknownField(String::new()));
        };
        let node = self
            .find(joins)
            .ok_or_else(|| CompileError::UnknownField(full.join(".")))?;
        let def: &'m StructDef = self.nodes[node].def;
        let field = def
            .field(name)
            .ok_or_else(|| CompileError::UnknownField(full.join(".")))?;
        Ok((node, field))
    }

    /// `index` and every node above it, nearest first.
    pub fn ancestors(&self, index: usize) -> Vec<usize> {
        let mut out = vec![index];
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            out.push(parent);
            current = parent;
        }
        out
    }

    /// Whether aggregating rows of `index` needs a distinct key.
    ///
    /// True when a used join outside the node's ancestry repeats rows, or when
    /// a one/cross join lies on the path to the node.
    pub fn needs_distinct_key(&self, index: usize) -> bool {
        let ancestry: HashSet<usize> = self.ancestors(index).into_iter().collect();
        let outside_fanout = self
            .nodes
            .iter()
            .enumerate()
            .any(|(i, n)| !ancestry.contains(&i) && n.fans_out());
        if outside_fanout {
            return true;
        }
        ancestry.iter().any(|&i| {
            matches!(
                self.nodes[i].relationship(),
                Some(JoinRelationship::One | JoinRelationship::Cross)
            )
        })
    }

    /// Join nodes in render order: parents first, and after the joins their
    /// `on` expressions read.
    pub fn render_order(&self) -> Vec<usize> {
        let mut preorder = Vec::new();
        let mut stack = vec![0];
        while let Some(i) = stack.pop() {
            if i != 0 {
                preorder.push(i);
            }
            for &child in self.nodes[i].children.iter().rev() {
                stack.push(child);
            }
        }

        let mut placed: HashSet<usize> = HashSet::from([0]);
        let mut out = Vec::with_capacity(preorder.len());
        let mut pending = preorder;
        while !pending.is_empty() {
            let (ready, blocked): (Vec<usize>, Vec<usize>) = pending.iter().partition(|&&i| {
                let node = &self.nodes[i];
                node.parent.map_or(true, |p| placed.contains(&p))
                    && node.depends_on.iter().all(|d| placed.contains(d))
            });
            if ready.is_empty() {
                // Mutually dependent joins: keep declaration order.
                out.extend(blocked);
                break;
            }
            for &i in &ready {
                placed.insert(i);
            }
            out.extend(ready);
            pending = blocked;
        }
        out
    }

    /// SQL that names a row of node `index`.
    pub fn row_ref(&self, index: usize, dialect: &dyn SqlDialect) -> String {
        let node = &self.nodes[index];
        match (node.is_record(), node.parent) {
            (true, Some(parent)) => {
                let parent_node = &self.nodes[parent];
                dialect.sql_field_reference(
                    &self.row_ref(parent, dialect),
                    parent_node.parent_kind(),
                    &node.def.name,
                    crate::model::AtomicType::Json,
                )
            }
            _ => dialect.quote_identifier(&node.alias),
        }
    }

    fn unique_alias(&mut self, name: &str) -> String {
        let mut alias = name.to_string();
        let mut n = 2;
        while self.aliases.contains(&alias) {
            alias = format!("{}_{}", name, n);
            n += 1;
        }
        self.aliases.insert(alias.clone());
        alias
    }
}

fn join(prefix: &[String], path: &[String]) -> Vec<String> {
    prefix.iter().chain(path).cloned().collect()
}
