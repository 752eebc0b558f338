//! The resolution pass: parsed documents to model definitions.
//!
//! One pass walks the root document and, depth first, everything it
//! imports. Each definition either resolves, waits on a fact that has not
//! arrived (it is skipped and the fact becomes a need), or fails with
//! diagnostics. A source whose schema fetch failed is recorded as
//! unavailable; only its uses report the fetch error.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::debug;
use url::Url;

use crate::diagnostics::{Diagnostic, Span};
use crate::model::time::parse_timezone;
use crate::model::{
    pipeline_output, AtomicField, AtomicType, BinaryOp, DependencyTree, Expr, ExpressionType,
    FieldDef, FilterCondition, JoinInfo, JoinRelationship, ModelDef, NamedObject, NamedQuery, Query,
    SourceRef, StructDef, StructKind, TurtleDef,
};

use super::ast::{Document, SourceExpr, SourceProperty, Spanned, SqlPart, Statement};
use super::needs::{CompilerNeeds, SqlKey, TableKey};
use super::parse::ParseError;
use super::typecheck::{check, Scope};
use super::SqlBlockCompiler;

/// What is known about one URL.
#[derive(Debug, Clone)]
pub(crate) enum FileState {
    Parsed(Document),
    ReadFailed(String),
    Invalid(ParseError),
}

/// Why a definition stopped resolving.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Halt {
    /// Waits on a fact that has not arrived.
    Pending,
    /// Diagnostics already reported.
    Failed,
    /// A schema fetch failed.
    Unavailable(String),
}

impl Halt {
    /// Keep the more significant of two halts.
    fn merge(current: Option<Halt>, next: Halt) -> Option<Halt> {
        Some(match (current, next) {
            (Some(Halt::Pending), _) | (_, Halt::Pending) => Halt::Pending,
            (Some(Halt::Unavailable(m)), _) | (_, Halt::Unavailable(m)) => Halt::Unavailable(m),
            _ => Halt::Failed,
        })
    }
}

/// A name in scope.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    Object(NamedObject),
    Pending,
    Failed,
    Unavailable { origin: String, message: String },
}

/// Facts gathered so far.
#[derive(Clone, Copy)]
pub(crate) struct Facts<'a> {
    pub files: &'a HashMap<String, FileState>,
    pub tables: &'a HashMap<TableKey, Result<StructDef, String>>,
    pub sql: &'a HashMap<SqlKey, Result<StructDef, String>>,
    pub sql_compiler: Option<&'a dyn SqlBlockCompiler>,
    pub base: Option<&'a ModelDef>,
}

pub(crate) struct Resolution {
    pub model: ModelDef,
    pub diagnostics: Vec<Diagnostic>,
    pub needs: CompilerNeeds,
}

/// Resolve `relative` against the URL of the importing document.
pub(crate) fn resolve_url(base: &str, relative: &str) -> Result<String, String> {
    let base = Url::parse(base).map_err(|e| format!("invalid url '{}': {}", base, e))?;
    base.join(relative)
        .map(|u| u.to_string())
        .map_err(|e| format!("cannot resolve import '{}': {}", relative, e))
}

struct UnavailableSource {
    url: String,
    name: String,
    message: String,
    span: Option<Span>,
}

pub(crate) struct Resolver<'a> {
    pub(super) facts: Facts<'a>,
    root: String,
    /// Document being resolved.
    pub(super) url: String,
    pub(super) scope: IndexMap<String, Entry>,
    /// Names defined by the current document, in order.
    defined: Vec<String>,
    resolved: HashMap<String, IndexMap<String, Entry>>,
    exports: HashMap<String, Vec<String>>,
    stack: Vec<String>,
    unavailable: Vec<UnavailableSource>,
    used: HashSet<(String, String)>,
    diagnostics: Vec<Diagnostic>,
    pub(super) needs: CompilerNeeds,
    dependencies: DependencyTree,
    queries: Vec<Query>,
}

impl<'a> Resolver<'a> {
    pub fn new(root: &str, facts: Facts<'a>) -> Self {
        Self {
            facts,
            root: root.to_string(),
            url: root.to_string(),
            scope: IndexMap::new(),
            defined: Vec::new(),
            resolved: HashMap::new(),
            exports: HashMap::new(),
            stack: Vec::new(),
            unavailable: Vec::new(),
            used: HashSet::new(),
            diagnostics: Vec::new(),
            needs: CompilerNeeds::default(),
            dependencies: DependencyTree::new(root),
            queries: Vec::new(),
        }
    }

    pub fn run(mut self) -> Resolution {
        let root = self.root.clone();
        match self.facts.files.get(&root) {
            Some(FileState::Parsed(_)) => self.resolve_document(&root),
            Some(FileState::ReadFailed(message)) => {
                let message = format!("cannot read '{}': {}", root, message);
                self.diagnostics.push(Diagnostic::error(&root, None, message));
            }
            Some(FileState::Invalid(e)) => {
                self.diagnostics
                    .push(Diagnostic::error(&root, e.span.clone(), &e.message));
            }
            None => self.needs.add_url(&root),
        }

        for source in &self.unavailable {
            if !self.used.contains(&(source.url.clone(), source.name.clone())) {
                self.diagnostics.push(Diagnostic::warning(
                    &source.url,
                    source.span.clone(),
                    format!("source '{}' is unavailable: {}", source.name, source.message),
                ));
            }
        }

        let mut model = ModelDef::new(&root);
        if let Some(scope) = self.resolved.remove(&root) {
            for (name, entry) in scope {
                if let Entry::Object(object) = entry {
                    model.contents.insert(name, object);
                }
            }
        }
        model.exports = self
            .exports
            .remove(&root)
            .unwrap_or_default()
            .into_iter()
            .filter(|name| model.contents.contains_key(name))
            .collect();
        model.queries = self.queries;
        model.dependencies = self.dependencies;
        debug!(
            url = %root,
            definitions = model.contents.len(),
            needs = self.needs.len(),
            problems = self.diagnostics.len(),
            "resolution pass finished"
        );
        Resolution {
            model,
            diagnostics: self.diagnostics,
            needs: self.needs,
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub(super) fn error(&mut self, span: &Option<Span>, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::error(&self.url, span.clone(), message));
    }

    /// Report an error and return the halt that skips the definition.
    pub(super) fn fail(&mut self, span: &Option<Span>, message: impl Into<String>) -> Halt {
        self.error(span, message);
        Halt::Failed
    }

    // =========================================================================
    // Documents
    // =========================================================================

    fn resolve_document(&mut self, url: &str) {
        if self.resolved.contains_key(url) {
            return;
        }
        let files = self.facts.files;
        let Some(FileState::Parsed(doc)) = files.get(url) else {
            return;
        };
        let saved_url = std::mem::replace(&mut self.url, url.to_string());
        let saved_scope = std::mem::take(&mut self.scope);
        let saved_defined = std::mem::take(&mut self.defined);
        self.stack.push(url.to_string());

        if url == self.root {
            if let Some(base) = self.facts.base {
                for (name, object) in &base.contents {
                    self.scope.insert(name.clone(), Entry::Object(object.clone()));
                }
            }
        }
        for statement in &doc.statements {
            self.statement(statement);
        }

        self.stack.pop();
        let scope = std::mem::replace(&mut self.scope, saved_scope);
        let defined = std::mem::replace(&mut self.defined, saved_defined);
        self.resolved.insert(url.to_string(), scope);
        self.exports.insert(url.to_string(), defined);
        self.url = saved_url;
    }

    fn statement(&mut self, statement: &Spanned<Statement>) {
        let span = &statement.span;
        match &statement.node {
            Statement::Import { url } => self.import(url, span),
            Statement::Source { name, source } => {
                if !self.claim(name, span) {
                    return;
                }
                let entry = match self.resolve_source(source, span) {
                    Ok(mut def) => {
                        def.name = name.clone();
                        Entry::Object(NamedObject::Source(def))
                    }
                    Err(halt) => self.halted(name, halt, span),
                };
                self.scope.insert(name.clone(), entry);
            }
            Statement::Query {
                name,
                query,
                persist,
            } => {
                if !self.claim(name, span) {
                    return;
                }
                let entry = match self.translate_query(query, span) {
                    Ok(mut q) => {
                        q.name = Some(name.clone());
                        Entry::Object(NamedObject::Query(NamedQuery {
                            name: name.clone(),
                            query: q,
                            persist: persist.clone(),
                        }))
                    }
                    Err(halt) => self.halted(name, halt, span),
                };
                self.scope.insert(name.clone(), entry);
            }
            Statement::Run { query } => {
                if self.url != self.root {
                    return;
                }
                match self.translate_query(query, span) {
                    Ok(q) => self.queries.push(q),
                    Err(Halt::Unavailable(message)) => self.error(span, message),
                    Err(_) => {}
                }
            }
        }
    }

    fn import(&mut self, relative: &str, span: &Option<Span>) {
        let target = match resolve_url(&self.url, relative) {
            Ok(target) => target,
            Err(message) => return self.error(span, message),
        };
        if let Some(pos) = self.stack.iter().position(|u| *u == target) {
            let mut cycle: Vec<&str> = self.stack[pos..].iter().map(String::as_str).collect();
            cycle.push(&target);
            let message = format!("import cycle: {}", cycle.join(" -> "));
            return self.error(span, message);
        }
        self.dependencies.add_edge(&self.url, &target);
        match self.facts.files.get(&target) {
            None => self.needs.add_url(&target),
            Some(FileState::ReadFailed(message)) => {
                let message = format!("cannot read '{}': {}", target, message);
                self.error(span, message);
            }
            Some(FileState::Invalid(e)) => {
                self.diagnostics
                    .push(Diagnostic::error(&target, e.span.clone(), &e.message));
            }
            Some(FileState::Parsed(_)) => {
                self.resolve_document(&target);
                let imported = self.resolved.get(&target).cloned().unwrap_or_default();
                for (name, entry) in imported {
                    if !self.defined.contains(&name) {
                        self.scope.insert(name, entry);
                    }
                }
            }
        }
    }

    /// Reserve a name for a definition of the current document.
    fn claim(&mut self, name: &str, span: &Option<Span>) -> bool {
        if self.defined.iter().any(|n| n == name) {
            self.error(span, format!("'{}' is already defined", name));
            return false;
        }
        self.defined.push(name.to_string());
        true
    }

    fn halted(&mut self, name: &str, halt: Halt, span: &Option<Span>) -> Entry {
        match halt {
            Halt::Pending => Entry::Pending,
            Halt::Failed => Entry::Failed,
            Halt::Unavailable(message) => {
                self.unavailable.push(UnavailableSource {
                    url: self.url.clone(),
                    name: name.to_string(),
                    message: message.clone(),
                    span: span.clone(),
                });
                Entry::Unavailable {
                    origin: self.url.clone(),
                    message,
                }
            }
        }
    }

    pub(super) fn lookup(&mut self, name: &str, span: &Option<Span>) -> Result<NamedObject, Halt> {
        match self.scope.get(name).cloned() {
            Some(Entry::Object(object)) => Ok(object),
            Some(Entry::Pending) => Err(Halt::Pending),
            Some(Entry::Failed) => Err(Halt::Failed),
            Some(Entry::Unavailable { origin, message }) => {
                self.used.insert((origin, name.to_string()));
                Err(self.fail(span, format!("source '{}' is unavailable: {}", name, message)))
            }
            None => Err(self.fail(span, format!("'{}' is not defined", name))),
        }
    }

    /// The model as resolved so far, for compiling embedded queries.
    fn partial_model(&self) -> ModelDef {
        let mut model = ModelDef::new(&self.root);
        for (name, entry) in &self.scope {
            if let Entry::Object(object) = entry {
                model.contents.insert(name.clone(), object.clone());
            }
        }
        model
    }

    // =========================================================================
    // Sources
    // =========================================================================

    pub(super) fn resolve_source(
        &mut self,
        expr: &SourceExpr,
        span: &Option<Span>,
    ) -> Result<StructDef, Halt> {
        match expr {
            SourceExpr::Table { connection, path } => {
                let key = TableKey::new(connection, path);
                match self.facts.tables.get(&key) {
                    None => {
                        self.needs.add_table(key);
                        Err(Halt::Pending)
                    }
                    Some(Err(message)) => Err(Halt::Unavailable(format!(
                        "cannot fetch schema for '{}': {}",
                        path, message
                    ))),
                    Some(Ok(schema)) => {
                        let mut def = schema.clone();
                        def.name = path.clone();
                        def.kind = StructKind::Table {
                            table_path: path.clone(),
                        };
                        def.connection = connection.clone();
                        Ok(def)
                    }
                }
            }
            SourceExpr::Sql { connection, parts } => {
                let text = self.materialize(parts, span)?;
                let key = SqlKey::new(connection, &text);
                match self.facts.sql.get(&key) {
                    None => {
                        self.needs.add_sql(key);
                        Err(Halt::Pending)
                    }
                    Some(Err(message)) => Err(Halt::Unavailable(format!(
                        "cannot fetch schema for SQL block: {}",
                        message
                    ))),
                    Some(Ok(schema)) => {
                        let mut def = schema.clone();
                        def.name = "sql".to_string();
                        def.kind = StructKind::SqlSelect { select_sql: text };
                        def.connection = connection.clone();
                        Ok(def)
                    }
                }
            }
            SourceExpr::Named { name } => match self.lookup(name, span)? {
                NamedObject::Source(def) => Ok(def),
                NamedObject::Query(named) => self.query_source(named.query, Some(name.clone()), span),
            },
            SourceExpr::Query { query } => {
                let query = self.translate_query(query, span)?;
                self.query_source(query, None, span)
            }
            SourceExpr::Composite { sources } => {
                let mut members = Vec::with_capacity(sources.len());
                let mut halt = None;
                for source in sources {
                    match self.resolve_source(source, span) {
                        Ok(def) => members.push(def),
                        Err(h) => halt = Halt::merge(halt, h),
                    }
                }
                if let Some(h) = halt {
                    return Err(h);
                }
                let Some(first) = members.first() else {
                    return Err(self.fail(span, "a composite source needs at least one source"));
                };
                let mut def = StructDef::with_kind(
                    "composite",
                    StructKind::Composite { sources: Vec::new() },
                    first.dialect.clone(),
                    first.connection.clone(),
                );
                for member in &members {
                    for field in &member.fields {
                        if !def.has_field(field.name()) {
                            def.fields.push(field.clone());
                        }
                    }
                }
                def.kind = StructKind::Composite { sources: members };
                Ok(def)
            }
            SourceExpr::Extend { base, properties } => {
                let mut def = self.resolve_source(base, span)?;
                let mut halt = None;
                for property in properties {
                    if let Err(h) = self.apply_property(&mut def, property) {
                        halt = Halt::merge(halt, h);
                    }
                }
                match halt {
                    Some(h) => Err(h),
                    None => Ok(def),
                }
            }
        }
    }

    /// Text of a SQL block with embedded queries compiled in place.
    fn materialize(&mut self, parts: &[SqlPart], span: &Option<Span>) -> Result<String, Halt> {
        let mut text = String::new();
        for part in parts {
            match part {
                SqlPart::Text { text: t } => text.push_str(t),
                SqlPart::Query { query } => {
                    let query = self.translate_query(query, span)?;
                    let Some(compiler) = self.facts.sql_compiler else {
                        return Err(self.fail(span, "SQL blocks with embedded queries need a query compiler"));
                    };
                    let partial = self.partial_model();
                    let sql = compiler
                        .compile_query_sql(&partial, &query)
                        .map_err(|message| self.fail(span, message))?;
                    text.push('(');
                    text.push_str(&sql);
                    text.push(')');
                }
            }
        }
        Ok(text)
    }

    /// The struct a query reads from.
    pub(super) fn query_input(&mut self, query: &Query, span: &Option<Span>) -> Result<StructDef, Halt> {
        match &query.source {
            SourceRef::Inline(def) => Ok((**def).clone()),
            SourceRef::Named(name) => match self.lookup(name, span)? {
                NamedObject::Source(def) => Ok(def),
                NamedObject::Query(named) => self.query_source(named.query, Some(name.clone()), span),
            },
        }
    }

    /// A query wrapped as a source whose fields are the query's output.
    fn query_source(
        &mut self,
        query: Query,
        name: Option<String>,
        span: &Option<Span>,
    ) -> Result<StructDef, Halt> {
        let input = self.query_input(&query, span)?;
        let output = pipeline_output(&input, &query.pipeline).map_err(|e| self.fail(span, e.to_string()))?;
        let mut def = StructDef::with_kind(
            name.clone().unwrap_or_else(|| "query".to_string()),
            StructKind::QuerySource {
                query: Box::new(query),
                query_name: name,
            },
            input.dialect,
            input.connection,
        );
        def.fields = output.fields;
        Ok(def)
    }

    // =========================================================================
    // Source properties
    // =========================================================================

    fn check_unique(&mut self, def: &StructDef, name: &str, span: &Option<Span>) -> Result<(), Halt> {
        if def.has_field(name) {
            return Err(self.fail(span, format!("'{}' is already defined in '{}'", name, def.name)));
        }
        Ok(())
    }

    pub(super) fn apply_property(
        &mut self,
        def: &mut StructDef,
        property: &Spanned<SourceProperty>,
    ) -> Result<(), Halt> {
        let span = &property.span;
        match &property.node {
            SourceProperty::Dimension { name, expr } => {
                self.check_unique(def, name, span)?;
                let t = check(expr, &Scope::source(def)).map_err(|m| self.fail(span, m))?;
                if t.etype.is_analytic() {
                    return Err(self.fail(span, "analytic functions are only allowed in calculate"));
                }
                if t.etype.is_aggregate() {
                    return Err(self.fail(
                        span,
                        format!("dimension '{}' is an aggregate; declare it as a measure", name),
                    ));
                }
                let mut field = AtomicField::computed(name, t.ty, t.expr, ExpressionType::Scalar);
                field.timeframe = t.timeframe;
                def.fields.push(FieldDef::Atomic(field));
            }
            SourceProperty::Measure { name, expr } => {
                self.check_unique(def, name, span)?;
                let t = check(expr, &Scope::source(def)).map_err(|m| self.fail(span, m))?;
                if t.etype.is_analytic() {
                    return Err(self.fail(span, "analytic functions are only allowed in calculate"));
                }
                if !t.etype.is_aggregate() {
                    return Err(self.fail(
                        span,
                        format!("measure '{}' is not an aggregate; declare it as a dimension", name),
                    ));
                }
                def.fields
                    .push(FieldDef::Atomic(AtomicField::computed(name, t.ty, t.expr, t.etype)));
            }
            SourceProperty::Join {
                name,
                source,
                relationship,
                join_type,
                on,
                with,
            } => {
                self.check_unique(def, name, span)?;
                let mut joined = self.resolve_source(source, span)?;
                if !def.connection.is_empty() && joined.connection != def.connection {
                    return Err(self.fail(
                        span,
                        format!(
                            "join '{}' reads connection '{}' but '{}' reads '{}'",
                            name, joined.connection, def.name, def.connection
                        ),
                    ));
                }
                joined.name = name.clone();
                joined.parent = Some(def.name.clone());
                joined.join = Some(JoinInfo {
                    relationship: *relationship,
                    join_type: *join_type,
                    on: None,
                });
                let condition = match (on, with) {
                    (Some(_), Some(_)) => {
                        return Err(self.fail(span, format!("join '{}' has both on: and with:", name)));
                    }
                    (None, Some(key)) => {
                        let Some(pk) = joined.primary_key.clone() else {
                            return Err(self.fail(
                                span,
                                format!("join '{}' uses with: but has no primary key", name),
                            ));
                        };
                        let t = check(key, &Scope::source(def)).map_err(|m| self.fail(span, m))?;
                        if !t.etype.is_scalar() {
                            return Err(self.fail(span, "a join key must be a scalar expression"));
                        }
                        Some(Expr::binary(
                            BinaryOp::Eq,
                            t.expr,
                            Expr::Field {
                                path: vec![name.clone(), pk],
                            },
                        ))
                    }
                    (Some(condition), None) => {
                        let mut with_join = def.clone();
                        with_join.fields.push(FieldDef::Struct(joined.clone()));
                        let t = check(condition, &Scope::source(&with_join))
                            .map_err(|m| self.fail(span, m))?;
                        if t.ty != AtomicType::Boolean || !t.etype.is_scalar() {
                            return Err(self.fail(span, "a join condition must be a scalar boolean"));
                        }
                        Some(t.expr)
                    }
                    (None, None) if *relationship == JoinRelationship::Cross => None,
                    (None, None) => {
                        return Err(self.fail(span, format!("join '{}' needs on: or with:", name)));
                    }
                };
                if let Some(info) = joined.join.as_mut() {
                    info.on = condition;
                }
                def.fields.push(FieldDef::Struct(joined));
            }
            SourceProperty::Where { filter } => {
                let t = check(filter, &Scope::source(def)).map_err(|m| self.fail(span, m))?;
                if t.ty != AtomicType::Boolean {
                    return Err(self.fail(span, format!("where: needs a boolean, got {}", t.ty)));
                }
                if !t.etype.is_scalar() {
                    return Err(self.fail(span, "aggregates are not allowed in a source where:"));
                }
                def.filters
                    .push(FilterCondition::scalar(t.expr, filter.to_string()));
            }
            SourceProperty::PrimaryKey { name } => match def.field(name) {
                Some(FieldDef::Atomic(_)) => def.primary_key = Some(name.clone()),
                _ => {
                    return Err(self.fail(
                        span,
                        format!("primary key '{}' is not a field of '{}'", name, def.name),
                    ));
                }
            },
            SourceProperty::View { name, pipeline } => {
                self.check_unique(def, name, span)?;
                let pipeline = self.translate_pipeline(def, pipeline, span)?;
                def.fields.push(FieldDef::Turtle(TurtleDef {
                    name: name.clone(),
                    pipeline,
                }));
            }
            SourceProperty::Timezone { name } => {
                parse_timezone(name).map_err(|e| self.fail(span, e.to_string()))?;
                def.timezone = Some(name.clone());
            }
        }
        Ok(())
    }
}
