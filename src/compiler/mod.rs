//! Query compiler.
//!
//! Lowers a [`Query`] against a finished (or partial) [`ModelDef`] to SQL
//! for one dialect. Each pipeline segment becomes a chain of statements
//! registered as CTEs (`__stage0`, `__stage1`, ...); the last one is the
//! main statement.
//!
//! # Example
//!
//! ```ignore
//! let compiler = QueryCompiler::new(&model);
//! let compiled = compiler.compile(&query)?;
//! println!("{}", compiled.sql);
//! ```
//!
//! The compiler holds no state across calls and only reads the model, so
//! one model can be compiled from many threads at once.

pub mod drill;
pub mod error;
pub mod expr_gen;
pub mod index;
pub mod join_tree;
pub mod segment;
pub mod stage;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{
    pipeline_output, segment_output, AtomicType, FieldDef, FilterCondition, ModelDef, PersistSpec,
    PipeSegment, Query, Sampling, ShapeError, SourceRef, StructDef, StructKind,
};
use crate::sql::dialect::{get_dialect, DialectError, SqlDialect};
use crate::sql::{Expr as SqlExpr, Join, JoinType, TableRef};
use crate::translator::SqlBlockCompiler;

pub use drill::{drill_filters, DrillDimension};
pub use error::{CompileError, CompileResult};
pub use expr_gen::ExprCompiler;
pub use join_tree::{JoinTree, DISTINCT_KEY, ROOT_ALIAS};
pub use stage::StageWriter;

/// Per-call compile settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Dialect to emit instead of the source's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
    /// Limit applied to the outermost stage when the query sets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_row_limit: Option<u64>,
}

/// SQL plus everything a caller needs to run it and read the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    /// Output shape of each pipeline segment, in order.
    pub structs: Vec<StructDef>,
    pub source_name: String,
    /// Source-level filters the result was computed under.
    #[serde(default)]
    pub source_filters: Vec<FilterCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    pub last_stage_name: String,
    pub connection_name: String,
    pub dialect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist: Option<PersistSpec>,
    /// Grouping dimensions of a single-reduce query, for drilling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drill: Vec<DrillDimension>,
}

impl CompiledQuery {
    /// Shape of the final result.
    pub fn result_struct(&self) -> Option<&StructDef> {
        self.structs.last()
    }
}

/// Compiles queries against one model.
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler<'m> {
    model: &'m ModelDef,
}

impl<'m> QueryCompiler<'m> {
    pub fn new(model: &'m ModelDef) -> Self {
        Self { model }
    }

    pub fn compile(&self, query: &Query) -> CompileResult<CompiledQuery> {
        self.compile_with(query, &CompileOptions::default())
    }

    pub fn compile_with(&self, query: &Query, options: &CompileOptions) -> CompileResult<CompiledQuery> {
        let source = resolve_source(self.model, &query.source)?;
        let dialect_name = options.dialect.as_deref().unwrap_or(&source.dialect);
        let dialect = get_dialect(dialect_name)
            .ok_or_else(|| CompileError::UnknownDialect(dialect_name.to_string()))?;
        debug!(source = %source.name, dialect = dialect.name(), "compiling query");

        let mut run = Compilation {
            model: self.model,
            dialect,
            default_row_limit: options.default_row_limit,
            stages: StageWriter::new(dialect),
            depth: 0,
        };
        let output = run.compile_query(query)?;
        let sql = run.stages.into_sql();

        let mut source_filters = source.filters.clone();
        source_filters.extend(query.filters.iter().cloned());

        Ok(CompiledQuery {
            sql,
            structs: output.structs,
            source_name: source.name.clone(),
            source_filters,
            query_name: query.name.clone(),
            last_stage_name: output.stage,
            connection_name: source.connection.clone(),
            dialect: dialect.name().to_string(),
            persist: None,
            drill: output.drill,
        })
    }

    /// Compile a named query from the model, carrying its persist annotation.
    pub fn compile_named(&self, name: &str, options: &CompileOptions) -> CompileResult<CompiledQuery> {
        let named = self
            .model
            .named_query(name)
            .ok_or_else(|| CompileError::UnknownQuery(name.to_string()))?;
        let mut compiled = self.compile_with(&named.query, options)?;
        compiled.query_name = Some(name.to_string());
        compiled.persist = named.persist.clone();
        Ok(compiled)
    }
}

/// Look up a query's source and return an owned copy.
pub fn resolve_source(model: &ModelDef, source: &SourceRef) -> CompileResult<StructDef> {
    match source {
        SourceRef::Named(name) => {
            if let Some(s) = model.source(name) {
                return Ok(s.clone());
            }
            // A named query used as a source.
            let named = model
                .named_query(name)
                .ok_or_else(|| CompileError::UnknownSource(name.to_string()))?;
            let input = resolve_source(model, &named.query.source)?;
            let mut out = StructDef::with_kind(
                name,
                StructKind::QuerySource {
                    query: Box::new(named.query.clone()),
                    query_name: Some(name.to_string()),
                },
                input.dialect.clone(),
                input.connection.clone(),
            );
            out.fields = pipeline_output(&input, &named.query.pipeline)?.fields;
            Ok(out)
        }
        SourceRef::Inline(def) => Ok((**def).clone()),
    }
}

/// Embedded-query compilation for SQL blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlBlocks;

impl SqlBlockCompiler for SqlBlocks {
    fn compile_query_sql(&self, partial: &ModelDef, query: &Query) -> Result<String, String> {
        QueryCompiler::new(partial)
            .compile(query)
            .map(|compiled| compiled.sql)
            .map_err(|e| e.to_string())
    }
}

// =============================================================================
// One compile call
// =============================================================================

/// Result of compiling a query into the shared stage chain.
#[derive(Debug)]
pub(crate) struct QueryOutput {
    pub stage: String,
    pub structs: Vec<StructDef>,
    pub drill: Vec<DrillDimension>,
}

/// Output of one compiled segment.
#[derive(Debug, Default)]
pub(crate) struct SegmentOutput {
    pub stage: String,
    pub drill: Vec<DrillDimension>,
}

/// State of a single compile: the dialect and the CTE chain.
pub(crate) struct Compilation<'m> {
    pub model: &'m ModelDef,
    pub dialect: &'static dyn SqlDialect,
    pub default_row_limit: Option<u64>,
    pub stages: StageWriter,
    depth: usize,
}

impl Compilation<'_> {
    fn compile_query(&mut self, query: &Query) -> CompileResult<QueryOutput> {
        if query.pipeline.is_empty() {
            return Err(CompileError::EmptyPipeline);
        }
        let mut source = resolve_source(self.model, &query.source)?;
        source.filters.extend(query.filters.iter().cloned());

        self.depth += 1;
        let out = match &source.kind {
            StructKind::Composite { sources } => self.compile_composite(&source, sources, &query.pipeline),
            _ => self.compile_pipeline(&source, &query.pipeline),
        };
        self.depth -= 1;
        out
    }

    /// Try each member in order; the first whose fields cover the query wins.
    fn compile_composite(
        &mut self,
        composite: &StructDef,
        members: &[StructDef],
        pipeline: &[PipeSegment],
    ) -> CompileResult<QueryOutput> {
        for member in members {
            let mut candidate = member.clone();
            for field in &composite.fields {
                if !candidate.has_field(field.name()) {
                    candidate.fields.push(field.clone());
                }
            }
            candidate.filters.extend(composite.filters.iter().cloned());
            if candidate.timezone.is_none() {
                candidate.timezone = composite.timezone.clone();
            }
            let checkpoint = self.stages.len();
            match self.compile_pipeline(&candidate, pipeline) {
                Err(CompileError::UnknownField(field))
                | Err(CompileError::Shape(ShapeError::UnknownField(field))) => {
                    debug!(member = %member.name, %field, "composite member does not cover query");
                    self.stages.truncate(checkpoint);
                }
                other => return other,
            }
        }
        Err(CompileError::NoCoveringSource(composite.name.clone()))
    }

    fn compile_pipeline(&mut self, source: &StructDef, pipeline: &[PipeSegment]) -> CompileResult<QueryOutput> {
        let mut input = source.clone();
        let mut stage: Option<String> = None;
        let mut structs = Vec::with_capacity(pipeline.len());
        let mut drill = Vec::new();

        for (i, segment) in pipeline.iter().enumerate() {
            let output_shape = segment_output(&input, segment)?;
            let outermost_last = self.depth == 1 && i + 1 == pipeline.len();
            let row_limit = if outermost_last { self.default_row_limit } else { None };
            let compiled = match segment {
                PipeSegment::Reduce(q) => {
                    segment::compile_reduce(self, &input, stage.as_deref(), q, row_limit)?
                }
                PipeSegment::Project(q) => {
                    segment::compile_project(self, &input, stage.as_deref(), q, row_limit)?
                }
                PipeSegment::Index(ix) => index::compile_index(self, &input, stage.as_deref(), ix)?,
            };
            if i == 0 && pipeline.len() == 1 {
                drill = compiled.drill;
            }
            structs.push(output_shape.clone());
            input = output_shape;
            stage = Some(compiled.stage);
        }

        Ok(QueryOutput {
            stage: stage.unwrap_or_default(),
            structs,
            drill,
        })
    }

    // =========================================================================
    // Table expressions and joins
    // =========================================================================

    /// FROM item for the segment input: the previous stage, or the source.
    pub(crate) fn render_root(
        &mut self,
        tree: &JoinTree<'_>,
        stage: Option<&str>,
        sample: Option<&Sampling>,
        keys: &BTreeSet<usize>,
    ) -> CompileResult<TableRef> {
        let keyed = keys.contains(&0);
        let table_sql = match stage {
            Some(name) => self.dialect.quote_identifier(name),
            None => self.table_sql(tree.root().def, sample)?,
        };
        Ok(self.keyed_table(table_sql, keyed, ROOT_ALIAS))
    }

    /// Join clauses for every used join, in render order.
    pub(crate) fn render_joins(
        &mut self,
        tree: &JoinTree<'_>,
        exprs: &mut ExprCompiler<'_, '_>,
    ) -> CompileResult<Vec<Join>> {
        let keys = exprs.keys_needed().clone();
        let mut joins = Vec::new();
        for index in tree.render_order() {
            let node = tree.node(index);
            if node.is_record() {
                continue;
            }
            let parent = node.parent.unwrap_or(0);
            let parent_node = tree.node(parent);

            if node.def.is_array() {
                let source = self.dialect.sql_field_reference(
                    &tree.row_ref(parent, self.dialect),
                    parent_node.parent_kind(),
                    &node.def.name,
                    AtomicType::Json,
                );
                let fields: Vec<(String, AtomicType)> = node
                    .def
                    .fields
                    .iter()
                    .filter_map(FieldDef::as_atomic)
                    .map(|a| (a.name.clone(), a.ty))
                    .collect();
                joins.push(Join::Raw(self.dialect.sql_unnest(
                    &source,
                    &node.alias,
                    &fields,
                    node.def.is_scalar_array(),
                )));
                continue;
            }

            let table_sql = self.table_sql(node.def, None)?;
            let table = self.keyed_table(table_sql, keys.contains(&index), &node.alias);

            let mut conditions = Vec::new();
            let join = node.def.join.as_ref();
            if let Some(on) = join.and_then(|j| j.on.as_ref()) {
                conditions.push(exprs.compile_scalar(on, &parent_node.path)?);
            }
            for filter in &node.def.filters {
                conditions.push(exprs.compile_scalar(&filter.expr, &node.path)?);
            }

            let relationship = join.map(|j| j.relationship);
            let kind = join.map(|j| j.join_type).unwrap_or_default();
            let join_type = match (relationship, kind, conditions.is_empty()) {
                (Some(crate::model::JoinRelationship::Cross), _, true) => JoinType::Cross,
                (_, crate::model::JoinKind::Left, _) => JoinType::Left,
                (_, crate::model::JoinKind::Inner, _) => JoinType::Inner,
                (_, crate::model::JoinKind::Right, _) => JoinType::Right,
                (_, crate::model::JoinKind::Full, _) => {
                    if !self.dialect.supports_full_join() {
                        return Err(DialectError::Unsupported {
                            dialect: self.dialect.name(),
                            feature: "full joins",
                        }
                        .into());
                    }
                    JoinType::Full
                }
            };
            let on = match join_type {
                JoinType::Cross => None,
                _ if conditions.is_empty() => Some(SqlExpr::Raw(self.dialect.format_bool(true).to_string())),
                _ => Some(SqlExpr::Raw(conditions.join(" AND "))),
            };
            joins.push(Join::Standard {
                join_type,
                table,
                on,
            });
        }
        Ok(joins)
    }

    fn table_sql(&mut self, def: &StructDef, sample: Option<&Sampling>) -> CompileResult<String> {
        match &def.kind {
            StructKind::Table { table_path } => {
                let table = self.dialect.quote_table_path(table_path);
                Ok(match sample {
                    Some(s) => self.dialect.sql_sample_table(&table, s),
                    None => table,
                })
            }
            StructKind::SqlSelect { select_sql } => Ok(format!("({})", select_sql)),
            StructKind::QuerySource { query, .. } => {
                let inner = self.compile_query(query)?;
                Ok(self.dialect.quote_identifier(&inner.stage))
            }
            StructKind::Composite { .. } => Err(CompileError::invalid(format!(
                "composite source '{}' cannot be joined",
                def.name
            ))),
            StructKind::Record | StructKind::Array { .. } | StructKind::Result => Err(
                CompileError::invalid(format!("'{}' is not a table expression", def.name)),
            ),
        }
    }

    /// Wrap a table with a generated distinct key column when needed.
    fn keyed_table(&self, table_sql: String, keyed: bool, alias: &str) -> TableRef {
        let sql = if keyed {
            let inner = self.dialect.quote_identifier("__t");
            format!(
                "(SELECT {} AS {}, {}.* FROM {} AS {})",
                self.dialect.sql_generate_uuid(),
                self.dialect.quote_identifier(DISTINCT_KEY),
                inner,
                table_sql,
                inner
            )
        } else {
            table_sql
        };
        TableRef::raw(sql).with_alias(alias)
    }
}
