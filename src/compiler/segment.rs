//! Reduce and project segments.
//!
//! A reduce with no nested views and no ungrouped aggregates is a single
//! `GROUP BY` statement. Anything else goes through the grouping-set plan:
//!
//! 1. Every row of the input is fanned out over a `group_set` column, one
//!    set per result level (numbered in pre-order) plus one per ungrouped
//!    aggregate. Each dimension is only kept in the sets that group by it
//!    and each aggregate is guarded by its own set.
//! 2. An optional window stage computes ungrouped values, nested `having`
//!    flags and per-level row numbers for nested limits.
//! 3. Collapse stages fold the deepest level into an array column on its
//!    parent, one depth at a time.
//! 4. The final stage keeps set 0 and renames columns to output names.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::model::{
    AtomicType, BinaryOp, Expr, ExpressionType, FieldDef, FilterCondition, OrderBy, OrderKey,
    PipeSegment, QueryField, QuerySegment, SortDirection, StructDef, StructKind, TimeUnit,
    UngroupedKind,
};
use crate::sql::dialect::{DialectError, SqlDialect};
use crate::sql::{
    col, Expr as SqlExpr, Join, OrderByExpr, Query, SelectExpr, SortDir, TableRef, WindowExt,
    WindowOrderBy,
};

use super::drill::DrillDimension;
use super::error::{CompileError, CompileResult};
use super::expr_gen::ExprCompiler;
use super::join_tree::JoinTree;
use super::{Compilation, SegmentOutput};

/// Nesting deeper than this is treated as a view that contains itself.
const MAX_NEST_DEPTH: usize = 32;
const MAX_INLINE_DEPTH: usize = 64;

// =============================================================================
// Output resolution
// =============================================================================

struct Value {
    name: String,
    expr: Expr,
    ty: AtomicType,
    kind: ExpressionType,
    timeframe: Option<TimeUnit>,
    /// How a drill filter refers to this value, when it can.
    drill: Option<String>,
}

enum Resolved<'q> {
    Value(Value),
    Nest {
        name: String,
        pipeline: &'q [PipeSegment],
    },
}

fn resolve_output<'q>(input: &'q StructDef, field: &'q QueryField) -> CompileResult<Resolved<'q>> {
    match field {
        QueryField::Ref { path, .. } => {
            let name = field.output_name().to_string();
            let def = input
                .lookup(path)
                .ok_or_else(|| CompileError::UnknownField(path.join(".")))?;
            match def {
                FieldDef::Atomic(a) => {
                    let owner = &path[..path.len().saturating_sub(1)];
                    let expr = match &a.expr {
                        Some(def) if a.is_measure() => rebase(def, owner),
                        _ => Expr::Field { path: path.clone() },
                    };
                    Ok(Resolved::Value(Value {
                        name,
                        kind: classify(a.expression_type, &expr),
                        expr,
                        ty: a.ty,
                        timeframe: a.timeframe,
                        drill: Some(path.join(".")),
                    }))
                }
                FieldDef::Turtle(t) => Ok(Resolved::Nest {
                    name,
                    pipeline: &t.pipeline,
                }),
                FieldDef::Struct(_) => Err(CompileError::NotAValue {
                    name: path.join("."),
                    kind: "join",
                }),
            }
        }
        QueryField::Def(FieldDef::Atomic(a)) => {
            let expr = a
                .expr
                .clone()
                .unwrap_or_else(|| Expr::field(&[a.name.as_str()]));
            Ok(Resolved::Value(Value {
                name: a.name.clone(),
                kind: classify(a.expression_type, &expr),
                drill: drill_expression(&expr),
                expr,
                ty: a.ty,
                timeframe: a.timeframe,
            }))
        }
        QueryField::Def(FieldDef::Turtle(t)) => Ok(Resolved::Nest {
            name: t.name.clone(),
            pipeline: &t.pipeline,
        }),
        QueryField::Def(FieldDef::Struct(s)) => Err(CompileError::NotAValue {
            name: s.name.clone(),
            kind: "join",
        }),
    }
}

/// Expression kind from the declared kind and what the expression contains.
fn classify(declared: ExpressionType, expr: &Expr) -> ExpressionType {
    let (mut analytic, mut aggregate, mut ungrouped) = (false, false, false);
    expr.walk(&mut |e| match e {
        Expr::Analytic { .. } => analytic = true,
        Expr::Aggregate { .. } => aggregate = true,
        Expr::Ungrouped { .. } => ungrouped = true,
        _ => {}
    });
    let found = match (analytic, aggregate, ungrouped) {
        (true, true, _) => ExpressionType::AggregateAnalytic,
        (true, false, _) => ExpressionType::ScalarAnalytic,
        (false, _, true) => ExpressionType::UngroupedAggregate,
        (false, true, false) => ExpressionType::Aggregate,
        _ => ExpressionType::Scalar,
    };
    declared.combine(found)
}

fn drill_expression(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Field { path } => Some(path.join(".")),
        Expr::TimeTrunc { expr, unit, .. } => match expr.as_ref() {
            Expr::Field { path } => Some(format!("{}.{}", path.join("."), unit.as_str())),
            _ => None,
        },
        _ => None,
    }
}

fn contains_ungrouped(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if matches!(e, Expr::Ungrouped { .. }) {
            found = true;
        }
    });
    found
}

/// Make a definition written inside `owner` absolute.
fn rebase(expr: &Expr, owner: &[String]) -> Expr {
    if owner.is_empty() {
        return expr.clone();
    }
    expr.rewrite(&mut |e| match e {
        Expr::Field { path } => Some(Expr::Field {
            path: owner.iter().chain(path).cloned().collect(),
        }),
        Expr::Aggregate {
            func,
            expr,
            locality,
        } => Some(Expr::Aggregate {
            func: *func,
            expr: expr.as_ref().map(|inner| Box::new(rebase(inner, owner))),
            locality: owner.iter().chain(locality).cloned().collect(),
        }),
        _ => None,
    })
}

/// Replace references to measures with their definitions. Names in `skip`
/// are segment outputs and stay as references.
fn inline_measures(
    expr: &Expr,
    input: &StructDef,
    skip: &HashSet<&str>,
    depth: usize,
) -> CompileResult<Expr> {
    if depth > MAX_INLINE_DEPTH {
        return Err(CompileError::invalid("measure definition refers to itself"));
    }
    let mut failure = None;
    let out = expr.rewrite(&mut |e| {
        let Expr::Field { path } = e else {
            return None;
        };
        if let [name] = path.as_slice() {
            if skip.contains(name.as_str()) {
                return None;
            }
        }
        match input.lookup(path) {
            Some(FieldDef::Atomic(a)) if a.is_measure() => {
                let def = a.expr.as_ref()?;
                let rebased = rebase(def, &path[..path.len() - 1]);
                match inline_measures(&rebased, input, &HashSet::new(), depth + 1) {
                    Ok(inlined) => Some(inlined),
                    Err(err) => {
                        failure.get_or_insert(err);
                        None
                    }
                }
            }
            _ => None,
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Input with the segment's `extend` fields (and those of nested views)
/// added. The first definition of a name wins.
fn with_extends(input: &StructDef, segment: &QuerySegment) -> StructDef {
    let mut extends = Vec::new();
    collect_extends(input, segment, &mut extends, 0);
    let mut out = input.clone();
    for field in extends {
        if !out.has_field(field.name()) {
            out.fields.push(field);
        }
    }
    out
}

fn collect_extends(input: &StructDef, segment: &QuerySegment, out: &mut Vec<FieldDef>, depth: usize) {
    if depth > MAX_NEST_DEPTH {
        return;
    }
    out.extend(segment.extend.iter().cloned());
    for field in &segment.fields {
        let pipeline = match field {
            QueryField::Def(FieldDef::Turtle(t)) => &t.pipeline,
            QueryField::Ref { path, .. } => match input.lookup(path) {
                Some(FieldDef::Turtle(t)) => &t.pipeline,
                _ => continue,
            },
            _ => continue,
        };
        if let Some(PipeSegment::Reduce(inner)) = pipeline.first() {
            collect_extends(input, inner, out, depth + 1);
        }
    }
}

/// `where` filters of a segment, plus the source's own on the first stage.
fn where_filters<'a>(
    input: &'a StructDef,
    stage: Option<&str>,
    segment: &'a QuerySegment,
) -> Vec<&'a FilterCondition> {
    let source: &[FilterCondition] = if stage.is_none() { &input.filters } else { &[] };
    source.iter().chain(&segment.filters).collect()
}

fn resolve_ordering(order_by: &[OrderBy], outputs: &[String]) -> CompileResult<Vec<(String, SortDirection)>> {
    order_by
        .iter()
        .map(|o| {
            let name = match &o.field {
                OrderKey::Name(n) if outputs.contains(n) => n.clone(),
                OrderKey::Name(n) => {
                    return Err(CompileError::invalid(format!(
                        "'{}' is not in the output of this query",
                        n
                    )))
                }
                OrderKey::Position(p) => outputs
                    .get(p.wrapping_sub(1))
                    .cloned()
                    .ok_or_else(|| CompileError::invalid(format!("order_by position {} is out of range", p)))?,
            };
            Ok((name, o.dir.unwrap_or(SortDirection::Asc)))
        })
        .collect()
}

fn sort_dir(dir: SortDirection) -> SortDir {
    match dir {
        SortDirection::Asc => SortDir::Asc,
        SortDirection::Desc => SortDir::Desc,
    }
}

fn window_order(sql: &str, dir: SortDirection) -> WindowOrderBy {
    match dir {
        SortDirection::Asc => WindowOrderBy::asc(SqlExpr::Raw(sql.to_string())),
        SortDirection::Desc => WindowOrderBy::desc(SqlExpr::Raw(sql.to_string())),
    }
}

fn raw(sql: impl Into<String>) -> SqlExpr {
    SqlExpr::Raw(sql.into())
}

fn positions(count: usize) -> Vec<SqlExpr> {
    (1..=count).map(|i| raw(i.to_string())).collect()
}

fn conjunction(filters: Vec<Expr>) -> Option<Expr> {
    filters
        .into_iter()
        .reduce(|a, b| Expr::binary(BinaryOp::And, a, b))
}

/// Tree with no fields; everything compiled against it resolves to locals.
fn empty_struct(dialect: &dyn SqlDialect) -> StructDef {
    StructDef::with_kind("", StructKind::Result, dialect.name(), "")
}

// =============================================================================
// Result plan
// =============================================================================

struct Dim {
    name: String,
    expr: Expr,
    ty: AtomicType,
    timeframe: Option<TimeUnit>,
    drill: Option<String>,
}

struct Agg {
    name: String,
    expr: Expr,
}

#[derive(Debug, Clone, Copy)]
enum Out {
    Dim(usize),
    Agg(usize),
    Calc(usize),
    Nest(usize),
}

/// One level of the result: the root segment or a nested view.
struct Node<'q> {
    id: usize,
    parent: Option<usize>,
    depth: usize,
    name: String,
    segment: &'q QuerySegment,
    dims: Vec<Dim>,
    aggs: Vec<Agg>,
    /// Analytic expressions, named through `outputs`.
    calcs: Vec<Expr>,
    outputs: Vec<(String, Out)>,
    children: Vec<usize>,
    /// `having` filters joined with AND, measures inlined.
    having: Option<Expr>,
}

impl Node<'_> {
    fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(n, _)| n.clone()).collect()
    }

    fn has_dim(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d.name == name)
    }
}

struct Plan<'q> {
    input: &'q StructDef,
    nodes: Vec<Node<'q>>,
}

impl<'q> Plan<'q> {
    fn build(input: &'q StructDef, segment: &'q QuerySegment) -> CompileResult<Self> {
        let mut plan = Plan {
            input,
            nodes: Vec::new(),
        };
        plan.add(segment, None, String::new())?;
        Ok(plan)
    }

    fn add(&mut self, segment: &'q QuerySegment, parent: Option<usize>, name: String) -> CompileResult<usize> {
        let id = self.nodes.len();
        let depth = parent.map_or(0, |p| self.nodes[p].depth + 1);
        if depth > MAX_NEST_DEPTH {
            return Err(CompileError::invalid(format!("view '{}' contains itself", name)));
        }
        self.nodes.push(Node {
            id,
            parent,
            depth,
            name,
            segment,
            dims: Vec::new(),
            aggs: Vec::new(),
            calcs: Vec::new(),
            outputs: Vec::new(),
            children: Vec::new(),
            having: None,
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }

        let input = self.input;
        for field in &segment.fields {
            match resolve_output(input, field)? {
                Resolved::Nest { name, pipeline } => {
                    let inner = match pipeline {
                        [PipeSegment::Reduce(inner)] => inner,
                        _ => {
                            return Err(CompileError::invalid(format!(
                                "nested view '{}' must be a single group_by/aggregate stage",
                                name
                            )))
                        }
                    };
                    let child = self.add(inner, Some(id), name.clone())?;
                    self.nodes[id].outputs.push((name, Out::Nest(child)));
                }
                Resolved::Value(v) => {
                    let node = &mut self.nodes[id];
                    let out = if v.kind.is_analytic() {
                        node.calcs.push(v.expr);
                        Out::Calc(node.calcs.len() - 1)
                    } else if v.kind.is_aggregate() {
                        let expr = inline_measures(&v.expr, input, &HashSet::new(), 0)?;
                        node.aggs.push(Agg {
                            name: v.name.clone(),
                            expr,
                        });
                        Out::Agg(node.aggs.len() - 1)
                    } else {
                        node.dims.push(Dim {
                            name: v.name.clone(),
                            expr: v.expr,
                            ty: v.ty,
                            timeframe: v.timeframe,
                            drill: v.drill,
                        });
                        Out::Dim(node.dims.len() - 1)
                    };
                    node.outputs.push((v.name, out));
                }
            }
        }

        let node = &self.nodes[id];
        let names = node.output_names();
        let skip: HashSet<&str> = names.iter().map(String::as_str).collect();
        let having = segment
            .having
            .iter()
            .map(|f| inline_measures(&f.expr, input, &skip, 0).map_err(|e| e.with_code(&f.code)))
            .collect::<CompileResult<Vec<_>>>()?;
        self.nodes[id].having = conjunction(having);
        Ok(id)
    }

    fn has_ungrouped(&self) -> bool {
        self.nodes.iter().any(|n| {
            n.aggs.iter().any(|a| contains_ungrouped(&a.expr))
                || n.having.as_ref().is_some_and(contains_ungrouped)
        })
    }

    fn subtree(&self, id: usize) -> Vec<usize> {
        let mut out = vec![id];
        for &child in &self.nodes[id].children {
            out.extend(self.subtree(child));
        }
        out
    }

    /// Strict ancestors, root first.
    fn ancestors(&self, id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut current = self.nodes[id].parent;
        while let Some(p) = current {
            out.push(p);
            current = self.nodes[p].parent;
        }
        out.reverse();
        out
    }

    fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Explicit ordering, else the first aggregate descending, else the
    /// first time dimension descending, else the first dimension.
    fn ordering(&self, id: usize) -> CompileResult<Vec<(String, SortDirection)>> {
        let node = &self.nodes[id];
        if !node.segment.order_by.is_empty() {
            let order = resolve_ordering(&node.segment.order_by, &node.output_names())?;
            for (name, _) in &order {
                if matches!(node.outputs.iter().find(|(n, _)| n == name), Some((_, Out::Nest(_)))) {
                    return Err(CompileError::invalid(format!(
                        "cannot order by nested view '{}'",
                        name
                    )));
                }
            }
            return Ok(order);
        }
        if let Some((name, _)) = node.outputs.iter().find(|(_, o)| matches!(o, Out::Agg(_))) {
            return Ok(vec![(name.clone(), SortDirection::Desc)]);
        }
        if let Some(d) = node.dims.iter().find(|d| d.ty.is_temporal()) {
            return Ok(vec![(d.name.clone(), SortDirection::Desc)]);
        }
        Ok(node
            .dims
            .first()
            .map(|d| vec![(d.name.clone(), SortDirection::Asc)])
            .unwrap_or_default())
    }

    fn drill(&self, timezone: Option<&str>) -> Vec<DrillDimension> {
        if self.nodes.len() != 1 {
            return Vec::new();
        }
        self.nodes[0]
            .dims
            .iter()
            .filter_map(|d| {
                d.drill.as_ref().map(|expression| DrillDimension {
                    name: d.name.clone(),
                    expression: expression.clone(),
                    ty: d.ty,
                    timeframe: d.timeframe,
                    timezone: timezone.map(str::to_string),
                })
            })
            .collect()
    }
}

// =============================================================================
// Reduce
// =============================================================================

pub(crate) fn compile_reduce(
    run: &mut Compilation<'_>,
    input: &StructDef,
    stage: Option<&str>,
    segment: &QuerySegment,
    row_limit: Option<u64>,
) -> CompileResult<SegmentOutput> {
    let input = with_extends(input, segment);
    let plan = Plan::build(&input, segment)?;
    let limit = segment.limit.or(row_limit);
    let timezone = segment.timezone.as_deref().or(input.timezone.as_deref());

    let stage = if plan.nodes.len() == 1 && !plan.has_ungrouped() {
        compile_flat(run, &plan, stage, limit, timezone)?
    } else {
        if plan.nodes.len() > 1 && !run.dialect.supports_nesting() {
            return Err(DialectError::Unsupported {
                dialect: run.dialect.name(),
                feature: "nested views",
            }
            .into());
        }
        Staged::new(&plan, run.dialect)?.compile(run, stage, limit, timezone)?
    };
    Ok(SegmentOutput {
        stage,
        drill: plan.drill(timezone),
    })
}

fn compile_flat(
    run: &mut Compilation<'_>,
    plan: &Plan<'_>,
    stage: Option<&str>,
    limit: Option<u64>,
    timezone: Option<&str>,
) -> CompileResult<String> {
    let node = &plan.nodes[0];
    let filters = where_filters(plan.input, stage, node.segment);

    let mut tree = JoinTree::new(plan.input);
    for d in &node.dims {
        tree.require_expr(&d.expr, &[])?;
    }
    for a in &node.aggs {
        tree.require_expr(&a.expr, &[])?;
    }
    for f in &filters {
        tree.require_expr(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?;
    }

    let mut exprs = ExprCompiler::new(run.dialect, &tree);
    exprs.set_timezone(timezone)?;

    let mut values: HashMap<&str, String> = HashMap::new();
    let mut select: Vec<Option<SelectExpr>> = Vec::with_capacity(node.outputs.len());
    let mut group_by = Vec::new();
    for (i, (name, out)) in node.outputs.iter().enumerate() {
        let sql = match out {
            Out::Dim(d) => {
                group_by.push(raw((i + 1).to_string()));
                exprs.compile_scalar(&node.dims[*d].expr, &[])?
            }
            Out::Agg(a) => exprs.compile(&node.aggs[*a].expr, &[])?,
            Out::Calc(_) => {
                select.push(None);
                continue;
            }
            Out::Nest(_) => return Err(CompileError::invalid("unexpected nested view")),
        };
        select.push(Some(SelectExpr::aliased(raw(sql.clone()), name)));
        values.insert(name.as_str(), sql);
    }

    for (name, sql) in &values {
        exprs.set_local(*name, sql.clone());
    }
    let ordering = plan.ordering(0)?;
    let order = ordering
        .iter()
        .filter_map(|(name, dir)| values.get(name.as_str()).map(|sql| window_order(sql, *dir)))
        .collect();
    exprs.set_window(Vec::new(), order);
    exprs.allow_analytics(true);
    for (slot, (name, out)) in select.iter_mut().zip(&node.outputs) {
        if let Out::Calc(c) = out {
            let sql = exprs.compile(&node.calcs[*c], &[])?;
            *slot = Some(SelectExpr::aliased(raw(sql), name));
        }
    }
    exprs.allow_analytics(false);

    let mut conditions = Vec::new();
    for f in &filters {
        conditions.push(exprs.compile_scalar(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?);
    }
    let having = match &node.having {
        Some(h) => Some(exprs.compile(h, &[])?),
        None => None,
    };

    let keys = exprs.keys_needed().clone();
    let sample = if stage.is_none() { node.segment.sample.as_ref() } else { None };
    let from = run.render_root(&tree, stage, sample, &keys)?;
    let joins = run.render_joins(&tree, &mut exprs)?;

    let mut query = Query::new()
        .select(select.into_iter().flatten().collect::<Vec<SelectExpr>>())
        .from(from);
    for join in joins {
        query = query.join(join);
    }
    for c in conditions {
        query = query.filter(raw(c));
    }
    if !group_by.is_empty() {
        query = query.group_by(group_by);
    }
    if let Some(h) = having {
        query = query.having(raw(h));
    }
    query = query.order_by(
        ordering
            .into_iter()
            .map(|(name, dir)| OrderByExpr::new(col(&name), sort_dir(dir)))
            .collect(),
    );
    if let Some(n) = limit {
        query = query.limit(n);
    }
    Ok(run.stages.add_stage(query))
}

// =============================================================================
// Grouping-set reduce
// =============================================================================

/// A set added for one ungrouped aggregate.
struct Extra {
    set: usize,
    owner: usize,
    kind: UngroupedKind,
    fields: Vec<String>,
    column: String,
    inner: Expr,
}

impl Extra {
    /// Whether dimension `dim` of the owner stays grouped in this set.
    fn keeps(&self, dim: &str) -> bool {
        let listed = self.fields.iter().any(|f| f == dim);
        match self.kind {
            UngroupedKind::All => listed,
            UngroupedKind::Exclude => !listed,
        }
    }
}

/// An aggregate lifted out of a larger expression into its own column.
struct Hoisted {
    column: String,
    owner: usize,
    expr: Expr,
}

enum AggForm {
    Direct,
    /// Computed in the window stage from hoisted columns.
    Derived(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Dim,
    Value,
    /// Only read by the window stage.
    Internal,
}

#[derive(Debug, Clone)]
struct Column {
    name: String,
    owner: usize,
    role: Role,
}

fn column_name(name: &str, id: usize) -> String {
    format!("{}__{}", name, id)
}

fn having_column(id: usize) -> String {
    format!("__having__{}", id)
}

fn row_number_column(id: usize) -> String {
    format!("__row_number__{}", id)
}

struct Hoister<'x> {
    owner: usize,
    base_set: usize,
    counter: &'x mut usize,
    extras: &'x mut Vec<Extra>,
    hoisted: &'x mut Vec<Hoisted>,
}

impl Hoister<'_> {
    fn hoist(&mut self, expr: &Expr) -> Expr {
        expr.rewrite(&mut |e| match e {
            Expr::Ungrouped { kind, expr, fields } => {
                let column = format!("__u{}", *self.counter);
                *self.counter += 1;
                self.extras.push(Extra {
                    set: self.base_set + self.extras.len(),
                    owner: self.owner,
                    kind: *kind,
                    fields: fields.clone(),
                    column: column.clone(),
                    inner: (**expr).clone(),
                });
                Some(Expr::field(&[column]))
            }
            Expr::Aggregate { .. } => Some(self.lift(e)),
            Expr::Filtered { expr, .. } if expr.contains_aggregate() => Some(self.lift(e)),
            _ => None,
        })
    }

    fn lift(&mut self, e: &Expr) -> Expr {
        let column = format!("__a{}", *self.counter);
        *self.counter += 1;
        self.hoisted.push(Hoisted {
            column: column.clone(),
            owner: self.owner,
            expr: e.clone(),
        });
        Expr::field(&[column])
    }
}

struct Staged<'p, 'q> {
    plan: &'p Plan<'q>,
    dialect: &'static dyn SqlDialect,
    extras: Vec<Extra>,
    hoisted: Vec<Hoisted>,
    forms: Vec<Vec<AggForm>>,
    having: Vec<Option<Expr>>,
}

impl<'p, 'q> Staged<'p, 'q> {
    fn new(plan: &'p Plan<'q>, dialect: &'static dyn SqlDialect) -> CompileResult<Self> {
        let mut extras = Vec::new();
        let mut hoisted = Vec::new();
        let mut counter = 0usize;
        let mut forms = Vec::with_capacity(plan.nodes.len());
        let mut having = Vec::with_capacity(plan.nodes.len());

        for node in &plan.nodes {
            if node.id != 0 && !node.calcs.is_empty() {
                return Err(CompileError::invalid(format!(
                    "calculate is not supported inside nested view '{}'",
                    node.name
                )));
            }
            let mut hoister = Hoister {
                owner: node.id,
                base_set: plan.nodes.len(),
                counter: &mut counter,
                extras: &mut extras,
                hoisted: &mut hoisted,
            };
            let node_forms = node
                .aggs
                .iter()
                .map(|a| {
                    if contains_ungrouped(&a.expr) {
                        AggForm::Derived(hoister.hoist(&a.expr))
                    } else {
                        AggForm::Direct
                    }
                })
                .collect();
            forms.push(node_forms);
            having.push(node.having.as_ref().map(|h| hoister.hoist(h)));
        }

        for extra in &extras {
            let owner = &plan.nodes[extra.owner];
            if let Some(missing) = extra.fields.iter().find(|f| !owner.has_dim(f)) {
                return Err(CompileError::invalid(format!(
                    "'{}' is not a dimension of this query",
                    missing
                )));
            }
        }

        Ok(Self {
            plan,
            dialect,
            extras,
            hoisted,
            forms,
            having,
        })
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn set_count(&self) -> usize {
        self.plan.nodes.len() + self.extras.len()
    }

    /// Sets in which dimension `dim` of node `id` is grouped.
    fn dim_sets(&self, id: usize, dim: &str) -> Vec<usize> {
        let subtree = self.plan.subtree(id);
        let mut sets = subtree.clone();
        for x in &self.extras {
            let included = if x.owner == id {
                x.keeps(dim)
            } else {
                subtree.contains(&x.owner)
            };
            if included {
                sets.push(x.set);
            }
        }
        sets.sort_unstable();
        sets
    }

    /// Sets whose rows pass through node `id`'s `where` filters.
    fn filtered_sets(&self, id: usize) -> Vec<usize> {
        let subtree = self.plan.subtree(id);
        let mut sets = subtree.clone();
        sets.extend(
            self.extras
                .iter()
                .filter(|x| subtree.contains(&x.owner))
                .map(|x| x.set),
        );
        sets.sort_unstable();
        sets
    }

    fn set_list(sets: &[usize]) -> String {
        sets.iter().map(usize::to_string).collect::<Vec<_>>().join(",")
    }

    fn needs_window_stage(&self) -> bool {
        !self.extras.is_empty()
            || self
                .plan
                .nodes
                .iter()
                .any(|n| n.id != 0 && (self.having[n.id].is_some() || n.segment.limit.is_some()))
    }

    fn compile(
        &self,
        run: &mut Compilation<'_>,
        stage: Option<&str>,
        limit: Option<u64>,
        timezone: Option<&str>,
    ) -> CompileResult<String> {
        debug!(
            levels = self.plan.nodes.len(),
            ungrouped = self.extras.len(),
            "compiling grouping-set reduce"
        );
        let (mut current, mut live) = self.grouping_stage(run, stage, timezone)?;
        let windowed = self.needs_window_stage();
        if windowed {
            current = self.window_stage(run, &current, &mut live)?;
        }
        for depth in (1..=self.plan.max_depth()).rev() {
            current = self.collapse_stage(run, &current, &mut live, depth, depth == self.plan.max_depth())?;
        }
        self.final_stage(run, &current, windowed, limit)
    }

    fn grouping_stage(
        &self,
        run: &mut Compilation<'_>,
        stage: Option<&str>,
        timezone: Option<&str>,
    ) -> CompileResult<(String, Vec<Column>)> {
        let plan = self.plan;
        let root_filters = where_filters(plan.input, stage, plan.nodes[0].segment);

        let mut tree = JoinTree::new(plan.input);
        for node in &plan.nodes {
            for d in &node.dims {
                tree.require_expr(&d.expr, &[])?;
            }
            for (a, form) in node.aggs.iter().zip(&self.forms[node.id]) {
                if let AggForm::Direct = form {
                    tree.require_expr(&a.expr, &[])?;
                }
            }
            if node.id != 0 {
                for f in &node.segment.filters {
                    tree.require_expr(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?;
                }
            }
        }
        for h in &self.hoisted {
            tree.require_expr(&h.expr, &[])?;
        }
        for x in &self.extras {
            tree.require_expr(&x.inner, &[])?;
        }
        for f in &root_filters {
            tree.require_expr(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?;
        }

        let mut exprs = ExprCompiler::new(self.dialect, &tree);
        exprs.set_timezone(timezone)?;

        let total = self.set_count();
        let mut select = vec![SelectExpr::new(raw("group_set"))];
        let mut live = Vec::new();
        for node in &plan.nodes {
            for d in &node.dims {
                let sql = exprs.compile_scalar(&d.expr, &[])?;
                let sets = self.dim_sets(node.id, &d.name);
                let sql = if sets.len() == total {
                    sql
                } else {
                    format!("CASE WHEN group_set IN ({}) THEN {} END", Self::set_list(&sets), sql)
                };
                let name = column_name(&d.name, node.id);
                select.push(SelectExpr::aliased(raw(sql), &name));
                live.push(Column {
                    name,
                    owner: node.id,
                    role: Role::Dim,
                });
            }
        }
        let grouped = select.len();

        for node in &plan.nodes {
            exprs.push_condition(format!("group_set={}", node.id));
            for (a, form) in node.aggs.iter().zip(&self.forms[node.id]) {
                if let AggForm::Direct = form {
                    let sql = exprs.compile(&a.expr, &[])?;
                    let name = column_name(&a.name, node.id);
                    select.push(SelectExpr::aliased(raw(sql), &name));
                    live.push(Column {
                        name,
                        owner: node.id,
                        role: Role::Value,
                    });
                }
            }
            exprs.pop_condition();
        }
        for h in &self.hoisted {
            exprs.push_condition(format!("group_set={}", h.owner));
            let sql = exprs.compile(&h.expr, &[])?;
            exprs.pop_condition();
            select.push(SelectExpr::aliased(raw(sql), &h.column));
            live.push(Column {
                name: h.column.clone(),
                owner: h.owner,
                role: Role::Value,
            });
        }
        for x in &self.extras {
            exprs.push_condition(format!("group_set={}", x.set));
            let sql = exprs.compile(&x.inner, &[])?;
            exprs.pop_condition();
            select.push(SelectExpr::aliased(raw(sql), &x.column));
            live.push(Column {
                name: x.column.clone(),
                owner: x.owner,
                role: Role::Internal,
            });
        }

        let mut conditions = Vec::new();
        for f in &root_filters {
            conditions.push(exprs.compile_scalar(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?);
        }
        for node in plan.nodes.iter().skip(1) {
            if node.segment.filters.is_empty() {
                continue;
            }
            let sets = Self::set_list(&self.filtered_sets(node.id));
            for f in &node.segment.filters {
                let sql = exprs.compile_scalar(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?;
                conditions.push(format!("(group_set NOT IN ({}) OR ({}))", sets, sql));
            }
        }

        let keys = exprs.keys_needed().clone();
        let sample = if stage.is_none() {
            plan.nodes[0].segment.sample.as_ref()
        } else {
            None
        };
        let from = run.render_root(&tree, stage, sample, &keys)?;
        let mut joins = run.render_joins(&tree, &mut exprs)?;
        joins.push(Join::Raw(self.dialect.sql_group_set_table(total - 1)));

        let mut query = Query::new().select(select).from(from);
        for join in joins {
            query = query.join(join);
        }
        for c in conditions {
            query = query.filter(raw(c));
        }
        query = query.group_by(positions(grouped));
        Ok((run.stages.add_stage(query), live))
    }

    /// Window expression reading the value of ungrouped set `x` on the
    /// rows of its owner.
    fn ungrouped_window(&self, x: &Extra) -> SqlExpr {
        let owner = &self.plan.nodes[x.owner];
        let mut partition = Vec::new();
        for a in self.plan.ancestors(x.owner) {
            for d in &self.plan.nodes[a].dims {
                partition.push(raw(self.quote(&column_name(&d.name, a))));
            }
        }
        for d in owner.dims.iter().filter(|d| x.keeps(&d.name)) {
            partition.push(raw(self.quote(&column_name(&d.name, owner.id))));
        }
        raw(format!(
            "MAX(CASE WHEN group_set={} THEN {} END)",
            x.set,
            self.quote(&x.column)
        ))
        .over()
        .partition_by(partition)
        .build()
    }

    fn set_placeholders(&self, exprs: &mut ExprCompiler<'_, '_>) {
        exprs.clear_locals();
        for h in &self.hoisted {
            exprs.set_local(h.column.clone(), self.quote(&h.column));
        }
        for x in &self.extras {
            exprs.set_local(x.column.clone(), self.ungrouped_window(x).to_sql(self.dialect));
        }
    }

    fn window_stage(&self, run: &mut Compilation<'_>, input: &str, live: &mut Vec<Column>) -> CompileResult<String> {
        let empty = empty_struct(self.dialect);
        let tree = JoinTree::new(&empty);
        let mut exprs = ExprCompiler::new(self.dialect, &tree);
        exprs.allow_aggregates(false);

        let hoisted: HashSet<&str> = self.hoisted.iter().map(|h| h.column.as_str()).collect();
        live.retain(|c| c.role != Role::Internal && !hoisted.contains(c.name.as_str()));

        let mut select = vec![SelectExpr::new(raw("group_set"))];
        select.extend(live.iter().map(|c| SelectExpr::new(col(&c.name))));
        let mut qualify = Vec::new();

        for node in &self.plan.nodes {
            self.set_placeholders(&mut exprs);
            let mut values: HashMap<&str, String> = HashMap::new();
            for d in &node.dims {
                values.insert(d.name.as_str(), self.quote(&column_name(&d.name, node.id)));
            }
            for (a, form) in node.aggs.iter().zip(&self.forms[node.id]) {
                let name = column_name(&a.name, node.id);
                let sql = match form {
                    AggForm::Direct => self.quote(&name),
                    AggForm::Derived(expr) => {
                        let sql = exprs.compile(expr, &[])?;
                        select.push(SelectExpr::aliased(raw(sql.clone()), &name));
                        live.push(Column {
                            name,
                            owner: node.id,
                            role: Role::Value,
                        });
                        sql
                    }
                };
                values.insert(a.name.as_str(), sql);
            }
            for (name, sql) in &values {
                exprs.set_local(*name, sql.clone());
            }

            let having = match &self.having[node.id] {
                Some(h) => {
                    let sql = exprs.compile(h, &[])?;
                    let name = having_column(node.id);
                    select.push(SelectExpr::aliased(raw(sql.clone()), &name));
                    live.push(Column {
                        name,
                        owner: node.id,
                        role: Role::Value,
                    });
                    Some(sql)
                }
                None => None,
            };

            if let Some(n) = node.segment.limit.filter(|_| node.id != 0) {
                let mut partition = vec![raw("group_set")];
                for a in self.plan.ancestors(node.id) {
                    for d in &self.plan.nodes[a].dims {
                        partition.push(raw(self.quote(&column_name(&d.name, a))));
                    }
                }
                if let Some(h) = &having {
                    partition.push(raw(format!("({})", h)));
                }
                let order = self
                    .plan
                    .ordering(node.id)?
                    .into_iter()
                    .filter_map(|(name, dir)| values.get(name.as_str()).map(|sql| window_order(sql, dir)))
                    .collect();
                let row_number = raw("ROW_NUMBER()")
                    .over()
                    .partition_by(partition)
                    .order_by(order)
                    .build()
                    .to_sql(self.dialect);
                let name = row_number_column(node.id);
                select.push(SelectExpr::aliased(raw(row_number), &name));
                qualify.push(format!("(group_set<>{} OR {} <= {})", node.id, self.quote(&name), n));
                live.push(Column {
                    name,
                    owner: node.id,
                    role: Role::Value,
                });
            }
        }

        let mut query = Query::new().select(select).from(TableRef::named(input));
        // Rows past a nested limit can be dropped here; the collapse filter
        // still applies them for dialects without QUALIFY.
        if self.dialect.supports_qualify() {
            for condition in qualify {
                query = query.qualify(raw(condition));
            }
        }
        Ok(run.stages.add_stage(query))
    }

    /// Fold every level at `depth` into an array column on its parent.
    fn collapse_stage(
        &self,
        run: &mut Compilation<'_>,
        input: &str,
        live: &mut Vec<Column>,
        depth: usize,
        first: bool,
    ) -> CompileResult<String> {
        let plan = self.plan;
        let folded: Vec<&Node<'_>> = plan.nodes.iter().filter(|n| n.depth == depth).collect();

        let remap = folded
            .iter()
            .map(|n| format!(" WHEN {} THEN {}", n.id, n.parent.unwrap_or(0)))
            .collect::<String>();
        let mut select = vec![SelectExpr::new(raw(format!(
            "CASE group_set{} ELSE group_set END AS group_set",
            remap
        )))];

        let kept: Vec<Column> = live
            .iter()
            .filter(|c| plan.nodes[c.owner].depth < depth)
            .cloned()
            .collect();
        for c in kept.iter().filter(|c| c.role == Role::Dim) {
            select.push(SelectExpr::new(col(&c.name)));
        }
        let grouped = select.len();
        for c in kept.iter().filter(|c| c.role != Role::Dim) {
            select.push(SelectExpr::aliased(
                raw(self.dialect.sql_any_value(c.owner, &self.quote(&c.name))),
                &c.name,
            ));
        }

        let mut added = Vec::new();
        for node in &folded {
            let fields = node
                .outputs
                .iter()
                .map(|(name, out)| {
                    let column = match out {
                        Out::Dim(_) | Out::Agg(_) => column_name(name, node.id),
                        Out::Nest(child) => column_name(&plan.nodes[*child].name, node.id),
                        Out::Calc(_) => {
                            return Err(CompileError::invalid("calculate is not supported in nested views"))
                        }
                    };
                    Ok((name.clone(), self.quote(&column)))
                })
                .collect::<CompileResult<Vec<_>>>()?;

            let mut filter = format!("group_set={}", node.id);
            if self.having[node.id].is_some() {
                filter.push_str(&format!(" AND {}", self.quote(&having_column(node.id))));
            }
            if let Some(n) = node.segment.limit {
                filter.push_str(&format!(
                    " AND {} <= {}",
                    self.quote(&row_number_column(node.id)),
                    n
                ));
            }

            let ordering = plan.ordering(node.id)?;
            let order = (!ordering.is_empty()).then(|| {
                ordering
                    .iter()
                    .map(|(name, dir)| {
                        let dir = match dir {
                            SortDirection::Asc => "ASC",
                            SortDirection::Desc => "DESC",
                        };
                        format!("{} {}", self.quote(&column_name(name, node.id)), dir)
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            });

            let parent = node.parent.unwrap_or(0);
            let name = column_name(&node.name, parent);
            let sql = self
                .dialect
                .sql_aggregate_turtle(&filter, &fields, order.as_deref());
            select.push(SelectExpr::aliased(raw(sql), &name));
            added.push(Column {
                name,
                owner: parent,
                role: Role::Value,
            });
        }

        let mut query = Query::new().select(select).from(TableRef::named(input));
        if first && !self.extras.is_empty() {
            let sets: Vec<usize> = self.extras.iter().map(|x| x.set).collect();
            query = query.filter(raw(format!("group_set NOT IN ({})", Self::set_list(&sets))));
        }
        query = query.group_by(positions(grouped));

        *live = kept;
        live.extend(added);
        Ok(run.stages.add_stage(query))
    }

    fn final_stage(
        &self,
        run: &mut Compilation<'_>,
        input: &str,
        windowed: bool,
        limit: Option<u64>,
    ) -> CompileResult<String> {
        let plan = self.plan;
        let root = &plan.nodes[0];
        let empty = empty_struct(self.dialect);
        let tree = JoinTree::new(&empty);
        let mut exprs = ExprCompiler::new(self.dialect, &tree);

        let mut values: HashMap<&str, String> = HashMap::new();
        let mut select: Vec<Option<SelectExpr>> = Vec::with_capacity(root.outputs.len());
        for (name, out) in &root.outputs {
            let column = match out {
                Out::Dim(_) | Out::Agg(_) => column_name(name, 0),
                Out::Nest(child) => column_name(&plan.nodes[*child].name, 0),
                Out::Calc(_) => {
                    select.push(None);
                    continue;
                }
            };
            let sql = self.quote(&column);
            select.push(Some(SelectExpr::aliased(raw(sql.clone()), name)));
            values.insert(name.as_str(), sql);
        }

        exprs.allow_aggregates(false);
        for h in &self.hoisted {
            exprs.set_local(h.column.clone(), self.quote(&h.column));
        }
        for (name, sql) in &values {
            exprs.set_local(*name, sql.clone());
        }

        let ordering = plan.ordering(0)?;
        let order = ordering
            .iter()
            .filter_map(|(name, dir)| values.get(name.as_str()).map(|sql| window_order(sql, *dir)))
            .collect();
        exprs.set_window(Vec::new(), order);
        exprs.allow_analytics(true);
        for (slot, (name, out)) in select.iter_mut().zip(&root.outputs) {
            if let Out::Calc(c) = out {
                let sql = exprs.compile(&root.calcs[*c], &[])?;
                *slot = Some(SelectExpr::aliased(raw(sql), name));
            }
        }
        exprs.allow_analytics(false);

        let mut query = Query::new()
            .select(select.into_iter().flatten().collect::<Vec<SelectExpr>>())
            .from(TableRef::named(input))
            .filter(raw("group_set=0"));
        if let Some(h) = &self.having[0] {
            let sql = if windowed {
                self.quote(&having_column(0))
            } else {
                exprs.compile(h, &[])?
            };
            query = query.filter(raw(sql));
        }
        query = query.order_by(
            ordering
                .into_iter()
                .map(|(name, dir)| OrderByExpr::new(col(&name), sort_dir(dir)))
                .collect(),
        );
        if let Some(n) = limit {
            query = query.limit(n);
        }
        Ok(run.stages.add_stage(query))
    }
}

// =============================================================================
// Project
// =============================================================================

pub(crate) fn compile_project(
    run: &mut Compilation<'_>,
    input: &StructDef,
    stage: Option<&str>,
    segment: &QuerySegment,
    row_limit: Option<u64>,
) -> CompileResult<SegmentOutput> {
    let input = with_extends(input, segment);
    let timezone = segment.timezone.as_deref().or(input.timezone.as_deref());

    let mut values = Vec::with_capacity(segment.fields.len());
    for field in &segment.fields {
        match resolve_output(&input, field)? {
            Resolved::Nest { name, .. } => {
                return Err(CompileError::invalid(format!(
                    "nested view '{}' cannot be used in select",
                    name
                )))
            }
            Resolved::Value(v) if v.kind.is_aggregate() => {
                return Err(CompileError::invalid(format!(
                    "'{}' is an aggregate and cannot be used in select",
                    v.name
                )))
            }
            Resolved::Value(v) => values.push(v),
        }
    }
    let names: Vec<String> = values.iter().map(|v| v.name.clone()).collect();
    let ordering = resolve_ordering(&segment.order_by, &names)?;
    let filters = where_filters(&input, stage, segment);

    let mut tree = JoinTree::new(&input);
    for v in values.iter().filter(|v| !v.kind.is_analytic()) {
        tree.require_expr(&v.expr, &[])?;
    }
    for f in &filters {
        tree.require_expr(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?;
    }

    let mut exprs = ExprCompiler::new(run.dialect, &tree);
    exprs.set_timezone(timezone)?;

    let mut compiled: HashMap<&str, String> = HashMap::new();
    for v in values.iter().filter(|v| !v.kind.is_analytic()) {
        compiled.insert(v.name.as_str(), exprs.compile_scalar(&v.expr, &[])?);
    }
    for (name, sql) in &compiled {
        exprs.set_local(*name, sql.clone());
    }
    let order = ordering
        .iter()
        .filter_map(|(name, dir)| compiled.get(name.as_str()).map(|sql| window_order(sql, *dir)))
        .collect();
    exprs.set_window(Vec::new(), order);
    exprs.allow_analytics(true);
    let mut select = Vec::with_capacity(values.len());
    for v in &values {
        let sql = match compiled.get(v.name.as_str()) {
            Some(sql) => sql.clone(),
            None => exprs.compile(&v.expr, &[])?,
        };
        select.push(SelectExpr::aliased(raw(sql), &v.name));
    }
    exprs.allow_analytics(false);

    let mut conditions = Vec::new();
    for f in &filters {
        conditions.push(exprs.compile_scalar(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?);
    }

    let keys = exprs.keys_needed().clone();
    let sample = if stage.is_none() { segment.sample.as_ref() } else { None };
    let from = run.render_root(&tree, stage, sample, &keys)?;
    let joins = run.render_joins(&tree, &mut exprs)?;

    let mut query = Query::new().select(select).from(from);
    for join in joins {
        query = query.join(join);
    }
    for c in conditions {
        query = query.filter(raw(c));
    }
    query = query.order_by(
        ordering
            .into_iter()
            .map(|(name, dir)| OrderByExpr::new(col(&name), sort_dir(dir)))
            .collect(),
    );
    if let Some(n) = segment.limit.or(row_limit) {
        query = query.limit(n);
    }
    Ok(SegmentOutput {
        stage: run.stages.add_stage(query),
        drill: Vec::new(),
    })
}
