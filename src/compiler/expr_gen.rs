//! Lowering of semantic expressions to dialect SQL text.
//!
//! Expressions are compiled against a [`JoinTree`]: field paths resolve to
//! the join that owns them, computed fields expand in place and aggregates
//! pick their symmetric form from the tree's fan-out facts.

use std::collections::{BTreeSet, HashMap};

use crate::model::time::{parse_date, parse_timestamp, parse_timezone, timestamp_to_utc};
use crate::model::{
    AggregateFunc, AnalyticFunc, AtomicType, BinaryOp, Expr, FieldDef, Literal,
};
use crate::sql::dialect::{DialectError, SqlDialect};
use crate::sql::{Expr as SqlExpr, WindowExt, WindowFrame, WindowOrderBy};

use super::error::{CompileError, CompileResult};
use super::join_tree::{JoinTree, DISTINCT_KEY};

/// Definitions deeper than this are treated as circular.
const MAX_DEFINITION_DEPTH: usize = 64;

pub struct ExprCompiler<'t, 'a> {
    dialect: &'static dyn SqlDialect,
    tree: &'t JoinTree<'a>,
    timezone: Option<String>,
    /// Names that compile to fixed SQL: segment outputs and placeholders.
    locals: HashMap<String, String>,
    /// Guards applied to every aggregate input.
    conditions: Vec<String>,
    window_partition: Vec<SqlExpr>,
    window_order: Vec<WindowOrderBy>,
    allow_aggregates: bool,
    allow_analytics: bool,
    depth: usize,
    keys_needed: BTreeSet<usize>,
}

impl<'t, 'a> ExprCompiler<'t, 'a> {
    pub fn new(dialect: &'static dyn SqlDialect, tree: &'t JoinTree<'a>) -> Self {
        Self {
            dialect,
            tree,
            timezone: None,
            locals: HashMap::new(),
            conditions: Vec::new(),
            window_partition: Vec::new(),
            window_order: Vec::new(),
            allow_aggregates: true,
            allow_analytics: false,
            depth: 0,
            keys_needed: BTreeSet::new(),
        }
    }

    pub fn dialect(&self) -> &'static dyn SqlDialect {
        self.dialect
    }

    pub fn tree(&self) -> &'t JoinTree<'a> {
        self.tree
    }

    /// Zone used for truncation, extraction and zone-less timestamp literals.
    /// UTC needs no conversion and is stored as `None`.
    pub fn set_timezone(&mut self, tz: Option<&str>) -> CompileResult<()> {
        self.timezone = match tz {
            Some(name) => {
                parse_timezone(name)?;
                (name != "UTC").then(|| name.to_string())
            }
            None => None,
        };
        Ok(())
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn set_local(&mut self, name: impl Into<String>, sql: impl Into<String>) {
        self.locals.insert(name.into(), sql.into());
    }

    pub fn clear_locals(&mut self) {
        self.locals.clear();
    }

    pub fn push_condition(&mut self, sql: impl Into<String>) {
        self.conditions.push(sql.into());
    }

    pub fn pop_condition(&mut self) {
        self.conditions.pop();
    }

    pub fn set_window(&mut self, partition: Vec<SqlExpr>, order: Vec<WindowOrderBy>) {
        self.window_partition = partition;
        self.window_order = order;
    }

    pub fn allow_aggregates(&mut self, allow: bool) {
        self.allow_aggregates = allow;
    }

    pub fn allow_analytics(&mut self, allow: bool) {
        self.allow_analytics = allow;
    }

    /// Tables that must be wrapped with a generated distinct key column.
    pub fn keys_needed(&self) -> &BTreeSet<usize> {
        &self.keys_needed
    }

    /// Compile a scalar condition such as a `where` filter.
    pub fn compile_scalar(&mut self, expr: &Expr, prefix: &[String]) -> CompileResult<String> {
        let saved = self.allow_aggregates;
        self.allow_aggregates = false;
        let out = self.compile(expr, prefix);
        self.allow_aggregates = saved;
        out
    }

    pub fn compile(&mut self, expr: &Expr, prefix: &[String]) -> CompileResult<String> {
        match expr {
            Expr::Field { path } => self.compile_path(path, prefix),
            Expr::Literal(lit) => self.compile_literal(lit),
            Expr::Binary { op, left, right } => self.compile_binary(*op, left, right, prefix),
            Expr::Not(e) => Ok(format!("NOT ({})", self.compile(e, prefix)?)),
            Expr::Neg(e) => Ok(format!("-({})", self.compile(e, prefix)?)),
            Expr::IsNull { expr, negated } => {
                let e = self.compile(expr, prefix)?;
                let kw = if *negated { "IS NOT NULL" } else { "IS NULL" };
                Ok(format!("({}) {}", e, kw))
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                if values.is_empty() {
                    return Ok(self.dialect.format_bool(*negated).to_string());
                }
                let e = self.compile(expr, prefix)?;
                let vals = values
                    .iter()
                    .map(|v| self.compile(v, prefix))
                    .collect::<CompileResult<Vec<_>>>()?;
                let kw = if *negated { "NOT IN" } else { "IN" };
                Ok(format!("{} {} ({})", e, kw, vals.join(", ")))
            }
            Expr::Case { whens, otherwise } => {
                let mut sql = String::from("CASE");
                for w in whens {
                    let cond = self.compile(&w.when, prefix)?;
                    let then = self.compile(&w.then, prefix)?;
                    sql.push_str(&format!(" WHEN {} THEN {}", cond, then));
                }
                if let Some(e) = otherwise {
                    sql.push_str(&format!(" ELSE {}", self.compile(e, prefix)?));
                }
                sql.push_str(" END");
                Ok(sql)
            }
            Expr::Cast { expr, to, safe } => {
                let e = self.compile(expr, prefix)?;
                Ok(self.dialect.sql_cast(&e, *to, *safe)?)
            }
            Expr::Function { name, args } => {
                let args = args
                    .iter()
                    .map(|a| self.compile(a, prefix))
                    .collect::<CompileResult<Vec<_>>>()?;
                if let Some(sql) = self.dialect.sql_function(name, &args) {
                    return Ok(sql);
                }
                let name = match self.dialect.remap_function(name) {
                    Some(remapped) => remapped.to_string(),
                    None => name.to_uppercase(),
                };
                Ok(format!("{}({})", name, args.join(", ")))
            }
            Expr::Aggregate {
                func,
                expr,
                locality,
            } => self.compile_aggregate(*func, expr.as_deref(), locality, prefix),
            Expr::Filtered { expr, filters } => {
                let mut conds = Vec::with_capacity(filters.len());
                for f in filters {
                    conds.push(self.compile_scalar(f, prefix)?);
                }
                let pushed = conds.len();
                for c in conds {
                    self.conditions.push(c);
                }
                let out = self.compile(expr, prefix);
                self.conditions.truncate(self.conditions.len() - pushed);
                out
            }
            Expr::Ungrouped { .. } => Err(CompileError::invalid(
                "all() and exclude() may only appear in the output of a reduce",
            )),
            Expr::Analytic { func, args } => self.compile_analytic(*func, args, prefix),
            Expr::TimeTrunc { expr, unit, base } => {
                let e = self.compile(expr, prefix)?;
                let tz = self.zone_for(*base);
                Ok(self.dialect.sql_truncate(&e, *base, *unit, tz))
            }
            Expr::TimeExtract { expr, unit, base } => {
                let e = self.compile(expr, prefix)?;
                let tz = self.zone_for(*base);
                Ok(self.dialect.sql_extract(&e, *base, *unit, tz))
            }
            Expr::TimeOffset {
                expr,
                op,
                amount,
                unit,
                base,
            } => {
                let e = self.compile(expr, prefix)?;
                let n = self.compile(amount, prefix)?;
                Ok(self.dialect.sql_time_offset(&e, *base, *op, &n, *unit))
            }
            Expr::TimeDiff {
                unit,
                from,
                to,
                base,
            } => {
                let f = self.compile(from, prefix)?;
                let t = self.compile(to, prefix)?;
                Ok(self.dialect.sql_time_diff(*unit, &f, &t, *base))
            }
            Expr::Now => Ok(self.dialect.sql_now()),
        }
    }

    fn zone_for(&self, base: AtomicType) -> Option<&str> {
        match base {
            AtomicType::Timestamp => self.timezone.as_deref(),
            _ => None,
        }
    }

    fn compile_path(&mut self, path: &[String], prefix: &[String]) -> CompileResult<String> {
        if let ([name], []) = (path, prefix) {
            if let Some(sql) = self.locals.get(name) {
                return Ok(sql.clone());
            }
        }
        let full: Vec<String> = prefix.iter().chain(path).cloned().collect();
        let (node, field) = self.tree.resolve_field(&full)?;
        match field {
            FieldDef::Atomic(atomic) => match &atomic.expr {
                Some(def) => {
                    if atomic.is_measure() && !self.allow_aggregates {
                        return Err(CompileError::invalid(format!(
                            "measure '{}' cannot be used here",
                            full.join(".")
                        )));
                    }
                    if self.depth >= MAX_DEFINITION_DEPTH {
                        return Err(CompileError::invalid(format!(
                            "definition of '{}' refers to itself",
                            full.join(".")
                        )));
                    }
                    let owner = self.tree.node(node).path.clone();
                    self.depth += 1;
                    let out = self.compile(def, &owner);
                    self.depth -= 1;
                    out
                }
                None => Ok(self.column_ref(node, &atomic.name, atomic.ty)),
            },
            FieldDef::Struct(_) => Err(CompileError::NotAValue {
                name: full.join("."),
                kind: "join",
            }),
            FieldDef::Turtle(_) => Err(CompileError::NotAValue {
                name: full.join("."),
                kind: "view",
            }),
        }
    }

    /// SQL for a physical column of node `node`.
    pub fn column_ref(&self, node: usize, name: &str, ty: AtomicType) -> String {
        let n = self.tree.node(node);
        self.dialect.sql_field_reference(
            &self.tree.row_ref(node, self.dialect),
            n.parent_kind(),
            name,
            ty,
        )
    }

    fn compile_literal(&self, lit: &Literal) -> CompileResult<String> {
        Ok(match lit {
            Literal::Number(text) => self.dialect.sql_number_literal(text),
            Literal::String(s) | Literal::Regex(s) => self.dialect.sql_string_literal(s),
            Literal::Bool(b) => self.dialect.format_bool(*b).to_string(),
            Literal::Null => "NULL".to_string(),
            Literal::Date(text) => {
                parse_date(text)?;
                self.dialect.sql_date_literal(text)
            }
            Literal::Timestamp { value, timezone } => {
                let zone = timezone.as_deref().or(self.timezone.as_deref());
                let utc = match zone {
                    Some(tz) => timestamp_to_utc(value, tz)?,
                    None => parse_timestamp(value)?
                        .format(crate::model::time::TIMESTAMP_SQL_FORMAT)
                        .to_string(),
                };
                self.dialect.sql_timestamp_literal(&utc)
            }
        })
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        prefix: &[String],
    ) -> CompileResult<String> {
        if matches!(right, Expr::Literal(Literal::Null)) && matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let l = self.compile(left, prefix)?;
            let kw = if op == BinaryOp::Eq { "IS NULL" } else { "IS NOT NULL" };
            return Ok(format!("({}) {}", l, kw));
        }
        let l = self.compile(left, prefix)?;
        let r = self.compile(right, prefix)?;
        let symbol = match op {
            BinaryOp::Mod => return Ok(format!("MOD({}, {})", l, r)),
            BinaryOp::Coalesce => return Ok(format!("COALESCE({}, {})", l, r)),
            BinaryOp::Match => return Ok(self.dialect.sql_regexp_match(&l, &r)),
            BinaryOp::NotMatch => return Ok(format!("NOT ({})", self.dialect.sql_regexp_match(&l, &r))),
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Like => "LIKE",
            BinaryOp::NotLike => "NOT LIKE",
        };
        Ok(format!("({} {} {})", l, symbol, r))
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    fn compile_aggregate(
        &mut self,
        func: AggregateFunc,
        arg: Option<&Expr>,
        locality: &[String],
        prefix: &[String],
    ) -> CompileResult<String> {
        if !self.allow_aggregates {
            return Err(CompileError::invalid(format!(
                "{}() cannot be used here",
                func.as_str()
            )));
        }
        let node = self.locality_node(arg, locality, prefix)?;

        self.allow_aggregates = false;
        let value = arg.map(|a| self.compile(a, prefix)).transpose();
        self.allow_aggregates = true;
        let value = value?;

        let distinct = match func {
            AggregateFunc::Count => node != 0 || self.tree.needs_distinct_key(node),
            AggregateFunc::Sum | AggregateFunc::Avg => self.tree.needs_distinct_key(node),
            _ => false,
        };
        let required = |v: Option<String>| {
            v.ok_or_else(|| CompileError::invalid(format!("{}() needs an argument", func.as_str())))
        };

        Ok(match func {
            AggregateFunc::Count if distinct => {
                let key = self.distinct_key(node)?;
                let key = match value {
                    Some(v) => format!("CASE WHEN {} IS NOT NULL THEN {} END", v, key),
                    None => key,
                };
                self.dialect.sql_count_distinct_key(&self.guard(&key))
            }
            AggregateFunc::Count => match value {
                Some(v) => format!("COUNT({})", self.guard(&v)),
                None if self.conditions.is_empty() => "COUNT(1)".to_string(),
                None => format!("COUNT({})", self.guard("1")),
            },
            AggregateFunc::CountDistinct => {
                format!("COUNT(DISTINCT {})", self.guard(&required(value)?))
            }
            AggregateFunc::Sum | AggregateFunc::Avg if distinct => {
                let v = required(value)?;
                let key = self.distinct_key(node)?;
                self.dialect.sql_sum_distinct(
                    &self.guard(&key),
                    &self.guard(&v),
                    func == AggregateFunc::Avg,
                )
            }
            AggregateFunc::Sum => format!("SUM({})", self.guard(&required(value)?)),
            AggregateFunc::Avg => format!("AVG({})", self.guard(&required(value)?)),
            AggregateFunc::Min => format!("MIN({})", self.guard(&required(value)?)),
            AggregateFunc::Max => format!("MAX({})", self.guard(&required(value)?)),
        })
    }

    /// `CASE WHEN <conditions> THEN value END`, or the value when unguarded.
    fn guard(&self, value: &str) -> String {
        if self.conditions.is_empty() {
            value.to_string()
        } else {
            format!(
                "CASE WHEN {} THEN {} END",
                self.conditions.join(" AND "),
                value
            )
        }
    }

    /// The join whose rows an aggregate counts: the explicit locality, else
    /// the deepest join shared by every field the argument reads.
    fn locality_node(
        &self,
        arg: Option<&Expr>,
        locality: &[String],
        prefix: &[String],
    ) -> CompileResult<usize> {
        let path: Vec<String> = if !locality.is_empty() {
            prefix.iter().chain(locality).cloned().collect()
        } else {
            let mut common: Option<Vec<String>> = None;
            if let Some(arg) = arg {
                for field in arg.field_paths() {
                    if let ([name], []) = (field, prefix) {
                        if self.locals.contains_key(name) {
                            continue;
                        }
                    }
                    let full: Vec<String> = prefix.iter().chain(field).cloned().collect();
                    let (node, _) = self.tree.resolve_field(&full)?;
                    let joins = self.tree.node(node).path.clone();
                    common = Some(match common {
                        None => joins,
                        Some(c) => c
                            .iter()
                            .zip(&joins)
                            .take_while(|(a, b)| a == b)
                            .map(|(a, _)| a.clone())
                            .collect(),
                    });
                }
            }
            common.unwrap_or_else(|| prefix.to_vec())
        };
        self.tree
            .find(&path)
            .ok_or_else(|| CompileError::UnknownField(path.join(".")))
    }

    fn distinct_key(&mut self, node: usize) -> CompileResult<String> {
        let n = self.tree.node(node);
        if n.is_record() {
            if let Some(parent) = n.parent {
                return self.distinct_key(parent);
            }
        }
        if n.def.is_array() {
            return Err(DialectError::Unsupported {
                dialect: self.dialect.name(),
                feature: "symmetric aggregates over unnested arrays",
            }
            .into());
        }
        match &n.def.primary_key {
            Some(pk) => {
                let ty = n
                    .def
                    .field(pk)
                    .and_then(FieldDef::as_atomic)
                    .map(|a| a.ty)
                    .unwrap_or(AtomicType::String);
                Ok(self.column_ref(node, pk, ty))
            }
            None => {
                self.keys_needed.insert(node);
                Ok(format!(
                    "{}.{}",
                    self.dialect.quote_identifier(&n.alias),
                    self.dialect.quote_identifier(DISTINCT_KEY)
                ))
            }
        }
    }

    // =========================================================================
    // Analytics
    // =========================================================================

    fn compile_analytic(
        &mut self,
        func: AnalyticFunc,
        args: &[Expr],
        prefix: &[String],
    ) -> CompileResult<String> {
        if !self.allow_analytics {
            return Err(CompileError::invalid(format!(
                "{}() may only be used in calculate",
                func.sql_name().to_lowercase()
            )));
        }
        self.allow_analytics = false;
        let compiled = args
            .iter()
            .map(|a| self.compile(a, prefix))
            .collect::<CompileResult<Vec<_>>>();
        self.allow_analytics = true;
        let compiled = compiled?;

        let call = SqlExpr::Raw(format!("{}({})", func.sql_name(), compiled.join(", ")));
        let mut window = call
            .over()
            .partition_by(self.window_partition.clone())
            .order_by(self.window_order.clone());
        if matches!(func, AnalyticFunc::FirstValue | AnalyticFunc::LastValue) {
            window = window.frame(WindowFrame::rows_entire_partition());
        }
        Ok(window.build().to_sql(self.dialect))
    }
}
