//! Search-index segments.
//!
//! One group set per indexed field. String fields contribute one row per
//! distinct value; other fields contribute a single `min to max` range.

use crate::model::{AggregateFunc, AtomicType, Expr, FieldDef, IndexSegment, StructDef};
use crate::sql::{col, Expr as SqlExpr, Join, OrderByExpr, Query, SelectExpr, SortDir, TableRef};

use super::error::{CompileError, CompileResult};
use super::expr_gen::ExprCompiler;
use super::join_tree::JoinTree;
use super::{Compilation, SegmentOutput};

struct IndexedField {
    path: Vec<String>,
    ty: AtomicType,
}

/// Scalar dimensions of the input, in declaration order.
fn default_fields(input: &StructDef) -> Vec<Vec<String>> {
    input
        .fields
        .iter()
        .filter_map(FieldDef::as_atomic)
        .filter(|a| {
            a.expression_type.is_scalar() && !matches!(a.ty, AtomicType::Json | AtomicType::SqlNative)
        })
        .map(|a| vec![a.name.clone()])
        .collect()
}

fn resolve_fields(input: &StructDef, segment: &IndexSegment) -> CompileResult<Vec<IndexedField>> {
    let paths = if segment.fields.is_empty() {
        default_fields(input)
    } else {
        segment.fields.clone()
    };
    if paths.is_empty() {
        return Err(CompileError::invalid("index has no fields to index"));
    }
    paths
        .into_iter()
        .map(|path| match input.lookup(&path) {
            Some(FieldDef::Atomic(a)) if a.is_measure() => Err(CompileError::invalid(format!(
                "cannot index measure '{}'",
                path.join(".")
            ))),
            Some(FieldDef::Atomic(a)) => Ok(IndexedField { ty: a.ty, path }),
            Some(other) => Err(CompileError::NotAValue {
                name: path.join("."),
                kind: other.kind_name(),
            }),
            None => Err(CompileError::UnknownField(path.join("."))),
        })
        .collect()
}

fn raw(sql: impl Into<String>) -> SqlExpr {
    SqlExpr::Raw(sql.into())
}

/// `CASE group_set WHEN i THEN v_i ... END`, or `NULL` when empty.
fn case_by_set(arms: &[(usize, String)]) -> String {
    if arms.is_empty() {
        return "NULL".to_string();
    }
    let whens: String = arms
        .iter()
        .map(|(set, value)| format!(" WHEN {} THEN {}", set, value))
        .collect();
    format!("CASE group_set{} END", whens)
}

pub(crate) fn compile_index(
    run: &mut Compilation<'_>,
    input: &StructDef,
    stage: Option<&str>,
    segment: &IndexSegment,
) -> CompileResult<SegmentOutput> {
    let dialect = run.dialect;
    let fields = resolve_fields(input, segment)?;
    let weight = match &segment.weight_measure {
        Some(name) => Expr::field(&[name.as_str()]),
        None => Expr::aggregate(AggregateFunc::Count, None, Vec::new()),
    };
    let filters: Vec<_> = if stage.is_none() {
        input.filters.iter().chain(&segment.filters).collect()
    } else {
        segment.filters.iter().collect()
    };

    let mut tree = JoinTree::new(input);
    for f in &fields {
        tree.require_field(&f.path)?;
    }
    tree.require_expr(&weight, &[])?;
    for f in &filters {
        tree.require_expr(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?;
    }

    let mut exprs = ExprCompiler::new(dialect, &tree);
    exprs.set_timezone(input.timezone.as_deref())?;

    let mut names = Vec::new();
    let mut paths = Vec::new();
    let mut types = Vec::new();
    let mut values = Vec::new();
    let mut ranges = Vec::new();
    for (set, f) in fields.iter().enumerate() {
        let sql = exprs.compile_scalar(&Expr::Field { path: f.path.clone() }, &[])?;
        let leaf = f.path.last().map(String::as_str).unwrap_or_default();
        names.push((set, dialect.sql_string_literal(leaf)));
        paths.push((set, dialect.sql_string_literal(&f.path.join("."))));
        types.push((set, dialect.sql_string_literal(f.ty.as_str())));
        if f.ty == AtomicType::String {
            values.push((set, sql));
        } else {
            let low = dialect.sql_cast(&format!("MIN({})", sql), AtomicType::String, false)?;
            let high = dialect.sql_cast(&format!("MAX({})", sql), AtomicType::String, false)?;
            ranges.push((set, format!("CONCAT({}, ' to ', {})", low, high)));
        }
    }
    let weight_sql = exprs.compile(&weight, &[])?;

    let mut conditions = Vec::new();
    for f in &filters {
        conditions.push(exprs.compile_scalar(&f.expr, &[]).map_err(|e| e.with_code(&f.code))?);
    }

    let keys = exprs.keys_needed().clone();
    let sample = if stage.is_none() { segment.sample.as_ref() } else { None };
    let from = run.render_root(&tree, stage, sample, &keys)?;
    let mut joins = run.render_joins(&tree, &mut exprs)?;
    joins.push(Join::Raw(dialect.sql_group_set_table(fields.len() - 1)));

    let mut grouping = Query::new()
        .select(vec![
            SelectExpr::new(raw("group_set")),
            SelectExpr::aliased(raw(case_by_set(&names)), "fieldName"),
            SelectExpr::aliased(raw(case_by_set(&paths)), "fieldPath"),
            SelectExpr::aliased(raw(case_by_set(&types)), "fieldType"),
            SelectExpr::aliased(raw(case_by_set(&values)), "fieldValue"),
            SelectExpr::aliased(raw(weight_sql), "weight"),
            SelectExpr::aliased(raw(case_by_set(&ranges)), "fieldRange"),
        ])
        .from(from);
    for join in joins {
        grouping = grouping.join(join);
    }
    for c in conditions {
        grouping = grouping.filter(raw(c));
    }
    grouping = grouping.group_by((1..=5).map(|i| raw(i.to_string())).collect());
    let grouped = run.stages.add_stage(grouping);

    let mut ranked = Query::new()
        .select(vec![
            SelectExpr::new(col("fieldName")),
            SelectExpr::new(col("fieldPath")),
            SelectExpr::new(col("fieldType")),
            SelectExpr::aliased(
                raw(format!(
                    "COALESCE({}, {})",
                    dialect.quote_identifier("fieldValue"),
                    dialect.quote_identifier("fieldRange")
                )),
                "fieldValue",
            ),
            SelectExpr::new(col("weight")),
        ])
        .from(TableRef::named(&grouped))
        .order_by(vec![OrderByExpr::new(col("weight"), SortDir::Desc)]);
    if let Some(n) = segment.limit {
        ranked = ranked.limit(n);
    }
    Ok(SegmentOutput {
        stage: run.stages.add_stage(ranked),
        drill: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::QueryCompiler;
    use crate::model::{
        AtomicField, ExpressionType, ModelDef, NamedObject, PipeSegment, Query as ModelQuery, SourceRef,
    };

    fn model() -> ModelDef {
        let flights = StructDef::table("flights", "faa.flights", "duckdb", "duck")
            .column("carrier", AtomicType::String)
            .column("distance", AtomicType::Number)
            .field_def(FieldDef::Atomic(AtomicField::computed(
                "total_distance",
                AtomicType::Number,
                Expr::aggregate(AggregateFunc::Sum, Some(Expr::field(&["distance"])), vec![]),
                ExpressionType::Aggregate,
            )));
        let mut model = ModelDef::new("file:///t.json");
        model
            .contents
            .insert("flights".into(), NamedObject::Source(flights));
        model
    }

    fn compile(segment: IndexSegment) -> CompileResult<String> {
        let model = model();
        let query = ModelQuery::new(
            SourceRef::Named("flights".into()),
            vec![PipeSegment::Index(segment)],
        );
        QueryCompiler::new(&model).compile(&query).map(|c| c.sql)
    }

    #[test]
    fn test_default_fields_skip_measures() {
        let sql = compile(IndexSegment::default()).unwrap();
        println!("{}", sql);
        assert!(sql.contains("GENERATE_SERIES(0,1,1)"));
        assert!(sql.contains("CASE group_set WHEN 0 THEN 'carrier' WHEN 1 THEN 'distance' END AS \"fieldName\""));
        assert!(sql.contains("CASE group_set WHEN 0 THEN \"base\".\"carrier\" END AS \"fieldValue\""));
        assert!(sql.contains("' to '"));
        assert!(sql.contains("COUNT(1) AS \"weight\""));
        assert!(sql.contains("ORDER BY \"weight\" DESC"));
        assert!(!sql.contains("total_distance"));
    }

    #[test]
    fn test_weight_measure() {
        let sql = compile(IndexSegment {
            fields: vec![vec!["carrier".into()]],
            weight_measure: Some("total_distance".into()),
            limit: Some(100),
            ..Default::default()
        })
        .unwrap();
        assert!(sql.contains("SUM(\"base\".\"distance\") AS \"weight\""));
        assert!(sql.contains("AS \"fieldRange\""));
        assert!(sql.ends_with("LIMIT 100"));
    }

    #[test]
    fn test_cannot_index_measure() {
        let err = compile(IndexSegment {
            fields: vec![vec!["total_distance".into()]],
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("total_distance"));
    }
}
