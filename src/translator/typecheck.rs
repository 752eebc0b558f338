//! Expression type checking.
//!
//! Turns an [`ExprAst`] into a model [`Expr`] while computing its value type
//! and expression kind. Errors are plain messages; the caller anchors them to
//! the span of the item being checked. Where an expression may appear
//! (scalar-only places, `aggregate:`, `calculate:`) is checked by the caller
//! against the returned [`ExpressionType`].

use crate::model::time::{parse_date, parse_timestamp, parse_timezone};
use crate::model::{
    AggregateFunc, AnalyticFunc, AtomicType, BinaryOp, CaseWhen, Expr, ExpressionType, FieldDef,
    Literal, StructDef, TimeUnit, UngroupedKind,
};

use super::ast::ExprAst;
use super::functions;

/// A checked expression.
#[derive(Debug, Clone)]
pub struct Typed {
    pub expr: Expr,
    pub ty: AtomicType,
    pub etype: ExpressionType,
    /// The `null` literal, which compares with anything.
    pub is_null: bool,
    /// Set when the value is a truncated time.
    pub timeframe: Option<TimeUnit>,
}

impl Typed {
    fn new(expr: Expr, ty: AtomicType, etype: ExpressionType) -> Self {
        Self {
            expr,
            ty,
            etype,
            is_null: false,
            timeframe: None,
        }
    }
}

/// An output already defined in the segment being checked.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub name: String,
    pub ty: AtomicType,
    pub etype: ExpressionType,
    /// Nested views cannot be used in expressions.
    pub is_nest: bool,
}

/// Names visible to an expression.
pub struct Scope<'a> {
    pub input: &'a StructDef,
    /// Earlier outputs of the segment, visible to `calculate` and `having`.
    pub outputs: &'a [OutputInfo],
    /// Dimensions `all()` / `exclude()` may name.
    pub dimensions: Option<&'a [String]>,
}

impl<'a> Scope<'a> {
    pub fn source(input: &'a StructDef) -> Self {
        Self {
            input,
            outputs: &[],
            dimensions: None,
        }
    }
}

type CheckResult = Result<Typed, String>;

pub fn check(ast: &ExprAst, scope: &Scope<'_>) -> CheckResult {
    match ast {
        ExprAst::Field { path } => check_field(path, scope),
        ExprAst::Number { value } => {
            if value.parse::<f64>().is_err() {
                return Err(format!("'{}' is not a number", value));
            }
            Ok(literal(Literal::Number(value.clone()), AtomicType::Number))
        }
        ExprAst::String { value } => Ok(literal(Literal::String(value.clone()), AtomicType::String)),
        ExprAst::Bool { value } => Ok(literal(Literal::Bool(*value), AtomicType::Boolean)),
        ExprAst::Null => {
            let mut t = literal(Literal::Null, AtomicType::Json);
            t.is_null = true;
            Ok(t)
        }
        ExprAst::Date { value } => {
            parse_date(value).map_err(|e| e.to_string())?;
            Ok(literal(Literal::Date(value.clone()), AtomicType::Date))
        }
        ExprAst::Timestamp { value, timezone } => {
            parse_timestamp(value).map_err(|e| e.to_string())?;
            if let Some(tz) = timezone {
                parse_timezone(tz).map_err(|e| e.to_string())?;
            }
            Ok(literal(
                Literal::Timestamp {
                    value: value.clone(),
                    timezone: timezone.clone(),
                },
                AtomicType::Timestamp,
            ))
        }
        ExprAst::Regex { value } => {
            regex::Regex::new(value).map_err(|e| format!("invalid regular expression: {}", e))?;
            Ok(literal(Literal::Regex(value.clone()), AtomicType::String))
        }
        ExprAst::Binary { op, left, right } => {
            let l = check(left, scope)?;
            let r = check(right, scope)?;
            check_binary(*op, l, r)
        }
        ExprAst::Not { expr } => {
            let e = check(expr, scope)?;
            expect_type(&e, AtomicType::Boolean, "not")?;
            Ok(Typed::new(Expr::Not(Box::new(e.expr)), AtomicType::Boolean, e.etype))
        }
        ExprAst::Neg { expr } => {
            let e = check(expr, scope)?;
            expect_type(&e, AtomicType::Number, "-")?;
            Ok(Typed::new(Expr::Neg(Box::new(e.expr)), AtomicType::Number, e.etype))
        }
        ExprAst::IsNull { expr, negated } => {
            let e = check(expr, scope)?;
            Ok(Typed::new(
                Expr::IsNull {
                    expr: Box::new(e.expr),
                    negated: *negated,
                },
                AtomicType::Boolean,
                e.etype,
            ))
        }
        ExprAst::In {
            expr,
            values,
            negated,
        } => {
            let e = check(expr, scope)?;
            let mut etype = e.etype;
            let mut out = Vec::with_capacity(values.len());
            for v in values {
                let v = check(v, scope)?;
                if !comparable(&e, &v) {
                    return Err(format!("cannot compare {} to {}", e.ty, v.ty));
                }
                etype = etype.combine(v.etype);
                out.push(v.expr);
            }
            Ok(Typed::new(
                Expr::In {
                    expr: Box::new(e.expr),
                    values: out,
                    negated: *negated,
                },
                AtomicType::Boolean,
                etype,
            ))
        }
        ExprAst::Case { whens, otherwise } => check_case(whens, otherwise.as_deref(), scope),
        ExprAst::Cast { expr, to, safe } => {
            let e = check(expr, scope)?;
            Ok(Typed::new(
                Expr::Cast {
                    expr: Box::new(e.expr),
                    to: *to,
                    safe: *safe,
                },
                *to,
                e.etype,
            ))
        }
        ExprAst::Call {
            name,
            args,
            locality,
        } => check_call(name, args, locality, scope),
        ExprAst::Filtered { expr, filters } => {
            let e = check(expr, scope)?;
            if !e.etype.is_aggregate() {
                return Err("only aggregates can be filtered".to_string());
            }
            let mut conds = Vec::with_capacity(filters.len());
            for f in filters {
                let f = check(f, scope)?;
                expect_type(&f, AtomicType::Boolean, "where")?;
                if !f.etype.is_scalar() {
                    return Err("aggregate filters must be scalar conditions".to_string());
                }
                conds.push(f.expr);
            }
            Ok(Typed::new(
                Expr::Filtered {
                    expr: Box::new(e.expr),
                    filters: conds,
                },
                e.ty,
                e.etype,
            ))
        }
        ExprAst::Truncate { expr, unit } => {
            let e = check(expr, scope)?;
            expect_temporal(&e, unit.as_str())?;
            if e.ty == AtomicType::Date && !unit.is_date_unit() {
                return Err(format!("cannot truncate a date to {}", unit));
            }
            let mut t = Typed::new(
                Expr::TimeTrunc {
                    expr: Box::new(e.expr),
                    unit: *unit,
                    base: e.ty,
                },
                e.ty,
                e.etype,
            );
            t.timeframe = Some(*unit);
            Ok(t)
        }
        ExprAst::Extract { expr, unit } => {
            let e = check(expr, scope)?;
            expect_temporal(&e, unit.as_str())?;
            if e.ty == AtomicType::Date && unit.is_time_of_day() {
                return Err(format!("cannot extract {} from a date", unit.as_str()));
            }
            Ok(Typed::new(
                Expr::TimeExtract {
                    expr: Box::new(e.expr),
                    unit: *unit,
                    base: e.ty,
                },
                AtomicType::Number,
                e.etype,
            ))
        }
        ExprAst::Offset {
            expr,
            op,
            amount,
            unit,
        } => {
            let e = check(expr, scope)?;
            expect_temporal(&e, "time offset")?;
            let n = check(amount, scope)?;
            expect_type(&n, AtomicType::Number, "time offset")?;
            if e.ty == AtomicType::Date && !unit.is_date_unit() {
                return Err(format!("cannot offset a date by {}s", unit));
            }
            Ok(Typed::new(
                Expr::TimeOffset {
                    expr: Box::new(e.expr),
                    op: *op,
                    amount: Box::new(n.expr),
                    unit: *unit,
                    base: e.ty,
                },
                e.ty,
                e.etype.combine(n.etype),
            ))
        }
        ExprAst::Diff { unit, from, to } => {
            let f = check(from, scope)?;
            let t = check(to, scope)?;
            expect_temporal(&f, "time difference")?;
            expect_temporal(&t, "time difference")?;
            let base = if f.ty == AtomicType::Timestamp || t.ty == AtomicType::Timestamp {
                AtomicType::Timestamp
            } else {
                AtomicType::Date
            };
            Ok(Typed::new(
                Expr::TimeDiff {
                    unit: *unit,
                    from: Box::new(f.expr),
                    to: Box::new(t.expr),
                    base,
                },
                AtomicType::Number,
                f.etype.combine(t.etype),
            ))
        }
        ExprAst::Now => Ok(Typed::new(Expr::Now, AtomicType::Timestamp, ExpressionType::Scalar)),
    }
}

fn literal(lit: Literal, ty: AtomicType) -> Typed {
    Typed::new(Expr::Literal(lit), ty, ExpressionType::Scalar)
}

fn check_field(path: &[String], scope: &Scope<'_>) -> CheckResult {
    if let [name] = path {
        if let Some(out) = scope.outputs.iter().find(|o| &o.name == name) {
            if out.is_nest {
                return Err(format!("'{}' is a nested view, not a value", name));
            }
            return Ok(Typed::new(Expr::Field { path: path.to_vec() }, out.ty, out.etype));
        }
    }
    match scope.input.lookup(path) {
        Some(FieldDef::Atomic(a)) => {
            let mut t = Typed::new(Expr::Field { path: path.to_vec() }, a.ty, a.expression_type);
            t.timeframe = a.timeframe;
            Ok(t)
        }
        Some(other) => Err(format!(
            "'{}' is a {}, not a value",
            path.join("."),
            other.kind_name()
        )),
        None => Err(format!("'{}' is not defined", path.join("."))),
    }
}

fn expect_type(t: &Typed, ty: AtomicType, context: &str) -> Result<(), String> {
    if t.is_null || t.ty == ty {
        Ok(())
    } else {
        Err(format!("'{}' needs a {}, got {}", context, ty, t.ty))
    }
}

fn expect_temporal(t: &Typed, context: &str) -> Result<(), String> {
    if t.ty.is_temporal() {
        Ok(())
    } else {
        Err(format!("'{}' needs a date or timestamp, got {}", context, t.ty))
    }
}

fn comparable(a: &Typed, b: &Typed) -> bool {
    a.is_null
        || b.is_null
        || a.ty == b.ty
        || (a.ty.is_temporal() && b.ty.is_temporal())
        || a.ty == AtomicType::SqlNative
        || b.ty == AtomicType::SqlNative
}

fn check_binary(op: BinaryOp, l: Typed, r: Typed) -> CheckResult {
    let ty = if op.is_arithmetic() {
        if l.ty.is_temporal() && r.ty.is_temporal() && op == BinaryOp::Sub {
            return Err("subtracting times needs a unit: use seconds(a to b)".to_string());
        }
        for side in [&l, &r] {
            expect_type(side, AtomicType::Number, op.symbol())?;
        }
        AtomicType::Number
    } else if op.is_comparison() {
        if !comparable(&l, &r) {
            return Err(format!("cannot compare {} to {}", l.ty, r.ty));
        }
        AtomicType::Boolean
    } else if op.is_logical() {
        for side in [&l, &r] {
            expect_type(side, AtomicType::Boolean, op.symbol())?;
        }
        AtomicType::Boolean
    } else {
        match op {
            BinaryOp::Like | BinaryOp::NotLike | BinaryOp::Match | BinaryOp::NotMatch => {
                for side in [&l, &r] {
                    expect_type(side, AtomicType::String, op.symbol())?;
                }
                AtomicType::Boolean
            }
            _ => {
                if !comparable(&l, &r) {
                    return Err(format!("'??' needs matching types, got {} and {}", l.ty, r.ty));
                }
                if l.is_null {
                    r.ty
                } else {
                    l.ty
                }
            }
        }
    };
    let etype = l.etype.combine(r.etype);
    Ok(Typed::new(Expr::binary(op, l.expr, r.expr), ty, etype))
}

fn check_case(whens: &[super::ast::WhenAst], otherwise: Option<&ExprAst>, scope: &Scope<'_>) -> CheckResult {
    let mut etype = ExpressionType::Scalar;
    let mut result: Option<Typed> = None;
    let mut arms = Vec::with_capacity(whens.len());
    let unify = |t: &Typed, result: &mut Option<Typed>| -> Result<(), String> {
        match result {
            Some(prev) if !comparable(prev, t) => Err(format!(
                "case branches have different types: {} and {}",
                prev.ty, t.ty
            )),
            Some(prev) if prev.is_null => {
                *result = Some(t.clone());
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                *result = Some(t.clone());
                Ok(())
            }
        }
    };
    for w in whens {
        let cond = check(&w.when, scope)?;
        expect_type(&cond, AtomicType::Boolean, "when")?;
        let then = check(&w.then, scope)?;
        unify(&then, &mut result)?;
        etype = etype.combine(cond.etype).combine(then.etype);
        arms.push(CaseWhen {
            when: cond.expr,
            then: then.expr,
        });
    }
    let otherwise = match otherwise {
        Some(e) => {
            let e = check(e, scope)?;
            unify(&e, &mut result)?;
            etype = etype.combine(e.etype);
            Some(Box::new(e.expr))
        }
        None => None,
    };
    let ty = result.map(|r| r.ty).unwrap_or(AtomicType::Json);
    Ok(Typed::new(
        Expr::Case {
            whens: arms,
            otherwise,
        },
        ty,
        etype,
    ))
}

fn check_call(name: &str, args: &[ExprAst], locality: &[String], scope: &Scope<'_>) -> CheckResult {
    let lower = name.to_ascii_lowercase();
    if let Some(func) = AggregateFunc::from_name(&lower) {
        return check_aggregate(func, args, locality, scope);
    }
    if !locality.is_empty() {
        return Err(format!("'{}' is not an aggregate function", name));
    }
    if lower == "all" || lower == "exclude" {
        let kind = if lower == "all" {
            UngroupedKind::All
        } else {
            UngroupedKind::Exclude
        };
        return check_ungrouped(kind, name, args, scope);
    }
    let checked = args
        .iter()
        .map(|a| check(a, scope))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(func) = AnalyticFunc::from_name(&lower) {
        let (min, max) = func.arity();
        if checked.len() < min || checked.len() > max {
            return Err(format!(
                "'{}' expects {} to {} arguments, got {}",
                name,
                min,
                max,
                checked.len()
            ));
        }
        if checked.iter().any(|a| a.etype.is_analytic()) {
            return Err("analytic functions cannot be nested".to_string());
        }
        let aggregate = checked.iter().any(|a| a.etype.is_aggregate());
        let ty = match func {
            AnalyticFunc::RowNumber | AnalyticFunc::Rank | AnalyticFunc::DenseRank => AtomicType::Number,
            _ => checked[0].ty,
        };
        let etype = if aggregate {
            ExpressionType::AggregateAnalytic
        } else {
            ExpressionType::ScalarAnalytic
        };
        return Ok(Typed::new(
            Expr::Analytic {
                func,
                args: checked.into_iter().map(|a| a.expr).collect(),
            },
            ty,
            etype,
        ));
    }
    let sig = functions::lookup(&lower).ok_or_else(|| format!("unknown function '{}'", name))?;
    let types: Vec<AtomicType> = checked.iter().map(|a| a.ty).collect();
    let ty = sig.check(&types)?;
    let etype = checked
        .iter()
        .fold(ExpressionType::Scalar, |acc, a| acc.combine(a.etype));
    Ok(Typed::new(
        Expr::Function {
            name: lower,
            args: checked.into_iter().map(|a| a.expr).collect(),
        },
        ty,
        etype,
    ))
}

/// Join path of the struct owning a field path, or `None` for the root.
fn join_prefix<'p>(input: &StructDef, path: &'p [String]) -> &'p [String] {
    let mut end = path.len().saturating_sub(1);
    while end > 0 && input.struct_at(&path[..end]).is_none() {
        end -= 1;
    }
    &path[..end]
}

fn check_aggregate(
    func: AggregateFunc,
    args: &[ExprAst],
    locality: &[String],
    scope: &Scope<'_>,
) -> CheckResult {
    if !locality.is_empty() {
        match scope.input.struct_at(locality) {
            Some(_) => {}
            None => return Err(format!("'{}' is not a join", locality.join("."))),
        }
    }
    let arg = match (func, args) {
        (AggregateFunc::Count, []) => None,
        (AggregateFunc::Count, [a]) | (AggregateFunc::CountDistinct, [a]) => Some(check(a, scope)?),
        (AggregateFunc::Count, _) | (AggregateFunc::CountDistinct, _) => {
            return Err(format!("'{}' expects at most 1 argument, got {}", func.as_str(), args.len()));
        }
        (_, [a]) => Some(check(a, scope)?),
        (_, _) => {
            return Err(format!("'{}' expects 1 argument, got {}", func.as_str(), args.len()));
        }
    };
    let func = match (func, &arg) {
        (AggregateFunc::Count, Some(_)) => AggregateFunc::CountDistinct,
        (f, _) => f,
    };
    let ty = match (func, &arg) {
        (AggregateFunc::Min | AggregateFunc::Max, Some(a)) => a.ty,
        _ => AtomicType::Number,
    };
    if let Some(a) = &arg {
        if a.etype.is_aggregate() {
            return Err("aggregate functions cannot be nested".to_string());
        }
        if a.etype.is_analytic() {
            return Err("analytic functions cannot be used inside an aggregate".to_string());
        }
        if matches!(func, AggregateFunc::Sum | AggregateFunc::Avg) {
            expect_type(a, AtomicType::Number, func.as_str())?;
        }
        let prefixes: Vec<&[String]> = a
            .expr
            .field_paths()
            .into_iter()
            .map(|p| join_prefix(scope.input, p))
            .collect();
        for (i, x) in prefixes.iter().enumerate() {
            for y in &prefixes[i + 1..] {
                if !x.starts_with(y) && !y.starts_with(x) {
                    return Err(format!(
                        "aggregate argument uses fields from unrelated joins '{}' and '{}'",
                        x.join("."),
                        y.join(".")
                    ));
                }
            }
        }
    }
    Ok(Typed::new(
        Expr::aggregate(func, arg.map(|a| a.expr), locality.to_vec()),
        ty,
        ExpressionType::Aggregate,
    ))
}

fn check_ungrouped(kind: UngroupedKind, name: &str, args: &[ExprAst], scope: &Scope<'_>) -> CheckResult {
    let (first, rest) = args
        .split_first()
        .ok_or_else(|| format!("'{}' needs an aggregate argument", name))?;
    let inner = check(first, scope)?;
    if !inner.etype.is_aggregate() || inner.etype.is_analytic() {
        return Err(format!("'{}' needs an aggregate argument", name));
    }
    let mut fields = Vec::with_capacity(rest.len());
    for r in rest {
        let field = match r {
            ExprAst::Field { path } if path.len() == 1 => path[0].clone(),
            other => return Err(format!("'{}' expects dimension names, got '{}'", name, other)),
        };
        if let Some(dims) = scope.dimensions {
            if !dims.contains(&field) {
                return Err(format!("'{}' is not a dimension of this query", field));
            }
        }
        fields.push(field);
    }
    Ok(Typed::new(
        Expr::Ungrouped {
            kind,
            expr: Box::new(inner.expr),
            fields,
        },
        inner.ty,
        ExpressionType::UngroupedAggregate,
    ))
}
