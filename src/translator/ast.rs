//! Document AST.
//!
//! This is the annotated syntax tree a [`DocumentParser`](super::DocumentParser)
//! produces. Statements, properties and query items carry the byte span they
//! were parsed from; diagnostics point there. The tree derives serde so the
//! bundled parser can read it as JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diagnostics::Span;
use crate::model::{
    AtomicType, BinaryOp, ExtractUnit, JoinKind, JoinRelationship, OffsetOp, OrderBy, PersistSpec,
    Sampling, TimeUnit,
};

// =============================================================================
// Spans
// =============================================================================

/// A node with the source range it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self {
            node,
            span: Some(span),
        }
    }

    /// A node with no source location, e.g. one built in code.
    pub fn bare(node: T) -> Self {
        Self { node, span: None }
    }
}

// =============================================================================
// Statements
// =============================================================================

/// A parsed document: its statements in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub statements: Vec<Spanned<Statement>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    /// `import "url"`
    Import { url: String },
    /// `source: name is ...`
    Source { name: String, source: SourceExpr },
    /// `query: name is ...`, optionally annotated `#@ persist`.
    Query {
        name: String,
        query: QueryExpr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persist: Option<PersistSpec>,
    },
    /// `run: ...`
    Run { query: QueryExpr },
}

// =============================================================================
// Sources
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceExpr {
    /// `connection.table('path')`
    Table { connection: String, path: String },
    /// `connection.sql("""...""")`; parts may embed queries.
    Sql {
        connection: String,
        parts: Vec<SqlPart>,
    },
    /// A source or query defined elsewhere.
    Named { name: String },
    /// A query used as a source.
    Query { query: Box<QueryExpr> },
    /// `compose(a, b, ...)`
    Composite { sources: Vec<SourceExpr> },
    /// `base extend { ... }`
    Extend {
        base: Box<SourceExpr>,
        properties: Vec<Spanned<SourceProperty>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SqlPart {
    Text { text: String },
    Query { query: QueryExpr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceProperty {
    Dimension { name: String, expr: ExprAst },
    Measure { name: String, expr: ExprAst },
    Join {
        name: String,
        source: SourceExpr,
        relationship: JoinRelationship,
        #[serde(default)]
        join_type: JoinKind,
        /// `on` condition, relative to the declaring source.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on: Option<ExprAst>,
        /// `with` foreign key: equal to the joined source's primary key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        with: Option<ExprAst>,
    },
    Where { filter: ExprAst },
    PrimaryKey { name: String },
    View { name: String, pipeline: Vec<SegmentAst> },
    Timezone { name: String },
}

// =============================================================================
// Queries
// =============================================================================

/// A source (or named query) followed by pipeline segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExpr {
    pub source: SourceExpr,
    #[serde(default)]
    pub segments: Vec<SegmentAst>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentAst {
    /// A view of the input, by name.
    View { name: String },
    Body { items: Vec<Spanned<SegmentItem>> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentItem {
    GroupBy { fields: Vec<FieldItem> },
    Aggregate { fields: Vec<FieldItem> },
    Select { fields: Vec<FieldItem> },
    Calculate { fields: Vec<FieldItem> },
    Nest { nests: Vec<NestItem> },
    Where { filters: Vec<ExprAst> },
    Having { filters: Vec<ExprAst> },
    OrderBy { items: Vec<OrderBy> },
    Limit { limit: u64 },
    Sample { sample: Sampling },
    /// `index: a, b.c` with an optional `by` weight measure. An empty field
    /// list indexes every scalar dimension.
    Index {
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },
    Timezone { name: String },
    /// Dimensions and measures local to this segment.
    Extend { properties: Vec<Spanned<SourceProperty>> },
}

/// An output field: a reference (`carrier`) or a definition
/// (`n is count()`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub expr: ExprAst,
}

impl FieldItem {
    pub fn reference(path: &[&str]) -> Self {
        Self {
            name: None,
            expr: ExprAst::field(path),
        }
    }

    pub fn define(name: &str, expr: ExprAst) -> Self {
        Self {
            name: Some(name.to_string()),
            expr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NestItem {
    /// `nest: by_origin`
    View { name: String },
    /// `nest: name is { ... }`
    Inline {
        name: String,
        pipeline: Vec<SegmentAst>,
    },
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExprAst {
    Field { path: Vec<String> },
    Number { value: String },
    String { value: String },
    Bool { value: bool },
    Null,
    /// `@2020-01-01`
    Date { value: String },
    /// `@2020-01-01 10:00:00`, optionally in a named zone.
    Timestamp {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// `r'...'`
    Regex { value: String },
    Binary {
        op: BinaryOp,
        left: Box<ExprAst>,
        right: Box<ExprAst>,
    },
    Not { expr: Box<ExprAst> },
    Neg { expr: Box<ExprAst> },
    IsNull {
        expr: Box<ExprAst>,
        #[serde(default)]
        negated: bool,
    },
    In {
        expr: Box<ExprAst>,
        values: Vec<ExprAst>,
        #[serde(default)]
        negated: bool,
    },
    Case {
        whens: Vec<WhenAst>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<ExprAst>>,
    },
    Cast {
        expr: Box<ExprAst>,
        to: AtomicType,
        #[serde(default)]
        safe: bool,
    },
    /// Function call: aggregate, analytic, `all`/`exclude`, or scalar.
    /// `locality` is the join path of `path.count()` style calls.
    Call {
        name: String,
        #[serde(default)]
        args: Vec<ExprAst>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        locality: Vec<String>,
    },
    /// `agg { where: ... }`
    Filtered {
        expr: Box<ExprAst>,
        filters: Vec<ExprAst>,
    },
    /// `expr.month`
    Truncate { expr: Box<ExprAst>, unit: TimeUnit },
    /// `month(expr)`
    Extract { expr: Box<ExprAst>, unit: ExtractUnit },
    /// `expr + 3 days`
    Offset {
        expr: Box<ExprAst>,
        op: OffsetOp,
        amount: Box<ExprAst>,
        unit: TimeUnit,
    },
    /// `days(a to b)`
    Diff {
        unit: TimeUnit,
        from: Box<ExprAst>,
        to: Box<ExprAst>,
    },
    Now,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenAst {
    pub when: ExprAst,
    pub then: ExprAst,
}

impl ExprAst {
    pub fn field(path: &[&str]) -> Self {
        ExprAst::Field {
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn number(text: &str) -> Self {
        ExprAst::Number {
            value: text.to_string(),
        }
    }

    pub fn string(text: &str) -> Self {
        ExprAst::String {
            value: text.to_string(),
        }
    }

    pub fn call(name: &str, args: Vec<ExprAst>) -> Self {
        ExprAst::Call {
            name: name.to_string(),
            args,
            locality: Vec::new(),
        }
    }

    pub fn binary(op: BinaryOp, left: ExprAst, right: ExprAst) -> Self {
        ExprAst::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

// =============================================================================
// Source text
// =============================================================================

fn write_list(f: &mut fmt::Formatter<'_>, items: &[ExprAst]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Renders an expression back as query-language text. Filters keep this as
/// their `code` so drill-through can replay them.
impl fmt::Display for ExprAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprAst::Field { path } => f.write_str(&path.join(".")),
            ExprAst::Number { value } => f.write_str(value),
            ExprAst::String { value } => {
                write!(f, "'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            ExprAst::Bool { value } => write!(f, "{}", value),
            ExprAst::Null => f.write_str("null"),
            ExprAst::Date { value } => write!(f, "@{}", value),
            ExprAst::Timestamp { value, timezone } => match timezone {
                Some(tz) => write!(f, "@{}[{}]", value, tz),
                None => write!(f, "@{}", value),
            },
            ExprAst::Regex { value } => write!(f, "r'{}'", value),
            ExprAst::Binary { op, left, right } => {
                let symbol = match op {
                    BinaryOp::Match => "~",
                    BinaryOp::NotMatch => "!~",
                    other => other.symbol(),
                };
                write!(f, "{} {} {}", left, symbol, right)
            }
            ExprAst::Not { expr } => write!(f, "not {}", expr),
            ExprAst::Neg { expr } => write!(f, "-{}", expr),
            ExprAst::IsNull { expr, negated } => {
                if *negated {
                    write!(f, "{} != null", expr)
                } else {
                    write!(f, "{} = null", expr)
                }
            }
            ExprAst::In {
                expr,
                values,
                negated,
            } => {
                write!(f, "{} {}in (", expr, if *negated { "not " } else { "" })?;
                write_list(f, values)?;
                f.write_str(")")
            }
            ExprAst::Case { whens, otherwise } => {
                f.write_str("case")?;
                for w in whens {
                    write!(f, " when {} then {}", w.when, w.then)?;
                }
                if let Some(e) = otherwise {
                    write!(f, " else {}", e)?;
                }
                f.write_str(" end")
            }
            ExprAst::Cast { expr, to, safe } => {
                write!(f, "{}::{}{}", expr, if *safe { ":" } else { "" }, to)
            }
            ExprAst::Call {
                name,
                args,
                locality,
            } => {
                if !locality.is_empty() {
                    write!(f, "{}.", locality.join("."))?;
                }
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                f.write_str(")")
            }
            ExprAst::Filtered { expr, filters } => {
                write!(f, "{} {{ where: ", expr)?;
                write_list(f, filters)?;
                f.write_str(" }")
            }
            ExprAst::Truncate { expr, unit } => write!(f, "{}.{}", expr, unit),
            ExprAst::Extract { expr, unit } => write!(f, "{}({})", unit.as_str(), expr),
            ExprAst::Offset {
                expr,
                op,
                amount,
                unit,
            } => {
                let sign = match op {
                    OffsetOp::Add => "+",
                    OffsetOp::Sub => "-",
                };
                write!(f, "{} {} {} {}s", expr, sign, amount, unit)
            }
            ExprAst::Diff { unit, from, to } => write!(f, "{}s({} to {})", unit, from, to),
            ExprAst::Now => f.write_str("now"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_from_json() {
        let text = r#"{
            "statements": [
                {"node": {"type": "import", "url": "common.json"}, "span": {"start": 0, "end": 20}},
                {"node": {"type": "source", "name": "flights",
                          "source": {"type": "table", "connection": "duck", "path": "flights.parquet"}}}
            ]
        }"#;
        let doc: Document = serde_json::from_str(text).unwrap();
        assert_eq!(doc.statements.len(), 2);
        assert_eq!(doc.statements[0].span, Some(0..20));
        assert!(matches!(
            &doc.statements[1].node,
            Statement::Source { name, .. } if name == "flights"
        ));
    }

    #[test]
    fn test_expression_text() {
        let e = ExprAst::binary(
            BinaryOp::And,
            ExprAst::binary(BinaryOp::Eq, ExprAst::field(&["carrier"]), ExprAst::string("AA")),
            ExprAst::binary(
                BinaryOp::Gt,
                ExprAst::Truncate {
                    expr: Box::new(ExprAst::field(&["dep_time"])),
                    unit: TimeUnit::Year,
                },
                ExprAst::Date {
                    value: "2003-01-01".into(),
                },
            ),
        );
        assert_eq!(e.to_string(), "carrier = 'AA' and dep_time.year > @2003-01-01");
        let count = ExprAst::Call {
            name: "count".into(),
            args: vec![],
            locality: vec!["aircraft".into()],
        };
        assert_eq!(count.to_string(), "aircraft.count()");
    }
}
