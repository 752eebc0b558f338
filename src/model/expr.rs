//! Semantic expressions.
//!
//! These are the resolved, type-checked expressions stored in a model. They
//! reference fields by path relative to the struct that owns them, and are
//! lowered to SQL by the compiler.

use serde::{Deserialize, Serialize};

use super::types::{AtomicType, ExtractUnit, TimeUnit};

/// A semantic expression.
///
/// Closed sum type: every consumer matches it exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Field reference by path, relative to the owning struct.
    Field { path: Vec<String> },
    Literal(Literal),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },
    Case {
        whens: Vec<CaseWhen>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        to: AtomicType,
        safe: bool,
    },
    /// Scalar function call, resolved through the function catalog.
    Function { name: String, args: Vec<Expr> },
    Aggregate {
        func: AggregateFunc,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<Box<Expr>>,
        /// Join path whose rows are being aggregated. Empty for the root.
        #[serde(default)]
        locality: Vec<String>,
    },
    /// `agg { where: ... }`
    Filtered {
        expr: Box<Expr>,
        filters: Vec<Expr>,
    },
    /// `all(agg, keep...)` / `exclude(agg, drop...)`
    Ungrouped {
        kind: UngroupedKind,
        expr: Box<Expr>,
        #[serde(default)]
        fields: Vec<String>,
    },
    Analytic { func: AnalyticFunc, args: Vec<Expr> },
    TimeTrunc {
        expr: Box<Expr>,
        unit: TimeUnit,
        base: AtomicType,
    },
    TimeExtract {
        expr: Box<Expr>,
        unit: ExtractUnit,
        base: AtomicType,
    },
    TimeOffset {
        expr: Box<Expr>,
        op: OffsetOp,
        amount: Box<Expr>,
        unit: TimeUnit,
        base: AtomicType,
    },
    TimeDiff {
        unit: TimeUnit,
        from: Box<Expr>,
        to: Box<Expr>,
        base: AtomicType,
    },
    Now,
}

/// Literal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    /// Numbers keep their source text so no precision is lost.
    Number(String),
    String(String),
    Bool(bool),
    Null,
    /// `YYYY-MM-DD`
    Date(String),
    /// `YYYY-MM-DD HH:MM:SS` in `timezone`, or UTC when absent.
    Timestamp {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Regex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Like,
    NotLike,
    Match,
    NotMatch,
    Coalesce,
}

impl BinaryOp {
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        )
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Like => "~",
            BinaryOp::NotLike => "!~",
            BinaryOp::Match => "~ r",
            BinaryOp::NotMatch => "!~ r",
            BinaryOp::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseWhen {
    pub when: Expr,
    pub then: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunc {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggregateFunc::Count),
            "count_distinct" => Some(AggregateFunc::CountDistinct),
            "sum" => Some(AggregateFunc::Sum),
            "avg" => Some(AggregateFunc::Avg),
            "min" => Some(AggregateFunc::Min),
            "max" => Some(AggregateFunc::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::CountDistinct => "count_distinct",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        }
    }

    /// Whether duplicated input rows change the result.
    pub fn is_fanout_sensitive(&self) -> bool {
        matches!(
            self,
            AggregateFunc::Count | AggregateFunc::Sum | AggregateFunc::Avg
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UngroupedKind {
    /// Ignore every dimension of the current level except the listed ones.
    All,
    /// Ignore only the listed dimensions.
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticFunc {
    RowNumber,
    Rank,
    DenseRank,
    Lag,
    Lead,
    FirstValue,
    LastValue,
}

impl AnalyticFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "row_number" => Some(AnalyticFunc::RowNumber),
            "rank" => Some(AnalyticFunc::Rank),
            "dense_rank" => Some(AnalyticFunc::DenseRank),
            "lag" => Some(AnalyticFunc::Lag),
            "lead" => Some(AnalyticFunc::Lead),
            "first_value" => Some(AnalyticFunc::FirstValue),
            "last_value" => Some(AnalyticFunc::LastValue),
            _ => None,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            AnalyticFunc::RowNumber => "ROW_NUMBER",
            AnalyticFunc::Rank => "RANK",
            AnalyticFunc::DenseRank => "DENSE_RANK",
            AnalyticFunc::Lag => "LAG",
            AnalyticFunc::Lead => "LEAD",
            AnalyticFunc::FirstValue => "FIRST_VALUE",
            AnalyticFunc::LastValue => "LAST_VALUE",
        }
    }

    /// Accepted argument counts.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            AnalyticFunc::RowNumber | AnalyticFunc::Rank | AnalyticFunc::DenseRank => (0, 0),
            AnalyticFunc::Lag | AnalyticFunc::Lead => (1, 3),
            AnalyticFunc::FirstValue | AnalyticFunc::LastValue => (1, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetOp {
    Add,
    Sub,
}

// =============================================================================
// Constructors and traversal
// =============================================================================

impl Expr {
    pub fn field<S: AsRef<str>>(path: &[S]) -> Expr {
        Expr::Field {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    pub fn number(text: impl Into<String>) -> Expr {
        Expr::Literal(Literal::Number(text.into()))
    }

    pub fn string(text: impl Into<String>) -> Expr {
        Expr::Literal(Literal::String(text.into()))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn aggregate(func: AggregateFunc, expr: Option<Expr>, locality: Vec<String>) -> Expr {
        Expr::Aggregate {
            func,
            expr: expr.map(Box::new),
            locality,
        }
    }

    /// Visit this expression and every subexpression, parents first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Field { .. } | Expr::Literal(_) | Expr::Now => {}
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Not(e) | Expr::Neg(e) => e.walk(f),
            Expr::IsNull { expr, .. } | Expr::Cast { expr, .. } => expr.walk(f),
            Expr::In { expr, values, .. } => {
                expr.walk(f);
                for v in values {
                    v.walk(f);
                }
            }
            Expr::Case { whens, otherwise } => {
                for w in whens {
                    w.when.walk(f);
                    w.then.walk(f);
                }
                if let Some(e) = otherwise {
                    e.walk(f);
                }
            }
            Expr::Function { args, .. } | Expr::Analytic { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            Expr::Aggregate { expr, .. } => {
                if let Some(e) = expr {
                    e.walk(f);
                }
            }
            Expr::Filtered { expr, filters } => {
                expr.walk(f);
                for c in filters {
                    c.walk(f);
                }
            }
            Expr::Ungrouped { expr, .. } => expr.walk(f),
            Expr::TimeTrunc { expr, .. } | Expr::TimeExtract { expr, .. } => expr.walk(f),
            Expr::TimeOffset { expr, amount, .. } => {
                expr.walk(f);
                amount.walk(f);
            }
            Expr::TimeDiff { from, to, .. } => {
                from.walk(f);
                to.walk(f);
            }
        }
    }

    /// Every field path referenced anywhere in the expression.
    pub fn field_paths(&self) -> Vec<&[String]> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Field { path } = e {
                out.push(path.as_slice());
            }
        });
        out
    }

    /// Contains an aggregate anywhere below (or at) this node.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
            }
        });
        found
    }

    /// Rebuild the expression with field references replaced.
    ///
    /// `f` returns `Some(replacement)` for paths it wants to rewrite.
    pub fn rewrite_fields(&self, f: &mut dyn FnMut(&[String]) -> Option<Expr>) -> Expr {
        self.rewrite(&mut |e| match e {
            Expr::Field { path } => f(path),
            _ => None,
        })
    }

    /// Rebuild the expression top-down. Where `f` returns a replacement the
    /// node is replaced and its children are not visited.
    pub fn rewrite(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replacement) = f(self) {
            return replacement;
        }
        let mut go = |e: &Expr| Box::new(e.rewrite(f));
        match self {
            Expr::Field { .. } | Expr::Literal(_) | Expr::Now => self.clone(),
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: go(left),
                right: go(right),
            },
            Expr::Not(e) => Expr::Not(go(e)),
            Expr::Neg(e) => Expr::Neg(go(e)),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: go(expr),
                negated: *negated,
            },
            Expr::In {
                expr,
                values,
                negated,
            } => Expr::In {
                expr: go(expr),
                values: values.iter().map(|v| *go(v)).collect(),
                negated: *negated,
            },
            Expr::Case { whens, otherwise } => Expr::Case {
                whens: whens
                    .iter()
                    .map(|w| CaseWhen {
                        when: *go(&w.when),
                        then: *go(&w.then),
                    })
                    .collect(),
                otherwise: otherwise.as_ref().map(|e| go(e)),
            },
            Expr::Cast { expr, to, safe } => Expr::Cast {
                expr: go(expr),
                to: *to,
                safe: *safe,
            },
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| *go(a)).collect(),
            },
            Expr::Aggregate {
                func,
                expr,
                locality,
            } => Expr::Aggregate {
                func: *func,
                expr: expr.as_ref().map(|e| go(e)),
                locality: locality.clone(),
            },
            Expr::Filtered { expr, filters } => Expr::Filtered {
                expr: go(expr),
                filters: filters.iter().map(|c| *go(c)).collect(),
            },
            Expr::Ungrouped { kind, expr, fields } => Expr::Ungrouped {
                kind: *kind,
                expr: go(expr),
                fields: fields.clone(),
            },
            Expr::Analytic { func, args } => Expr::Analytic {
                func: *func,
                args: args.iter().map(|a| *go(a)).collect(),
            },
            Expr::TimeTrunc { expr, unit, base } => Expr::TimeTrunc {
                expr: go(expr),
                unit: *unit,
                base: *base,
            },
            Expr::TimeExtract { expr, unit, base } => Expr::TimeExtract {
                expr: go(expr),
                unit: *unit,
                base: *base,
            },
            Expr::TimeOffset {
                expr,
                op,
                amount,
                unit,
                base,
            } => Expr::TimeOffset {
                expr: go(expr),
                op: *op,
                amount: go(amount),
                unit: *unit,
                base: *base,
            },
            Expr::TimeDiff {
                unit,
                from,
                to,
                base,
            } => Expr::TimeDiff {
                unit: *unit,
                from: go(from),
                to: go(to),
                base: *base,
            },
        }
    }
}
