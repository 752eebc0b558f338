//! Queries and pipeline segments.

use serde::{Deserialize, Serialize};

use crate::diagnostics::Span;

use super::expr::Expr;
use super::field::FieldDef;
use super::structdef::StructDef;
use super::types::{ExpressionType, SortDirection};

/// A query: a source followed by a pipeline of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub source: SourceRef,
    pub pipeline: Vec<PipeSegment>,
    /// Filters applied to the source before the first stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterCondition>,
    /// The statement the query was written in, when it came from a document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl Query {
    pub fn new(source: SourceRef, pipeline: Vec<PipeSegment>) -> Self {
        Self {
            name: None,
            source,
            pipeline,
            filters: Vec::new(),
            location: None,
        }
    }
}

/// A byte range in the document at `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub url: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRef {
    /// A source in the model's contents.
    Named(String),
    Inline(Box<StructDef>),
}

/// One stage of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipeSegment {
    Reduce(QuerySegment),
    Project(QuerySegment),
    Index(IndexSegment),
}

impl PipeSegment {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PipeSegment::Reduce(_) => "reduce",
            PipeSegment::Project(_) => "project",
            PipeSegment::Index(_) => "index",
        }
    }

    pub fn query_segment(&self) -> Option<&QuerySegment> {
        match self {
            PipeSegment::Reduce(q) | PipeSegment::Project(q) => Some(q),
            PipeSegment::Index(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySegment {
    pub fields: Vec<QueryField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub having: Vec<FilterCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sampling>,
    /// Fields defined locally for this segment (`extend`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extend: Vec<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// An output of a query segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryField {
    /// Reference to an existing field, optionally renamed.
    Ref {
        path: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Def(FieldDef),
}

impl QueryField {
    pub fn reference(path: &[&str]) -> Self {
        QueryField::Ref {
            path: path.iter().map(|s| s.to_string()).collect(),
            alias: None,
        }
    }

    /// Name of the output column.
    pub fn output_name(&self) -> &str {
        match self {
            QueryField::Ref { path, alias } => alias
                .as_deref()
                .or_else(|| path.last().map(String::as_str))
                .unwrap_or_default(),
            QueryField::Def(f) => f.name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: OrderKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<SortDirection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    Name(String),
    /// 1-based output position.
    Position(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    Rows(u64),
    Percent(f64),
    Enable(bool),
}

/// Row count used by `sample: true`.
pub const DEFAULT_SAMPLE_ROWS: u64 = 50_000;

/// A filter with the source text it was written as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub expr: Expr,
    #[serde(default)]
    pub expression_type: ExpressionType,
    #[serde(default)]
    pub code: String,
}

impl FilterCondition {
    pub fn scalar(expr: Expr, code: impl Into<String>) -> Self {
        Self {
            expr,
            expression_type: ExpressionType::Scalar,
            code: code.into(),
        }
    }
}

/// A search-index stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSegment {
    pub fields: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_measure: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sampling>,
}
