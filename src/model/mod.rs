//! Semantic model types.
//!
//! Everything here is plain data: serializable, cloneable and immutable once
//! a model is final. A [`ModelDef`] round-tripped through JSON compiles to
//! the same SQL.

pub mod dependency;
pub mod expr;
pub mod field;
pub mod modeldef;
pub mod query;
pub mod shape;
pub mod structdef;
pub mod time;
pub mod types;

pub use dependency::DependencyTree;
pub use expr::{
    AggregateFunc, AnalyticFunc, BinaryOp, CaseWhen, Expr, Literal, OffsetOp, UngroupedKind,
};
pub use field::{AtomicField, FieldDef, TurtleDef};
pub use modeldef::{ModelDef, NamedObject, NamedQuery, PersistSpec};
pub use query::{
    FilterCondition, IndexSegment, OrderBy, OrderKey, PipeSegment, Query, QueryField,
    QuerySegment, Sampling, SourceLocation, SourceRef, DEFAULT_SAMPLE_ROWS,
};
pub use shape::{pipeline_output, segment_output, ShapeError};
pub use structdef::{JoinInfo, StructDef, StructKind, ARRAY_ELEMENT};
pub use types::{
    AtomicType, ExpressionType, ExtractUnit, JoinKind, JoinRelationship, SortDirection, TimeUnit,
};
