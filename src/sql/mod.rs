//! SQL generation.
//!
//! A small typed builder the compiler emits through:
//!
//! - [`query`] - SELECT statements, joins and CTEs
//! - [`expr`] - expression AST and builder helpers
//! - [`token`] - tokens that serialize per dialect
//! - [`dialect`] - the dialect contract, implementations and registry

pub mod dialect;
pub mod expr;
pub mod query;
pub mod token;

#[cfg(test)]
pub mod test_utils;

pub use dialect::{dialect_names, get_dialect, SqlDialect};
pub use expr::{
    case_when, col, conjunction, func, func_distinct, lit_bool, lit_int, lit_null, lit_str,
    raw_sql, star, table_col, BinaryOperator, Expr, ExprExt, Literal, SortDir, UnaryOperator,
    WindowExt, WindowFrame, WindowOrderBy,
};
pub use query::{Cte, Join, JoinType, OrderByExpr, Query, SelectExpr, TableRef, TableSource};
pub use token::{Token, TokenStream};
