//! # Quiver
//!
//! A semantic query compiler that turns an analytical query language into
//! multi-dialect SQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Documents (annotated AST, one per URL)          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [translator: needs loop]
//! ┌─────────────────────────────────────────────────────────┐
//! │   ModelDef (sources, named queries, dependency tree)     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [compiler]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Stage CTEs built with the SQL builder + SqlDialect     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │             CompiledQuery (SQL + result shape)           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The translator never talks to a database. It returns the facts it still
//! needs (files, table schemas, SQL block schemas) and the [`runtime`] fetches
//! them and feeds them back until the model is final.

pub mod build;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod model;
pub mod runtime;
pub mod sql;
pub mod translator;

pub use sql::dialect;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::compiler::{CompileOptions, CompiledQuery, QueryCompiler};
    pub use crate::diagnostics::{Diagnostic, Severity};
    pub use crate::model::{AtomicType, ModelDef, Query, StructDef};
    pub use crate::runtime::{CompileOutcome, QueryRequest, QueryTarget, Runtime};
    pub use crate::sql::dialect::{get_dialect, SqlDialect};
    pub use crate::translator::{TranslateResponse, Translator};
}

pub use compiler::{CompiledQuery, QueryCompiler};
pub use model::ModelDef;
pub use runtime::Runtime;
