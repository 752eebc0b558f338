//! SQL dialect contract, implementations and registry.
//!
//! The compiler never formats database-specific SQL itself. Every construct
//! that differs between engines goes through [`SqlDialect`]:
//!
//! - Identifier quoting: `"` (Postgres, DuckDB, Snowflake), `` ` `` (MySQL, StandardSQL)
//! - Boolean literals: true/false vs 1/0
//! - Grouping-set fan-out tables and `ANY_VALUE` emulation
//! - Symmetric aggregate hashing
//! - Nested output (`JSONB_AGG`, `LIST`, `ARRAY_AGG(STRUCT ..)`, `JSON_OBJECT`)
//! - Unnesting of array and record columns
//! - Time truncation, extraction, offsets and differences in a query time zone
//!
//! # Usage
//!
//! ```ignore
//! use quiver::dialect::get_dialect;
//!
//! let dialect = get_dialect("postgres").unwrap();
//! let quoted = dialect.quote_identifier("user");  // "user"
//! ```
//!
//! # Feature matrix
//!
//! | Feature | Postgres | DuckDB | StandardSQL | MySQL | Snowflake |
//! |---------|----------|--------|-------------|-------|-----------|
//! | FULL JOIN | ✓ | ✓ | ✓ | ❌ | ✓ |
//! | QUALIFY | ❌ | ✓ | ✓ | ❌ | ✓ |
//! | SAFE/TRY cast | ❌ | ✓ | ✓ | ❌ | ✓ |
//! | Native booleans | ✓ | ✓ | ✓ | ❌ | ✓ |

mod duckdb;
pub mod helpers;
mod mysql;
mod postgres;
mod snowflake;
mod standardsql;

pub use duckdb::DuckDb;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use snowflake::Snowflake;
pub use standardsql::StandardSql;

use std::collections::HashMap;
use std::fmt::Debug;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::model::{AtomicType, ExtractUnit, OffsetOp, Sampling, TimeUnit};

use super::token::TokenStream;

/// A construct the target database cannot express.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialectError {
    #[error("{feature} is not supported by the {dialect} dialect")]
    Unsupported {
        dialect: &'static str,
        feature: &'static str,
    },
}

/// How the parent of a referenced field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    /// A table or subquery row.
    Table,
    /// A record (struct/object) column.
    Record,
    /// An unnested array whose elements are records.
    ArrayRecord,
    /// An unnested array of scalars; the element itself is the value.
    ArrayScalar,
}

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// Default implementations follow Postgres-flavoured ANSI SQL where one
/// exists. Methods prefixed with `sql_` return SQL text fragments that the
/// compiler splices into [`crate::sql::Expr::Raw`] nodes.
pub trait SqlDialect: Debug + Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    /// Quote an identifier (table, column, alias).
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a dotted table path. Each segment is quoted separately unless
    /// the dialect treats the path as one identifier.
    fn quote_table_path(&self, path: &str) -> String {
        path.split('.')
            .map(|part| self.quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quote a string value.
    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    /// Format a boolean literal; `1`/`0` where booleans are not native.
    fn format_bool(&self, b: bool) -> &'static str {
        if self.has_native_booleans() {
            helpers::format_bool_literal(b)
        } else {
            helpers::format_bool_numeric(b)
        }
    }

    /// Numeric literal text as written in the source.
    fn sql_number_literal(&self, text: &str) -> String {
        text.to_string()
    }

    /// String literal as emitted into queries.
    fn sql_string_literal(&self, s: &str) -> String {
        self.quote_string(s)
    }

    fn sql_date_literal(&self, date: &str) -> String {
        format!("DATE '{}'", date)
    }

    /// A timestamp literal; `utc` is already normalized to UTC.
    fn sql_timestamp_literal(&self, utc: &str) -> String {
        format!("TIMESTAMP '{}'", utc)
    }

    // =========================================================================
    // Statement shape
    // =========================================================================

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_standard(limit, offset)
    }

    fn emit_recursive_keyword(&self) -> bool {
        true
    }

    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// MySQL treats `||` as logical OR.
    fn supports_concat_operator(&self) -> bool {
        true
    }

    // =========================================================================
    // Types
    // =========================================================================

    /// Type name used in casts.
    fn sql_type_name(&self, ty: AtomicType) -> &'static str;

    /// Classify a column type reported by the database.
    fn atomic_type_for(&self, sql_type: &str) -> AtomicType {
        helpers::atomic_type_for_common(sql_type)
    }

    /// `CAST(expr AS type)`, or the dialect's null-on-failure cast when
    /// `safe` is set.
    fn sql_cast(&self, expr: &str, to: AtomicType, safe: bool) -> Result<String, DialectError> {
        if safe {
            return Err(DialectError::Unsupported {
                dialect: self.name(),
                feature: "safe cast",
            });
        }
        Ok(format!("CAST({} AS {})", expr, self.sql_type_name(to)))
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Rename a function for this dialect.
    fn remap_function(&self, _name: &str) -> Option<&'static str> {
        None
    }

    /// Dialect-specific rendering for a function call with already-rendered
    /// arguments. `None` means emit `NAME(args)` as written.
    fn sql_function(&self, name: &str, args: &[String]) -> Option<String> {
        match (name.to_ascii_lowercase().as_str(), args) {
            ("starts_with", [s, prefix]) => Some(format!("STARTS_WITH({}, {})", s, prefix)),
            ("div", [a, b]) => Some(format!("DIV({}, {})", a, b)),
            _ => None,
        }
    }

    fn sql_regexp_match(&self, expr: &str, regex: &str) -> String;

    fn sql_now(&self) -> String {
        "CURRENT_TIMESTAMP".to_string()
    }

    // =========================================================================
    // Grouping sets
    // =========================================================================

    /// Join clause that fans each row out over `group_set` 0..=max_set.
    fn sql_group_set_table(&self, max_set: usize) -> String;

    /// Pick the single value of `column` within `group_set`.
    fn sql_any_value(&self, group_set: usize, column: &str) -> String {
        format!("MAX({})", helpers::guard_group_set(group_set, column))
    }

    // =========================================================================
    // Symmetric aggregates
    // =========================================================================

    fn sql_generate_uuid(&self) -> String;

    /// Large integer derived from a hash of `key`.
    fn sql_sum_distinct_hashed_key(&self, key: &str) -> String;

    /// Fan-out safe `SUM` (or `AVG` when `avg`) of `value` per distinct `key`.
    fn sql_sum_distinct(&self, key: &str, value: &str, avg: bool) -> String;

    fn sql_count_distinct_key(&self, key: &str) -> String {
        format!("COUNT(DISTINCT {})", key)
    }

    // =========================================================================
    // Nesting
    // =========================================================================

    /// Aggregate rows matching `filter` into a nested array of records.
    ///
    /// `fields` pairs output names with already-rendered values.
    fn sql_aggregate_turtle(
        &self,
        filter: &str,
        fields: &[(String, String)],
        order_by: Option<&str>,
    ) -> String;

    /// Join clause that unnests `source` under `alias`.
    fn sql_unnest(
        &self,
        source: &str,
        alias: &str,
        fields: &[(String, AtomicType)],
        is_scalar: bool,
    ) -> String;

    /// Reference `field` inside `parent`.
    fn sql_field_reference(&self, parent: &str, kind: ParentKind, field: &str, ty: AtomicType) -> String {
        let _ = ty;
        match kind {
            ParentKind::ArrayScalar => parent.to_string(),
            _ => format!("{}.{}", parent, self.quote_identifier(field)),
        }
    }

    // =========================================================================
    // Time
    // =========================================================================

    /// Truncate to `unit`. Timestamps are truncated in civil time of `tz`
    /// and returned as UTC instants.
    fn sql_truncate(&self, expr: &str, base: AtomicType, unit: TimeUnit, tz: Option<&str>) -> String;

    fn sql_extract(&self, expr: &str, base: AtomicType, unit: ExtractUnit, tz: Option<&str>) -> String;

    fn sql_time_offset(
        &self,
        expr: &str,
        base: AtomicType,
        op: OffsetOp,
        amount: &str,
        unit: TimeUnit,
    ) -> String;

    /// Whole `unit`s from `from` to `to`.
    fn sql_time_diff(&self, unit: TimeUnit, from: &str, to: &str, base: AtomicType) -> String;

    // =========================================================================
    // Sampling
    // =========================================================================

    /// Parenthesized subquery reading a sample of `table_sql`. Returns the
    /// table unchanged when sampling is disabled.
    fn sql_sample_table(&self, table_sql: &str, sampling: &Sampling) -> String {
        match helpers::resolve_sampling(sampling) {
            Some(Sampling::Rows(n)) => {
                format!("(SELECT * FROM {} ORDER BY RANDOM() LIMIT {})", table_sql, n)
            }
            Some(Sampling::Percent(p)) => {
                format!("(SELECT * FROM {} TABLESAMPLE SYSTEM ({}))", table_sql, p)
            }
            _ => table_sql.to_string(),
        }
    }

    // =========================================================================
    // Feature Flags
    // =========================================================================

    fn supports_full_join(&self) -> bool {
        true
    }

    fn supports_qualify(&self) -> bool {
        false
    }

    fn supports_nesting(&self) -> bool {
        true
    }

    fn supports_safe_cast(&self) -> bool {
        false
    }

    fn has_native_booleans(&self) -> bool {
        true
    }
}

// =============================================================================
// Registry
// =============================================================================

static POSTGRES: Postgres = Postgres;
static DUCKDB: DuckDb = DuckDb;
static STANDARDSQL: StandardSql = StandardSql;
static MYSQL: MySql = MySql;
static SNOWFLAKE: Snowflake = Snowflake;

static REGISTRY: Lazy<HashMap<&'static str, &'static dyn SqlDialect>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, &'static dyn SqlDialect> = HashMap::new();
    map.insert("postgres", &POSTGRES);
    map.insert("duckdb", &DUCKDB);
    map.insert("standardsql", &STANDARDSQL);
    map.insert("bigquery", &STANDARDSQL);
    map.insert("mysql", &MYSQL);
    map.insert("snowflake", &SNOWFLAKE);
    map
});

/// Look up a dialect by name (case-insensitive).
pub fn get_dialect(name: &str) -> Option<&'static dyn SqlDialect> {
    REGISTRY.get(name.to_ascii_lowercase().as_str()).copied()
}

/// Canonical names of the registered dialects, sorted.
pub fn dialect_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = REGISTRY.values().map(|d| d.name()).collect();
    names.sort_unstable();
    names.dedup();
    names
}
