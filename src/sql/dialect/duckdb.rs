//! DuckDB SQL dialect.
//!
//! DuckDB features:
//! - ANSI identifier quoting (`"`)
//! - Native boolean type
//! - QUALIFY and FILTER clauses
//! - TRY_CAST
//! - LIST and struct literals for nested results
//! - `USING SAMPLE` table sampling

use crate::model::{AtomicType, ExtractUnit, OffsetOp, Sampling, TimeUnit};

use super::helpers;
use super::{ParentKind, SqlDialect};

/// DuckDB SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn sql_type_name(&self, ty: AtomicType) -> &'static str {
        match ty {
            AtomicType::String => "VARCHAR",
            AtomicType::Number => "DOUBLE",
            AtomicType::Boolean => "BOOLEAN",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "TIMESTAMP",
            AtomicType::Json | AtomicType::SqlNative => "JSON",
        }
    }

    fn atomic_type_for(&self, sql_type: &str) -> AtomicType {
        let upper = sql_type.trim().to_ascii_uppercase();
        if upper.starts_with("STRUCT") || upper.ends_with("[]") || upper.starts_with("MAP") {
            return AtomicType::SqlNative;
        }
        helpers::atomic_type_for_common(sql_type)
    }

    fn sql_cast(&self, expr: &str, to: AtomicType, safe: bool) -> Result<String, super::DialectError> {
        let func = if safe { "TRY_CAST" } else { "CAST" };
        Ok(format!("{}({} AS {})", func, expr, self.sql_type_name(to)))
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_duckdb(name)
    }

    fn sql_function(&self, name: &str, args: &[String]) -> Option<String> {
        match (name.to_ascii_lowercase().as_str(), args) {
            ("starts_with", [s, prefix]) => Some(format!("STARTS_WITH({}, {})", s, prefix)),
            ("strpos", [s, sub]) => Some(format!("STRPOS({}, {})", s, sub)),
            ("div", [a, b]) => Some(format!("({} // {})", a, b)),
            _ => None,
        }
    }

    fn sql_regexp_match(&self, expr: &str, regex: &str) -> String {
        format!("REGEXP_MATCHES({}, {})", expr, regex)
    }

    fn sql_group_set_table(&self, max_set: usize) -> String {
        format!(
            "CROSS JOIN (SELECT UNNEST(GENERATE_SERIES(0,{},1)) AS group_set) AS __group_sets",
            max_set
        )
    }

    fn sql_any_value(&self, group_set: usize, column: &str) -> String {
        format!("ANY_VALUE({})", helpers::guard_group_set(group_set, column))
    }

    fn sql_generate_uuid(&self) -> String {
        "GEN_RANDOM_UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, key: &str) -> String {
        format!("md5_number_upper(({})::VARCHAR)::DECIMAL(38,0)", key)
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, avg: bool) -> String {
        let hashed = self.sql_sum_distinct_hashed_key(key);
        let cast = format!("({})::DECIMAL(38,10)", value);
        helpers::symmetric_sum(&hashed, &cast, key, value, avg)
    }

    fn sql_aggregate_turtle(
        &self,
        filter: &str,
        fields: &[(String, String)],
        order_by: Option<&str>,
    ) -> String {
        let pairs = fields
            .iter()
            .map(|(name, value)| format!("{}: {}", self.quote_string(name), value))
            .collect::<Vec<_>>()
            .join(", ");
        let order = order_by.map(|o| format!(" ORDER BY {}", o)).unwrap_or_default();
        format!(
            "COALESCE(LIST({{{}}}{}) FILTER (WHERE {}), [])",
            pairs, order, filter
        )
    }

    fn sql_unnest(
        &self,
        source: &str,
        alias: &str,
        _fields: &[(String, AtomicType)],
        _is_scalar: bool,
    ) -> String {
        format!(
            "LEFT JOIN LATERAL (SELECT UNNEST({}) AS \"value\") AS {} ON true",
            source,
            self.quote_identifier(alias)
        )
    }

    fn sql_field_reference(&self, parent: &str, kind: ParentKind, field: &str, _ty: AtomicType) -> String {
        match kind {
            ParentKind::Table | ParentKind::Record => {
                format!("{}.{}", parent, self.quote_identifier(field))
            }
            ParentKind::ArrayRecord => {
                format!("{}.\"value\".{}", parent, self.quote_identifier(field))
            }
            ParentKind::ArrayScalar => format!("{}.\"value\"", parent),
        }
    }

    fn sql_truncate(&self, expr: &str, base: AtomicType, unit: TimeUnit, tz: Option<&str>) -> String {
        helpers::truncate_date_trunc(expr, base, unit, tz)
    }

    fn sql_extract(&self, expr: &str, base: AtomicType, unit: ExtractUnit, tz: Option<&str>) -> String {
        helpers::extract_pg_style(expr, base, unit, tz)
    }

    fn sql_time_offset(
        &self,
        expr: &str,
        base: AtomicType,
        op: OffsetOp,
        amount: &str,
        unit: TimeUnit,
    ) -> String {
        helpers::offset_interval(expr, base, op, amount, unit)
    }

    fn sql_time_diff(&self, unit: TimeUnit, from: &str, to: &str, _base: AtomicType) -> String {
        format!("DATE_DIFF('{}', {}, {})", unit.as_str(), from, to)
    }

    fn sql_sample_table(&self, table_sql: &str, sampling: &Sampling) -> String {
        match helpers::resolve_sampling(sampling) {
            Some(Sampling::Rows(n)) => {
                format!("(SELECT * FROM {} USING SAMPLE {} ROWS)", table_sql, n)
            }
            Some(Sampling::Percent(p)) => format!(
                "(SELECT * FROM {} USING SAMPLE {} PERCENT (bernoulli))",
                table_sql, p
            ),
            _ => table_sql.to_string(),
        }
    }

    fn supports_qualify(&self) -> bool {
        true
    }

    fn supports_safe_cast(&self) -> bool {
        true
    }
}
