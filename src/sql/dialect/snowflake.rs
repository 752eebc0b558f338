//! Snowflake SQL dialect.
//!
//! Snowflake features:
//! - ANSI identifier quoting (`"`)
//! - QUALIFY and TRY_CAST
//! - VARIANT / OBJECT_CONSTRUCT for nested results
//! - LATERAL FLATTEN for arrays
//! - CONVERT_TIMEZONE for civil time

use crate::model::{AtomicType, ExtractUnit, OffsetOp, Sampling, TimeUnit};

use super::helpers;
use super::{DialectError, ParentKind, SqlDialect};

/// Snowflake SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Snowflake;

impl Snowflake {
    fn civil(expr: &str, tz: Option<&str>) -> String {
        match tz {
            Some(tz) => format!("CONVERT_TIMEZONE('UTC', '{}', {})", tz, expr),
            None => expr.to_string(),
        }
    }
}

impl SqlDialect for Snowflake {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_backslash(s)
    }

    fn sql_timestamp_literal(&self, utc: &str) -> String {
        format!("'{}'::TIMESTAMP_NTZ", utc)
    }

    fn sql_type_name(&self, ty: AtomicType) -> &'static str {
        match ty {
            AtomicType::String => "VARCHAR",
            AtomicType::Number => "DOUBLE",
            AtomicType::Boolean => "BOOLEAN",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "TIMESTAMP_NTZ",
            AtomicType::Json | AtomicType::SqlNative => "VARIANT",
        }
    }

    fn atomic_type_for(&self, sql_type: &str) -> AtomicType {
        let upper = sql_type.trim().to_ascii_uppercase();
        if upper == "ARRAY" || upper == "GEOGRAPHY" {
            return AtomicType::SqlNative;
        }
        helpers::atomic_type_for_common(sql_type)
    }

    fn sql_cast(&self, expr: &str, to: AtomicType, safe: bool) -> Result<String, DialectError> {
        let func = if safe { "TRY_CAST" } else { "CAST" };
        Ok(format!("{}({} AS {})", func, expr, self.sql_type_name(to)))
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_snowflake(name)
    }

    fn sql_function(&self, name: &str, args: &[String]) -> Option<String> {
        match (name.to_ascii_lowercase().as_str(), args) {
            ("starts_with", [s, prefix]) => Some(format!("STARTSWITH({}, {})", s, prefix)),
            ("strpos", [s, sub]) => Some(format!("POSITION({}, {})", sub, s)),
            ("div", [a, b]) => Some(format!("TRUNC({} / {})", a, b)),
            _ => None,
        }
    }

    fn sql_regexp_match(&self, expr: &str, regex: &str) -> String {
        format!("REGEXP_INSTR({}, {}) > 0", expr, regex)
    }

    fn sql_now(&self) -> String {
        "CURRENT_TIMESTAMP()".to_string()
    }

    fn sql_group_set_table(&self, max_set: usize) -> String {
        format!(
            "CROSS JOIN (SELECT seq4() AS group_set FROM TABLE(GENERATOR(ROWCOUNT => {}))) AS __group_sets",
            max_set + 1
        )
    }

    fn sql_generate_uuid(&self) -> String {
        "UUID_STRING()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, key: &str) -> String {
        let hashed = format!(
            "(TO_NUMBER(SUBSTR(MD5({k}), 1, 15), 'XXXXXXXXXXXXXXX') * 4294967296 \
             + TO_NUMBER(SUBSTR(MD5({k}), 16, 8), 'XXXXXXXX'))",
            k = key
        );
        helpers::shift_hashed_key(&hashed)
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, avg: bool) -> String {
        let hashed = self.sql_sum_distinct_hashed_key(key);
        let cast = format!("CAST({} AS NUMBER(38,9))", value);
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
            .map(|(name, value)| format!("{}, {}", self.quote_string(name), value))
            .collect::<Vec<_>>()
            .join(", ");
        let order = order_by
            .map(|o| format!(" WITHIN GROUP (ORDER BY {})", o))
            .unwrap_or_default();
        format!(
            "COALESCE(ARRAY_AGG(CASE WHEN {} THEN OBJECT_CONSTRUCT_KEEP_NULL({}) END){}, ARRAY_CONSTRUCT())",
            filter, pairs, order
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
            "LEFT JOIN LATERAL FLATTEN(INPUT => {}) AS {}",
            source,
            self.quote_identifier(alias)
        )
    }

    fn sql_field_reference(&self, parent: &str, kind: ParentKind, field: &str, ty: AtomicType) -> String {
        match kind {
            ParentKind::Table => format!("{}.{}", parent, self.quote_identifier(field)),
            ParentKind::Record => format!("{}:{}::{}", parent, field, self.sql_type_name(ty)),
            ParentKind::ArrayRecord => {
                format!("{}.value:{}::{}", parent, field, self.sql_type_name(ty))
            }
            ParentKind::ArrayScalar => format!("{}.value::{}", parent, self.sql_type_name(ty)),
        }
    }

    fn sql_truncate(&self, expr: &str, base: AtomicType, unit: TimeUnit, tz: Option<&str>) -> String {
        let zone = match base {
            AtomicType::Date => None,
            _ => tz,
        };
        let c = Self::civil(expr, zone);
        let truncated = match unit {
            TimeUnit::Week => format!(
                "DATEADD(day, -(DAYOFWEEKISO({c})-1), DATE_TRUNC('day', {c}))",
                c = c
            ),
            other => format!("DATE_TRUNC('{}', {})", other.as_str(), c),
        };
        match zone {
            Some(tz) => format!("CONVERT_TIMEZONE('{}', 'UTC', {})", tz, truncated),
            None => truncated,
        }
    }

    fn sql_extract(&self, expr: &str, base: AtomicType, unit: ExtractUnit, tz: Option<&str>) -> String {
        let c = match base {
            AtomicType::Timestamp => Self::civil(expr, tz),
            _ => expr.to_string(),
        };
        match unit {
            ExtractUnit::DayOfWeek => format!("(DAYOFWEEK({})+1)", c),
            ExtractUnit::DayOfYear => format!("DAYOFYEAR({})", c),
            ExtractUnit::Week => format!("WEEKISO({})", c),
            other => format!("EXTRACT({} FROM {})", helpers::extract_keyword(other), c),
        }
    }

    fn sql_time_offset(
        &self,
        expr: &str,
        _base: AtomicType,
        op: OffsetOp,
        amount: &str,
        unit: TimeUnit,
    ) -> String {
        let amount = match op {
            OffsetOp::Add => amount.to_string(),
            OffsetOp::Sub => format!("-({})", amount),
        };
        format!("DATEADD({}, {}, {})", unit.as_str(), amount, expr)
    }

    fn sql_time_diff(&self, unit: TimeUnit, from: &str, to: &str, _base: AtomicType) -> String {
        format!("DATEDIFF({}, {}, {})", unit.as_str(), from, to)
    }

    fn sql_sample_table(&self, table_sql: &str, sampling: &Sampling) -> String {
        match helpers::resolve_sampling(sampling) {
            Some(Sampling::Rows(n)) => {
                format!("(SELECT * FROM {} SAMPLE ({} ROWS))", table_sql, n)
            }
            Some(Sampling::Percent(p)) => format!("(SELECT * FROM {} SAMPLE ({}))", table_sql, p),
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
