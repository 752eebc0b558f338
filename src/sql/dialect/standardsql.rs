//! Google BigQuery Standard SQL dialect.
//!
//! StandardSQL features:
//! - Backtick identifier quoting; table paths quoted as one identifier
//! - SAFE_CAST
//! - QUALIFY
//! - ARRAY_AGG of STRUCT for nested results, UNNEST for arrays
//! - TIMESTAMP_TRUNC / EXTRACT with an explicit time zone argument

use crate::model::{AtomicType, ExtractUnit, OffsetOp, Sampling, TimeUnit};

use super::helpers;
use super::{DialectError, ParentKind, SqlDialect};

/// BigQuery Standard SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct StandardSql;

impl StandardSql {
    fn date_part(unit: TimeUnit) -> &'static str {
        match unit {
            TimeUnit::Week => "WEEK(MONDAY)",
            other => helpers::unit_keyword(other),
        }
    }
}

impl SqlDialect for StandardSql {
    fn name(&self) -> &'static str {
        "standardsql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn quote_table_path(&self, path: &str) -> String {
        helpers::quote_backtick(path)
    }

    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_backslash(s)
    }

    fn sql_type_name(&self, ty: AtomicType) -> &'static str {
        match ty {
            AtomicType::String => "STRING",
            AtomicType::Number => "FLOAT64",
            AtomicType::Boolean => "BOOL",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "TIMESTAMP",
            AtomicType::Json | AtomicType::SqlNative => "JSON",
        }
    }

    fn atomic_type_for(&self, sql_type: &str) -> AtomicType {
        let upper = sql_type.trim().to_ascii_uppercase();
        if upper.starts_with("STRUCT") || upper.starts_with("ARRAY") || upper == "GEOGRAPHY" {
            return AtomicType::SqlNative;
        }
        // BigQuery DATETIME has no zone; it is treated like a timestamp.
        helpers::atomic_type_for_common(sql_type)
    }

    fn sql_cast(&self, expr: &str, to: AtomicType, safe: bool) -> Result<String, DialectError> {
        let func = if safe { "SAFE_CAST" } else { "CAST" };
        Ok(format!("{}({} AS {})", func, expr, self.sql_type_name(to)))
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_standardsql(name)
    }

    fn sql_function(&self, name: &str, args: &[String]) -> Option<String> {
        match (name.to_ascii_lowercase().as_str(), args) {
            ("starts_with", [s, prefix]) => Some(format!("STARTS_WITH({}, {})", s, prefix)),
            ("strpos", [s, sub]) => Some(format!("STRPOS({}, {})", s, sub)),
            ("div", [a, b]) => Some(format!("DIV({}, {})", a, b)),
            _ => None,
        }
    }

    fn sql_regexp_match(&self, expr: &str, regex: &str) -> String {
        format!("REGEXP_CONTAINS({}, {})", expr, regex)
    }

    fn sql_now(&self) -> String {
        "CURRENT_TIMESTAMP()".to_string()
    }

    fn sql_group_set_table(&self, max_set: usize) -> String {
        format!(
            "CROSS JOIN UNNEST(GENERATE_ARRAY(0,{},1)) AS group_set",
            max_set
        )
    }

    fn sql_any_value(&self, group_set: usize, column: &str) -> String {
        format!("ANY_VALUE({})", helpers::guard_group_set(group_set, column))
    }

    fn sql_generate_uuid(&self) -> String {
        "GENERATE_UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, key: &str) -> String {
        let hex = format!("TO_HEX(MD5(CAST({} AS STRING)))", key);
        let key = format!(
            "(CAST(CAST(CONCAT('0x', SUBSTR({h}, 1, 15)) AS INT64) AS NUMERIC) * 4294967296 \
             + CAST(CAST(CONCAT('0x', SUBSTR({h}, 16, 8)) AS INT64) AS NUMERIC))",
            h = hex
        );
        helpers::shift_hashed_key(&key)
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, avg: bool) -> String {
        let hashed = self.sql_sum_distinct_hashed_key(key);
        let cast = format!("CAST({} AS NUMERIC)", value);
        helpers::symmetric_sum(&hashed, &cast, key, value, avg)
    }

    fn sql_aggregate_turtle(
        &self,
        filter: &str,
        fields: &[(String, String)],
        order_by: Option<&str>,
    ) -> String {
        let members = fields
            .iter()
            .map(|(name, value)| format!("{} AS {}", value, self.quote_identifier(name)))
            .collect::<Vec<_>>()
            .join(", ");
        let order = order_by.map(|o| format!(" ORDER BY {}", o)).unwrap_or_default();
        format!(
            "ARRAY_AGG(CASE WHEN {} THEN STRUCT({}) END IGNORE NULLS{})",
            filter, members, order
        )
    }

    fn sql_unnest(
        &self,
        source: &str,
        alias: &str,
        _fields: &[(String, AtomicType)],
        _is_scalar: bool,
    ) -> String {
        format!("LEFT JOIN UNNEST({}) AS {}", source, self.quote_identifier(alias))
    }

    fn sql_field_reference(&self, parent: &str, kind: ParentKind, field: &str, _ty: AtomicType) -> String {
        match kind {
            ParentKind::ArrayScalar => parent.to_string(),
            _ => format!("{}.{}", parent, self.quote_identifier(field)),
        }
    }

    fn sql_truncate(&self, expr: &str, base: AtomicType, unit: TimeUnit, tz: Option<&str>) -> String {
        let part = Self::date_part(unit);
        match (base, tz) {
            (AtomicType::Date, _) => format!("DATE_TRUNC({}, {})", expr, part),
            (_, Some(tz)) => format!("TIMESTAMP_TRUNC({}, {}, '{}')", expr, part, tz),
            (_, None) => format!("TIMESTAMP_TRUNC({}, {})", expr, part),
        }
    }

    fn sql_extract(&self, expr: &str, base: AtomicType, unit: ExtractUnit, tz: Option<&str>) -> String {
        let part = match unit {
            ExtractUnit::DayOfWeek => "DAYOFWEEK",
            ExtractUnit::DayOfYear => "DAYOFYEAR",
            ExtractUnit::Week => "ISOWEEK",
            other => helpers::extract_keyword(other),
        };
        match (base, tz) {
            (AtomicType::Timestamp, Some(tz)) => {
                format!("EXTRACT({} FROM {} AT TIME ZONE '{}')", part, expr, tz)
            }
            _ => format!("EXTRACT({} FROM {})", part, expr),
        }
    }

    fn sql_time_offset(
        &self,
        expr: &str,
        base: AtomicType,
        op: OffsetOp,
        amount: &str,
        unit: TimeUnit,
    ) -> String {
        let verb = match op {
            OffsetOp::Add => "ADD",
            OffsetOp::Sub => "SUB",
        };
        let part = helpers::unit_keyword(unit);
        match base {
            AtomicType::Date => format!("DATE_{}({}, INTERVAL {} {})", verb, expr, amount, part),
            _ if unit.is_date_unit() && unit != TimeUnit::Day => format!(
                "TIMESTAMP(DATETIME_{}(DATETIME({}), INTERVAL {} {}))",
                verb, expr, amount, part
            ),
            _ => format!("TIMESTAMP_{}({}, INTERVAL {} {})", verb, expr, amount, part),
        }
    }

    fn sql_time_diff(&self, unit: TimeUnit, from: &str, to: &str, base: AtomicType) -> String {
        let part = helpers::unit_keyword(unit);
        match base {
            AtomicType::Date => format!("DATE_DIFF({}, {}, {})", to, from, part),
            _ if unit.is_date_unit() && unit != TimeUnit::Day => format!(
                "DATETIME_DIFF(DATETIME({}), DATETIME({}), {})",
                to, from, part
            ),
            _ => format!("TIMESTAMP_DIFF({}, {}, {})", to, from, part),
        }
    }

    fn sql_sample_table(&self, table_sql: &str, sampling: &Sampling) -> String {
        match helpers::resolve_sampling(sampling) {
            Some(Sampling::Rows(n)) => {
                format!("(SELECT * FROM {} ORDER BY RAND() LIMIT {})", table_sql, n)
            }
            Some(Sampling::Percent(p)) => format!(
                "(SELECT * FROM {} TABLESAMPLE SYSTEM ({} PERCENT))",
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
