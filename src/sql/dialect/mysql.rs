//! MySQL SQL dialect.
//!
//! MySQL features:
//! - Backtick identifier quoting
//! - Boolean as 1/0
//! - `CONCAT()` function (|| is logical OR by default)
//! - No FULL OUTER JOIN
//! - JSON_OBJECT / JSON_TABLE for nesting and unnesting
//! - CONVERT_TZ for time zones (requires loaded zone tables)

use crate::model::{AtomicType, ExtractUnit, OffsetOp, Sampling, TimeUnit};

use super::helpers;
use super::{ParentKind, SqlDialect};

/// MySQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl MySql {
    fn civil(expr: &str, tz: Option<&str>) -> String {
        match tz {
            Some(tz) => format!("CONVERT_TZ({}, 'UTC', '{}')", expr, tz),
            None => expr.to_string(),
        }
    }

    fn json_table_type(ty: AtomicType) -> &'static str {
        match ty {
            AtomicType::String => "TEXT",
            AtomicType::Number => "DOUBLE",
            AtomicType::Boolean => "BOOLEAN",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "DATETIME",
            AtomicType::Json | AtomicType::SqlNative => "JSON",
        }
    }
}

impl SqlDialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_backslash(s)
    }

    fn supports_concat_operator(&self) -> bool {
        false
    }

    fn sql_timestamp_literal(&self, utc: &str) -> String {
        format!("TIMESTAMP('{}')", utc)
    }

    fn sql_type_name(&self, ty: AtomicType) -> &'static str {
        match ty {
            AtomicType::String => "CHAR",
            AtomicType::Number => "DOUBLE",
            AtomicType::Boolean => "SIGNED",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "DATETIME",
            AtomicType::Json | AtomicType::SqlNative => "JSON",
        }
    }

    fn atomic_type_for(&self, sql_type: &str) -> AtomicType {
        let upper = sql_type.trim().to_ascii_uppercase();
        // TINYINT(1) is how MySQL stores booleans.
        if upper == "TINYINT(1)" || upper == "BIT(1)" {
            return AtomicType::Boolean;
        }
        helpers::atomic_type_for_common(sql_type)
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_mysql(name)
    }

    fn sql_function(&self, name: &str, args: &[String]) -> Option<String> {
        match (name.to_ascii_lowercase().as_str(), args) {
            ("starts_with", [s, prefix]) => Some(format!("({} LIKE CONCAT({}, '%'))", s, prefix)),
            ("strpos", [s, sub]) => Some(format!("LOCATE({}, {})", sub, s)),
            ("div", [a, b]) => Some(format!("({} DIV {})", a, b)),
            _ => None,
        }
    }

    fn sql_regexp_match(&self, expr: &str, regex: &str) -> String {
        format!("REGEXP_LIKE({}, {})", expr, regex)
    }

    fn sql_now(&self) -> String {
        "UTC_TIMESTAMP()".to_string()
    }

    fn sql_group_set_table(&self, max_set: usize) -> String {
        format!(
            "CROSS JOIN ({}) AS __group_sets",
            helpers::group_set_union(max_set)
        )
    }

    fn sql_generate_uuid(&self) -> String {
        "UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, key: &str) -> String {
        format!(
            "(CAST(CONV(SUBSTRING(MD5({k}),1,16),16,10) AS DECIMAL(65,0))*4294967296 \
             + CAST(CONV(SUBSTRING(MD5({k}),17,8),16,10) AS DECIMAL(65,0)))",
            k = key
        )
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, avg: bool) -> String {
        let hashed = self.sql_sum_distinct_hashed_key(key);
        let cast = format!("CAST({} AS DECIMAL(65,10))", value);
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
        let order = order_by.map(|o| format!(" ORDER BY {}", o)).unwrap_or_default();
        format!(
            "COALESCE(CAST(CONCAT('[', GROUP_CONCAT(IF({}, JSON_OBJECT({}), NULL){} SEPARATOR ','), ']') AS JSON), JSON_ARRAY())",
            filter, pairs, order
        )
    }

    fn sql_unnest(
        &self,
        source: &str,
        alias: &str,
        fields: &[(String, AtomicType)],
        is_scalar: bool,
    ) -> String {
        let columns = if is_scalar {
            let ty = fields.first().map(|(_, t)| *t).unwrap_or(AtomicType::String);
            format!("`value` {} PATH '$'", Self::json_table_type(ty))
        } else {
            fields
                .iter()
                .map(|(name, ty)| {
                    format!(
                        "{} {} PATH '$.{}'",
                        self.quote_identifier(name),
                        Self::json_table_type(*ty),
                        name
                    )
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "LEFT JOIN JSON_TABLE({}, '$[*]' COLUMNS({})) AS {} ON true",
            source,
            columns,
            self.quote_identifier(alias)
        )
    }

    fn sql_field_reference(&self, parent: &str, kind: ParentKind, field: &str, _ty: AtomicType) -> String {
        match kind {
            ParentKind::Table | ParentKind::ArrayRecord => {
                format!("{}.{}", parent, self.quote_identifier(field))
            }
            ParentKind::Record => format!(
                "JSON_UNQUOTE(JSON_EXTRACT({}, '$.{}'))",
                parent, field
            ),
            ParentKind::ArrayScalar => format!("{}.`value`", parent),
        }
    }

    fn sql_truncate(&self, expr: &str, base: AtomicType, unit: TimeUnit, tz: Option<&str>) -> String {
        let zone = match base {
            AtomicType::Date => None,
            _ => tz,
        };
        let c = Self::civil(expr, zone);
        let truncated = match unit {
            TimeUnit::Second => format!("CAST(DATE_FORMAT({}, '%Y-%m-%d %H:%i:%s') AS DATETIME)", c),
            TimeUnit::Minute => format!("CAST(DATE_FORMAT({}, '%Y-%m-%d %H:%i:00') AS DATETIME)", c),
            TimeUnit::Hour => format!("CAST(DATE_FORMAT({}, '%Y-%m-%d %H:00:00') AS DATETIME)", c),
            TimeUnit::Day => format!("CAST(DATE({}) AS DATETIME)", c),
            TimeUnit::Week => format!(
                "CAST(DATE_SUB(DATE({c}), INTERVAL WEEKDAY({c}) DAY) AS DATETIME)",
                c = c
            ),
            TimeUnit::Month => format!("CAST(DATE_FORMAT({}, '%Y-%m-01') AS DATETIME)", c),
            TimeUnit::Quarter => format!(
                "CAST(MAKEDATE(YEAR({c}), 1) + INTERVAL QUARTER({c}) - 1 QUARTER AS DATETIME)",
                c = c
            ),
            TimeUnit::Year => format!("CAST(DATE_FORMAT({}, '%Y-01-01') AS DATETIME)", c),
        };
        match (base, zone) {
            (AtomicType::Date, _) => format!("DATE({})", truncated),
            (_, Some(tz)) => format!("CONVERT_TZ({}, '{}', 'UTC')", truncated, tz),
            (_, None) => truncated,
        }
    }

    fn sql_extract(&self, expr: &str, base: AtomicType, unit: ExtractUnit, tz: Option<&str>) -> String {
        let c = match base {
            AtomicType::Timestamp => Self::civil(expr, tz),
            _ => expr.to_string(),
        };
        match unit {
            ExtractUnit::DayOfWeek => format!("DAYOFWEEK({})", c),
            ExtractUnit::DayOfYear => format!("DAYOFYEAR({})", c),
            ExtractUnit::Week => format!("WEEK({}, 3)", c),
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
        let func = match op {
            OffsetOp::Add => "DATE_ADD",
            OffsetOp::Sub => "DATE_SUB",
        };
        format!(
            "{}({}, INTERVAL {} {})",
            func,
            expr,
            amount,
            helpers::unit_keyword(unit)
        )
    }

    fn sql_time_diff(&self, unit: TimeUnit, from: &str, to: &str, _base: AtomicType) -> String {
        format!(
            "TIMESTAMPDIFF({}, {}, {})",
            helpers::unit_keyword(unit),
            from,
            to
        )
    }

    fn sql_sample_table(&self, table_sql: &str, sampling: &Sampling) -> String {
        match helpers::resolve_sampling(sampling) {
            Some(Sampling::Rows(n)) => {
                format!("(SELECT * FROM {} ORDER BY RAND() LIMIT {})", table_sql, n)
            }
            Some(Sampling::Percent(p)) => format!(
                "(SELECT * FROM {} WHERE RAND() < {})",
                table_sql,
                p / 100.0
            ),
            _ => table_sql.to_string(),
        }
    }

    fn supports_full_join(&self) -> bool {
        false
    }

    fn has_native_booleans(&self) -> bool {
        false
    }
}
