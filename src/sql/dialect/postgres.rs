//! PostgreSQL SQL dialect.
//!
//! PostgreSQL features:
//! - ANSI identifier quoting (`"`)
//! - Native boolean type (true/false)
//! - FILTER clause for aggregates
//! - `GENERATE_SERIES` for grouping-set fan-out
//! - JSONB for nested results and record columns
//! - No safe cast

use crate::model::{AtomicType, ExtractUnit, OffsetOp, TimeUnit};

use super::helpers;
use super::{ParentKind, SqlDialect};

/// PostgreSQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn sql_number_literal(&self, text: &str) -> String {
        if text.contains(['.', 'e', 'E']) {
            format!("{}::DOUBLE PRECISION", text)
        } else {
            text.to_string()
        }
    }

    fn sql_type_name(&self, ty: AtomicType) -> &'static str {
        match ty {
            AtomicType::String => "VARCHAR",
            AtomicType::Number => "DOUBLE PRECISION",
            AtomicType::Boolean => "BOOLEAN",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "TIMESTAMP",
            AtomicType::Json | AtomicType::SqlNative => "JSONB",
        }
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_postgres(name)
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
        format!("{} ~ {}", expr, regex)
    }

    fn sql_group_set_table(&self, max_set: usize) -> String {
        format!(
            "CROSS JOIN GENERATE_SERIES(0,{},1) AS group_set",
            max_set
        )
    }

    fn sql_any_value(&self, group_set: usize, column: &str) -> String {
        format!(
            "(ARRAY_AGG({c}) FILTER (WHERE group_set={n} AND {c} IS NOT NULL))[1]",
            c = column,
            n = group_set
        )
    }

    fn sql_generate_uuid(&self) -> String {
        "GEN_RANDOM_UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, key: &str) -> String {
        let hex = format!("MD5({}::TEXT)", key);
        format!(
            "(('x' || SUBSTR({h}, 1, 16))::BIT(64)::BIGINT::DECIMAL(65,0) * 4294967296 \
             + ('x' || SUBSTR({h}, 17, 8))::BIT(32)::BIGINT::DECIMAL(65,0))",
            h = hex
        )
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, avg: bool) -> String {
        let hashed = self.sql_sum_distinct_hashed_key(key);
        let cast = format!("({})::NUMERIC", value);
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
            "COALESCE(JSONB_AGG(JSONB_BUILD_OBJECT({}){}) FILTER (WHERE {}), '[]'::JSONB)",
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
            "LEFT JOIN JSONB_ARRAY_ELEMENTS(TO_JSONB({})) AS {} ON true",
            source,
            self.quote_identifier(alias)
        )
    }

    fn sql_field_reference(&self, parent: &str, kind: ParentKind, field: &str, ty: AtomicType) -> String {
        let text = match kind {
            ParentKind::Table => return format!("{}.{}", parent, self.quote_identifier(field)),
            ParentKind::ArrayScalar => match ty {
                AtomicType::Json | AtomicType::SqlNative => return parent.to_string(),
                _ => format!("({} #>> '{{}}')", parent),
            },
            ParentKind::Record | ParentKind::ArrayRecord => match ty {
                AtomicType::Json | AtomicType::SqlNative => {
                    return format!("({}->{})", parent, self.quote_string(field))
                }
                _ => format!("({}->>{})", parent, self.quote_string(field)),
            },
        };
        match ty {
            AtomicType::String => text,
            other => format!("{}::{}", text, self.sql_type_name(other)),
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

    fn sql_time_diff(&self, unit: TimeUnit, from: &str, to: &str, base: AtomicType) -> String {
        let (from, to) = match base {
            AtomicType::Date => (format!("({})::TIMESTAMP", from), format!("({})::TIMESTAMP", to)),
            _ => (from.to_string(), to.to_string()),
        };
        let months = || {
            format!(
                "((EXTRACT(YEAR FROM {t}) - EXTRACT(YEAR FROM {f})) * 12 + (EXTRACT(MONTH FROM {t}) - EXTRACT(MONTH FROM {f})))",
                f = from,
                t = to
            )
        };
        match unit {
            TimeUnit::Month => months(),
            TimeUnit::Quarter => format!("FLOOR({} / 3)", months()),
            TimeUnit::Year => format!(
                "(EXTRACT(YEAR FROM {}) - EXTRACT(YEAR FROM {}))",
                to, from
            ),
            fixed => format!(
                "FLOOR(EXTRACT(EPOCH FROM ({} - {})) / {})",
                to,
                from,
                fixed.fixed_seconds().unwrap_or(1)
            ),
        }
    }
}
