//! Shared building blocks for dialect implementations.
//!
//! Dialects compose these to implement [`super::SqlDialect`] with minimal
//! duplication.

use crate::model::{AtomicType, ExtractUnit, OffsetOp, Sampling, TimeUnit, DEFAULT_SAMPLE_ROWS};

use super::super::token::{Token, TokenStream};

// =============================================================================
// Identifier and string quoting
// =============================================================================

/// Used by: Postgres, DuckDB, Snowflake
pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Used by: MySQL, StandardSQL
pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Quote each dotted segment of a table path separately.
pub fn quote_path_segments(path: &str, quote: fn(&str) -> String) -> String {
    path.split('.').map(quote).collect::<Vec<_>>().join(".")
}

/// Standard single-quoted string with `''` escaping.
pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Single-quoted string where backslash is also an escape character.
/// Used by: MySQL, StandardSQL, Snowflake
pub fn quote_string_backslash(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

// =============================================================================
// Booleans and pagination
// =============================================================================

pub fn format_bool_literal(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Used by: MySQL
pub fn format_bool_numeric(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

/// `LIMIT n OFFSET m`
pub fn emit_limit_offset_standard(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();

    if let Some(lim) = limit {
        ts.push(Token::Limit)
            .space()
            .push(Token::LitInt(lim as i64));
    }

    if let Some(off) = offset {
        if limit.is_some() {
            ts.space();
        }
        ts.push(Token::Offset)
            .space()
            .push(Token::LitInt(off as i64));
    }

    ts
}

// =============================================================================
// Function remapping
// =============================================================================

pub fn remap_function_postgres(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "IFNULL" | "NVL" => Some("COALESCE"),
        "CHAR_LENGTH" => Some("LENGTH"),
        _ => None,
    }
}

pub fn remap_function_duckdb(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "IFNULL" | "NVL" => Some("COALESCE"),
        "CHAR_LENGTH" => Some("LENGTH"),
        _ => None,
    }
}

pub fn remap_function_mysql(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NVL" => Some("IFNULL"),
        "SUBSTR" => Some("SUBSTRING"),
        "LENGTH" => Some("CHAR_LENGTH"),
        _ => None,
    }
}

pub fn remap_function_snowflake(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "IFNULL" => Some("NVL"),
        "CHAR_LENGTH" => Some("LENGTH"),
        _ => None,
    }
}

pub fn remap_function_standardsql(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NVL" => Some("IFNULL"),
        "LENGTH" => Some("CHAR_LENGTH"),
        _ => None,
    }
}

// =============================================================================
// Type mapping
// =============================================================================

/// Classify a database column type name.
///
/// Parameters (`VARCHAR(20)`, `NUMERIC(10,2)`) are ignored.
pub fn atomic_type_for_common(sql_type: &str) -> AtomicType {
    let upper = sql_type.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or_default().trim();
    match base {
        "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" | "BPCHAR"
        | "NVARCHAR" | "UUID" | "ENUM" | "CITEXT" => AtomicType::String,
        "INT" | "INTEGER" | "INT2" | "INT4" | "INT8" | "INT64" | "BIGINT" | "SMALLINT"
        | "TINYINT" | "MEDIUMINT" | "HUGEINT" | "UBIGINT" | "UINTEGER" | "DECIMAL"
        | "NUMERIC" | "BIGNUMERIC" | "NUMBER" | "FLOAT" | "FLOAT4" | "FLOAT8" | "FLOAT64"
        | "DOUBLE" | "DOUBLE PRECISION" | "REAL" => AtomicType::Number,
        "BOOL" | "BOOLEAN" => AtomicType::Boolean,
        "DATE" => AtomicType::Date,
        "JSON" | "JSONB" | "VARIANT" | "OBJECT" => AtomicType::Json,
        b if b.starts_with("TIMESTAMP") || b == "DATETIME" => AtomicType::Timestamp,
        _ => AtomicType::SqlNative,
    }
}

// =============================================================================
// Grouping sets and symmetric aggregates
// =============================================================================

/// `CASE WHEN group_set=n THEN value END`
pub fn guard_group_set(group_set: usize, value: &str) -> String {
    format!("CASE WHEN group_set={} THEN {} END", group_set, value)
}

/// Moves a 92-bit hashed key nine places right. The key stays exact in a
/// scale-9 decimal and the sum keeps room for every row below the 29 integer
/// digits of `NUMERIC` and `NUMBER(38,9)`.
pub const HASHED_KEY_SHIFT: &str = "0.000000001";

pub fn shift_hashed_key(hashed_key: &str) -> String {
    format!("({} * {})", hashed_key, HASHED_KEY_SHIFT)
}

/// `SUM(DISTINCT hash + value) - SUM(DISTINCT hash)`, divided by the count of
/// distinct keys with a value for averages.
pub fn symmetric_sum(hashed_key: &str, value_cast: &str, key: &str, value: &str, avg: bool) -> String {
    let sum = format!(
        "(SUM(DISTINCT {h} + COALESCE({v}, 0)) - SUM(DISTINCT {h}))",
        h = hashed_key,
        v = value_cast
    );
    if avg {
        format!(
            "({} / NULLIF(COUNT(DISTINCT CASE WHEN {} IS NOT NULL THEN {} END), 0))",
            sum, value, key
        )
    } else {
        sum
    }
}

/// `SELECT 0 AS group_set UNION ALL SELECT 1 ...`
pub fn group_set_union(max_set: usize) -> String {
    (0..=max_set)
        .map(|n| {
            if n == 0 {
                "SELECT 0 AS group_set".to_string()
            } else {
                format!("SELECT {}", n)
            }
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

// =============================================================================
// Time
// =============================================================================

pub fn unit_keyword(unit: TimeUnit) -> &'static str {
    match unit {
        TimeUnit::Second => "SECOND",
        TimeUnit::Minute => "MINUTE",
        TimeUnit::Hour => "HOUR",
        TimeUnit::Day => "DAY",
        TimeUnit::Week => "WEEK",
        TimeUnit::Month => "MONTH",
        TimeUnit::Quarter => "QUARTER",
        TimeUnit::Year => "YEAR",
    }
}

pub fn extract_keyword(unit: ExtractUnit) -> &'static str {
    match unit {
        ExtractUnit::Second => "SECOND",
        ExtractUnit::Minute => "MINUTE",
        ExtractUnit::Hour => "HOUR",
        ExtractUnit::Day => "DAY",
        ExtractUnit::DayOfWeek => "DOW",
        ExtractUnit::DayOfYear => "DOY",
        ExtractUnit::Week => "WEEK",
        ExtractUnit::Month => "MONTH",
        ExtractUnit::Quarter => "QUARTER",
        ExtractUnit::Year => "YEAR",
    }
}

/// Postgres-style UTC timestamp to civil time in `tz`.
pub fn at_time_zone_civil(expr: &str, tz: &str) -> String {
    format!("(({}) AT TIME ZONE 'UTC') AT TIME ZONE '{}'", expr, tz)
}

/// Postgres-style civil time in `tz` back to a UTC timestamp.
pub fn at_time_zone_utc(expr: &str, tz: &str) -> String {
    format!("(({}) AT TIME ZONE '{}') AT TIME ZONE 'UTC'", expr, tz)
}

/// `DATE_TRUNC` with civil-time conversion (Postgres, DuckDB).
pub fn truncate_date_trunc(expr: &str, base: AtomicType, unit: TimeUnit, tz: Option<&str>) -> String {
    let part = unit.as_str();
    match (base, tz) {
        (AtomicType::Date, _) => format!("DATE_TRUNC('{}', {})::DATE", part, expr),
        (_, Some(tz)) => at_time_zone_utc(
            &format!("DATE_TRUNC('{}', {})", part, at_time_zone_civil(expr, tz)),
            tz,
        ),
        (_, None) => format!("DATE_TRUNC('{}', {})", part, expr),
    }
}

/// `EXTRACT` with civil-time conversion and 1 = Sunday day of week
/// (Postgres, DuckDB).
pub fn extract_pg_style(expr: &str, base: AtomicType, unit: ExtractUnit, tz: Option<&str>) -> String {
    let civil = match (base, tz) {
        (AtomicType::Timestamp, Some(tz)) => at_time_zone_civil(expr, tz),
        _ => expr.to_string(),
    };
    match unit {
        ExtractUnit::DayOfWeek => format!("(EXTRACT(DOW FROM {})+1)", civil),
        ExtractUnit::Second => format!("FLOOR(EXTRACT(SECOND FROM {}))", civil),
        other => format!("EXTRACT({} FROM {})", extract_keyword(other), civil),
    }
}

/// `x + n * INTERVAL '1 unit'` (Postgres, DuckDB).
pub fn offset_interval(expr: &str, base: AtomicType, op: OffsetOp, amount: &str, unit: TimeUnit) -> String {
    let (count, unit_name) = match unit {
        TimeUnit::Quarter => (3, "month"),
        other => (1, other.as_str()),
    };
    let sign = match op {
        OffsetOp::Add => "+",
        OffsetOp::Sub => "-",
    };
    let shifted = format!(
        "({} {} ({}) * INTERVAL '{} {}')",
        expr, sign, amount, count, unit_name
    );
    match base {
        AtomicType::Date => format!("({})::DATE", shifted),
        _ => shifted,
    }
}

/// Normalize `sample: true/false` to a concrete request.
pub fn resolve_sampling(sampling: &Sampling) -> Option<Sampling> {
    match sampling {
        Sampling::Enable(true) => Some(Sampling::Rows(DEFAULT_SAMPLE_ROWS)),
        Sampling::Enable(false) => None,
        other => Some(*other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shifted_key_sums_fit_numeric() {
        // 15 hex digits times 2^32, plus 8 more hex digits.
        let max_key: u128 = ((1u128 << 60) - 1) * (1u128 << 32) + ((1u128 << 32) - 1);
        let shift = 10u128.pow(HASHED_KEY_SHIFT.trim_start_matches("0.").len() as u32);
        let rows = 1_000_000u128;
        let integer_limit = 10u128.pow(29);

        assert_eq!(shift, 10u128.pow(9));
        assert!(max_key / shift * rows < integer_limit);
        assert!(max_key * rows > integer_limit);
    }

    #[test]
    fn test_atomic_type_for_common() {
        assert_eq!(atomic_type_for_common("varchar(20)"), AtomicType::String);
        assert_eq!(atomic_type_for_common("DOUBLE PRECISION"), AtomicType::Number);
        assert_eq!(
            atomic_type_for_common("timestamp with time zone"),
            AtomicType::Timestamp
        );
        assert_eq!(atomic_type_for_common("geography"), AtomicType::SqlNative);
    }

    #[test]
    fn test_symmetric_sum_shape() {
        let sql = symmetric_sum("H", "CAST(v AS NUMERIC)", "k", "v", false);
        assert_eq!(
            sql,
            "(SUM(DISTINCT H + COALESCE(CAST(v AS NUMERIC), 0)) - SUM(DISTINCT H))"
        );
        let avg = symmetric_sum("H", "v", "k", "v", true);
        assert!(avg.contains("NULLIF(COUNT(DISTINCT CASE WHEN v IS NOT NULL THEN k END), 0)"));
    }

    #[test]
    fn test_group_set_union() {
        assert_eq!(
            group_set_union(2),
            "SELECT 0 AS group_set UNION ALL SELECT 1 UNION ALL SELECT 2"
        );
    }

    #[test]
    fn test_quote_strings() {
        assert_eq!(quote_string_single("it's"), "'it''s'");
        assert_eq!(quote_string_backslash("a\\b'c"), "'a\\\\b\\'c'");
    }
}
