//! SQL validation helpers for tests.
//!
//! Parses emitted SQL with sqlparser-rs so syntax errors surface in tests.

use sqlparser::dialect::{
    BigQueryDialect, DuckDbDialect, GenericDialect, MySqlDialect, PostgreSqlDialect,
    SnowflakeDialect,
};
use sqlparser::parser::Parser;

/// Check that `sql` parses for the dialect registered under `dialect`.
pub fn validate_sql(sql: &str, dialect: &str) -> Result<(), String> {
    let parser_dialect: Box<dyn sqlparser::dialect::Dialect> = match dialect {
        "postgres" => Box::new(PostgreSqlDialect {}),
        "duckdb" => Box::new(DuckDbDialect {}),
        "mysql" => Box::new(MySqlDialect {}),
        "snowflake" => Box::new(SnowflakeDialect {}),
        "standardsql" | "bigquery" => Box::new(BigQueryDialect {}),
        _ => Box::new(GenericDialect {}),
    };

    Parser::parse_sql(&*parser_dialect, sql)
        .map(|_| ())
        .map_err(|e| format!("Invalid SQL for {}: {}\nSQL: {}", dialect, e, sql))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_valid_sql() {
        validate_sql("SELECT * FROM users", "postgres").unwrap();
        validate_sql("SELECT * FROM users", "mysql").unwrap();
    }

    #[test]
    fn test_validate_invalid_sql() {
        assert!(validate_sql("SELEC * FORM users", "postgres").is_err());
    }
}
