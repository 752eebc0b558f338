//! The CTE chain a compiled query is written into.

use tracing::debug;

use crate::sql::dialect::SqlDialect;
use crate::sql::{Cte, Query};

/// Collects pipeline stages as named statements.
///
/// Every stage is registered under `__stage{n}`. Rendering emits all but the
/// last stage as CTEs and the last one as the main statement. Query sources
/// compile into the same writer so their stages share the chain.
#[derive(Debug)]
pub struct StageWriter {
    dialect: &'static dyn SqlDialect,
    stages: Vec<(String, Query)>,
}

impl StageWriter {
    pub fn new(dialect: &'static dyn SqlDialect) -> Self {
        Self {
            dialect,
            stages: Vec::new(),
        }
    }

    /// Register a stage and return its CTE name.
    pub fn add_stage(&mut self, query: Query) -> String {
        let name = format!("__stage{}", self.stages.len());
        debug!(stage = %name, dialect = self.dialect.name(), "emitting stage");
        self.stages.push((name.clone(), query));
        name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Drop stages registered after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.stages.truncate(len);
    }

    /// Name of the most recent stage.
    pub fn last_name(&self) -> Option<&str> {
        self.stages.last().map(|(name, _)| name.as_str())
    }

    /// Render the chain: earlier stages become CTEs of the last one.
    pub fn into_sql(mut self) -> String {
        let Some((_, last)) = self.stages.pop() else {
            return String::new();
        };
        let mut statement = last;
        let mut ctes: Vec<Cte> = self
            .stages
            .into_iter()
            .map(|(name, query)| Cte::new(&name, query))
            .collect();
        ctes.append(&mut statement.with);
        statement.with = ctes;
        statement.to_sql(self.dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::dialect::get_dialect;
    use crate::sql::{col, TableRef};

    #[test]
    fn test_chain_renders_ctes() {
        let dialect = get_dialect("duckdb").unwrap();
        let mut writer = StageWriter::new(dialect);
        let first = writer.add_stage(
            Query::new()
                .select(vec![col("a")])
                .from(TableRef::path("t").with_alias("base")),
        );
        let second = writer.add_stage(
            Query::new()
                .select(vec![col("a")])
                .from(TableRef::named(&first).with_alias("base")),
        );
        assert_eq!(second, "__stage1");
        assert_eq!(writer.last_name(), Some("__stage1"));

        let sql = writer.into_sql();
        println!("{}", sql);
        assert!(sql.starts_with("WITH \"__stage0\" AS ("));
        assert!(sql.contains("FROM \"__stage0\" AS \"base\""));
        assert!(!sql.contains("\"__stage1\" AS ("));
    }

    #[test]
    fn test_single_stage_has_no_with() {
        let dialect = get_dialect("postgres").unwrap();
        let mut writer = StageWriter::new(dialect);
        writer.add_stage(Query::new().select(vec![col("a")]).from(TableRef::path("t")));
        assert!(writer.into_sql().starts_with("SELECT"));
    }
}
