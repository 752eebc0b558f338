//! SELECT statement builder.

use super::dialect::SqlDialect;
use super::expr::{Expr, ExprExt, SortDir};
use super::token::{Token, TokenStream};

// =============================================================================
// Select expression
// =============================================================================

/// A SELECT list item.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct SelectExpr {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectExpr {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: &str) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    pub fn to_tokens(&self, dialect: &dyn SqlDialect) -> TokenStream {
        let mut ts = self.expr.to_tokens(dialect);
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

impl From<Expr> for SelectExpr {
    fn from(expr: Expr) -> Self {
        SelectExpr::new(expr)
    }
}

// =============================================================================
// Table reference
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    /// A CTE or other bare name.
    Named(String),
    /// A dotted table path.
    Path(String),
    Subquery(Box<Query>),
    /// A table expression produced by a dialect hook.
    Raw(String),
}

/// A FROM item with optional alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct TableRef {
    pub source: TableSource,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn named(name: &str) -> Self {
        Self {
            source: TableSource::Named(name.into()),
            alias: None,
        }
    }

    pub fn path(path: &str) -> Self {
        Self {
            source: TableSource::Path(path.into()),
            alias: None,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            source: TableSource::Raw(sql.into()),
            alias: None,
        }
    }

    pub fn subquery(query: Query) -> Self {
        Self {
            source: TableSource::Subquery(Box::new(query)),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn to_tokens(&self, dialect: &dyn SqlDialect) -> TokenStream {
        let mut ts = TokenStream::new();
        match &self.source {
            TableSource::Named(name) => {
                ts.push(Token::Ident(name.clone()));
            }
            TableSource::Path(path) => {
                ts.push(Token::TablePath(path.clone()));
            }
            TableSource::Subquery(query) => {
                ts.lparen()
                    .append(&query.to_tokens(dialect))
                    .rparen();
            }
            TableSource::Raw(sql) => {
                ts.push(Token::Raw(sql.clone()));
            }
        }
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

// =============================================================================
// Joins
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    Standard {
        join_type: JoinType,
        table: TableRef,
        on: Option<Expr>,
    },
    /// A complete join clause from a dialect hook (unnest, group sets).
    Raw(String),
}

impl Join {
    pub fn to_tokens(&self, dialect: &dyn SqlDialect) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            Join::Standard {
                join_type,
                table,
                on,
            } => {
                match join_type {
                    JoinType::Inner => ts.push(Token::Inner),
                    JoinType::Left => ts.push(Token::Left),
                    JoinType::Right => ts.push(Token::Right),
                    JoinType::Full => ts.push(Token::Full).space().push(Token::Outer),
                    JoinType::Cross => ts.push(Token::Cross),
                };
                ts.space().push(Token::Join).space();
                ts.append(&table.to_tokens(dialect));
                if let Some(on) = on {
                    ts.space().push(Token::On).space();
                    ts.append(&on.to_tokens(dialect));
                }
            }
            Join::Raw(sql) => {
                ts.push(Token::Raw(sql.clone()));
            }
        }
        ts
    }
}

// =============================================================================
// ORDER BY
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct OrderByExpr {
    pub expr: Expr,
    pub dir: Option<SortDir>,
}

impl OrderByExpr {
    pub fn new(expr: Expr, dir: SortDir) -> Self {
        Self {
            expr,
            dir: Some(dir),
        }
    }

    pub fn to_tokens(&self, dialect: &dyn SqlDialect) -> TokenStream {
        let mut ts = self.expr.to_tokens(dialect);
        if let Some(dir) = &self.dir {
            ts.space().push(match dir {
                SortDir::Asc => Token::Asc,
                SortDir::Desc => Token::Desc,
            });
        }
        ts
    }
}

// =============================================================================
// CTE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct Cte {
    pub name: String,
    pub query: Box<Query>,
}

impl Cte {
    pub fn new(name: &str, query: Query) -> Self {
        Self {
            name: name.into(),
            query: Box::new(query),
        }
    }

    pub fn to_tokens(&self, dialect: &dyn SqlDialect) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::Ident(self.name.clone()))
            .space()
            .push(Token::As)
            .space()
            .lparen()
            .newline()
            .append(&self.query.to_tokens(dialect))
            .newline()
            .rparen();
        ts
    }
}

// =============================================================================
// Query
// =============================================================================

/// A SELECT statement.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use = "Query has no effect until converted to SQL with to_sql()"]
pub struct Query {
    pub with: Vec<Cte>,
    pub select: Vec<SelectExpr>,
    pub distinct: bool,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    /// Filter over window results, for dialects with `QUALIFY`.
    pub qualify: Option<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cte(mut self, cte: Cte) -> Self {
        self.with.push(cte);
        self
    }

    pub fn select(mut self, exprs: Vec<impl Into<SelectExpr>>) -> Self {
        self.select = exprs.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn column(mut self, expr: SelectExpr) -> Self {
        self.select.push(expr);
        self
    }

    pub fn from(mut self, table: TableRef) -> Self {
        self.from = Some(table);
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Add a WHERE condition, ANDed with existing ones.
    pub fn filter(mut self, condition: Expr) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn having(mut self, condition: Expr) -> Self {
        self.having = Some(match self.having {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    pub fn qualify(mut self, condition: Expr) -> Self {
        self.qualify = Some(match self.qualify {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    pub fn order_by(mut self, exprs: Vec<OrderByExpr>) -> Self {
        self.order_by = exprs;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_tokens(&self, dialect: &dyn SqlDialect) -> TokenStream {
        let mut ts = TokenStream::new();

        if !self.with.is_empty() {
            ts.push(Token::With).space();
            for (i, cte) in self.with.iter().enumerate() {
                if i > 0 {
                    ts.comma().newline();
                }
                ts.append(&cte.to_tokens(dialect));
            }
            ts.newline();
        }

        ts.push(Token::Select);
        if self.distinct {
            ts.space().push(Token::Distinct);
        }

        for (i, select_expr) in self.select.iter().enumerate() {
            if i == 0 {
                ts.newline().indent(1);
            } else {
                ts.comma().newline().indent(1);
            }
            ts.append(&select_expr.to_tokens(dialect));
        }

        if let Some(from) = &self.from {
            ts.newline().push(Token::From).space();
            ts.append(&from.to_tokens(dialect));
        }

        for join in &self.joins {
            ts.newline();
            ts.append(&join.to_tokens(dialect));
        }

        if let Some(where_clause) = &self.where_clause {
            ts.newline().push(Token::Where).space();
            ts.append(&where_clause.to_tokens(dialect));
        }

        if !self.group_by.is_empty() {
            ts.newline().push(Token::GroupBy).space();
            for (i, expr) in self.group_by.iter().enumerate() {
                if i > 0 {
                    ts.comma();
                }
                ts.append(&expr.to_tokens(dialect));
            }
        }

        if let Some(having) = &self.having {
            ts.newline().push(Token::Having).space();
            ts.append(&having.to_tokens(dialect));
        }

        if let Some(qualify) = &self.qualify {
            ts.newline().push(Token::Qualify).space();
            ts.append(&qualify.to_tokens(dialect));
        }

        if !self.order_by.is_empty() {
            ts.newline().push(Token::OrderBy).space();
            for (i, order_expr) in self.order_by.iter().enumerate() {
                if i > 0 {
                    ts.comma();
                }
                ts.append(&order_expr.to_tokens(dialect));
            }
        }

        let limit_offset = dialect.emit_limit_offset(self.limit, None);
        if !limit_offset.is_empty() {
            ts.newline();
            ts.append(&limit_offset);
        }

        ts
    }

    pub fn to_sql(&self, dialect: &dyn SqlDialect) -> String {
        self.to_tokens(dialect).serialize(dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::dialect::get_dialect;
    use crate::sql::expr::{col, func, lit_int, raw_sql, table_col};
    use crate::sql::test_utils::validate_sql;

    #[test]
    fn test_grouped_select() {
        let dialect = get_dialect("duckdb").unwrap();
        let query = Query::new()
            .select(vec![
                SelectExpr::aliased(table_col("base", "carrier"), "carrier"),
                SelectExpr::aliased(func("COUNT", vec![lit_int(1)]), "flight_count"),
            ])
            .from(TableRef::path("faa.flights").with_alias("base"))
            .group_by(vec![lit_int(1)])
            .order_by(vec![OrderByExpr::new(lit_int(2), SortDir::Desc)])
            .limit(10);

        let sql = query.to_sql(dialect);
        println!("{}", sql);
        assert!(sql.contains("FROM \"faa\".\"flights\" AS \"base\""));
        assert!(sql.contains("GROUP BY 1"));
        assert!(sql.contains("ORDER BY 2 DESC"));
        assert!(sql.ends_with("LIMIT 10"));
        validate_sql(&sql, "duckdb").unwrap();
    }

    #[test]
    fn test_cte_chain() {
        let dialect = get_dialect("postgres").unwrap();
        let stage = Query::new()
            .select(vec![col("a")])
            .from(TableRef::path("t").with_alias("base"));
        let outer = Query::new()
            .with_cte(Cte::new("__stage0", stage))
            .select(vec![col("a")])
            .from(TableRef::named("__stage0"));

        let sql = outer.to_sql(dialect);
        assert!(sql.starts_with("WITH \"__stage0\" AS (\n"));
        validate_sql(&sql, "postgres").unwrap();
    }

    #[test]
    fn test_qualify_follows_having() {
        let dialect = get_dialect("snowflake").unwrap();
        let query = Query::new()
            .select(vec![
                SelectExpr::new(col("a")),
                SelectExpr::aliased(raw_sql("ROW_NUMBER() OVER (ORDER BY \"a\")"), "rn"),
            ])
            .from(TableRef::path("t"))
            .qualify(raw_sql("\"rn\" <= 3"))
            .qualify(raw_sql("\"a\" > 0"));
        let sql = query.to_sql(dialect);
        println!("{}", sql);
        assert!(sql.contains("\nQUALIFY "), "{}", sql);
        assert!(sql.contains("\"rn\" <= 3"), "{}", sql);
        assert!(sql.contains("\"a\" > 0"), "{}", sql);
        validate_sql(&sql, "snowflake").unwrap();
    }

    #[test]
    fn test_raw_join() {
        let dialect = get_dialect("postgres").unwrap();
        let query = Query::new()
            .select(vec![col("group_set")])
            .from(TableRef::path("t").with_alias("base"))
            .join(Join::Raw("CROSS JOIN GENERATE_SERIES(0,2,1) AS group_set".into()));
        let sql = query.to_sql(dialect);
        assert!(sql.contains("\nCROSS JOIN GENERATE_SERIES(0,2,1) AS group_set"));
    }
}
