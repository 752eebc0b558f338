//! One query, every dialect.

use sqlparser::dialect::{GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use quiver::compiler::{CompileError, CompileOptions, QueryCompiler};
use quiver::dialect::{dialect_names, get_dialect};
use quiver::model::{
    AggregateFunc, AtomicField, AtomicType, BinaryOp, Expr, ExpressionType, FieldDef, JoinInfo,
    JoinKind, JoinRelationship, Literal, ModelDef, NamedObject, OrderBy, OrderKey, PipeSegment,
    Query, QueryField, QuerySegment, SortDirection, SourceRef, StructDef,
};

fn carriers(kind: JoinKind) -> StructDef {
    let mut carriers = StructDef::table("carriers", "faa.carriers", "postgres", "conn")
        .column("code", AtomicType::String)
        .column("nickname", AtomicType::String)
        .primary_key("code");
    carriers.join = Some(JoinInfo {
        relationship: JoinRelationship::One,
        join_type: kind,
        on: Some(Expr::binary(
            BinaryOp::Eq,
            Expr::field(&["carrier"]),
            Expr::field(&["carriers", "code"]),
        )),
    });
    carriers
}

fn model(kind: JoinKind) -> ModelDef {
    let flights = StructDef::table("flights", "faa.flights", "postgres", "conn")
        .column("carrier", AtomicType::String)
        .column("distance", AtomicType::Number)
        .field_def(FieldDef::Struct(carriers(kind)))
        .field_def(FieldDef::Atomic(AtomicField::computed(
            "flight_count",
            AtomicType::Number,
            Expr::aggregate(AggregateFunc::Count, None, vec![]),
            ExpressionType::Aggregate,
        )))
        .field_def(FieldDef::Atomic(AtomicField::computed(
            "total_distance",
            AtomicType::Number,
            Expr::aggregate(AggregateFunc::Sum, Some(Expr::field(&["distance"])), vec![]),
            ExpressionType::Aggregate,
        )));
    let mut model = ModelDef::new("file:///faa.json");
    model
        .contents
        .insert("flights".into(), NamedObject::Source(flights));
    model
}

fn query(fields: &[&[&str]]) -> Query {
    Query::new(
        SourceRef::Named("flights".into()),
        vec![PipeSegment::Reduce(QuerySegment {
            fields: fields.iter().map(|p| QueryField::reference(p)).collect(),
            order_by: vec![OrderBy {
                field: OrderKey::Name("carrier".into()),
                dir: Some(SortDirection::Asc),
            }],
            limit: Some(10),
            ..Default::default()
        })],
    )
}

fn options(dialect: &str) -> CompileOptions {
    CompileOptions {
        dialect: Some(dialect.into()),
        default_row_limit: None,
    }
}

fn compile(kind: JoinKind, dialect: &str) -> Result<String, CompileError> {
    QueryCompiler::new(&model(kind))
        .compile_with(
            &query(&[&["carrier"], &["carriers", "nickname"], &["flight_count"], &["total_distance"]]),
            &options(dialect),
        )
        .map(|c| c.sql)
}

fn validate_sql(sql: &str, dialect: &str) {
    let result = match dialect {
        "postgres" => Parser::parse_sql(&PostgreSqlDialect {}, sql),
        "mysql" => Parser::parse_sql(&MySqlDialect {}, sql),
        _ => Parser::parse_sql(&GenericDialect {}, sql),
    };
    assert!(result.is_ok(), "{} SQL failed to parse: {:?}\n{}", dialect, result.err(), sql);
}

// ============================================================================
// Matrix
// ============================================================================

#[test]
fn test_registry_names() {
    assert_eq!(
        dialect_names(),
        vec!["duckdb", "mysql", "postgres", "snowflake", "standardsql"]
    );
    assert_eq!(get_dialect("bigquery").map(|d| d.name()), Some("standardsql"));
    assert_eq!(get_dialect("DuckDB").map(|d| d.name()), Some("duckdb"));
    assert!(get_dialect("oracle").is_none());
}

#[test]
fn test_every_dialect_compiles_the_same_query() {
    for dialect in dialect_names() {
        let sql = compile(JoinKind::Left, dialect).unwrap();
        println!("-- {}\n{}", dialect, sql);
        assert!(sql.contains("LEFT JOIN"), "{}: {}", dialect, sql);
        assert!(sql.contains("GROUP BY"), "{}: {}", dialect, sql);
        assert!(sql.contains("LIMIT 10"), "{}: {}", dialect, sql);
        // A one join does not repeat root rows.
        assert!(!sql.contains("SUM(DISTINCT"), "{}: {}", dialect, sql);
    }
}

#[test]
fn test_identifier_quoting() {
    let flat = query(&[&["carrier"], &["flight_count"]]);
    for (dialect, quoted) in [
        ("duckdb", "\"base\".\"carrier\""),
        ("postgres", "\"base\".\"carrier\""),
        ("snowflake", "\"base\".\"carrier\""),
        ("mysql", "`base`.`carrier`"),
        ("standardsql", "`base`.`carrier`"),
    ] {
        let sql = QueryCompiler::new(&model(JoinKind::Left))
            .compile_with(&flat, &options(dialect))
            .unwrap()
            .sql;
        assert!(sql.contains(quoted), "{}: {}", dialect, sql);
    }
}

#[test]
fn test_flat_queries_parse() {
    let flat = query(&[&["carrier"], &["flight_count"], &["total_distance"]]);
    for dialect in ["postgres", "mysql"] {
        let sql = QueryCompiler::new(&model(JoinKind::Left))
            .compile_with(&flat, &options(dialect))
            .unwrap()
            .sql;
        validate_sql(&sql, dialect);
    }
}

#[test]
fn test_compiled_dialect_is_canonical() {
    let compiled = QueryCompiler::new(&model(JoinKind::Left))
        .compile_with(&query(&[&["carrier"], &["flight_count"]]), &options("BigQuery"))
        .unwrap();
    assert_eq!(compiled.dialect, "standardsql");
    assert_eq!(compiled.connection_name, "conn");
}

// ============================================================================
// Capabilities
// ============================================================================

#[test]
fn test_full_join_depends_on_dialect() {
    let err = compile(JoinKind::Full, "mysql").unwrap_err();
    assert!(matches!(err, CompileError::Unsupported(_)), "{:?}", err);
    assert!(err.to_string().contains("full joins"), "{}", err);

    let sql = compile(JoinKind::Full, "postgres").unwrap();
    assert!(sql.contains("FULL OUTER JOIN"), "{}", sql);
}

#[test]
fn test_boolean_literals_follow_native_support() {
    let mut model = model(JoinKind::Left);
    if let Some(NamedObject::Source(flights)) = model.contents.get_mut("flights") {
        flights.fields.push(FieldDef::Atomic(AtomicField::computed(
            "is_scheduled",
            AtomicType::Boolean,
            Expr::Literal(Literal::Bool(true)),
            ExpressionType::Scalar,
        )));
    }
    let compile = |dialect: &str| {
        QueryCompiler::new(&model)
            .compile_with(&query(&[&["carrier"], &["is_scheduled"]]), &options(dialect))
            .unwrap()
            .sql
    };

    let mysql = compile("mysql");
    assert!(!get_dialect("mysql").unwrap().has_native_booleans());
    assert!(mysql.contains("AS `is_scheduled`"), "{}", mysql);
    assert!(!mysql.contains("true"), "{}", mysql);

    let postgres = compile("postgres");
    assert!(postgres.contains("true"), "{}", postgres);
    validate_sql(&mysql, "mysql");
    validate_sql(&postgres, "postgres");
}

#[test]
fn test_unknown_dialect() {
    let err = compile(JoinKind::Left, "oracle").unwrap_err();
    assert_eq!(err, CompileError::UnknownDialect("oracle".into()));
}

#[test]
fn test_source_dialect_is_the_default() {
    let compiled = QueryCompiler::new(&model(JoinKind::Left))
        .compile(&query(&[&["carrier"], &["flight_count"]]))
        .unwrap();
    assert_eq!(compiled.dialect, "postgres");
}
