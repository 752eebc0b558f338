//! Nested views: grouping sets, per-set limits and nested output.

use quiver::compiler::{CompileError, CompileOptions, CompiledQuery, QueryCompiler};
use quiver::model::{
    AggregateFunc, AtomicField, AtomicType, Expr, ExpressionType, FieldDef, ModelDef,
    NamedObject, PipeSegment, Query, QueryField, QuerySegment, SourceRef, StructDef, TurtleDef,
};

fn flights() -> StructDef {
    StructDef::table("flights", "faa.flights", "duckdb", "duck")
        .column("carrier", AtomicType::String)
        .column("origin", AtomicType::String)
        .column("destination", AtomicType::String)
        .column("distance", AtomicType::Number)
        .field_def(FieldDef::Atomic(AtomicField::computed(
            "flight_count",
            AtomicType::Number,
            Expr::aggregate(AggregateFunc::Count, None, vec![]),
            ExpressionType::Aggregate,
        )))
        .field_def(FieldDef::Turtle(TurtleDef {
            name: "by_origin".into(),
            pipeline: vec![PipeSegment::Reduce(QuerySegment {
                fields: vec![
                    QueryField::reference(&["origin"]),
                    QueryField::reference(&["flight_count"]),
                ],
                limit: Some(5),
                ..Default::default()
            })],
        }))
}

fn model() -> ModelDef {
    let mut model = ModelDef::new("file:///flights.json");
    model
        .contents
        .insert("flights".into(), NamedObject::Source(flights()));
    model
}

fn nest(name: &str, fields: Vec<QueryField>, limit: Option<u64>) -> QueryField {
    QueryField::Def(FieldDef::Turtle(TurtleDef {
        name: name.into(),
        pipeline: vec![PipeSegment::Reduce(QuerySegment {
            fields,
            limit,
            ..Default::default()
        })],
    }))
}

fn compile(fields: Vec<QueryField>, dialect: &str) -> Result<CompiledQuery, CompileError> {
    let query = Query::new(
        SourceRef::Named("flights".into()),
        vec![PipeSegment::Reduce(QuerySegment {
            fields,
            ..Default::default()
        })],
    );
    let options = CompileOptions {
        dialect: Some(dialect.into()),
        default_row_limit: None,
    };
    QueryCompiler::new(&model()).compile_with(&query, &options)
}

// ============================================================================
// Grouping sets
// ============================================================================

#[test]
fn test_named_view_nests_with_its_own_limit() {
    let compiled = compile(
        vec![
            QueryField::reference(&["carrier"]),
            QueryField::reference(&["flight_count"]),
            QueryField::reference(&["by_origin"]),
        ],
        "duckdb",
    )
    .unwrap();
    let sql = &compiled.sql;
    println!("{}", sql);
    assert!(sql.contains("GENERATE_SERIES(0,1,1)"), "{}", sql);
    assert!(sql.contains("\"__row_number__1\" <= 5"), "{}", sql);
    assert!(sql.contains("COALESCE(LIST({"), "{}", sql);
    assert!(sql.contains("FILTER (WHERE group_set=1"), "{}", sql);
    assert!(sql.contains("group_set=0"), "{}", sql);
}

#[test]
fn test_nested_limit_prunes_with_qualify() {
    let fields = || {
        vec![
            QueryField::reference(&["carrier"]),
            QueryField::reference(&["by_origin"]),
        ]
    };
    let duckdb = compile(fields(), "duckdb").unwrap().sql;
    assert!(
        duckdb.contains("QUALIFY (group_set<>1 OR \"__row_number__1\" <= 5)"),
        "{}",
        duckdb
    );
    assert!(duckdb.contains("FILTER (WHERE group_set=1 AND \"__row_number__1\" <= 5)"), "{}", duckdb);

    let postgres = compile(fields(), "postgres").unwrap().sql;
    assert!(!postgres.contains("QUALIFY"), "{}", postgres);
    assert!(postgres.contains("\"__row_number__1\" <= 5"), "{}", postgres);
}

#[test]
fn test_nested_output_shape() {
    let compiled = compile(
        vec![
            QueryField::reference(&["carrier"]),
            QueryField::reference(&["by_origin"]),
        ],
        "duckdb",
    )
    .unwrap();
    let result = compiled.result_struct().unwrap();
    let nested = result.field("by_origin").and_then(FieldDef::as_struct).unwrap();
    assert!(nested.is_array());
    assert!(nested.has_field("origin"));
    assert!(nested.has_field("flight_count"));
    // Nested queries are not drillable.
    assert!(compiled.drill.is_empty());
}

#[test]
fn test_two_levels_of_nesting() {
    let inner = nest(
        "by_destination",
        vec![
            QueryField::reference(&["destination"]),
            QueryField::reference(&["flight_count"]),
        ],
        Some(2),
    );
    let outer = nest(
        "by_origin",
        vec![
            QueryField::reference(&["origin"]),
            QueryField::reference(&["flight_count"]),
            inner,
        ],
        None,
    );
    let compiled = compile(vec![QueryField::reference(&["carrier"]), outer], "duckdb").unwrap();
    let sql = &compiled.sql;
    println!("{}", sql);
    assert!(sql.contains("GENERATE_SERIES(0,2,1)"), "{}", sql);
    assert!(sql.contains("\"__row_number__2\" <= 2"), "{}", sql);
    assert!(sql.contains("CASE WHEN group_set IN (1,2) THEN \"base\".\"origin\" END"), "{}", sql);
    assert!(sql.contains("CASE WHEN group_set IN (2) THEN \"base\".\"destination\" END"), "{}", sql);
}

#[test]
fn test_sibling_nests_get_separate_sets() {
    let compiled = compile(
        vec![
            QueryField::reference(&["carrier"]),
            QueryField::reference(&["by_origin"]),
            nest(
                "by_destination",
                vec![
                    QueryField::reference(&["destination"]),
                    QueryField::reference(&["flight_count"]),
                ],
                None,
            ),
        ],
        "duckdb",
    )
    .unwrap();
    let sql = &compiled.sql;
    assert!(sql.contains("GENERATE_SERIES(0,2,1)"), "{}", sql);
    assert!(sql.contains("FILTER (WHERE group_set=1"), "{}", sql);
    assert!(sql.contains("FILTER (WHERE group_set=2"), "{}", sql);
}

// ============================================================================
// Dialects
// ============================================================================

#[test]
fn test_postgres_nests_as_jsonb() {
    let compiled = compile(
        vec![
            QueryField::reference(&["carrier"]),
            QueryField::reference(&["by_origin"]),
        ],
        "postgres",
    )
    .unwrap();
    let sql = &compiled.sql;
    assert!(sql.contains("CROSS JOIN GENERATE_SERIES(0,1,1) AS group_set"), "{}", sql);
    assert!(sql.contains("JSONB_AGG(JSONB_BUILD_OBJECT("), "{}", sql);
    assert!(sql.contains("'[]'::JSONB"), "{}", sql);
}

#[test]
fn test_every_dialect_fans_out_group_sets() {
    for dialect in quiver::sql::dialect_names() {
        let compiled = compile(
            vec![
                QueryField::reference(&["carrier"]),
                QueryField::reference(&["by_origin"]),
            ],
            dialect,
        )
        .unwrap();
        assert!(compiled.sql.contains("group_set"), "{}: {}", dialect, compiled.sql);
        assert_eq!(compiled.dialect, dialect);
    }
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_nest_must_reduce() {
    let project = QueryField::Def(FieldDef::Turtle(TurtleDef {
        name: "rows".into(),
        pipeline: vec![PipeSegment::Project(QuerySegment {
            fields: vec![QueryField::reference(&["origin"])],
            ..Default::default()
        })],
    }));
    let err = compile(vec![QueryField::reference(&["carrier"]), project], "duckdb").unwrap_err();
    assert!(err.to_string().contains("rows"), "{}", err);
}
