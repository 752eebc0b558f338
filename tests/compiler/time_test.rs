//! Time truncation, extraction, literals and drill filters.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use quiver::compiler::{drill_filters, CompileOptions, CompiledQuery, QueryCompiler};
use quiver::model::time::{format_date, week_start};
use quiver::model::{
    AggregateFunc, AtomicField, AtomicType, BinaryOp, Expr, ExpressionType, ExtractUnit,
    FieldDef, FilterCondition, Literal, ModelDef, NamedObject, PipeSegment, Query, QueryField,
    QuerySegment, SourceRef, StructDef, TimeUnit,
};

// ============================================================================
// Fixtures
// ============================================================================

fn flights() -> StructDef {
    StructDef::table("flights", "faa.flights", "postgres", "pg")
        .column("carrier", AtomicType::String)
        .column("distance", AtomicType::Number)
        .column("dep_time", AtomicType::Timestamp)
        .column("dep_date", AtomicType::Date)
        .field_def(FieldDef::Atomic(AtomicField::computed(
            "flight_count",
            AtomicType::Number,
            Expr::aggregate(AggregateFunc::Count, None, vec![]),
            ExpressionType::Aggregate,
        )))
}

fn model(source: StructDef) -> ModelDef {
    let mut model = ModelDef::new("file:///flights.json");
    model
        .contents
        .insert("flights".into(), NamedObject::Source(source));
    model
}

fn truncated(name: &str, column: &str, base: AtomicType, unit: TimeUnit) -> QueryField {
    let mut field = AtomicField::computed(
        name,
        base,
        Expr::TimeTrunc {
            expr: Box::new(Expr::field(&[column])),
            unit,
            base,
        },
        ExpressionType::Scalar,
    );
    field.timeframe = Some(unit);
    QueryField::Def(FieldDef::Atomic(field))
}

fn extracted(name: &str, unit: ExtractUnit) -> QueryField {
    QueryField::Def(FieldDef::Atomic(AtomicField::computed(
        name,
        AtomicType::Number,
        Expr::TimeExtract {
            expr: Box::new(Expr::field(&["dep_time"])),
            unit,
            base: AtomicType::Timestamp,
        },
        ExpressionType::Scalar,
    )))
}

fn compile_on(source: StructDef, segment: QuerySegment, dialect: &str) -> CompiledQuery {
    let query = Query::new(
        SourceRef::Named("flights".into()),
        vec![PipeSegment::Reduce(segment)],
    );
    let options = CompileOptions {
        dialect: Some(dialect.into()),
        default_row_limit: None,
    };
    QueryCompiler::new(&model(source))
        .compile_with(&query, &options)
        .unwrap()
}

fn compile(segment: QuerySegment, dialect: &str) -> CompiledQuery {
    compile_on(flights(), segment, dialect)
}

fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ============================================================================
// Truncation
// ============================================================================

#[test]
fn test_month_truncation_orders_newest_first() {
    let compiled = compile(
        QuerySegment {
            fields: vec![truncated("dep_month", "dep_time", AtomicType::Timestamp, TimeUnit::Month)],
            ..Default::default()
        },
        "postgres",
    );
    let sql = &compiled.sql;
    assert!(sql.contains("DATE_TRUNC('month', \"base\".\"dep_time\") AS \"dep_month\""), "{}", sql);
    assert!(sql.contains("ORDER BY \"dep_month\" DESC"), "{}", sql);
}

#[test]
fn test_truncation_in_query_timezone() {
    let compiled = compile(
        QuerySegment {
            fields: vec![truncated("dep_day", "dep_time", AtomicType::Timestamp, TimeUnit::Day)],
            timezone: Some("America/New_York".into()),
            ..Default::default()
        },
        "postgres",
    );
    let sql = &compiled.sql;
    assert!(
        sql.contains(
            "DATE_TRUNC('day', ((\"base\".\"dep_time\") AT TIME ZONE 'UTC') AT TIME ZONE 'America/New_York')"
        ),
        "{}",
        sql
    );
}

#[test]
fn test_source_timezone_applies_when_query_has_none() {
    let mut source = flights();
    source.timezone = Some("Europe/Paris".into());
    let compiled = compile_on(
        source,
        QuerySegment {
            fields: vec![truncated("dep_day", "dep_time", AtomicType::Timestamp, TimeUnit::Day)],
            ..Default::default()
        },
        "duckdb",
    );
    assert!(compiled.sql.contains("AT TIME ZONE 'Europe/Paris'"), "{}", compiled.sql);
}

#[test]
fn test_date_truncation_stays_a_date() {
    let compiled = compile(
        QuerySegment {
            fields: vec![truncated("dep_year", "dep_date", AtomicType::Date, TimeUnit::Year)],
            timezone: Some("America/New_York".into()),
            ..Default::default()
        },
        "postgres",
    );
    let sql = &compiled.sql;
    assert!(sql.contains("DATE_TRUNC('year', \"base\".\"dep_date\")::DATE"), "{}", sql);
    assert!(!sql.contains("AT TIME ZONE"), "{}", sql);
}

#[test]
fn test_truncation_per_dialect() {
    let segment = QuerySegment {
        fields: vec![truncated("dep_month", "dep_time", AtomicType::Timestamp, TimeUnit::Month)],
        ..Default::default()
    };
    let bq = compile(segment.clone(), "standardsql").sql;
    assert!(bq.contains("TIMESTAMP_TRUNC(`base`.`dep_time`, MONTH)"), "{}", bq);
    let mysql = compile(segment.clone(), "mysql").sql;
    assert!(mysql.contains("DATE_FORMAT(`base`.`dep_time`, '%Y-%m-01')"), "{}", mysql);
    let snowflake = compile(segment, "snowflake").sql;
    assert!(snowflake.contains("DATE_TRUNC('month', \"base\".\"dep_time\")"), "{}", snowflake);
}

// ============================================================================
// Extraction
// ============================================================================

#[test]
fn test_day_of_week_starts_on_sunday() {
    let segment = QuerySegment {
        fields: vec![
            extracted("dow", ExtractUnit::DayOfWeek),
            QueryField::reference(&["flight_count"]),
        ],
        ..Default::default()
    };
    let pg = compile(segment.clone(), "postgres").sql;
    assert!(pg.contains("(EXTRACT(DOW FROM \"base\".\"dep_time\")+1)"), "{}", pg);
    let bq = compile(segment, "standardsql").sql;
    assert!(bq.contains("EXTRACT(DAYOFWEEK FROM `base`.`dep_time`)"), "{}", bq);
}

// ============================================================================
// Literals
// ============================================================================

fn departed_after(value: &str, timezone: Option<&str>) -> FilterCondition {
    FilterCondition::scalar(
        Expr::binary(
            BinaryOp::Gt,
            Expr::field(&["dep_time"]),
            Expr::Literal(Literal::Timestamp {
                value: value.into(),
                timezone: timezone.map(str::to_string),
            }),
        ),
        format!("dep_time > @{}", value),
    )
}

#[test]
fn test_timestamp_literal_is_converted_to_utc() {
    let compiled = compile(
        QuerySegment {
            fields: vec![QueryField::reference(&["flight_count"])],
            filters: vec![departed_after("2020-02-20 00:00:00", Some("America/Mexico_City"))],
            ..Default::default()
        },
        "duckdb",
    );
    assert!(compiled.sql.contains("TIMESTAMP '2020-02-20 06:00:00'"), "{}", compiled.sql);
}

#[test]
fn test_literal_without_zone_uses_query_timezone() {
    let compiled = compile(
        QuerySegment {
            fields: vec![QueryField::reference(&["flight_count"])],
            filters: vec![departed_after("2020-02-20 00:00:00", None)],
            timezone: Some("America/Mexico_City".into()),
            ..Default::default()
        },
        "duckdb",
    );
    assert!(compiled.sql.contains("TIMESTAMP '2020-02-20 06:00:00'"), "{}", compiled.sql);
}

#[test]
fn test_unknown_timezone_fails() {
    let query = Query::new(
        SourceRef::Named("flights".into()),
        vec![PipeSegment::Reduce(QuerySegment {
            fields: vec![truncated("dep_day", "dep_time", AtomicType::Timestamp, TimeUnit::Day)],
            timezone: Some("Mars/Olympus_Mons".into()),
            ..Default::default()
        })],
    );
    let err = QueryCompiler::new(&model(flights())).compile(&query).unwrap_err();
    assert!(err.to_string().contains("Mars/Olympus_Mons"), "{}", err);
}

// ============================================================================
// Drill
// ============================================================================

#[test]
fn test_drill_filters_follow_grouping() {
    let mut source = flights();
    source.filters.push(FilterCondition::scalar(
        Expr::binary(BinaryOp::Gt, Expr::field(&["distance"]), Expr::number("100")),
        "distance > 100",
    ));
    let compiled = compile_on(
        source,
        QuerySegment {
            fields: vec![
                QueryField::reference(&["carrier"]),
                truncated("dep_month", "dep_time", AtomicType::Timestamp, TimeUnit::Month),
                QueryField::reference(&["flight_count"]),
            ],
            ..Default::default()
        },
        "postgres",
    );

    let names: Vec<_> = compiled.drill.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["carrier", "dep_month"]);
    assert_eq!(compiled.drill[1].expression, "dep_time.month");
    assert_eq!(compiled.drill[1].timeframe, Some(TimeUnit::Month));

    let filters = drill_filters(
        &compiled,
        &row(&[
            ("carrier", json!("AA")),
            ("dep_month", json!("2024-03-01T00:00:00Z")),
            ("flight_count", json!(12)),
        ]),
    );
    assert_eq!(
        filters,
        vec![
            "distance > 100".to_string(),
            "carrier = 'AA'".to_string(),
            "dep_time.month = @2024-03".to_string(),
        ]
    );
}

#[test]
fn test_drill_renders_in_query_timezone() {
    let compiled = compile(
        QuerySegment {
            fields: vec![
                truncated("dep_hour", "dep_time", AtomicType::Timestamp, TimeUnit::Hour),
                QueryField::reference(&["flight_count"]),
            ],
            timezone: Some("America/New_York".into()),
            ..Default::default()
        },
        "postgres",
    );
    assert_eq!(compiled.drill[0].timezone.as_deref(), Some("America/New_York"));
    let filters = drill_filters(&compiled, &row(&[("dep_hour", json!("2020-02-20 15:00:00"))]));
    assert_eq!(filters, vec!["dep_time.hour = @2020-02-20 10".to_string()]);
}

#[test]
fn test_missing_value_drills_to_null() {
    let compiled = compile(
        QuerySegment {
            fields: vec![
                QueryField::reference(&["carrier"]),
                QueryField::reference(&["flight_count"]),
            ],
            ..Default::default()
        },
        "postgres",
    );
    let filters = drill_filters(&compiled, &Map::new());
    assert_eq!(filters, vec!["carrier = null".to_string()]);
}

// ============================================================================
// Literal formats
// ============================================================================

#[test]
fn test_time_literal_formats() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
    assert_eq!(format_date(date, TimeUnit::Year), "@2024");
    assert_eq!(format_date(date, TimeUnit::Quarter), "@2024-Q1");
    assert_eq!(format_date(date, TimeUnit::Month), "@2024-03");
    assert_eq!(format_date(date, TimeUnit::Week), "@2024-03-04-WK");
    assert_eq!(format_date(date, TimeUnit::Day), "@2024-03-06");
    assert_eq!(week_start(date), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
}
