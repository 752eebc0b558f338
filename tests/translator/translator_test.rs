//! Documents through the translator and on to SQL.

use std::sync::Arc;

use serde_json::{json, Value};

use quiver::compiler::{CompileOptions, QueryCompiler, SqlBlocks};
use quiver::diagnostics::render;
use quiver::model::{AtomicType, FieldDef, SourceRef, StructDef};
use quiver::translator::{
    SqlKey, TableKey, TranslateResponse, TranslateResult, Translator, UpdateData,
};

const ROOT: &str = "file:///models/flights.json";

// ============================================================================
// Fixtures
// ============================================================================

fn flights_schema() -> StructDef {
    StructDef::table("flights", "flights", "duckdb", "duck")
        .column("carrier", AtomicType::String)
        .column("origin", AtomicType::String)
        .column("distance", AtomicType::Number)
        .column("dep_time", AtomicType::Timestamp)
}

fn carriers_schema() -> StructDef {
    StructDef::table("carriers", "carriers", "duckdb", "duck")
        .column("code", AtomicType::String)
        .column("nickname", AtomicType::String)
        .primary_key("code")
}

fn field(path: &[&str]) -> Value {
    json!({ "kind": "field", "path": path })
}

fn count() -> Value {
    json!({ "kind": "call", "name": "count", "args": [] })
}

fn table(path: &str) -> Value {
    json!({ "type": "table", "connection": "duck", "path": path })
}

fn flights_source(properties: Vec<Value>) -> Value {
    json!({
        "type": "source",
        "name": "flights",
        "source": { "type": "extend", "base": table("flights"), "properties": properties }
    })
}

fn by_carrier_segment() -> Value {
    json!({
        "type": "body",
        "items": [
            { "node": { "type": "group_by", "fields": [{ "expr": field(&["carrier"]) }] } },
            { "node": { "type": "aggregate", "fields": [{ "expr": field(&["flight_count"]) }] } }
        ]
    })
}

fn run(segments: Vec<Value>) -> Value {
    json!({
        "type": "run",
        "query": { "source": { "type": "named", "name": "flights" }, "segments": segments }
    })
}

fn spanned(statements: Vec<Value>) -> String {
    let statements: Vec<Value> = statements
        .into_iter()
        .enumerate()
        .map(|(i, node)| json!({ "node": node, "span": { "start": i * 10, "end": i * 10 + 9 } }))
        .collect();
    json!({ "statements": statements }).to_string()
}

/// Feed the document and both tables, then translate.
fn translate_with(translator: Translator, text: String) -> TranslateResult {
    let mut translator = translator;
    translator.update(
        UpdateData::new()
            .file(ROOT, text)
            .table(TableKey::new("duck", "flights"), flights_schema())
            .table(TableKey::new("duck", "carriers"), carriers_schema()),
    );
    match translator.compile().unwrap() {
        TranslateResponse::Final(result) => result,
        TranslateResponse::Needs(needs) => panic!("unexpected needs {:?}", needs),
    }
}

fn translate(text: String) -> TranslateResult {
    translate_with(Translator::new(ROOT), text)
}

fn messages(result: &TranslateResult) -> Vec<String> {
    result.problems.iter().map(|p| p.message.clone()).collect()
}

// ============================================================================
// Documents to SQL
// ============================================================================

#[test]
fn test_run_statement_compiles_to_sql() {
    let result = translate(spanned(vec![
        flights_source(vec![
            json!({ "node": { "type": "measure", "name": "flight_count", "expr": count() } }),
            json!({ "node": {
                "type": "join", "name": "carriers", "source": table("carriers"),
                "relationship": "one", "with": field(&["carrier"])
            } }),
        ]),
        run(vec![by_carrier_segment()]),
    ]));
    assert!(result.problems.is_empty(), "{:?}", result.problems);
    assert_eq!(result.model.queries.len(), 1);

    let flights = result.model.source("flights").unwrap();
    let carriers = flights.field("carriers").and_then(FieldDef::as_struct).unwrap();
    assert!(carriers.join.as_ref().and_then(|j| j.on.as_ref()).is_some());

    let sql = QueryCompiler::new(&result.model)
        .compile(&result.model.queries[0])
        .unwrap()
        .sql;
    assert!(sql.contains("\"base\".\"carrier\" AS \"carrier\""), "{}", sql);
    assert!(sql.contains("COUNT(1)"), "{}", sql);
    // The join is declared but unused, so it is not rendered.
    assert!(!sql.contains("JOIN"), "{}", sql);
}

#[test]
fn test_named_view_nests() {
    let result = translate(spanned(vec![
        flights_source(vec![
            json!({ "node": { "type": "measure", "name": "flight_count", "expr": count() } }),
            json!({ "node": { "type": "view", "name": "by_origin", "pipeline": [{
                "type": "body",
                "items": [
                    { "node": { "type": "group_by", "fields": [{ "expr": field(&["origin"]) }] } },
                    { "node": { "type": "aggregate", "fields": [{ "expr": field(&["flight_count"]) }] } },
                    { "node": { "type": "limit", "limit": 3 } }
                ]
            }] } }),
        ]),
        run(vec![json!({
            "type": "body",
            "items": [
                { "node": { "type": "group_by", "fields": [{ "expr": field(&["carrier"]) }] } },
                { "node": { "type": "nest", "nests": [{ "type": "view", "name": "by_origin" }] } }
            ]
        })]),
    ]));
    assert!(result.problems.is_empty(), "{:?}", result.problems);
    let sql = QueryCompiler::new(&result.model)
        .compile(&result.model.queries[0])
        .unwrap()
        .sql;
    assert!(sql.contains("group_set"), "{}", sql);
    assert!(sql.contains("\"__row_number__1\" <= 3"), "{}", sql);
}

#[test]
fn test_named_query_keeps_persist_annotation() {
    let result = translate(spanned(vec![
        flights_source(vec![
            json!({ "node": { "type": "measure", "name": "flight_count", "expr": count() } }),
        ]),
        json!({
            "type": "query",
            "name": "by_carrier",
            "query": { "source": { "type": "named", "name": "flights" }, "segments": [by_carrier_segment()] },
            "persist": { "table_name": "by_carrier_daily" }
        }),
    ]));
    assert!(result.problems.is_empty(), "{:?}", result.problems);
    let persisted: Vec<_> = result.model.persisted_queries().map(|q| q.name.as_str()).collect();
    assert_eq!(persisted, vec!["by_carrier"]);

    let compiled = QueryCompiler::new(&result.model)
        .compile_named("by_carrier", &CompileOptions::default())
        .unwrap();
    assert_eq!(compiled.query_name.as_deref(), Some("by_carrier"));
    assert_eq!(
        compiled.persist.and_then(|p| p.table_name).as_deref(),
        Some("by_carrier_daily")
    );
}

#[test]
fn test_query_on_named_query_keeps_the_reference() {
    let result = translate(spanned(vec![
        flights_source(vec![
            json!({ "node": { "type": "measure", "name": "flight_count", "expr": count() } }),
        ]),
        json!({
            "type": "query",
            "name": "by_carrier",
            "query": { "source": { "type": "named", "name": "flights" }, "segments": [by_carrier_segment()] },
            "persist": {}
        }),
        json!({
            "type": "run",
            "query": {
                "source": { "type": "named", "name": "by_carrier" },
                "segments": [{ "type": "body", "items": [
                    { "node": { "type": "group_by", "fields": [{ "expr": field(&["flight_count"]) }] } }
                ] }]
            }
        }),
    ]));
    assert!(result.problems.is_empty(), "{:?}", result.problems);
    let query = &result.model.queries[0];
    assert_eq!(query.source, SourceRef::Named("by_carrier".to_string()));
    assert_eq!(query.pipeline.len(), 1);

    let sql = QueryCompiler::new(&result.model).compile(query).unwrap().sql;
    assert!(sql.contains("COUNT(1)"), "{}", sql);
    assert!(sql.contains("\"flight_count\""), "{}", sql);
}

#[test]
fn test_sql_block_embeds_compiled_query() {
    let doc = spanned(vec![
        flights_source(vec![
            json!({ "node": { "type": "measure", "name": "flight_count", "expr": count() } }),
        ]),
        json!({
            "type": "source",
            "name": "summary",
            "source": {
                "type": "sql",
                "connection": "duck",
                "parts": [
                    { "type": "text", "text": "SELECT * FROM " },
                    { "type": "query", "query": {
                        "source": { "type": "named", "name": "flights" },
                        "segments": [by_carrier_segment()]
                    } }
                ]
            }
        }),
    ]);
    let mut translator = Translator::new(ROOT).with_sql_compiler(Arc::new(SqlBlocks));
    translator.update(
        UpdateData::new()
            .file(ROOT, doc)
            .table(TableKey::new("duck", "flights"), flights_schema()),
    );
    let TranslateResponse::Needs(needs) = translator.compile().unwrap() else {
        panic!("expected a SQL schema request");
    };
    assert_eq!(needs.sql.len(), 1);
    let key: SqlKey = needs.sql[0].clone();
    assert_eq!(key.connection, "duck");
    assert!(key.sql.starts_with("SELECT * FROM (SELECT"), "{}", key.sql);
    assert!(key.sql.ends_with(')'), "{}", key.sql);
    assert!(key.sql.contains("\"base\".\"carrier\""), "{}", key.sql);

    let schema = StructDef::table("sql", "", "duckdb", "duck")
        .column("carrier", AtomicType::String)
        .column("flight_count", AtomicType::Number);
    translator.update(UpdateData::new().sql_schema(key, schema));
    let TranslateResponse::Final(result) = translator.compile().unwrap() else {
        panic!("expected a final result");
    };
    assert!(result.problems.is_empty(), "{:?}", result.problems);
    let summary = result.model.source("summary").unwrap();
    assert!(summary.has_field("flight_count"));
}

#[test]
fn test_sql_block_without_compiler_is_an_error() {
    let result = translate(spanned(vec![
        flights_source(vec![]),
        json!({
            "type": "source",
            "name": "summary",
            "source": {
                "type": "sql",
                "connection": "duck",
                "parts": [{ "type": "query", "query": {
                    "source": { "type": "named", "name": "flights" },
                    "segments": [{ "type": "body", "items": [
                        { "node": { "type": "group_by", "fields": [{ "expr": field(&["carrier"]) }] } }
                    ] }]
                } }]
            }
        }),
    ]));
    assert!(result.has_errors());
    assert!(messages(&result).iter().any(|m| m.contains("need a query compiler")));
}

// ============================================================================
// Diagnostics
// ============================================================================

#[test]
fn test_measure_and_dimension_kinds_are_checked() {
    let result = translate(spanned(vec![flights_source(vec![
        json!({ "node": { "type": "dimension", "name": "n", "expr": count() } }),
        json!({ "node": { "type": "measure", "name": "d", "expr": field(&["distance"]) } }),
    ])]));
    let messages = messages(&result);
    assert!(messages.contains(&"dimension 'n' is an aggregate; declare it as a measure".to_string()));
    assert!(messages.contains(&"measure 'd' is not an aggregate; declare it as a dimension".to_string()));
}

#[test]
fn test_duplicate_definition() {
    let result = translate(spanned(vec![
        flights_source(vec![]),
        flights_source(vec![]),
    ]));
    assert!(result.has_errors());
    let problem = &result.problems[0];
    assert_eq!(problem.message, "'flights' is already defined");
    assert_eq!(problem.span, Some(10..19));
}

#[test]
fn test_undefined_field_in_query() {
    let result = translate(spanned(vec![
        flights_source(vec![]),
        run(vec![json!({
            "type": "body",
            "items": [
                { "node": { "type": "group_by", "fields": [{ "expr": field(&["nope"]) }] } }
            ]
        })]),
    ]));
    assert!(result.has_errors());
    assert!(messages(&result).iter().any(|m| m.contains("'nope' is not defined")));
    assert!(result.model.queries.is_empty());
}

#[test]
fn test_join_with_needs_primary_key() {
    let result = translate(spanned(vec![flights_source(vec![json!({ "node": {
        "type": "join", "name": "legs", "source": table("flights"),
        "relationship": "many", "with": field(&["carrier"])
    } })])]));
    assert!(messages(&result).contains(&"join 'legs' uses with: but has no primary key".to_string()));
}

#[test]
fn test_source_where_must_be_boolean() {
    let result = translate(spanned(vec![flights_source(vec![json!({ "node": {
        "type": "where", "filter": field(&["carrier"])
    } })])]));
    assert!(messages(&result).iter().any(|m| m.starts_with("where: needs a boolean")));
}

#[test]
fn test_diagnostic_renders_against_source_text() {
    let text = spanned(vec![flights_source(vec![]), flights_source(vec![])]);
    let result = translate(text.clone());
    let rendered = render(&result.problems[0], &text);
    assert!(rendered.contains("'flights' is already defined"), "{}", rendered);
    assert!(rendered.contains(ROOT), "{}", rendered);
}
