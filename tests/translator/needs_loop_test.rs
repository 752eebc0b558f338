//! The needs loop, driven the way a host drives it.

use std::collections::HashMap;

use serde_json::{json, Value};

use quiver::model::{AtomicType, StructDef};
use quiver::translator::{
    CompilerNeeds, TableKey, TranslateResponse, TranslateResult, Translator, TranslatorError,
    UpdateData,
};

const ROOT: &str = "file:///models/flights.json";
const COMMON: &str = "file:///models/lib/common.json";
const SHARED: &str = "file:///models/shared.json";

// ============================================================================
// Host
// ============================================================================

/// Answers needs from fixed files and tables, recording each batch.
#[derive(Default)]
struct Host {
    files: HashMap<String, String>,
    tables: HashMap<TableKey, StructDef>,
    batches: Vec<CompilerNeeds>,
}

impl Host {
    fn file(mut self, url: &str, text: String) -> Self {
        self.files.insert(url.to_string(), text);
        self
    }

    fn table(mut self, path: &str, columns: &[&str]) -> Self {
        let mut schema = StructDef::table(path, path, "duckdb", "duck");
        for column in columns {
            schema = schema.column(column, AtomicType::String);
        }
        self.tables.insert(TableKey::new("duck", path), schema);
        self
    }

    fn answer(&self, needs: &CompilerNeeds) -> UpdateData {
        let mut data = UpdateData::new();
        for url in &needs.urls {
            data = match self.files.get(url) {
                Some(text) => data.file(url, text.clone()),
                None => data.file_error(url, "not found"),
            };
        }
        for key in &needs.tables {
            data = match self.tables.get(key) {
                Some(schema) => data.table(key.clone(), schema.clone()),
                None => data.table_error(key.clone(), "no such table"),
            };
        }
        data
    }

    fn run(&mut self, translator: &mut Translator) -> TranslateResult {
        for _ in 0..20 {
            match translator.compile().unwrap() {
                TranslateResponse::Final(result) => return result,
                TranslateResponse::Needs(needs) => {
                    let data = self.answer(&needs);
                    self.batches.push(needs);
                    translator.update(data);
                }
            }
        }
        panic!("translation did not settle: {:?}", self.batches);
    }
}

fn doc(statements: Vec<Value>) -> String {
    json!({ "statements": statements }).to_string()
}

fn import(url: &str) -> Value {
    json!({ "type": "import", "url": url })
}

fn source(name: &str, path: &str) -> Value {
    json!({
        "type": "source",
        "name": name,
        "source": { "type": "table", "connection": "duck", "path": path }
    })
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn test_each_level_of_imports_is_one_batch() {
    let mut host = Host::default()
        .file(ROOT, doc(vec![import("lib/common.json"), source("flights", "flights")]))
        .file(COMMON, doc(vec![import("../shared.json"), source("carriers", "carriers")]))
        .file(SHARED, doc(vec![source("airports", "airports")]))
        .table("flights", &["carrier"])
        .table("carriers", &["code"])
        .table("airports", &["faa_code"]);
    let mut translator = Translator::new(ROOT);
    let result = host.run(&mut translator);

    assert!(result.problems.is_empty(), "{:?}", result.problems);
    let urls: Vec<_> = host.batches.iter().map(|b| b.urls.clone()).collect();
    assert_eq!(
        urls,
        vec![
            vec![ROOT.to_string()],
            vec![COMMON.to_string()],
            vec![SHARED.to_string()],
            vec![],
        ]
    );
    assert_eq!(host.batches[1].tables, vec![TableKey::new("duck", "flights")]);
    assert_eq!(host.batches[3].tables, vec![TableKey::new("duck", "airports")]);
    assert_eq!(translator.iterations(), 5);

    let model = &result.model;
    for name in ["flights", "carriers", "airports"] {
        assert!(model.source(name).is_some(), "{} missing", name);
    }
    assert_eq!(model.exports, vec!["flights".to_string()]);
    assert_eq!(model.dependencies.direct(ROOT), vec![COMMON]);
    assert_eq!(
        model.dependencies.flatten(),
        vec![COMMON.to_string(), SHARED.to_string()]
    );
}

#[test]
fn test_sources_take_their_declared_names() {
    let mut host = Host::default()
        .file(ROOT, doc(vec![source("legs", "raw_flights")]))
        .table("raw_flights", &["carrier"]);
    let result = host.run(&mut Translator::new(ROOT));
    let legs = result.model.source("legs").unwrap();
    assert_eq!(legs.name, "legs");
    assert!(legs.has_field("carrier"));
}

// ============================================================================
// Failures in the documents
// ============================================================================

#[test]
fn test_missing_import_is_reported_at_the_importer() {
    let mut host = Host::default().file(ROOT, doc(vec![import("missing.json")]));
    let result = host.run(&mut Translator::new(ROOT));
    assert!(result.has_errors());
    let problem = &result.problems[0];
    assert_eq!(problem.url, ROOT);
    assert_eq!(
        problem.message,
        "cannot read 'file:///models/missing.json': not found"
    );
}

#[test]
fn test_import_cycle() {
    let mut host = Host::default()
        .file(ROOT, doc(vec![import("a.json")]))
        .file("file:///models/a.json", doc(vec![import("flights.json")]));
    let result = host.run(&mut Translator::new(ROOT));
    assert!(result.has_errors());
    assert!(
        result
            .problems
            .iter()
            .any(|p| p.message.starts_with("import cycle: ") && p.message.contains("a.json")),
        "{:?}",
        result.problems
    );
}

#[test]
fn test_syntax_error_in_import_points_into_that_file() {
    let mut host = Host::default()
        .file(ROOT, doc(vec![import("lib/common.json")]))
        .file(COMMON, "{ \"statements\": [ oops ] }".to_string());
    let result = host.run(&mut Translator::new(ROOT));
    assert!(result.has_errors());
    let problem = &result.problems[0];
    assert_eq!(problem.url, COMMON);
    assert!(problem.span.is_some());
}

#[test]
fn test_missing_table_only_warns_when_unused() {
    let mut host = Host::default().file(ROOT, doc(vec![source("flights", "flights")]));
    let result = host.run(&mut Translator::new(ROOT));
    assert!(!result.has_errors());
    assert_eq!(result.problems.len(), 1);
    assert!(result.problems[0].message.contains("no such table"));
    assert!(result.model.source("flights").is_none());
}

// ============================================================================
// Protocol
// ============================================================================

#[test]
fn test_unanswered_table_is_protocol_violation() {
    let mut translator = Translator::new(ROOT);
    assert!(matches!(translator.compile().unwrap(), TranslateResponse::Needs(_)));
    translator.update(UpdateData::new().file(ROOT, doc(vec![source("flights", "flights")])));
    assert!(matches!(translator.compile().unwrap(), TranslateResponse::Needs(_)));
    translator.update(UpdateData::new());
    let err = translator.compile().unwrap_err();
    let TranslatorError::NeedNotSatisfied(key) = err;
    assert_eq!(key, "table duck:flights");
}

#[test]
fn test_facts_may_arrive_before_they_are_asked_for() {
    let mut translator = Translator::new(ROOT);
    translator.update(
        UpdateData::new()
            .file(ROOT, doc(vec![source("flights", "flights")]))
            .table(
                TableKey::new("duck", "flights"),
                StructDef::table("flights", "flights", "duckdb", "duck")
                    .column("carrier", AtomicType::String),
            ),
    );
    match translator.compile().unwrap() {
        TranslateResponse::Final(result) => assert!(result.problems.is_empty()),
        TranslateResponse::Needs(needs) => panic!("unexpected needs {:?}", needs),
    }
    assert_eq!(translator.iterations(), 1);
}

#[test]
fn test_first_answer_wins() {
    let mut translator = Translator::new(ROOT);
    let key = TableKey::new("duck", "flights");
    translator.update(UpdateData::new().file(ROOT, doc(vec![source("flights", "flights")])));
    translator.update(UpdateData::new().table(
        key.clone(),
        StructDef::table("flights", "flights", "duckdb", "duck").column("first", AtomicType::String),
    ));
    translator.update(UpdateData::new().table(
        key,
        StructDef::table("flights", "flights", "duckdb", "duck").column("second", AtomicType::String),
    ));
    let TranslateResponse::Final(result) = translator.compile().unwrap() else {
        panic!("expected a final result");
    };
    let flights = result.model.source("flights").unwrap();
    assert!(flights.has_field("first"));
    assert!(!flights.has_field("second"));
}

#[test]
fn test_final_result_is_frozen() {
    let mut host = Host::default()
        .file(ROOT, doc(vec![source("flights", "flights")]))
        .table("flights", &["carrier"]);
    let mut translator = Translator::new(ROOT);
    let first = host.run(&mut translator);
    let iterations = translator.iterations();
    assert!(translator.is_final());

    translator.update(UpdateData::new().file(ROOT, doc(vec![])));
    let TranslateResponse::Final(again) = translator.compile().unwrap() else {
        panic!("expected a final result");
    };
    assert_eq!(first.model, again.model);
    assert_eq!(translator.iterations(), iterations);
}
