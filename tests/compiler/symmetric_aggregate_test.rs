//! Aggregates over fanned-out joins.
//!
//! A `many` join repeats the rows of the struct that declares it. Sums,
//! averages and counts of the repeated rows must still count every row once.

use std::collections::HashSet;

use quiver::cache::hash::content_hash;
use quiver::compiler::{CompileOptions, QueryCompiler};
use quiver::model::{
    AggregateFunc, AtomicField, AtomicType, BinaryOp, Expr, ExpressionType, FieldDef, JoinInfo,
    JoinKind, JoinRelationship, ModelDef, NamedObject, PipeSegment, Query, QueryField,
    QuerySegment, SourceRef, StructDef,
};

// ============================================================================
// Fixtures
// ============================================================================

fn measure(name: &str, func: AggregateFunc, arg: Option<Expr>) -> FieldDef {
    FieldDef::Atomic(AtomicField::computed(
        name,
        AtomicType::Number,
        Expr::aggregate(func, arg, vec![]),
        ExpressionType::Aggregate,
    ))
}

fn items_join() -> StructDef {
    let mut items = StructDef::table("items", "shop.items", "postgres", "pg")
        .column("order_id", AtomicType::Number)
        .column("price", AtomicType::Number);
    items.join = Some(JoinInfo {
        relationship: JoinRelationship::Many,
        join_type: JoinKind::Left,
        on: Some(Expr::binary(
            BinaryOp::Eq,
            Expr::field(&["id"]),
            Expr::field(&["items", "order_id"]),
        )),
    });
    items
}

fn carriers_join() -> StructDef {
    let mut carriers = StructDef::table("carriers", "shop.carriers", "postgres", "pg")
        .column("code", AtomicType::String)
        .column("fleet_size", AtomicType::Number)
        .primary_key("code");
    carriers.join = Some(JoinInfo {
        relationship: JoinRelationship::One,
        join_type: JoinKind::Left,
        on: Some(Expr::binary(
            BinaryOp::Eq,
            Expr::field(&["carrier"]),
            Expr::field(&["carriers", "code"]),
        )),
    });
    carriers
}

fn orders(keyed: bool) -> StructDef {
    let orders = StructDef::table("orders", "shop.orders", "postgres", "pg")
        .column("id", AtomicType::Number)
        .column("carrier", AtomicType::String)
        .column("shipping", AtomicType::Number)
        .field_def(FieldDef::Struct(items_join()))
        .field_def(FieldDef::Struct(carriers_join()))
        .field_def(measure(
            "total_shipping",
            AggregateFunc::Sum,
            Some(Expr::field(&["shipping"])),
        ))
        .field_def(measure(
            "avg_shipping",
            AggregateFunc::Avg,
            Some(Expr::field(&["shipping"])),
        ))
        .field_def(measure(
            "item_total",
            AggregateFunc::Sum,
            Some(Expr::field(&["items", "price"])),
        ))
        .field_def(measure("order_count", AggregateFunc::Count, None));
    if keyed {
        orders.primary_key("id")
    } else {
        orders
    }
}

fn model(keyed: bool) -> ModelDef {
    let mut model = ModelDef::new("file:///shop.json");
    model
        .contents
        .insert("orders".into(), NamedObject::Source(orders(keyed)));
    model
}

fn compile(model: &ModelDef, fields: &[&[&str]], dialect: &str) -> String {
    let query = Query::new(
        SourceRef::Named("orders".into()),
        vec![PipeSegment::Reduce(QuerySegment {
            fields: fields.iter().map(|p| QueryField::reference(p)).collect(),
            ..Default::default()
        })],
    );
    let options = CompileOptions {
        dialect: Some(dialect.into()),
        default_row_limit: None,
    };
    QueryCompiler::new(model)
        .compile_with(&query, &options)
        .unwrap()
        .sql
}

// ============================================================================
// SQL shape
// ============================================================================

#[test]
fn test_no_fanout_means_plain_aggregates() {
    let sql = compile(
        &model(true),
        &[&["carrier"], &["total_shipping"], &["order_count"]],
        "postgres",
    );
    assert!(sql.contains("SUM(\"base\".\"shipping\")"), "{}", sql);
    assert!(sql.contains("COUNT(1)"), "{}", sql);
    assert!(!sql.contains("DISTINCT"), "{}", sql);
    assert!(!sql.contains("JOIN"), "{}", sql);
}

#[test]
fn test_root_sum_is_symmetric_when_many_join_used() {
    let sql = compile(
        &model(true),
        &[&["carrier"], &["total_shipping"], &["item_total"]],
        "postgres",
    );
    println!("{}", sql);
    assert!(sql.contains("LEFT JOIN \"shop\".\"items\" AS \"items\""), "{}", sql);
    assert!(sql.contains("SUM(DISTINCT"), "{}", sql);
    assert!(sql.contains(" - SUM(DISTINCT"), "{}", sql);
    assert!(sql.contains("MD5(\"base\".\"id\"::TEXT)"), "{}", sql);
    // The joined rows are not repeated; their sum stays plain.
    assert!(sql.contains("SUM(\"items\".\"price\")"), "{}", sql);
}

#[test]
fn test_root_count_uses_primary_key() {
    let sql = compile(&model(true), &[&["order_count"], &["item_total"]], "postgres");
    assert!(sql.contains("COUNT(DISTINCT \"base\".\"id\")"), "{}", sql);
}

#[test]
fn test_avg_divides_by_distinct_keys_with_values() {
    let sql = compile(&model(true), &[&["avg_shipping"], &["item_total"]], "postgres");
    assert!(sql.contains("NULLIF(COUNT(DISTINCT CASE WHEN"), "{}", sql);
    assert!(
        sql.contains("\"base\".\"shipping\" IS NOT NULL THEN \"base\".\"id\" END"),
        "{}",
        sql
    );
}

#[test]
fn test_one_join_on_path_is_symmetric() {
    let mut model = model(true);
    if let Some(NamedObject::Source(orders)) = model.contents.get_mut("orders") {
        orders.fields.push(measure(
            "fleet",
            AggregateFunc::Sum,
            Some(Expr::field(&["carriers", "fleet_size"])),
        ));
    }
    let sql = compile(&model, &[&["fleet"]], "postgres");
    println!("{}", sql);
    assert!(sql.contains("SUM(DISTINCT"), "{}", sql);
    assert!(sql.contains("MD5(\"carriers\".\"code\"::TEXT)"), "{}", sql);
}

#[test]
fn test_missing_primary_key_generates_distinct_key() {
    let sql = compile(&model(false), &[&["total_shipping"], &["item_total"]], "duckdb");
    println!("{}", sql);
    assert!(
        sql.contains("GEN_RANDOM_UUID() AS \"__distinct_key\""),
        "{}",
        sql
    );
    assert!(
        sql.contains("md5_number_upper((\"base\".\"__distinct_key\")::VARCHAR)"),
        "{}",
        sql
    );
    // Only the root is wrapped; the joined table is read as is.
    assert_eq!(sql.matches("AS \"__distinct_key\"").count(), 1, "{}", sql);
}

#[test]
fn test_count_at_join_locality() {
    let mut model = model(true);
    if let Some(NamedObject::Source(orders)) = model.contents.get_mut("orders") {
        orders.fields.push(FieldDef::Atomic(AtomicField::computed(
            "item_count",
            AtomicType::Number,
            Expr::aggregate(AggregateFunc::Count, None, vec!["items".into()]),
            ExpressionType::Aggregate,
        )));
    }
    let sql = compile(&model, &[&["carrier"], &["item_count"]], "postgres");
    assert!(
        sql.contains("COUNT(DISTINCT \"items\".\"__distinct_key\")"),
        "{}",
        sql
    );
    assert!(sql.contains("GEN_RANDOM_UUID() AS \"__distinct_key\""), "{}", sql);
}

#[test]
fn test_every_dialect_emits_symmetric_sum() {
    for dialect in quiver::sql::dialect_names() {
        let sql = compile(&model(true), &[&["total_shipping"], &["item_total"]], dialect);
        assert!(sql.contains("SUM(DISTINCT"), "{}: {}", dialect, sql);
        assert!(sql.contains(" - SUM(DISTINCT"), "{}: {}", dialect, sql);
    }
}

// ============================================================================
// Why the formula works
// ============================================================================

/// Large number derived from a key, standing in for the database hash.
fn hashed(key: &str) -> u128 {
    u128::from_str_radix(&content_hash(key)[..16], 16).unwrap() * 4_294_967_296
}

#[test]
fn test_symmetric_sum_counts_each_key_once() {
    // order 1 (shipping 10) has three items, order 2 (shipping 20) has two.
    let joined: Vec<(&str, u128)> = vec![
        ("1", 10),
        ("1", 10),
        ("1", 10),
        ("2", 20),
        ("2", 20),
    ];

    let naive: u128 = joined.iter().map(|(_, v)| v).sum();
    assert_eq!(naive, 70);

    let with_value: HashSet<u128> = joined.iter().map(|(k, v)| hashed(k) + v).collect();
    let hashes: HashSet<u128> = joined.iter().map(|(k, _)| hashed(k)).collect();
    let symmetric = with_value.iter().sum::<u128>() - hashes.iter().sum::<u128>();
    assert_eq!(symmetric, 30);
}
