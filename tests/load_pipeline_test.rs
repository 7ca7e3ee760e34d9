use polars::prelude::*;
use serde_json::json;
use std::sync::Arc;
use warehouse_ingest::ingestion::{enforce, normalize, SchemaSource};
use warehouse_ingest::{
    FieldMode, FieldSchema, FieldType, LoadError, LoadOrchestrator, LoadRequest, LoadStatus, MemoryWarehouse,
    Record, SchemaInference, TableRef, TableSchema, Value,
};

fn records(json: serde_json::Value) -> Vec<Record> {
    json.as_array()
        .expect("array of records")
        .iter()
        .cloned()
        .map(|r| Record::from_json(r).unwrap())
        .collect()
}

fn schema_of(fields: &[(&str, FieldType)]) -> TableSchema {
    TableSchema::new(fields.iter().map(|(name, ty)| FieldSchema::new(*name, *ty)).collect())
}

#[test]
fn test_normalize_order_record() {
    let out = normalize(&records(json!([{"Order-Id": 5, "Amount": "12.50", "meta": {}}])), None);
    assert_eq!(out[0].keys().collect::<Vec<_>>(), vec!["Order_Id", "Amount", "meta"]);
    assert_eq!(out[0].get("Order_Id"), Some(&Value::Int(5)));
    assert_eq!(out[0].get("Amount"), Some(&Value::from("12.50")));
    assert_eq!(out[0].get("meta"), Some(&Value::Null));
}

#[test]
fn test_conflicting_scalars_infer_string() {
    let schema = SchemaInference::new().infer(&records(json!([{"x": 1}, {"x": "a"}])));
    assert_eq!(schema.field("x").unwrap().field_type, FieldType::String);
}

#[test]
fn test_repeated_string_enforcement() {
    let schema = TableSchema::new(vec![FieldSchema::new("tags", FieldType::String).repeated()]);
    let out = enforce(&records(json!([{"tags": [1, 2]}])), &schema);
    assert_eq!(
        out[0].get("tags"),
        Some(&Value::List(vec![Value::from("1"), Value::from("2")]))
    );
}

#[tokio::test]
async fn test_rejected_load_retries_once_with_new_column() {
    let dest = TableRef::new("ds", "events");
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(dest.clone(), schema_of(&[("x", FieldType::Integer)])));
    warehouse.reject_next_load("no such field: y");
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(records(json!([{"x": 1, "y": true}])), &LoadRequest::new("ds", "events"))
        .await
        .unwrap();

    let submissions = warehouse.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].schema.names(), vec!["x"]);
    assert!(submissions[1].schema.contains("x"));
    assert!(submissions[1].schema.contains("y"));
    assert_eq!(outcome.status, LoadStatus::SchemaWidened);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.schema_source, SchemaSource::ExistingTable);
}

#[tokio::test]
async fn test_second_rejection_is_not_retried() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_dataset("ds"));
    warehouse.reject_next_load("quota exceeded");
    warehouse.reject_next_load("quota exceeded");
    let loader = LoadOrchestrator::new(warehouse.clone());

    let err = loader
        .load_records(records(json!([{"x": 1}])), &LoadRequest::new("ds", "events"))
        .await
        .unwrap_err();

    assert!(matches!(err, LoadError::Rejected { attempts: 2, .. }));
    assert_eq!(warehouse.submissions().len(), 2);
}

#[tokio::test]
async fn test_type_mismatch_widens_append_table() {
    let dest = TableRef::new("ds", "events");
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(dest.clone(), schema_of(&[("x", FieldType::Integer)])));
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(
            records(json!([{"x": "abc", "y": true}])),
            &LoadRequest::new("ds", "events").append(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, LoadStatus::SchemaWidened);
    assert!(outcome.warnings.is_empty());
    let table = warehouse.table(&dest).unwrap();
    assert_eq!(table.schema.field("x").unwrap().field_type, FieldType::String);
    assert_eq!(table.schema.field("y").unwrap().field_type, FieldType::Boolean);
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.rows[0].get("x"), Some(&Value::from("abc")));
}

#[tokio::test]
async fn test_refused_base_table_update_is_a_warning() {
    let base = TableRef::new("ds", "base");
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(base.clone(), schema_of(&[("x", FieldType::Integer)])));
    warehouse.refuse_schema_update(&base);
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(
            records(json!([{"x": "abc"}])),
            &LoadRequest::new("ds", "daily").with_base_table("base"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.schema_source, SchemaSource::BaseTable("base".to_string()));
    assert_eq!(outcome.status, LoadStatus::SchemaWidened);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].table, base);
    assert_eq!(
        warehouse.table(&base).unwrap().schema.field("x").unwrap().field_type,
        FieldType::Integer
    );
    assert!(warehouse.table(&TableRef::new("ds", "daily")).is_some());
}

#[tokio::test]
async fn test_widened_schema_reaches_permanent_table() {
    let permanent = TableRef::new("ds", "orders");
    let warehouse =
        Arc::new(MemoryWarehouse::new().with_table(permanent.clone(), schema_of(&[("x", FieldType::Integer)])));
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(records(json!([{"x": "abc", "y": 1}])), &LoadRequest::new("ds", "orders_temp"))
        .await
        .unwrap();

    assert_eq!(outcome.schema_source, SchemaSource::PermanentTable("orders".to_string()));
    let schema = warehouse.table(&permanent).unwrap().schema;
    assert_eq!(schema.field("x").unwrap().field_type, FieldType::String);
    assert_eq!(schema.field("y").unwrap().field_type, FieldType::Integer);
    assert_eq!(warehouse.table(&TableRef::new("ds", "orders_temp")).unwrap().rows.len(), 1);
}

#[tokio::test]
async fn test_nested_payload_loads_first_time() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(
            records(json!([
                {"id": 1, "customer": {"e-mail": "a@b.c"}, "lines": [{"sku": "A", "qty": 2}]},
                {"id": 2, "customer": {}, "lines": [], "note": null}
            ])),
            &LoadRequest::new("shop", "orders").with_platform("shopify"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, LoadStatus::Loaded);
    assert_eq!(outcome.attempts, 1);
    let lines = outcome.schema.field("lines").unwrap();
    assert_eq!(lines.mode, FieldMode::Repeated);
    assert_eq!(lines.field_type, FieldType::Record);
    assert!(outcome.schema.field("customer").unwrap().field("e_mail").is_some());
    assert!(warehouse.has_dataset("shop"));
}

#[tokio::test]
async fn test_load_dataframe() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_dataset("ds"));
    let loader = LoadOrchestrator::new(warehouse.clone());
    let frame = df![
        "Order #" => [1i64, 2],
        "unit price" => [Some(9.5), None],
        "status" => ["paid", "open"]
    ]
    .unwrap();

    let outcome = loader
        .load_dataframe(&frame, &LoadRequest::new("ds", "frame_orders"))
        .await
        .unwrap();

    assert_eq!(outcome.rows, 2);
    assert_eq!(outcome.schema.names(), vec!["Order_Number", "unit_price", "status"]);
    assert_eq!(outcome.schema.field("unit_price").unwrap().field_type, FieldType::Float);
    let table = warehouse.table(&TableRef::new("ds", "frame_orders")).unwrap();
    assert_eq!(table.rows[1].get("unit_price"), Some(&Value::Null));
}

#[tokio::test]
async fn test_scalar_and_list_values_share_a_repeated_column() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_dataset("ds"));
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(records(json!([{"n": 5}, {"n": [1, 2]}])), &LoadRequest::new("ds", "mixed"))
        .await
        .unwrap();

    assert_eq!(outcome.status, LoadStatus::Loaded);
    assert_eq!(outcome.attempts, 1);
    let n = outcome.schema.field("n").unwrap();
    assert_eq!((n.field_type, n.mode), (FieldType::Integer, FieldMode::Repeated));
    let rows = warehouse.table(&TableRef::new("ds", "mixed")).unwrap().rows;
    assert_eq!(rows[0].get("n"), Some(&Value::List(vec![Value::Int(5)])));
    assert_eq!(rows[1].get("n"), Some(&Value::List(vec![Value::Int(1), Value::Int(2)])));
}

#[tokio::test]
async fn test_field_names_differing_in_case_load_as_one_column() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_dataset("ds"));
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(records(json!([{"Id": 1}, {"id": 2}])), &LoadRequest::new("ds", "people"))
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.schema.names(), vec!["Id"]);
    let rows = warehouse.table(&TableRef::new("ds", "people")).unwrap().rows;
    assert_eq!(rows[1].get("Id"), Some(&Value::Int(2)));
}

#[tokio::test]
async fn test_refused_destination_update_on_append_is_a_warning() {
    let dest = TableRef::new("ds", "events");
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(dest.clone(), schema_of(&[("x", FieldType::Integer)])));
    warehouse.refuse_schema_update(&dest);
    warehouse.reject_next_load("backend error");
    let loader = LoadOrchestrator::new(warehouse.clone());

    let outcome = loader
        .load_records(records(json!([{"x": 1}])), &LoadRequest::new("ds", "events").append())
        .await
        .unwrap();

    assert_eq!(outcome.status, LoadStatus::SchemaWidened);
    assert_eq!(warehouse.submissions().len(), 2);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].table, dest);
    assert_eq!(warehouse.table(&dest).unwrap().rows.len(), 1);
}

#[tokio::test]
async fn test_refused_destination_update_still_submits_second_attempt() {
    let dest = TableRef::new("ds", "events");
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(dest.clone(), schema_of(&[("x", FieldType::Integer)])));
    warehouse.refuse_schema_update(&dest);
    let loader = LoadOrchestrator::new(warehouse.clone());

    let err = loader
        .load_records(records(json!([{"x": "abc"}])), &LoadRequest::new("ds", "events").append())
        .await
        .unwrap_err();

    assert!(matches!(err, LoadError::Rejected { attempts: 2, .. }));
    let submissions = warehouse.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[1].schema.field("x").unwrap().field_type, FieldType::String);
}

#[tokio::test]
async fn test_existing_table_types_are_kept_on_append() {
    let dest = TableRef::new("ds", "ledger");
    let table_schema = TableSchema::from_json(json!([
        {"name": "d", "type": "DATE", "mode": "REQUIRED"},
        {"name": "amount", "type": "NUMERIC"},
        {"name": "blob", "type": "BYTES"}
    ]))
    .unwrap();
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(dest.clone(), table_schema.clone()));
    let loader = LoadOrchestrator::new(warehouse.clone());
    let request = LoadRequest::new("ds", "ledger").append();

    let outcome = loader
        .load_records(records(json!([{"d": "2024-03-01", "amount": "12.50", "blob": "AAE="}])), &request)
        .await
        .unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(warehouse.submissions()[0].schema, table_schema);

    warehouse.reject_next_load("backend error");
    let outcome = loader
        .load_records(records(json!([{"d": "2024-03-02", "amount": 3, "y": true}])), &request)
        .await
        .unwrap();
    assert_eq!(outcome.status, LoadStatus::SchemaWidened);
    assert!(outcome.warnings.is_empty());
    let widened = warehouse.table(&dest).unwrap().schema;
    assert_eq!(&widened.fields[..3], &table_schema.fields[..]);
    assert_eq!(widened.field("y").unwrap().field_type, FieldType::Boolean);
    assert_eq!(warehouse.table(&dest).unwrap().rows.len(), 2);
}
