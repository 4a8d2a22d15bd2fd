//! SQL API warehouse against a mocked statements endpoint.

use std::time::Duration;

use dmf_store::{SqlApiConfig, SqlApiWarehouse, Warehouse, WarehouseError};
use dmf_types::{ActionKind, AppliedDmfRecord, FilterCondition};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn warehouse(server: &MockServer) -> SqlApiWarehouse {
    warehouse_with_timeout(server, Duration::from_secs(60))
}

fn warehouse_with_timeout(server: &MockServer, statement_timeout: Duration) -> SqlApiWarehouse {
    SqlApiWarehouse::new(SqlApiConfig {
        base_url: server.uri(),
        token: Some("secret".into()),
        token_type: Some("OAUTH".into()),
        procedure: "DEMO.GOVERNANCE.SP_MANAGE_DMF".into(),
        database: None,
        schema: None,
        warehouse: Some("COMPUTE_WH".into()),
        role: None,
        statement_timeout,
        request_timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn rows(columns: &[&str], data: serde_json::Value) -> serde_json::Value {
    let row_type: Vec<_> = columns.iter().map(|c| json!({ "name": c })).collect();
    json!({
        "statementHandle": "01b2-handle",
        "code": "090001",
        "message": "Statement executed successfully.",
        "resultSetMetaData": { "rowType": row_type, "partitionInfo": [{ "rowCount": 1 }] },
        "data": data,
    })
}

#[tokio::test]
async fn active_config_binds_table_and_maps_nulls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .and(header("authorization", "Bearer secret"))
        .and(header("x-snowflake-authorization-token-type", "OAUTH"))
        .and(body_partial_json(json!({
            "warehouse": "COMPUTE_WH",
            "bindings": { "1": { "type": "TEXT", "value": "DEMO.GOVERNANCE.DMF_CONFIG" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(
            &["DATABASE_NAME", "SCHEMA_NAME", "TABLE_NAME", "DMF_NAME", "COLUMN_NAMES", "DMF_SCHEDULE"],
            json!([
                ["DEMO", "SALES", "ORDERS", "SNOWFLAKE.CORE.NULL_COUNT", "AMOUNT", "60 MINUTE"],
                ["DEMO", "SALES", "ORDERS", "SNOWFLAKE.CORE.ROW_COUNT", null, null]
            ]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let config = warehouse(&server)
        .active_config("DEMO.GOVERNANCE.DMF_CONFIG")
        .await
        .unwrap();

    assert_eq!(config.len(), 2);
    assert_eq!(config[0].full_table_id(), "DEMO.SALES.ORDERS");
    assert_eq!(config[0].column_names, "AMOUNT");
    assert_eq!(config[1].column_names, "");
    assert_eq!(config[1].schedule, "");
}

#[tokio::test]
async fn applied_dmfs_keeps_null_columns_as_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .and(body_partial_json(json!({
            "bindings": { "1": { "type": "TEXT", "value": "DEMO.SALES.ORDERS" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(
            &["METRIC_NAME", "COLUMNS"],
            json!([["NULL_COUNT", "AMOUNT"], ["ROW_COUNT", null]]),
        )))
        .mount(&server)
        .await;

    let applied = warehouse(&server).applied_dmfs("DEMO.SALES.ORDERS").await.unwrap();
    assert_eq!(
        applied,
        vec![
            AppliedDmfRecord::new("NULL_COUNT", Some("AMOUNT")),
            AppliedDmfRecord::new("ROW_COUNT", None),
        ]
    );
}

#[tokio::test]
async fn partitioned_results_are_concatenated() {
    let server = MockServer::start().await;
    let mut first = rows(&["METRIC_NAME", "COLUMNS"], json!([["A", ""]]));
    first["resultSetMetaData"]["partitionInfo"] = json!([{ "rowCount": 1 }, { "rowCount": 1 }]);

    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(first))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/statements/01b2-handle"))
        .and(query_param("partition", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [["B", "X"]] })))
        .expect(1)
        .mount(&server)
        .await;

    let applied = warehouse(&server).applied_dmfs("DEMO.S.T").await.unwrap();
    let names: Vec<_> = applied.iter().map(|r| r.metric_name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
}

#[tokio::test]
async fn manage_dmf_binds_quoted_filter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .and(body_partial_json(json!({
            "statement": "CALL DEMO.GOVERNANCE.SP_MANAGE_DMF(?, ?, ?)",
            "bindings": {
                "1": { "type": "TEXT", "value": "DEMO.GOVERNANCE.DMF_CONFIG" },
                "2": { "type": "TEXT", "value": "ADD" },
                "3": { "type": "TEXT", "value": "TABLE_NAME = 'O''BRIEN' AND DMF_NAME = 'ns.check'" }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(
            &["SP_MANAGE_DMF"],
            json!([["Added 1 DMF(s)"]]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let filter = FilterCondition::new("O'BRIEN", "ns.check");
    let out = warehouse(&server)
        .manage_dmf("DEMO.GOVERNANCE.DMF_CONFIG", ActionKind::Add, Some(&filter))
        .await
        .unwrap();
    assert_eq!(out.as_deref(), Some("Added 1 DMF(s)"));
}

#[tokio::test]
async fn manage_dmf_without_filter_binds_null() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .and(body_partial_json(json!({
            "bindings": { "2": { "value": "VALIDATE" }, "3": { "type": "TEXT", "value": null } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(&["SP_MANAGE_DMF"], json!([]))))
        .expect(1)
        .mount(&server)
        .await;

    let out = warehouse(&server)
        .manage_dmf("DEMO.GOVERNANCE.DMF_CONFIG", ActionKind::Validate, None)
        .await
        .unwrap();
    assert_eq!(out, None);
}

#[tokio::test]
async fn error_status_carries_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "code": "002003",
            "message": "Table 'DEMO.S.GONE' does not exist or not authorized."
        })))
        .mount(&server)
        .await;

    let err = warehouse(&server).applied_dmfs("DEMO.S.GONE").await.unwrap_err();
    match err {
        WarehouseError::Status { code, message } => {
            assert_eq!(code, 422);
            assert!(message.contains("does not exist"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn long_running_call_is_polled_until_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "statementHandle": "01b3-running",
            "message": "Asynchronous execution in progress."
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/statements/01b3-running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(
            &["SP_MANAGE_DMF"],
            json!([["ADD done"]]),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let filter = FilterCondition::new("ORDERS", "SNOWFLAKE.CORE.NULL_COUNT");
    let out = warehouse(&server)
        .manage_dmf("DEMO.GOVERNANCE.DMF_CONFIG", ActionKind::Add, Some(&filter))
        .await
        .unwrap();
    assert_eq!(out.as_deref(), Some("ADD done"));
}

#[tokio::test]
async fn still_running_after_statement_timeout_is_pending() {
    let server = MockServer::start().await;
    let running = json!({
        "statementHandle": "01b3-running",
        "message": "Asynchronous execution in progress."
    });
    Mock::given(method("POST"))
        .and(path("/api/v2/statements"))
        .respond_with(ResponseTemplate::new(202).set_body_json(running.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/statements/01b3-running"))
        .respond_with(ResponseTemplate::new(202).set_body_json(running))
        .mount(&server)
        .await;

    let err = warehouse_with_timeout(&server, Duration::from_secs(1))
        .active_config("CFG")
        .await
        .unwrap_err();
    assert!(matches!(err, WarehouseError::Pending { handle } if handle == "01b3-running"));
}

#[test]
fn rejects_procedure_names_that_are_not_identifiers() {
    let cfg = SqlApiConfig {
        base_url: "http://localhost".into(),
        token: None,
        token_type: None,
        procedure: "X(); DROP TABLE Y; --".into(),
        database: None,
        schema: None,
        warehouse: None,
        role: None,
        statement_timeout: Duration::from_secs(60),
        request_timeout: Duration::from_secs(5),
    };
    assert!(SqlApiWarehouse::new(cfg).is_err());
}
