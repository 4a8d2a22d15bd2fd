//! Seeded in-memory warehouse for trying the console without a live account.

use std::sync::Arc;

use dmf_store::InMemoryWarehouse;
use dmf_types::{AppliedDmfRecord, DmfConfigEntry};

fn row(table: &str, dmf: &str, cols: &str, schedule: &str) -> DmfConfigEntry {
    DmfConfigEntry {
        database: "DEMO".into(),
        schema: "SALES".into(),
        table: table.into(),
        dmf_name: dmf.into(),
        column_names: cols.into(),
        schedule: schedule.into(),
    }
}

pub async fn demo_warehouse(config_table: &str) -> Arc<InMemoryWarehouse> {
    let wh = Arc::new(InMemoryWarehouse::new(config_table));

    wh.insert_config(row("ORDERS", "SNOWFLAKE.CORE.NULL_COUNT", "CUSTOMER_ID", "60 MINUTE"), true)
        .await;
    wh.insert_config(row("ORDERS", "SNOWFLAKE.CORE.ROW_COUNT", "", "60 MINUTE"), true)
        .await;
    wh.insert_config(row("ORDERS", "SNOWFLAKE.CORE.DUPLICATE_COUNT", "ORDER_ID", "TRIGGER_ON_CHANGES"), true)
        .await;
    wh.insert_config(row("CUSTOMERS", "SNOWFLAKE.CORE.NULL_COUNT", "EMAIL", "USING CRON 0 6 * * * UTC"), true)
        .await;
    wh.insert_config(row("CUSTOMERS", "SNOWFLAKE.CORE.FRESHNESS", "UPDATED_AT", "60 MINUTE"), false)
        .await;
    wh.insert_config(row("LEGACY_RETURNS", "SNOWFLAKE.CORE.ROW_COUNT", "", "60 MINUTE"), true)
        .await;

    wh.attach("DEMO.SALES.ORDERS", AppliedDmfRecord::new("ROW_COUNT", None)).await;
    wh.attach("DEMO.SALES.ORDERS", AppliedDmfRecord::new("NULL_COUNT", Some("AMOUNT")))
        .await;
    wh.attach("DEMO.SALES.CUSTOMERS", AppliedDmfRecord::new("NULL_COUNT", Some("EMAIL")))
        .await;
    wh.mark_unavailable("DEMO.SALES.LEGACY_RETURNS").await;

    wh
}
