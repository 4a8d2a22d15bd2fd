use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dmf_types::{ActionKind, AppliedDmfRecord, DmfConfigEntry, FilterCondition};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{Warehouse, WarehouseError};

const POLL_INITIAL: Duration = Duration::from_millis(200);
const POLL_MAX: Duration = Duration::from_secs(2);

const ACTIVE_CONFIG_SQL: &str = "SELECT DATABASE_NAME, SCHEMA_NAME, TABLE_NAME, DMF_NAME, COLUMN_NAMES, DMF_SCHEDULE \
     FROM IDENTIFIER(?) WHERE IS_ACTIVE = TRUE";

const APPLIED_DMFS_SQL: &str = "SELECT METRIC_NAME, ARRAY_TO_STRING(REF_ARGUMENTS::ARRAY, ',') AS COLUMNS \
     FROM TABLE(INFORMATION_SCHEMA.DATA_METRIC_FUNCTION_REFERENCES(\
     REF_ENTITY_NAME => ?, REF_ENTITY_DOMAIN => 'TABLE'))";

#[derive(Clone)]
pub struct SqlApiConfig {
    /// Account URL, e.g. `https://<account>.snowflakecomputing.com`.
    pub base_url: String,
    pub token: Option<String>,
    /// Value for `X-Snowflake-Authorization-Token-Type` (`OAUTH`, `KEYPAIR_JWT`, ...).
    pub token_type: Option<String>,
    /// Fully qualified name of the management procedure.
    pub procedure: String,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    /// Server-side statement timeout.
    pub statement_timeout: Duration,
    /// Client-side HTTP timeout.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for SqlApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***REDACTED***"))
            .field("token_type", &self.token_type)
            .field("procedure", &self.procedure)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .field("statement_timeout", &self.statement_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Warehouse reached through the SQL REST API (`/api/v2/statements`).
///
/// Every caller-supplied value travels as a bound parameter. The procedure name
/// comes from configuration and is checked to be a plain qualified identifier.
pub struct SqlApiWarehouse {
    client: reqwest::Client,
    cfg: SqlApiConfig,
}

#[derive(Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    bindings: BTreeMap<String, Binding>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct Binding {
    #[serde(rename = "type")]
    kind: &'static str,
    value: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct StatementResponse {
    #[serde(rename = "statementHandle", default)]
    statement_handle: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "resultSetMetaData", default)]
    meta: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Deserialize, Debug, Default)]
struct ResultSetMetaData {
    #[serde(rename = "rowType", default)]
    row_type: Vec<ColumnType>,
    #[serde(rename = "partitionInfo", default)]
    partition_info: Vec<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct ColumnType {
    name: String,
}

/// Rows of one statement, all partitions concatenated.
#[derive(Debug, Default)]
struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn index_of(&self, name: &str) -> Result<usize, WarehouseError> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| WarehouseError::Decode(format!("missing {name} column")))
    }

    fn required(&self, row: usize, col: usize, name: &str) -> Result<String, WarehouseError> {
        self.optional(row, col)
            .ok_or_else(|| WarehouseError::Decode(format!("{name} is NULL in row {row}")))
    }

    fn optional(&self, row: usize, col: usize) -> Option<String> {
        self.rows.get(row).and_then(|r| r.get(col)).cloned().flatten()
    }
}

fn text(value: &str) -> Binding {
    Binding {
        kind: "TEXT",
        value: Some(value.to_string()),
    }
}

fn null_text() -> Binding {
    Binding {
        kind: "TEXT",
        value: None,
    }
}

fn is_qualified_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

impl SqlApiWarehouse {
    pub fn new(cfg: SqlApiConfig) -> Result<Self, WarehouseError> {
        if !is_qualified_identifier(&cfg.procedure) {
            return Err(WarehouseError::Decode(format!(
                "procedure name {:?} is not a qualified identifier",
                cfg.procedure
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| WarehouseError::Transport(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    fn statements_url(&self) -> String {
        format!("{}/api/v2/statements", self.cfg.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req.header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.cfg.token {
            req = req.bearer_auth(token);
        }
        if let Some(kind) = &self.cfg.token_type {
            req = req.header("X-Snowflake-Authorization-Token-Type", kind);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<StatementResponse, WarehouseError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| WarehouseError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| WarehouseError::Transport(e.to_string()))?;

        if status == reqwest::StatusCode::ACCEPTED {
            let parsed: StatementResponse = serde_json::from_str(&body).unwrap_or_default();
            return Err(WarehouseError::Pending {
                handle: parsed.statement_handle.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            let message = serde_json::from_str::<StatementResponse>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(body);
            return Err(WarehouseError::Status {
                code: status.as_u16(),
                message,
            });
        }
        serde_json::from_str(&body).map_err(|e| WarehouseError::Decode(e.to_string()))
    }

    /// Poll a statement that is still running until it completes, giving up
    /// once `statement_timeout` has passed.
    async fn wait_for(&self, handle: String) -> Result<StatementResponse, WarehouseError> {
        if handle.is_empty() {
            return Err(WarehouseError::Pending { handle });
        }
        let url = format!("{}/{}", self.statements_url(), handle);
        let deadline = Instant::now() + self.cfg.statement_timeout;
        let mut delay = POLL_INITIAL;
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(handle = %handle, "statement still running after timeout");
                return Err(WarehouseError::Pending { handle });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            match self.send(self.client.get(&url)).await {
                Err(WarehouseError::Pending { .. }) => {
                    tracing::debug!(handle = %handle, "statement still running");
                    delay = (delay * 2).min(POLL_MAX);
                }
                other => return other,
            }
        }
    }

    async fn execute(&self, statement: &str, params: Vec<Binding>) -> Result<ResultSet, WarehouseError> {
        let bindings: BTreeMap<String, Binding> = params
            .into_iter()
            .enumerate()
            .map(|(i, b)| ((i + 1).to_string(), b))
            .collect();
        let body = StatementRequest {
            statement,
            timeout: self.cfg.statement_timeout.as_secs(),
            database: self.cfg.database.as_deref(),
            schema: self.cfg.schema.as_deref(),
            warehouse: self.cfg.warehouse.as_deref(),
            role: self.cfg.role.as_deref(),
            bindings,
        };
        tracing::debug!(statement, "submitting statement");
        let first = match self
            .send(self.client.post(self.statements_url()).json(&body))
            .await
        {
            Err(WarehouseError::Pending { handle }) => self.wait_for(handle).await?,
            other => other?,
        };

        let meta = first.meta.unwrap_or_default();
        let mut result = ResultSet {
            columns: meta.row_type.into_iter().map(|c| c.name).collect(),
            rows: first.data,
        };

        if meta.partition_info.len() > 1 {
            let handle = first.statement_handle.ok_or_else(|| {
                WarehouseError::Decode("partitioned result without statementHandle".into())
            })?;
            for partition in 1..meta.partition_info.len() {
                let url = format!("{}/{}", self.statements_url(), handle);
                let page = self
                    .send(self.client.get(url).query(&[("partition", partition)]))
                    .await?;
                result.rows.extend(page.data);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl Warehouse for SqlApiWarehouse {
    async fn active_config(&self, config_table: &str) -> Result<Vec<DmfConfigEntry>, WarehouseError> {
        let rs = self.execute(ACTIVE_CONFIG_SQL, vec![text(config_table)]).await?;
        let db = rs.index_of("DATABASE_NAME")?;
        let schema = rs.index_of("SCHEMA_NAME")?;
        let table = rs.index_of("TABLE_NAME")?;
        let dmf = rs.index_of("DMF_NAME")?;
        let cols = rs.index_of("COLUMN_NAMES")?;
        let schedule = rs.index_of("DMF_SCHEDULE")?;

        (0..rs.rows.len())
            .map(|row| {
                Ok(DmfConfigEntry {
                    database: rs.required(row, db, "DATABASE_NAME")?,
                    schema: rs.required(row, schema, "SCHEMA_NAME")?,
                    table: rs.required(row, table, "TABLE_NAME")?,
                    dmf_name: rs.required(row, dmf, "DMF_NAME")?,
                    column_names: rs.optional(row, cols).unwrap_or_default(),
                    schedule: rs.optional(row, schedule).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn applied_dmfs(&self, full_table_id: &str) -> Result<Vec<AppliedDmfRecord>, WarehouseError> {
        let rs = self.execute(APPLIED_DMFS_SQL, vec![text(full_table_id)]).await?;
        let metric = rs.index_of("METRIC_NAME")?;
        let cols = rs.index_of("COLUMNS")?;
        (0..rs.rows.len())
            .map(|row| {
                Ok(AppliedDmfRecord {
                    metric_name: rs.required(row, metric, "METRIC_NAME")?,
                    columns: rs.optional(row, cols),
                })
            })
            .collect()
    }

    async fn manage_dmf(
        &self,
        target: &str,
        action: ActionKind,
        filter: Option<&FilterCondition>,
    ) -> Result<Option<String>, WarehouseError> {
        let statement = format!("CALL {}(?, ?, ?)", self.cfg.procedure);
        let filter = match filter {
            Some(f) => text(&f.to_predicate()),
            None => null_text(),
        };
        let rs = self
            .execute(&statement, vec![text(target), text(action.verb()), filter])
            .await?;
        Ok(rs.optional(0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_checked() {
        assert!(is_qualified_identifier("DEMO.GOVERNANCE.SP_MANAGE_DMF"));
        assert!(!is_qualified_identifier("DEMO.GOV; DROP TABLE X"));
        assert!(!is_qualified_identifier("DEMO..SP"));
        assert!(!is_qualified_identifier(""));
    }

    #[test]
    fn bindings_serialize_positionally() {
        let body = StatementRequest {
            statement: "CALL P(?, ?, ?)",
            timeout: 60,
            database: None,
            schema: None,
            warehouse: Some("WH"),
            role: None,
            bindings: [("1".to_string(), text("a")), ("2".to_string(), null_text())]
                .into_iter()
                .collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["bindings"]["1"], serde_json::json!({"type": "TEXT", "value": "a"}));
        assert_eq!(json["bindings"]["2"], serde_json::json!({"type": "TEXT", "value": null}));
        assert_eq!(json["warehouse"], "WH");
        assert!(json.get("database").is_none());
    }
}
