use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row of desired state from the DMF configuration table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmfConfigEntry {
    pub database: String,
    pub schema: String,
    pub table: String,
    /// Possibly namespace-qualified (`ns.name`).
    pub dmf_name: String,
    /// Comma-joined column list; empty means table-level scope.
    #[serde(default)]
    pub column_names: String,
    #[serde(default)]
    pub schedule: String,
}

impl DmfConfigEntry {
    pub fn full_table_id(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table)
    }

    /// The metric name as the live metadata reports it: everything after the last `.`.
    pub fn dmf_short_name(&self) -> &str {
        match self.dmf_name.rsplit_once('.') {
            Some((_, short)) => short,
            None => &self.dmf_name,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            full_table_id: self.full_table_id(),
            dmf_short_name: self.dmf_short_name().to_string(),
            column_names: self.column_names.clone(),
        }
    }

    /// Predicate the management procedure uses to target this row.
    pub fn filter_condition(&self) -> FilterCondition {
        FilterCondition {
            table_name: self.table.clone(),
            dmf_name: self.dmf_name.clone(),
        }
    }
}

/// Key used to match a config row against live state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub full_table_id: String,
    pub dmf_short_name: String,
    #[serde(default)]
    pub column_names: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.full_table_id, self.dmf_short_name, self.column_names)
    }
}

/// One DMF currently attached to a table, as reported by introspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDmfRecord {
    pub metric_name: String,
    /// `None` when the metadata source returned NULL.
    #[serde(default)]
    pub columns: Option<String>,
}

impl AppliedDmfRecord {
    pub fn new(metric_name: impl Into<String>, columns: Option<&str>) -> Self {
        Self {
            metric_name: metric_name.into(),
            columns: columns.map(str::to_string),
        }
    }

    pub fn columns_or_empty(&self) -> &str {
        self.columns.as_deref().unwrap_or("")
    }
}

/// A config row together with whether it is attached right now.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledRow {
    #[serde(flatten)]
    pub entry: DmfConfigEntry,
    pub is_applied: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Add,
    Drop,
    Validate,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Add, ActionKind::Drop, ActionKind::Validate];

    /// Verb passed to the management procedure.
    pub fn verb(self) -> &'static str {
        match self {
            ActionKind::Add => "ADD",
            ActionKind::Drop => "DROP",
            ActionKind::Validate => "VALIDATE",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Error)]
#[error("unknown action: {0} (expected ADD, DROP or VALIDATE)")]
pub struct ParseActionError(pub String);

impl FromStr for ActionKind {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(ActionKind::Add),
            "DROP" => Ok(ActionKind::Drop),
            "VALIDATE" => Ok(ActionKind::Validate),
            _ => Err(ParseActionError(s.to_string())),
        }
    }
}

/// Literal-equality predicate on `TABLE_NAME` and `DMF_NAME`.
///
/// Kept structured until it reaches the procedure call; `to_predicate` is the
/// only place it becomes SQL text, and it quotes both literals.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterCondition {
    pub table_name: String,
    pub dmf_name: String,
}

impl FilterCondition {
    pub fn new(table_name: impl Into<String>, dmf_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            dmf_name: dmf_name.into(),
        }
    }

    pub fn to_predicate(&self) -> String {
        format!(
            "TABLE_NAME = {} AND DMF_NAME = {}",
            quote_literal(&self.table_name),
            quote_literal(&self.dmf_name)
        )
    }

    /// Whether the procedure would select `entry` with this predicate.
    pub fn matches(&self, entry: &DmfConfigEntry) -> bool {
        entry.table == self.table_name && entry.dmf_name == self.dmf_name
    }
}

impl fmt::Display for FilterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_predicate())
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A single management-procedure invocation. `filter: None` targets every row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: ActionKind,
    pub filter: Option<FilterCondition>,
}

impl ActionRequest {
    pub fn for_entry(action: ActionKind, entry: &DmfConfigEntry) -> Self {
        Self {
            action,
            filter: Some(entry.filter_condition()),
        }
    }

    pub fn all_rows(action: ActionKind) -> Self {
        Self { action, filter: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{action} call failed: {message}")]
pub struct ActionCallError {
    pub action: ActionKind,
    pub message: String,
}

/// Outcome of one management-procedure call for one selected row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub entry: DmfConfigEntry,
    pub action: ActionKind,
    /// The scalar the procedure returned (`None` for an empty result set).
    pub outcome: Result<Option<String>, ActionCallError>,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            Ok(Some(value)) => value.clone(),
            Ok(None) => "(no result)".into(),
            Err(e) => format!("FAILED: {}", e.message),
        }
    }
}
