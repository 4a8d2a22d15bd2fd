use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dmf_types::{ActionKind, AppliedDmfRecord, DmfConfigEntry, FilterCondition};
use tokio::sync::Mutex;

use crate::{Warehouse, WarehouseError};

/// One management-procedure invocation as seen by [`InMemoryWarehouse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    pub target: String,
    pub action: ActionKind,
    pub filter: Option<FilterCondition>,
}

/// In-memory warehouse.
///
/// Holds a config table and per-table attachments and emulates the management
/// procedure against them: ADD attaches each selected row's metric, DROP
/// detaches it, VALIDATE only counts. Failures can be scripted per table or
/// per filter, and every call is recorded so tests can assert on ordering.
///
/// NOTE: the procedure emulation is a stand-in; the real one lives in the warehouse.
pub struct InMemoryWarehouse {
    config_table: String,
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    config: Vec<(DmfConfigEntry, bool)>,
    applied: HashMap<String, Vec<AppliedDmfRecord>>,
    unavailable_tables: HashSet<String>,
    config_failure: Option<String>,
    call_failures: HashMap<FilterCondition, String>,
    calls: Vec<RecordedCall>,
    config_reads: usize,
    applied_reads: usize,
}

impl InMemoryWarehouse {
    pub fn new(config_table: impl Into<String>) -> Self {
        Self {
            config_table: config_table.into(),
            inner: Mutex::new(State::default()),
        }
    }

    pub fn config_table(&self) -> &str {
        &self.config_table
    }

    pub async fn insert_config(&self, entry: DmfConfigEntry, is_active: bool) {
        self.inner.lock().await.config.push((entry, is_active));
    }

    pub async fn attach(&self, full_table_id: &str, record: AppliedDmfRecord) {
        let mut inner = self.inner.lock().await;
        inner.applied.entry(full_table_id.to_string()).or_default().push(record);
    }

    /// Make introspection of `full_table_id` fail, as for a dropped table.
    pub async fn mark_unavailable(&self, full_table_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.unavailable_tables.insert(full_table_id.to_string());
    }

    pub async fn fail_config_reads(&self, message: impl Into<String>) {
        self.inner.lock().await.config_failure = Some(message.into());
    }

    /// Make every call whose filter equals `filter` fail with `message`.
    pub async fn fail_calls_matching(&self, filter: FilterCondition, message: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.call_failures.insert(filter, message.into());
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn config_reads(&self) -> usize {
        self.inner.lock().await.config_reads
    }

    pub async fn applied_reads(&self) -> usize {
        self.inner.lock().await.applied_reads
    }

    /// Snapshot of what is attached to a table (debug hook).
    pub async fn attached(&self, full_table_id: &str) -> Vec<AppliedDmfRecord> {
        let inner = self.inner.lock().await;
        inner.applied.get(full_table_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn active_config(&self, config_table: &str) -> Result<Vec<DmfConfigEntry>, WarehouseError> {
        let mut inner = self.inner.lock().await;
        inner.config_reads += 1;
        if let Some(message) = &inner.config_failure {
            return Err(WarehouseError::Unavailable(message.clone()));
        }
        if config_table != self.config_table {
            return Err(WarehouseError::Unavailable(format!(
                "table {config_table} does not exist"
            )));
        }
        Ok(inner
            .config
            .iter()
            .filter(|(_, active)| *active)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn applied_dmfs(&self, full_table_id: &str) -> Result<Vec<AppliedDmfRecord>, WarehouseError> {
        let mut inner = self.inner.lock().await;
        inner.applied_reads += 1;
        if inner.unavailable_tables.contains(full_table_id) {
            return Err(WarehouseError::Unavailable(format!(
                "object {full_table_id} does not exist or not authorized"
            )));
        }
        Ok(inner.applied.get(full_table_id).cloned().unwrap_or_default())
    }

    async fn manage_dmf(
        &self,
        target: &str,
        action: ActionKind,
        filter: Option<&FilterCondition>,
    ) -> Result<Option<String>, WarehouseError> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(RecordedCall {
            target: target.to_string(),
            action,
            filter: filter.cloned(),
        });

        if let Some(message) = filter.and_then(|f| inner.call_failures.get(f)) {
            return Err(WarehouseError::Status {
                code: 422,
                message: message.clone(),
            });
        }
        if target != self.config_table {
            return Err(WarehouseError::Unavailable(format!("table {target} does not exist")));
        }

        let selected: Vec<DmfConfigEntry> = inner
            .config
            .iter()
            .filter(|(entry, active)| *active && filter.map_or(true, |f| f.matches(entry)))
            .map(|(entry, _)| entry.clone())
            .collect();

        for entry in &selected {
            let attached = inner.applied.entry(entry.full_table_id()).or_default();
            let position = attached.iter().position(|r| {
                r.metric_name == entry.dmf_short_name() && r.columns_or_empty() == entry.column_names
            });
            match (action, position) {
                (ActionKind::Add, None) => attached.push(AppliedDmfRecord::new(
                    entry.dmf_short_name(),
                    Some(entry.column_names.as_str()),
                )),
                (ActionKind::Drop, Some(idx)) => {
                    attached.remove(idx);
                }
                _ => {}
            }
        }

        Ok(Some(format!("{} completed for {} DMF(s)", action.verb(), selected.len())))
    }
}
