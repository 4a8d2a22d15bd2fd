use std::sync::Arc;
use std::time::Duration;

use dmf_audit::{AuditError, AuditLog};
use dmf_dispatch::Dispatcher;
use dmf_loader::{LoaderTtls, StatusLoader};
pub use dmf_loader::LoadError;
use dmf_reconcile::Reconciliation;
use dmf_settings::ConsoleSettings;
use dmf_store::{SqlApiConfig, SqlApiWarehouse, Warehouse, WarehouseError};
use dmf_types::{ActionCallError, ActionKind, ActionResult, DmfConfigEntry, NaturalKey, ReconciledRow};
use serde::Serialize;
use thiserror::Error;

pub mod demo;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("audit log: {0}")]
    Audit(#[from] AuditError),
    #[error("warehouse setup: {0}")]
    Setup(#[from] WarehouseError),
    #[error("missing setting: {0}")]
    MissingSetting(&'static str),
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("row {index} is out of range for the {action} queue ({len} rows)")]
    IndexOutOfRange { action: ActionKind, index: usize, len: usize },
    #[error("{key} is not in the {action} queue")]
    UnknownKey { action: ActionKind, key: NaturalKey },
}

/// Reconciled state of every active config row, as last loaded.
#[derive(Clone, Debug, Serialize)]
pub struct ConsoleView {
    pub config_table: String,
    pub reconciliation: Reconciliation,
    pub ambiguous_keys: Vec<(NaturalKey, usize)>,
}

impl ConsoleView {
    /// Nothing configured. A valid state, not an error.
    pub fn is_empty(&self) -> bool {
        self.reconciliation.is_empty()
    }

    pub fn rows(&self) -> &[ReconciledRow] {
        self.reconciliation.all()
    }

    /// Rows an action may target: ADD → not applied, DROP → applied, VALIDATE → all.
    pub fn queue(&self, action: ActionKind) -> Vec<&ReconciledRow> {
        self.reconciliation.queue(action)
    }

    /// Resolve zero-based positions in `action`'s queue, keeping the caller's order.
    pub fn select_indices(
        &self,
        action: ActionKind,
        indices: &[usize],
    ) -> Result<Vec<DmfConfigEntry>, SelectionError> {
        let queue = self.queue(action);
        indices
            .iter()
            .map(|&index| {
                queue
                    .get(index)
                    .map(|row| row.entry.clone())
                    .ok_or(SelectionError::IndexOutOfRange {
                        action,
                        index,
                        len: queue.len(),
                    })
            })
            .collect()
    }

    /// Resolve natural keys against `action`'s queue, keeping the caller's order.
    /// A key shared by several rows selects the first of them.
    pub fn select_keys(
        &self,
        action: ActionKind,
        keys: &[NaturalKey],
    ) -> Result<Vec<DmfConfigEntry>, SelectionError> {
        let queue = self.queue(action);
        keys.iter()
            .map(|key| {
                queue
                    .iter()
                    .find(|row| row.entry.natural_key() == *key)
                    .map(|row| row.entry.clone())
                    .ok_or_else(|| SelectionError::UnknownKey {
                        action,
                        key: key.clone(),
                    })
            })
            .collect()
    }
}

/// Everything an operator sees after a batch: every row's outcome, then the reloaded state.
#[derive(Debug, Serialize)]
pub struct ActionReport {
    pub action: ActionKind,
    pub results: Vec<ActionResult>,
    pub view: Option<ConsoleView>,
    pub reload_error: Option<String>,
}

impl ActionReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

#[derive(Debug, Serialize)]
pub struct UnfilteredReport {
    pub action: ActionKind,
    pub outcome: Result<Option<String>, ActionCallError>,
    pub view: Option<ConsoleView>,
    pub reload_error: Option<String>,
}

/// Loader, reconciler and dispatcher wired into the refresh loop:
/// load → reconcile → select → dispatch → invalidate → reload.
pub struct DmfConsole {
    loader: StatusLoader,
    dispatcher: Dispatcher,
    audit: Option<AuditLog>,
}

impl DmfConsole {
    pub fn new(warehouse: Arc<dyn Warehouse>, settings: &ConsoleSettings) -> Result<Self, ConsoleError> {
        let ttls = LoaderTtls {
            config: settings.config_ttl(),
            applied: settings.applied_ttl(),
        };
        let audit = match &settings.audit_file {
            Some(path) => Some(AuditLog::open(path)?),
            None => None,
        };
        Ok(Self {
            loader: StatusLoader::new(Arc::clone(&warehouse), settings.config_table.clone(), ttls),
            dispatcher: Dispatcher::new(warehouse, settings.config_table.clone())
                .with_call_timeout(settings.call_timeout()),
            audit,
        })
    }

    pub fn config_table(&self) -> &str {
        self.loader.config_table()
    }

    /// Current state, served from the caches while they are fresh.
    pub async fn view(&self) -> Result<ConsoleView, LoadError> {
        let configs = self.loader.load_active_config().await?;
        let applied = self.loader.load_applied_by_table(&configs).await;
        let reconciliation = Reconciliation::compute(&configs, &applied);

        let ambiguous_keys = reconciliation.ambiguous_keys();
        for (key, rows) in &ambiguous_keys {
            tracing::warn!(key = %key, rows, "several config rows share one natural key");
        }
        tracing::debug!(
            rows = reconciliation.all().len(),
            pending = reconciliation.pending().len(),
            applied = reconciliation.applied().len(),
            "reconciled DMF configuration"
        );

        Ok(ConsoleView {
            config_table: self.loader.config_table().to_string(),
            reconciliation,
            ambiguous_keys,
        })
    }

    /// Drop every cached read and load again.
    pub async fn refresh(&self) -> Result<ConsoleView, LoadError> {
        self.loader.invalidate().await;
        self.view().await
    }

    /// Dispatch `action` for `selection`, record it, then invalidate and reload.
    pub async fn run_action(&self, action: ActionKind, selection: &[DmfConfigEntry]) -> ActionReport {
        self.warn_on_collisions(selection).await;

        let results = self.dispatcher.dispatch(action, selection).await;
        if let Some(audit) = &self.audit {
            for result in &results {
                if let Err(e) = audit.record_result(result) {
                    tracing::warn!(error = %e, path = %audit.path().display(), "failed to append audit record");
                }
            }
        }

        let (view, reload_error) = self.reload_after_action().await;
        ActionReport {
            action,
            results,
            view,
            reload_error,
        }
    }

    /// One unfiltered procedure call covering every configured row.
    pub async fn run_unfiltered(&self, action: ActionKind) -> UnfilteredReport {
        let outcome = self.dispatcher.dispatch_all(action).await;
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_unfiltered(action, &outcome) {
                tracing::warn!(error = %e, path = %audit.path().display(), "failed to append audit record");
            }
        }
        let (view, reload_error) = self.reload_after_action().await;
        UnfilteredReport {
            action,
            outcome,
            view,
            reload_error,
        }
    }

    async fn reload_after_action(&self) -> (Option<ConsoleView>, Option<String>) {
        match self.refresh().await {
            Ok(view) => (Some(view), None),
            Err(e) => {
                tracing::error!(error = %e, "reload after action failed");
                (None, Some(e.to_string()))
            }
        }
    }

    /// The procedure targets rows by table and DMF name only; say so when
    /// that reaches further than the row the operator picked.
    async fn warn_on_collisions(&self, selection: &[DmfConfigEntry]) {
        let configs = match self.loader.load_active_config().await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping selection collision check");
                return;
            }
        };
        for entry in selection {
            let filter = entry.filter_condition();
            let others: Vec<String> = configs
                .iter()
                .filter(|c| filter.matches(c) && *c != entry)
                .map(|c| c.natural_key().to_string())
                .collect();
            if !others.is_empty() {
                tracing::warn!(
                    filter = %filter,
                    ?others,
                    "filter also matches other configured rows"
                );
            }
        }
    }
}

/// Build the SQL API warehouse described by `settings`.
pub fn sql_api_warehouse(settings: &ConsoleSettings) -> Result<Arc<dyn Warehouse>, ConsoleError> {
    let api = &settings.sql_api;
    let base_url = api
        .base_url
        .clone()
        .ok_or(ConsoleError::MissingSetting("sql_api.base_url (DMF_SQL_API_URL)"))?;
    let warehouse = SqlApiWarehouse::new(SqlApiConfig {
        base_url,
        token: api.token.clone(),
        token_type: api.token_type.clone(),
        procedure: settings.procedure.clone(),
        database: api.database.clone(),
        schema: api.schema.clone(),
        warehouse: api.warehouse.clone(),
        role: api.role.clone(),
        statement_timeout: Duration::from_secs(api.statement_timeout_secs),
        request_timeout: Duration::from_secs(api.request_timeout_secs),
    })?;
    Ok(Arc::new(warehouse))
}
