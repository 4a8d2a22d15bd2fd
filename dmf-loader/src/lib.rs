use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dmf_cache::TtlCache;
use dmf_store::{Warehouse, WarehouseError};
use dmf_types::{AppliedDmfRecord, DmfConfigEntry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load DMF configuration from {table}: {source}")]
    DataAccess {
        table: String,
        #[source]
        source: WarehouseError,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct LoaderTtls {
    pub config: Duration,
    pub applied: Duration,
}

impl Default for LoaderTtls {
    fn default() -> Self {
        Self {
            config: Duration::from_secs(60),
            applied: Duration::from_secs(60),
        }
    }
}

/// Reads desired state (the config table) and observed state (per-table
/// DMF references), both through short-lived caches.
pub struct StatusLoader {
    warehouse: Arc<dyn Warehouse>,
    config_table: String,
    config_cache: TtlCache<String, Vec<DmfConfigEntry>>,
    applied_cache: TtlCache<String, Vec<AppliedDmfRecord>>,
}

impl StatusLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, config_table: impl Into<String>, ttls: LoaderTtls) -> Self {
        Self {
            warehouse,
            config_table: config_table.into(),
            config_cache: TtlCache::new("dmf_config", ttls.config),
            applied_cache: TtlCache::new("applied_dmfs", ttls.applied),
        }
    }

    pub fn config_table(&self) -> &str {
        &self.config_table
    }

    /// All active configuration rows. An empty vector means nothing is configured.
    pub async fn load_active_config(&self) -> Result<Vec<DmfConfigEntry>, LoadError> {
        let table = self.config_table.clone();
        self.config_cache
            .get_or_try_load(table.clone(), || async {
                match self.warehouse.active_config(&table).await {
                    Ok(rows) => {
                        tracing::info!(table = %table, rows = rows.len(), "loaded active DMF configuration");
                        Ok(rows)
                    }
                    Err(source) => Err(LoadError::DataAccess {
                        table: table.clone(),
                        source,
                    }),
                }
            })
            .await
    }

    /// DMFs attached to one table. Never fails: an unreachable or unsupported
    /// object is reported as having nothing attached.
    pub async fn load_applied_dmfs(&self, full_table_id: &str) -> Vec<AppliedDmfRecord> {
        let loaded: Result<_, WarehouseError> = self
            .applied_cache
            .get_or_try_load(full_table_id.to_string(), || {
                self.warehouse.applied_dmfs(full_table_id)
            })
            .await;
        match loaded {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(table = %full_table_id, error = %e, "DMF metadata unavailable; treating table as having none applied");
                Vec::new()
            }
        }
    }

    /// Observed state for every distinct table referenced by `configs`.
    pub async fn load_applied_by_table(
        &self,
        configs: &[DmfConfigEntry],
    ) -> HashMap<String, Vec<AppliedDmfRecord>> {
        let mut by_table = HashMap::new();
        for entry in configs {
            let table = entry.full_table_id();
            if by_table.contains_key(&table) {
                continue;
            }
            let records = self.load_applied_dmfs(&table).await;
            by_table.insert(table, records);
        }
        by_table
    }

    pub async fn invalidate(&self) {
        self.config_cache.invalidate_all().await;
        self.applied_cache.invalidate_all().await;
    }
}
