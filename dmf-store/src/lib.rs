use async_trait::async_trait;
use dmf_types::{ActionKind, AppliedDmfRecord, DmfConfigEntry, FilterCondition};
use thiserror::Error;

pub mod memory;
pub use memory::{InMemoryWarehouse, RecordedCall};

pub mod sql_api;
pub use sql_api::{SqlApiConfig, SqlApiWarehouse};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("statement failed ({code}): {message}")]
    Status { code: u16, message: String },
    #[error("statement {handle} is still running")]
    Pending { handle: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Everything the console needs from the warehouse.
///
/// Three logical operations; how they are transported is up to the implementation.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Rows of `config_table` flagged `IS_ACTIVE`.
    async fn active_config(&self, config_table: &str) -> Result<Vec<DmfConfigEntry>, WarehouseError>;

    /// DMFs currently attached to one table (`db.schema.table`).
    async fn applied_dmfs(&self, full_table_id: &str) -> Result<Vec<AppliedDmfRecord>, WarehouseError>;

    /// Invoke the management procedure once. `filter: None` means every row of `target`.
    /// Returns the first column of the first result row, if any.
    async fn manage_dmf(
        &self,
        target: &str,
        action: ActionKind,
        filter: Option<&FilterCondition>,
    ) -> Result<Option<String>, WarehouseError>;
}
