use std::sync::Arc;
use std::time::Duration;

use dmf_store::{Warehouse, WarehouseError};
use dmf_types::{ActionCallError, ActionKind, ActionRequest, ActionResult, DmfConfigEntry};

/// Turns a selection of config rows plus a verb into management-procedure calls.
///
/// Calls go out one at a time in selection order. A failing call is recorded
/// against its row and the batch carries on.
pub struct Dispatcher {
    warehouse: Arc<dyn Warehouse>,
    target: String,
    call_timeout: Option<Duration>,
}

impl Dispatcher {
    /// `target` is the config table reference handed to the procedure.
    pub fn new(warehouse: Arc<dyn Warehouse>, target: impl Into<String>) -> Self {
        Self {
            warehouse,
            target: target.into(),
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// One result per selected row, in the same order.
    pub async fn dispatch(&self, action: ActionKind, selection: &[DmfConfigEntry]) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(selection.len());
        for entry in selection {
            let request = ActionRequest::for_entry(action, entry);
            let outcome = self.call(&request).await;
            match &outcome {
                Ok(value) => tracing::info!(
                    action = %action,
                    table = %entry.full_table_id(),
                    dmf = %entry.dmf_name,
                    result = ?value,
                    "DMF action succeeded"
                ),
                Err(e) => tracing::warn!(
                    action = %action,
                    table = %entry.full_table_id(),
                    dmf = %entry.dmf_name,
                    error = %e.message,
                    "DMF action failed"
                ),
            }
            results.push(ActionResult {
                entry: entry.clone(),
                action,
                outcome,
            });
        }
        results
    }

    /// Run `action` against every configured row with a single unfiltered call.
    pub async fn dispatch_all(&self, action: ActionKind) -> Result<Option<String>, ActionCallError> {
        let outcome = self.call(&ActionRequest::all_rows(action)).await;
        match &outcome {
            Ok(value) => tracing::info!(action = %action, result = ?value, "unfiltered DMF action succeeded"),
            Err(e) => tracing::warn!(action = %action, error = %e.message, "unfiltered DMF action failed"),
        }
        outcome
    }

    /// A single procedure invocation, with the timeout applied when configured.
    pub async fn call(&self, request: &ActionRequest) -> Result<Option<String>, ActionCallError> {
        let fut = self
            .warehouse
            .manage_dmf(&self.target, request.action, request.filter.as_ref());
        let result: Result<Option<String>, WarehouseError> = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(r) => r,
                Err(_) => Err(WarehouseError::Transport(format!(
                    "no response within {}s",
                    limit.as_secs_f64()
                ))),
            },
            None => fut.await,
        };
        result.map_err(|e| ActionCallError {
            action: request.action,
            message: e.to_string(),
        })
    }
}
