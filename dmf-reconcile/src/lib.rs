//! Desired-vs-observed reconciliation.
//!
//! Pure functions only: no I/O, deterministic for a given input, and the
//! output preserves the order of the config rows.

use std::collections::{BTreeMap, HashMap};

use dmf_types::{ActionKind, AppliedDmfRecord, DmfConfigEntry, NaturalKey, ReconciledRow};
use serde::Serialize;

/// Whether `entry` is attached according to `applied` (the records for its table).
///
/// Exact, case-sensitive comparison of metric name and column list, with a
/// NULL applied column list read as `""`. Stops at the first match.
pub fn is_applied(entry: &DmfConfigEntry, applied: &[AppliedDmfRecord]) -> bool {
    let short = entry.dmf_short_name();
    applied
        .iter()
        .any(|r| r.metric_name == short && r.columns_or_empty() == entry.column_names)
}

pub fn reconcile(
    configs: &[DmfConfigEntry],
    applied_by_table: &HashMap<String, Vec<AppliedDmfRecord>>,
) -> Vec<ReconciledRow> {
    configs
        .iter()
        .map(|entry| {
            let is_applied = applied_by_table
                .get(&entry.full_table_id())
                .map_or(false, |records| is_applied(entry, records));
            ReconciledRow {
                entry: entry.clone(),
                is_applied,
            }
        })
        .collect()
}

/// Reconciled rows and the work queues derived from them.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Reconciliation {
    rows: Vec<ReconciledRow>,
}

impl Reconciliation {
    pub fn new(rows: Vec<ReconciledRow>) -> Self {
        Self { rows }
    }

    pub fn compute(
        configs: &[DmfConfigEntry],
        applied_by_table: &HashMap<String, Vec<AppliedDmfRecord>>,
    ) -> Self {
        Self::new(reconcile(configs, applied_by_table))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every configured row; the VALIDATE queue.
    pub fn all(&self) -> &[ReconciledRow] {
        &self.rows
    }

    /// Rows not attached yet; the ADD queue.
    pub fn pending(&self) -> Vec<&ReconciledRow> {
        self.rows.iter().filter(|r| !r.is_applied).collect()
    }

    /// Rows currently attached; the DROP queue.
    pub fn applied(&self) -> Vec<&ReconciledRow> {
        self.rows.iter().filter(|r| r.is_applied).collect()
    }

    pub fn queue(&self, action: ActionKind) -> Vec<&ReconciledRow> {
        match action {
            ActionKind::Add => self.pending(),
            ActionKind::Drop => self.applied(),
            ActionKind::Validate => self.rows.iter().collect(),
        }
    }

    /// Natural keys shared by more than one config row, with their row count.
    ///
    /// Such rows always reconcile identically; they are reported, not merged.
    pub fn ambiguous_keys(&self) -> Vec<(NaturalKey, usize)> {
        let mut counts: BTreeMap<NaturalKey, usize> = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.entry.natural_key()).or_default() += 1;
        }
        counts.into_iter().filter(|(_, n)| *n > 1).collect()
    }
}
