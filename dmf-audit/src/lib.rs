//! Append-only, hash-chained record of every DMF action the console dispatched.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use dmf_types::{ActionCallError, ActionKind, ActionResult};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub timestamp: String,
    pub action: String,
    pub table: String,
    pub dmf_name: String,
    pub column_names: String,
    /// `ok:<value>` or `error:<message>`.
    pub outcome: String,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

/// Table recorded for an unfiltered call, which covers every configured row.
pub const ALL_ROWS: &str = "*";

impl AuditRecord {
    pub fn from_result(result: &ActionResult) -> Self {
        Self::new(
            result.action,
            result.entry.full_table_id(),
            result.entry.dmf_name.clone(),
            result.entry.column_names.clone(),
            &result.outcome,
        )
    }

    pub fn unfiltered(action: ActionKind, outcome: &Result<Option<String>, ActionCallError>) -> Self {
        Self::new(action, ALL_ROWS.to_string(), String::new(), String::new(), outcome)
    }

    fn new(
        action: ActionKind,
        table: String,
        dmf_name: String,
        column_names: String,
        outcome: &Result<Option<String>, ActionCallError>,
    ) -> Self {
        let outcome = match outcome {
            Ok(value) => format!("ok:{}", value.as_deref().unwrap_or("")),
            Err(e) => format!("error:{}", e.message),
        };
        Self {
            record_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            action: action.verb().to_string(),
            table,
            dmf_name,
            column_names,
            outcome,
            prev_hash: None,
            chain_hash: String::new(),
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Links `record` onto the chain and writes it as one JSON line.
    pub fn append(&self, mut record: AuditRecord) -> Result<AuditRecord, AuditError> {
        let mut last = self.last_hash.lock().map_err(|_| AuditError::Io("lock".into()))?;
        record.prev_hash = last.clone();
        record.chain_hash = hash_record(&record);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        let line = serde_json::to_string(&record).map_err(|e| AuditError::Parse(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| AuditError::Io(e.to_string()))?;
        *last = Some(record.chain_hash.clone());
        Ok(record)
    }

    pub fn record_result(&self, result: &ActionResult) -> Result<AuditRecord, AuditError> {
        self.append(AuditRecord::from_result(result))
    }

    pub fn record_unfiltered(
        &self,
        action: ActionKind,
        outcome: &Result<Option<String>, ActionCallError>,
    ) -> Result<AuditRecord, AuditError> {
        self.append(AuditRecord::unfiltered(action, outcome))
    }
}

/// Check every line links to its predecessor and hashes to its stored value.
/// Returns the number of records.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, AuditError> {
    let records = read_records(path.as_ref())?;
    let mut prev: Option<String> = None;
    for (i, record) in records.iter().enumerate() {
        if record.prev_hash != prev {
            return Err(AuditError::Chain {
                line: i + 1,
                reason: "previous hash mismatch".into(),
            });
        }
        if record.chain_hash != hash_record(record) {
            return Err(AuditError::Chain {
                line: i + 1,
                reason: "record hash invalid".into(),
            });
        }
        prev = Some(record.chain_hash.clone());
    }
    Ok(records.len())
}

/// The last `n` records, oldest first.
pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<AuditRecord>, AuditError> {
    let mut records = read_records(path.as_ref())?;
    let start = records.len().saturating_sub(n);
    Ok(records.split_off(start))
}

/// Each field is length-prefixed so bytes cannot shift between neighbours.
fn hash_record(record: &AuditRecord) -> String {
    let mut h = Sha256::new();
    let mut field = |bytes: &[u8]| {
        h.update((bytes.len() as u64).to_le_bytes());
        h.update(bytes);
    };
    field(record.record_id.to_string().as_bytes());
    field(record.timestamp.as_bytes());
    field(record.action.as_bytes());
    field(record.table.as_bytes());
    field(record.dmf_name.as_bytes());
    field(record.column_names.as_bytes());
    field(record.outcome.as_bytes());
    if let Some(prev) = &record.prev_hash {
        field(prev.as_bytes());
    }
    format!("{:x}", h.finalize())
}

fn read_records(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let file = File::open(path).map_err(|e| AuditError::Io(e.to_string()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| AuditError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).map_err(|e| AuditError::Parse(e.to_string()))?);
    }
    Ok(records)
}

fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(read_records(path)?.pop().map(|r| r.chain_hash))
}
