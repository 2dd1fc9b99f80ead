//! Durable record of finished requests
//!
//! Every request that reaches `Completed` or `Aborted` is appended to a
//! JSON-lines file. A restarted participant seeds its request book from this
//! file, so a replayed deposit or burn is recognised as already handled.

use crate::request::{AbortReason, RequestKind, RequestStatus, TransactionRequest};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// One finished request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub chain_reference: String,
    pub kind: RequestKind,
    pub status: RequestStatus,
    pub amount: u64,
    pub counterparty_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    /// Entry for `request` as it enters the terminal `status`
    pub fn new(request: &TransactionRequest, status: RequestStatus) -> Self {
        Self {
            chain_reference: request.chain_reference.clone(),
            kind: request.kind,
            status,
            amount: request.amount,
            counterparty_address: request.counterparty_address.clone(),
            broadcast_txid: request.broadcast_txid.clone(),
            abort_reason: request.abort_reason,
            processed_at: Utc::now(),
        }
    }
}

/// Append-only file of [`ProcessedRecord`]s
pub struct ProcessedLedger {
    path: PathBuf,
    file: Mutex<File>,
}

impl ProcessedLedger {
    /// Open or create the ledger, returning the records it already holds.
    ///
    /// A torn final line left by a crash mid-append is dropped.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<ProcessedRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let complete = data.rfind('\n').map_or(0, |i| i + 1);

        let mut records = Vec::new();
        for (number, line) in data[..complete].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| {
                Error::Serialization(format!("{} line {}: {}", path.display(), number + 1, e))
            })?;
            records.push(record);
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if complete < data.len() {
            warn!(
                path = %path.display(),
                bytes = data.len() - complete,
                "Dropping torn final ledger entry"
            );
            file.set_len(complete as u64)?;
        }
        debug!(path = %path.display(), records = records.len(), "Opened processed ledger");

        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk
    pub fn append(&self, record: &ProcessedRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Internal("processed ledger lock poisoned".into()))?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}
