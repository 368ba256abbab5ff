//! Append-only audit ledger.
//!
//! Records are newline-delimited JSON, partitioned by UTC day
//! (`<dir>/YYYY-MM-DD.jsonl`). Files are only ever opened in append mode and
//! each write is synced before returning. Core transition logic never reads
//! the ledger; reads exist for replay and reporting.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::state_machine::{Actor, ItemId, ItemState};

/// What an audit record is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An item changed state. `from` is `None` when the item was created.
    Transition {
        item_id: ItemId,
        from: Option<ItemState>,
        to: ItemState,
    },
    /// A compare-and-swap lost a race and the operation was dropped.
    Abandoned {
        item_id: ItemId,
        expected: ItemState,
        actual: ItemState,
    },
    /// A scheduled tick came due while the job was still running.
    JobSkipped { job_id: String },
    /// A job check returned an error or panicked.
    JobFailed { job_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    #[serde(flatten)]
    pub event: AuditEvent,
    pub reason: String,
}

impl AuditRecord {
    pub fn new(actor: Actor, event: AuditEvent, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            actor,
            event,
            reason: reason.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn item_id(&self) -> Option<&ItemId> {
        match &self.event {
            AuditEvent::Transition { item_id, .. } | AuditEvent::Abandoned { item_id, .. } => {
                Some(item_id)
            }
            AuditEvent::JobSkipped { .. } | AuditEvent::JobFailed { .. } => None,
        }
    }

    /// Short label used for grouping in digests.
    pub fn label(&self) -> String {
        match &self.event {
            AuditEvent::Transition { from: None, .. } => "created".to_string(),
            AuditEvent::Transition {
                from: Some(from),
                to,
                ..
            } => format!("{from}->{to}"),
            AuditEvent::Abandoned { .. } => "abandoned".to_string(),
            AuditEvent::JobSkipped { .. } => "job_skipped".to_string(),
            AuditEvent::JobFailed { .. } => "job_failed".to_string(),
        }
    }
}

/// Durable, append-only ledger of audit records.
pub struct AuditLog {
    dir: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn partition_for(&self, ts: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("{}.jsonl", ts.format("%Y-%m-%d")))
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partition_for(record.timestamp))?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        self.read_partitions(|_| true)
    }

    /// Records whose timestamp is at or after `from`, oldest first.
    pub fn since(&self, from: DateTime<Utc>) -> Result<Vec<AuditRecord>, StoreError> {
        let first_day = from.date_naive();
        let mut records = self.read_partitions(|day| day >= first_day)?;
        records.retain(|r| r.timestamp >= from);
        Ok(records)
    }

    /// Every transition of one item, oldest first.
    pub fn replay(&self, item_id: &ItemId) -> Result<Vec<AuditRecord>, StoreError> {
        let mut records = self.records()?;
        records.retain(|r| r.item_id() == Some(item_id));
        Ok(records)
    }

    fn read_partitions(
        &self,
        include: impl Fn(NaiveDate) -> bool,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let mut partitions: Vec<(NaiveDate, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let stem = path.file_stem()?.to_str()?;
                if path.extension()? != "jsonl" {
                    return None;
                }
                let day = NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()?;
                Some((day, path))
            })
            .filter(|(day, _)| include(*day))
            .collect();
        partitions.sort();

        let mut records = Vec::new();
        for (_, path) in partitions {
            let contents = fs::read_to_string(&path)?;
            for (n, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(
                        file = %path.display(),
                        line = n + 1,
                        "skipping unreadable audit record: {e}"
                    ),
                }
            }
        }
        // Stable: equal timestamps keep append order.
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

/// Aggregate view of the ledger over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct AuditDigest {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total: usize,
    pub by_event: BTreeMap<String, usize>,
    pub failures: Vec<AuditRecord>,
}

impl AuditDigest {
    pub fn build(records: &[AuditRecord], from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let mut by_event = BTreeMap::new();
        let mut failures = Vec::new();
        let mut total = 0;
        for record in records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
        {
            total += 1;
            *by_event.entry(record.label()).or_insert(0) += 1;
            let failed = matches!(
                record.event,
                AuditEvent::JobFailed { .. }
                    | AuditEvent::Transition {
                        to: ItemState::Error,
                        ..
                    }
            );
            if failed {
                failures.push(record.clone());
            }
        }
        Self {
            from,
            to,
            total,
            by_event,
            failures,
        }
    }
}
