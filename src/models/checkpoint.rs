//! Checkpoint record persisted per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the run that owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Complete,
}

/// Durable progress marker, stored as `{jobId}/checkpoint.json`.
///
/// Unknown fields are ignored on read and fields added after the first
/// format carry serde defaults, so older and newer writers interoperate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub job_id: String,
    pub run_id: String,
    /// Last completed position in the source enumeration
    pub cursor: u64,
    pub items_processed: u64,
    pub updated_at: DateTime<Utc>,
    /// Snapshot written in the same checkpoint as this record
    #[serde(default)]
    pub filter_snapshot_path: String,

    #[serde(default)]
    pub previous_snapshot_path: Option<String>,
    /// Cursor committed together with `previous_snapshot_path`
    #[serde(default)]
    pub previous_cursor: Option<u64>,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub run_seq: u64,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    /// Fresh record for the first run of a job.
    pub fn new(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let now = Utc::now();
        Self {
            run_id: run_id(&job_id, 1),
            job_id,
            cursor: 0,
            items_processed: 0,
            updated_at: now,
            filter_snapshot_path: String::new(),
            previous_snapshot_path: None,
            previous_cursor: None,
            generation: 0,
            run_seq: 1,
            status: RunStatus::Running,
            started_at: Some(now),
        }
    }

    /// Record for the run following `self`.
    ///
    /// An unfinished predecessor is resumed from its cursor; a complete one
    /// starts a new pass at cursor zero. The snapshot lineage carries over
    /// either way.
    pub fn successor(&self) -> Self {
        let now = Utc::now();
        let run_seq = self.run_seq + 1;
        let (cursor, items_processed) = match self.status {
            RunStatus::Running => (self.cursor, self.items_processed),
            RunStatus::Complete => (0, 0),
        };
        Self {
            job_id: self.job_id.clone(),
            run_id: run_id(&self.job_id, run_seq),
            cursor,
            items_processed,
            updated_at: now,
            filter_snapshot_path: self.filter_snapshot_path.clone(),
            previous_snapshot_path: self.previous_snapshot_path.clone(),
            previous_cursor: self.previous_cursor,
            generation: self.generation,
            run_seq,
            status: RunStatus::Running,
            started_at: Some(now),
        }
    }

    /// Move the cursor forward. Lower values are ignored so the cursor never
    /// decreases within a run. Returns whether it moved.
    pub fn advance(&mut self, cursor: u64) -> bool {
        if cursor > self.cursor {
            self.cursor = cursor;
            true
        } else {
            false
        }
    }

    pub fn has_snapshot(&self) -> bool {
        !self.filter_snapshot_path.is_empty()
    }

    /// Point the record at its previous snapshot after the latest one was
    /// lost. The cursor moves back to where that snapshot was taken, or to
    /// zero when older writers did not record it.
    pub fn roll_back(&mut self) -> bool {
        let Some(path) = self.previous_snapshot_path.take() else {
            return false;
        };
        self.filter_snapshot_path = path;
        self.cursor = self.cursor.min(self.previous_cursor.take().unwrap_or(0));
        true
    }
}

/// Run ids are the job id plus a zero-padded sequence so they sort by age.
pub fn run_id(job_id: &str, run_seq: u64) -> String {
    format!("{job_id}-{run_seq:010}")
}
