//! Checkpoint Store: exact, non-probabilistic progress per job.
//!
//! The record answers "where did the last run stop". Whether a given item
//! was seen is only ever answered by the filter.

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::CheckpointRecord;
use crate::storage::{BlobStore, get_optional, paths};

/// Loads and saves `{jobId}/checkpoint.json`.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn BlobStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// The record for `job_id`, or `None` before the first checkpoint.
    pub async fn load(&self, job_id: &str) -> Result<Option<CheckpointRecord>> {
        paths::validate_job_id(job_id)?;
        let path = paths::checkpoint(job_id);
        let Some(bytes) = get_optional(self.store.as_ref(), &path).await? else {
            log::debug!("No checkpoint at {}", path);
            return Ok(None);
        };

        let record: CheckpointRecord = serde_json::from_slice(&bytes)?;
        if record.job_id != job_id {
            return Err(AppError::validation(format!(
                "{} belongs to job '{}'",
                path, record.job_id
            )));
        }
        Ok(Some(record))
    }

    /// Overwrite the record. One `put`, so readers see the old or the new
    /// record and never a mix.
    pub async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        paths::validate_job_id(&record.job_id)?;
        let path = paths::checkpoint(&record.job_id);
        let bytes = serde_json::to_vec_pretty(record)?;
        self.store.put(&path, bytes).await?;
        log::debug!(
            "Saved checkpoint {} (run {}, cursor {})",
            path,
            record.run_id,
            record.cursor
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::storage::{Fault, MemoryStorage};

    fn store() -> (MemoryStorage, CheckpointStore) {
        let memory = MemoryStorage::new();
        let checkpoints = CheckpointStore::new(Arc::new(memory.clone()));
        (memory, checkpoints)
    }

    #[tokio::test]
    async fn test_load_absent() {
        let (_, checkpoints) = store();
        assert!(checkpoints.load("site-A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (memory, checkpoints) = store();
        let mut record = CheckpointRecord::new("site-A");
        record.advance(42);
        record.items_processed = 7;
        record.filter_snapshot_path = paths::filter_snapshot("site-A", 1);
        record.status = RunStatus::Complete;

        checkpoints.save(&record).await.unwrap();
        assert_eq!(memory.keys(), vec!["site-A/checkpoint.json"]);

        let loaded = checkpoints.load("site-A").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_load_ignores_unknown_fields() {
        let (memory, checkpoints) = store();
        let json = r#"{
            "jobId": "site-A",
            "runId": "legacy",
            "cursor": 9,
            "itemsProcessed": 3,
            "updatedAt": "2026-01-02T03:04:05Z",
            "filterSnapshotPath": "site-A/filter/0000000002.bin",
            "shard": 4
        }"#;
        memory
            .put("site-A/checkpoint.json", json.as_bytes().to_vec())
            .await
            .unwrap();

        let loaded = checkpoints.load("site-A").await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 9);
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.previous_snapshot_path, None);
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_record() {
        let (memory, checkpoints) = store();
        let other = serde_json::to_vec(&CheckpointRecord::new("site-B")).unwrap();
        memory.put("site-A/checkpoint.json", other).await.unwrap();

        let err = checkpoints.load("site-A").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_job_id_never_reaches_store() {
        let (memory, checkpoints) = store();
        assert!(checkpoints.load("../etc").await.is_err());
        assert_eq!(memory.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let (memory, checkpoints) = store();
        memory.inject(Fault::Permanent, 1);
        let err = checkpoints.save(&CheckpointRecord::new("site-A")).await.unwrap_err();
        assert!(matches!(err, AppError::PermanentStore { .. }));
    }
}
