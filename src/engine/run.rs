//! The handle a crawl holds for one Run.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::checkpoint::CheckpointStore;
use crate::error::{AppError, Result};
use crate::filter::{FilterStats, SeenSet};
use crate::models::{
    CheckpointConfig, CheckpointRecord, CrawlItem, ItemKey, JobSeq, KeyDeriver, RunStatus,
};
use crate::scanner::{CollectionScanner, OutputSample, RebuildSummary};
use crate::storage::{BlobStore, paths};

use super::state::{EngineState, StateCell};

/// Where the run's starting filter came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RestoreSource {
    /// The snapshot named by the checkpoint record
    Snapshot { path: String },
    /// The record's previous snapshot, after the latest failed to load
    Rollback { path: String },
    /// The newest stored snapshot, after the checkpoint record was lost
    Recovered { path: String },
    /// A Collection Scanner pass over the job's output
    Rebuild(RebuildSummary),
}

/// Result of a bounded shutdown.
#[derive(Debug)]
pub enum ShutdownOutcome {
    /// The final checkpoint committed and the run is complete
    Finalized,
    /// The final checkpoint failed; work since the last good one will be
    /// reprocessed next run
    CheckpointFailed(AppError),
    TimedOut,
}

/// Outcome of the key-derivation self-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub sampled: usize,
    /// Output records whose derived key the filter does not contain
    pub missing: usize,
    pub examples: Vec<String>,
}

impl VerifyReport {
    /// Check that `filter` holds every sampled key.
    pub fn check(filter: &SeenSet, sample: &[OutputSample]) -> Self {
        let missing: Vec<&OutputSample> = sample
            .iter()
            .filter(|s| !filter.might_contain(&s.key))
            .collect();
        Self {
            sampled: sample.len(),
            missing: missing.len(),
            examples: missing.iter().take(5).map(|s| s.identity.clone()).collect(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.missing == 0
    }
}

/// Point-in-time view of a run, for logs and the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub job_id: String,
    pub run_id: String,
    pub state: EngineState,
    pub cursor: u64,
    pub items_processed: u64,
    pub pending: u64,
    pub generation: u64,
    pub restored_from: RestoreSource,
    pub checkpoints_committed: u64,
    pub checkpoints_failed: u64,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub last_checkpoint_error: Option<String>,
    pub last_verify: Option<VerifyReport>,
    pub filter: FilterStats,
}

#[derive(Debug, Default)]
struct CheckpointLog {
    committed: u64,
    failed: u64,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_verify: Option<VerifyReport>,
}

/// State shared between the crawl and the background checkpointer.
pub(super) struct Shared {
    pub(super) job_id: String,
    pub(super) store: Arc<dyn BlobStore>,
    pub(super) checkpoints: CheckpointStore,
    pub(super) scanner: CollectionScanner,
    pub(super) deriver: KeyDeriver,
    pub(super) settings: CheckpointConfig,
    pub(super) verify_sample: usize,
    pub(super) state: StateCell,
    pub(super) restored_from: RestoreSource,
    pub(super) resume_cursor: u64,

    // lock order: filter, then record
    pub(super) filter: RwLock<SeenSet>,
    pub(super) record: RwLock<CheckpointRecord>,

    /// Serializes checkpoint, finalize and shutdown
    pub(super) commit_lock: tokio::sync::Mutex<()>,
    /// Items marked since the last committed checkpoint
    pub(super) pending: AtomicU64,
    /// Cursor stored with the snapshot the record currently names
    committed_cursor: AtomicU64,
    pub(super) trigger: Notify,
    pub(super) stop: watch::Sender<bool>,
    log: Mutex<CheckpointLog>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        job_id: &str,
        store: Arc<dyn BlobStore>,
        scanner: CollectionScanner,
        deriver: KeyDeriver,
        settings: CheckpointConfig,
        verify_sample: usize,
        state: StateCell,
        restored_from: RestoreSource,
        filter: SeenSet,
        record: CheckpointRecord,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let cursor = record.cursor;
        Self {
            job_id: job_id.to_string(),
            checkpoints: CheckpointStore::new(store.clone()),
            store,
            scanner,
            deriver,
            settings,
            verify_sample,
            state,
            restored_from,
            resume_cursor: cursor,
            filter: RwLock::new(filter),
            record: RwLock::new(record),
            commit_lock: tokio::sync::Mutex::new(()),
            pending: AtomicU64::new(0),
            committed_cursor: AtomicU64::new(cursor),
            trigger: Notify::new(),
            stop,
            log: Mutex::new(CheckpointLog::default()),
        }
    }
}

/// Cheap to clone; every clone drives the same Run.
///
/// `is_new` and `mark_processed` may be called from any task. Each
/// `mark_processed` updates filter and record under both write locks, so a
/// checkpoint always snapshots a consistent pair.
#[derive(Clone)]
pub struct RunHandle {
    pub(super) shared: Arc<Shared>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("job_id", &self.shared.job_id)
            .field("run_id", &self.run_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub(super) fn new(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.shared.job_id
    }

    pub fn run_id(&self) -> String {
        self.read_record().run_id.clone()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.get()
    }

    pub fn restored_from(&self) -> &RestoreSource {
        &self.shared.restored_from
    }

    /// Cursor the source enumeration should resume after.
    pub fn resume_cursor(&self) -> u64 {
        self.shared.resume_cursor
    }

    pub fn cursor(&self) -> u64 {
        self.read_record().cursor
    }

    pub fn pending(&self) -> u64 {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn deriver(&self) -> KeyDeriver {
        self.shared.deriver
    }

    /// Pure in-memory membership query. Never fails, never does I/O.
    pub fn is_new(&self, key: &ItemKey) -> bool {
        !self.read_filter().might_contain(key)
    }

    /// Record `key` as processed at `cursor`. Durable at the next checkpoint.
    pub fn mark_processed(&self, key: &ItemKey, cursor: u64) -> Result<()> {
        self.update(key, cursor, true)?;
        Ok(())
    }

    /// Test and mark in one critical section. Returns whether `key` was new.
    ///
    /// Worker pools that share a handle should use this instead of a separate
    /// `is_new` and `mark_processed`, which could both see the key as new.
    /// A seen key still advances the cursor but is not counted as processed.
    pub fn check_and_mark(&self, key: &ItemKey, cursor: u64) -> Result<bool> {
        self.update(key, cursor, false)
    }

    pub fn key_of(&self, item: &impl CrawlItem) -> Result<ItemKey> {
        item.key(&self.shared.deriver)
    }

    pub fn is_new_item(&self, item: &impl CrawlItem) -> Result<bool> {
        Ok(self.is_new(&self.key_of(item)?))
    }

    pub fn mark_item(&self, item: &impl CrawlItem) -> Result<()> {
        self.mark_processed(&self.key_of(item)?, item.cursor())
    }

    /// Sequence for the next newly scheduled spider job. Jobs are marked
    /// with their sequence as cursor, so this continues after a restart.
    pub fn next_job_seq(&self) -> JobSeq {
        JobSeq::new(self.cursor() + 1)
    }

    fn update(&self, key: &ItemKey, cursor: u64, count_seen: bool) -> Result<bool> {
        let state = self.state();
        if !state.accepts_items() {
            return Err(AppError::invalid_state(state, "active"));
        }

        let inserted = {
            let mut filter = self.write_filter();
            let mut record = self.write_record();
            let inserted = filter.insert(key);
            record.advance(cursor);
            if inserted || count_seen {
                record.items_processed += 1;
            }
            inserted
        };

        let pending = self.shared.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending >= self.shared.settings.every_items {
            self.shared.trigger.notify_one();
        }
        Ok(inserted)
    }

    /// Persist filter and record. Best effort: on failure in-memory state is
    /// untouched, the run stays active and the next call tries again.
    pub async fn checkpoint(&self) -> Result<()> {
        let _guard = self.shared.commit_lock.lock().await;
        self.shared
            .state
            .advance(&[EngineState::Active], EngineState::Checkpointing)?;
        let result = self.commit().await;
        self.shared.state.set(EngineState::Active);
        result
    }

    /// Final checkpoint with the record marked complete.
    ///
    /// On failure the run returns to `Active` so the caller can retry.
    pub async fn finalize(&self) -> Result<()> {
        let _guard = self.shared.commit_lock.lock().await;
        self.shared
            .state
            .advance(&[EngineState::Active], EngineState::Finalizing)?;
        self.write_record().status = RunStatus::Complete;

        match self.commit().await {
            Ok(()) => {
                self.shared.state.set(EngineState::Closed);
                self.shared.stop.send_replace(true);
                let record = self.read_record();
                log::info!(
                    "Run {} complete: {} items, cursor {}",
                    record.run_id,
                    record.items_processed,
                    record.cursor
                );
                Ok(())
            }
            Err(e) => {
                self.write_record().status = RunStatus::Running;
                self.shared.state.set(EngineState::Active);
                Err(e)
            }
        }
    }

    /// Stop the checkpointer and try one final checkpoint within `timeout`.
    /// The run is closed afterwards whatever the outcome.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.shared.stop.send_replace(true);
        if self.state() == EngineState::Closed {
            return ShutdownOutcome::Finalized;
        }

        let outcome = match tokio::time::timeout(timeout, self.finalize()).await {
            Ok(Ok(())) => ShutdownOutcome::Finalized,
            Ok(Err(e)) => {
                log::error!(
                    "Final checkpoint for {} failed: {}; {} item(s) will be reprocessed next run",
                    self.shared.job_id,
                    e,
                    self.pending()
                );
                ShutdownOutcome::CheckpointFailed(e)
            }
            Err(_) => {
                log::warn!(
                    "Final checkpoint for {} timed out after {:?}; {} item(s) will be reprocessed next run",
                    self.shared.job_id,
                    timeout,
                    self.pending()
                );
                ShutdownOutcome::TimedOut
            }
        };
        self.shared.state.set(EngineState::Closed);
        outcome
    }

    /// Two-phase write: snapshot first, then the record that points at it,
    /// then prune. Callers hold `commit_lock`.
    pub(super) async fn commit(&self) -> Result<()> {
        let result = self.commit_inner().await;
        let mut log = self.shared.log.lock().unwrap_or_else(|p| p.into_inner());
        match &result {
            Ok(generation) => {
                log.committed += 1;
                log.last_success = Some(Utc::now());
                log.last_error = None;
                let record = self.read_record();
                log::info!(
                    "Checkpoint {} committed for {} (cursor {}, {} items)",
                    generation,
                    self.shared.job_id,
                    record.cursor,
                    record.items_processed
                );
            }
            Err(e) => {
                log.failed += 1;
                log.last_error = Some(e.to_string());
                log::warn!(
                    "Checkpoint failed for {}: {}; will retry next cycle",
                    self.shared.job_id,
                    e
                );
            }
        }
        result.map(|_| ())
    }

    async fn commit_inner(&self) -> Result<u64> {
        let (bytes, mut record, pending) = {
            let filter = self.read_filter();
            let record = self.read_record();
            (
                filter.to_bytes(),
                record.clone(),
                self.shared.pending.load(Ordering::SeqCst),
            )
        };

        let generation = record.generation + 1;
        let snapshot_path = paths::filter_snapshot(&self.shared.job_id, generation);
        self.shared.store.put(&snapshot_path, bytes).await?;

        let committed_cursor = self.shared.committed_cursor.load(Ordering::SeqCst);
        record.previous_snapshot_path = record
            .has_snapshot()
            .then(|| record.filter_snapshot_path.clone());
        record.previous_cursor = record.has_snapshot().then_some(committed_cursor);
        record.filter_snapshot_path = snapshot_path;
        record.generation = generation;
        record.updated_at = Utc::now();
        self.shared.checkpoints.save(&record).await?;

        {
            let mut live = self.write_record();
            live.filter_snapshot_path = record.filter_snapshot_path.clone();
            live.previous_snapshot_path = record.previous_snapshot_path.clone();
            live.previous_cursor = record.previous_cursor;
            live.generation = generation;
            live.updated_at = record.updated_at;
        }
        self.shared.pending.fetch_sub(pending, Ordering::SeqCst);
        self.shared
            .committed_cursor
            .store(record.cursor, Ordering::SeqCst);

        self.prune(&record).await;
        Ok(generation)
    }

    /// Delete snapshots outside the newest `retain_generations`, never
    /// touching the two the committed record references.
    async fn prune(&self, record: &CheckpointRecord) {
        let prefix = paths::filter_prefix(&self.shared.job_id);
        let snapshots = match self.shared.store.list(&prefix).await {
            Ok(paths) => paths,
            Err(e) => {
                log::warn!("Could not list {} for pruning: {}", prefix, e);
                return;
            }
        };

        let mut generations: Vec<(u64, String)> = snapshots
            .into_iter()
            .filter_map(|p| paths::snapshot_generation(&p).map(|g| (g, p)))
            .collect();
        generations.sort();

        let retain = self.shared.settings.retain_generations.max(2);
        let stale = generations.len().saturating_sub(retain);
        for (_, path) in generations.into_iter().take(stale) {
            if path == record.filter_snapshot_path
                || record.previous_snapshot_path.as_deref() == Some(path.as_str())
            {
                continue;
            }
            match self.shared.store.delete(&path).await {
                Ok(()) => log::debug!("Pruned {}", path),
                Err(e) => log::warn!("Could not prune {}: {}", path, e),
            }
        }
    }

    pub fn stats(&self) -> RunStats {
        let filter = self.read_filter().stats();
        let record = self.read_record().clone();
        let log = self.shared.log.lock().unwrap_or_else(|p| p.into_inner());
        RunStats {
            job_id: record.job_id,
            run_id: record.run_id,
            state: self.state(),
            cursor: record.cursor,
            items_processed: record.items_processed,
            pending: self.pending(),
            generation: record.generation,
            restored_from: self.shared.restored_from.clone(),
            checkpoints_committed: log.committed,
            checkpoints_failed: log.failed,
            last_checkpoint_at: log.last_success,
            last_checkpoint_error: log.last_error.clone(),
            last_verify: log.last_verify.clone(),
            filter,
        }
    }

    /// Re-derive keys for a sample of persisted output and check that the
    /// filter holds them. A miss means the live path and the output disagree
    /// on identity, so processed items would be fetched again.
    pub async fn verify_output_sample(&self) -> Result<VerifyReport> {
        let sample = self
            .shared
            .scanner
            .sample(&self.shared.job_id, self.shared.verify_sample)
            .await?;

        let report = VerifyReport::check(&self.read_filter(), &sample);
        if !report.is_consistent() {
            log::warn!(
                "Key derivation self-check for {}: {} of {} output records not in the seen-set (e.g. {:?})",
                self.shared.job_id,
                report.missing,
                report.sampled,
                report.examples
            );
        } else {
            log::debug!(
                "Key derivation self-check for {} passed on {} records",
                self.shared.job_id,
                report.sampled
            );
        }
        self.shared
            .log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_verify = Some(report.clone());
        Ok(report)
    }

    fn read_filter(&self) -> RwLockReadGuard<'_, SeenSet> {
        self.shared.filter.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_filter(&self) -> RwLockWriteGuard<'_, SeenSet> {
        self.shared.filter.write().unwrap_or_else(|p| p.into_inner())
    }

    fn read_record(&self) -> RwLockReadGuard<'_, CheckpointRecord> {
        self.shared.record.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_record(&self) -> RwLockWriteGuard<'_, CheckpointRecord> {
        self.shared.record.write().unwrap_or_else(|p| p.into_inner())
    }
}
