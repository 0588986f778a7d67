//! Dedup Engine: decides whether an item is new and makes progress durable.
//!
//! [`DedupEngine::initialize`] restores a job's state and hands back a
//! [`RunHandle`], the only owner of that Run's filter and checkpoint record.
//! Startup chooses the filter in this order:
//!
//! 1. the snapshot named by `{jobId}/checkpoint.json`
//! 2. the record's previous snapshot, if the latest is missing or corrupt;
//!    the cursor moves back to where that snapshot was taken
//! 3. without a record, the newest decodable snapshot under `{jobId}/filter/`
//! 4. a Collection Scanner rebuild from `{jobId}/output/`
//!
//! New snapshots are always numbered above every generation already in the
//! store, so startup never overwrites one.
//!
//! Any store failure while doing so is fatal: the engine moves to `Failed`
//! and returns `AppError::Initialization`. Crawling without dedup state
//! would repeat every side effect.
//!
//! A successful startup always leaves a durable checkpoint behind, so a run
//! never ends without one.

mod checkpointer;
mod run;
mod state;

use std::sync::Arc;

pub use run::{RestoreSource, RunHandle, RunStats, ShutdownOutcome, VerifyReport};
pub use state::EngineState;

use crate::checkpoint::CheckpointStore;
use crate::error::{AppError, Result};
use crate::filter::SeenSet;
use crate::models::{CheckpointRecord, Config, KeyDeriver};
use crate::scanner::CollectionScanner;
use crate::storage::{BlobStore, paths};

use run::Shared;
use state::StateCell;

/// Entry point for one Run of one job.
pub struct DedupEngine {
    store: Arc<dyn BlobStore>,
    config: Config,
    deriver: KeyDeriver,
    state: StateCell,
}

impl DedupEngine {
    /// Fails when `config` does not validate.
    pub fn new(store: Arc<dyn BlobStore>, config: Config) -> Result<Self> {
        config.validate()?;
        let deriver = KeyDeriver::new(config.scanner.identity_kind);
        Ok(Self {
            store,
            config,
            deriver,
            state: StateCell::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The key derivation shared by the live path and the scanner.
    pub fn deriver(&self) -> KeyDeriver {
        self.deriver
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(self.store.clone())
    }

    pub fn scanner(&self) -> CollectionScanner {
        CollectionScanner::new(
            self.store.clone(),
            self.deriver,
            self.config.scanner.clone(),
            self.config.filter.clone(),
        )
    }

    /// Load or rebuild dedup state for `job_id` and start a Run.
    ///
    /// An engine drives a single Run; create a new engine for the next one.
    pub async fn initialize(&self, job_id: &str) -> Result<RunHandle> {
        self.state
            .advance(&[EngineState::Uninitialized], EngineState::Initializing)?;
        self.state.set_label(job_id);

        match self.start(job_id, false).await {
            Ok(handle) => {
                self.state.set(EngineState::Active);
                log::info!(
                    "Run {} active for {} (resume after cursor {})",
                    handle.run_id(),
                    job_id,
                    handle.resume_cursor()
                );
                Ok(handle)
            }
            Err(e) => {
                self.state.set(EngineState::Failed);
                log::error!("Initialization failed for {}: {}", job_id, e);
                Err(AppError::initialization(job_id, e))
            }
        }
    }

    /// Like `initialize`, but ignores any snapshot and rebuilds the filter
    /// from output. The rebuilt filter is committed before returning.
    pub async fn initialize_rebuilt(&self, job_id: &str) -> Result<RunHandle> {
        self.state
            .advance(&[EngineState::Uninitialized], EngineState::Initializing)?;
        self.state.set_label(job_id);

        match self.start(job_id, true).await {
            Ok(handle) => {
                self.state.set(EngineState::Active);
                Ok(handle)
            }
            Err(e) => {
                self.state.set(EngineState::Failed);
                log::error!("Rebuild failed for {}: {}", job_id, e);
                Err(AppError::initialization(job_id, e))
            }
        }
    }

    async fn start(&self, job_id: &str, force_rebuild: bool) -> Result<RunHandle> {
        paths::validate_job_id(job_id)?;
        let checkpoints = self.checkpoint_store();
        let stored = self.stored_snapshots(job_id).await?;
        let newest_generation = stored.first().map_or(0, |(generation, _)| *generation);

        let (mut record, filter, source) = match checkpoints.load(job_id).await? {
            None => {
                let recovered = if force_rebuild {
                    None
                } else {
                    self.recover_snapshot(&stored).await?
                };
                let mut record = CheckpointRecord::new(job_id);
                match recovered {
                    Some((filter, path)) => {
                        log::warn!(
                            "No checkpoint for {}; recovered seen-set from {} ({} items)",
                            job_id,
                            path,
                            filter.len()
                        );
                        record.filter_snapshot_path = path.clone();
                        (record, filter, RestoreSource::Recovered { path })
                    }
                    None => {
                        log::info!("No checkpoint for {}; starting first run", job_id);
                        let (filter, source) = self.rebuild(job_id).await?;
                        (record, filter, source)
                    }
                }
            }
            Some(previous) => {
                let mut record = previous.successor();
                let restored = if force_rebuild {
                    None
                } else {
                    self.load_snapshot(&previous).await?
                };
                match restored {
                    Some((filter, source)) => {
                        if let RestoreSource::Rollback { .. } = &source {
                            let skipped = record.cursor;
                            record.roll_back();
                            log::warn!(
                                "Cursor for {} moved back from {} to {}",
                                job_id,
                                skipped,
                                record.cursor
                            );
                        }
                        (record, filter, source)
                    }
                    None => {
                        record.filter_snapshot_path.clear();
                        record.previous_snapshot_path = None;
                        record.previous_cursor = None;
                        let (filter, source) = self.rebuild(job_id).await?;
                        (record, filter, source)
                    }
                }
            }
        };
        // records from older writers may lack the generation counter, and a
        // lost record leaves generations behind
        if let Some(generation) = paths::snapshot_generation(&record.filter_snapshot_path) {
            record.generation = record.generation.max(generation);
        }
        record.generation = record.generation.max(newest_generation);

        let from_snapshot = matches!(source, RestoreSource::Snapshot { .. });
        let handle = RunHandle::new(Shared::new(
            job_id,
            self.store.clone(),
            self.scanner(),
            self.deriver,
            self.config.checkpoint.clone(),
            self.config.scanner.verify_sample,
            self.state.clone(),
            source,
            filter,
            record,
        ));

        // a loaded snapshot only needs the new run recorded; anything else
        // is written as a fresh generation
        if from_snapshot {
            let record = handle.shared.record.read().unwrap_or_else(|p| p.into_inner()).clone();
            checkpoints.save(&record).await?;
        } else {
            let _guard = handle.shared.commit_lock.lock().await;
            handle.commit().await?;
        }
        Ok(handle)
    }

    /// Latest loadable snapshot of `record`, falling back to its previous
    /// one. `Ok(None)` when neither is usable; store failures propagate.
    async fn load_snapshot(
        &self,
        record: &CheckpointRecord,
    ) -> Result<Option<(SeenSet, RestoreSource)>> {
        let candidates = [
            Some(record.filter_snapshot_path.as_str()).filter(|p| !p.is_empty()),
            record.previous_snapshot_path.as_deref().filter(|p| !p.is_empty()),
        ];

        for (index, path) in candidates.into_iter().enumerate() {
            let Some(path) = path else { continue };
            let bytes = match self.store.get(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.is_not_found() => {
                    log::warn!("Snapshot {} is missing", path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match SeenSet::from_bytes(&bytes, path) {
                Ok(filter) => {
                    let source = if index == 0 {
                        log::info!("Loaded seen-set from {} ({} items)", path, filter.len());
                        RestoreSource::Snapshot {
                            path: path.to_string(),
                        }
                    } else {
                        log::warn!(
                            "Rolled back to snapshot {} ({} items); items after it are enumerated again",
                            path,
                            filter.len()
                        );
                        RestoreSource::Rollback {
                            path: path.to_string(),
                        }
                    };
                    return Ok(Some((filter, source)));
                }
                Err(e) => log::warn!("{}", e),
            }
        }
        Ok(None)
    }

    /// Snapshot generations under `{job_id}/filter/`, newest first.
    async fn stored_snapshots(&self, job_id: &str) -> Result<Vec<(u64, String)>> {
        let mut stored: Vec<(u64, String)> = self
            .store
            .list(&paths::filter_prefix(job_id))
            .await?
            .into_iter()
            .filter_map(|p| paths::snapshot_generation(&p).map(|g| (g, p)))
            .collect();
        stored.sort_by(|a, b| b.cmp(a));
        Ok(stored)
    }

    /// Newest decodable snapshot among `stored`, for a job whose record is
    /// gone. Store failures propagate.
    async fn recover_snapshot(
        &self,
        stored: &[(u64, String)],
    ) -> Result<Option<(SeenSet, String)>> {
        for (_, path) in stored {
            let bytes = match self.store.get(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match SeenSet::from_bytes(&bytes, path) {
                Ok(filter) => return Ok(Some((filter, path.clone()))),
                Err(e) => log::warn!("{}", e),
            }
        }
        Ok(None)
    }

    async fn rebuild(&self, job_id: &str) -> Result<(SeenSet, RestoreSource)> {
        let report = self.scanner().rebuild(job_id).await?;
        let summary = report.summary();
        Ok((report.filter, RestoreSource::Rebuild(summary)))
    }
}
