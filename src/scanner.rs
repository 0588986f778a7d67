//! Collection Scanner: rebuilds the seen-set from persisted crawl output.
//!
//! Only the cold-start path runs this. It reads every blob under
//! `{jobId}/output/`, pulls the identity field out of each record and feeds
//! it through the same [`KeyDeriver`] the live path uses.
//!
//! Output blobs are JSON Lines, except `*.json` blobs which may hold a
//! single array of records. Lines that do not parse or lack the identity
//! field are counted and skipped; a blob that cannot be fetched fails the
//! rebuild, since a partial filter would silently let processed items
//! through again.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::filter::SeenSet;
use crate::models::{FilterConfig, ItemKey, KeyDeriver, ScannerConfig};
use crate::storage::{BlobStore, paths};

/// Outcome of a rebuild.
#[derive(Debug)]
pub struct RebuildReport {
    pub filter: SeenSet,
    pub blobs_scanned: usize,
    pub records: u64,
    pub keys_inserted: u64,
    pub skipped: u64,
}

/// Counts without the filter, for logs and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub blobs_scanned: usize,
    pub records: u64,
    pub keys_inserted: u64,
    pub skipped: u64,
}

impl RebuildReport {
    pub fn summary(&self) -> RebuildSummary {
        RebuildSummary {
            blobs_scanned: self.blobs_scanned,
            records: self.records,
            keys_inserted: self.keys_inserted,
            skipped: self.skipped,
        }
    }
}

/// Keys extracted from one blob.
#[derive(Debug, Default)]
struct BlobKeys {
    keys: Vec<ItemKey>,
    records: u64,
    skipped: u64,
}

/// Identities and keys pulled from recent output, for the self-check.
#[derive(Debug, Clone)]
pub struct OutputSample {
    pub identity: String,
    pub key: ItemKey,
}

pub struct CollectionScanner {
    store: Arc<dyn BlobStore>,
    deriver: KeyDeriver,
    config: ScannerConfig,
    filter: FilterConfig,
}

impl CollectionScanner {
    pub fn new(
        store: Arc<dyn BlobStore>,
        deriver: KeyDeriver,
        config: ScannerConfig,
        filter: FilterConfig,
    ) -> Self {
        Self {
            store,
            deriver,
            config,
            filter,
        }
    }

    /// Build a fresh seen-set from every output blob of `job_id`.
    pub async fn rebuild(&self, job_id: &str) -> Result<RebuildReport> {
        paths::validate_job_id(job_id)?;
        let blobs = self.store.list(&paths::output_prefix(job_id)).await?;
        log::info!(
            "Rebuilding seen-set for {} from {} output blob(s)",
            job_id,
            blobs.len()
        );

        let mut results = stream::iter(blobs.iter())
            .map(|path| async move { self.scan_blob(path).await })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut keys = Vec::new();
        let mut records = 0;
        let mut skipped = 0;
        while let Some(result) = results.next().await {
            let blob = result?;
            records += blob.records;
            skipped += blob.skipped;
            keys.extend(blob.keys);
        }

        // pre-size for what the corpus already holds plus the configured headroom
        let capacity = self.filter.capacity.max(keys.len() as u64 * 2);
        let mut filter =
            SeenSet::with_capacity(capacity, self.filter.false_positive_rate, self.filter.growth);
        let keys_inserted = keys.iter().filter(|k| filter.insert(k)).count() as u64;

        if skipped > 0 {
            log::warn!(
                "Skipped {} output record(s) without a usable '{}' field",
                skipped,
                self.config.identity_field
            );
        }
        log::info!(
            "Rebuilt seen-set for {}: {} records, {} distinct keys",
            job_id,
            records,
            keys_inserted
        );

        Ok(RebuildReport {
            filter,
            blobs_scanned: blobs.len(),
            records,
            keys_inserted,
            skipped,
        })
    }

    /// Up to `limit` records from the newest output blobs, with their keys.
    pub async fn sample(&self, job_id: &str, limit: usize) -> Result<Vec<OutputSample>> {
        paths::validate_job_id(job_id)?;
        let blobs = self.store.list(&paths::output_prefix(job_id)).await?;

        let mut sample = Vec::new();
        for path in blobs.iter().rev() {
            if sample.len() >= limit {
                break;
            }
            let bytes = self.store.get(path).await?;
            for identity in self.identities(path, &bytes).0 {
                if sample.len() >= limit {
                    break;
                }
                if let Ok(key) = self.deriver.derive(&identity) {
                    sample.push(OutputSample { identity, key });
                }
            }
        }
        Ok(sample)
    }

    async fn scan_blob(&self, path: &str) -> Result<BlobKeys> {
        let bytes = self.store.get(path).await?;
        let (identities, mut skipped) = self.identities(path, &bytes);

        let mut out = BlobKeys {
            records: identities.len() as u64 + skipped,
            ..BlobKeys::default()
        };
        for identity in identities {
            match self.deriver.derive(&identity) {
                Ok(key) => out.keys.push(key),
                Err(e) => {
                    log::debug!("{}: cannot derive key for '{}': {}", path, identity, e);
                    skipped += 1;
                }
            }
        }
        out.skipped = skipped;
        log::debug!("Scanned {} ({} keys)", path, out.keys.len());
        Ok(out)
    }

    /// Identity strings in a blob and the number of records without one.
    fn identities(&self, path: &str, bytes: &[u8]) -> (Vec<String>, u64) {
        let text = String::from_utf8_lossy(bytes);
        let mut identities = Vec::new();
        let mut skipped = 0;

        if path.ends_with(".json") {
            if let Ok(Value::Array(records)) = serde_json::from_str::<Value>(&text) {
                for record in &records {
                    match self.identity_of(record) {
                        Some(id) => identities.push(id),
                        None => skipped += 1,
                    }
                }
                return (identities, skipped);
            }
        }

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|record| self.identity_of(&record))
            {
                Some(id) => identities.push(id),
                None => skipped += 1,
            }
        }
        (identities, skipped)
    }

    fn identity_of(&self, record: &Value) -> Option<String> {
        match record.get(&self.config.identity_field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
