//! Blob store abstractions for dedup state and crawl output.
//!
//! Every job owns one namespace inside the store:
//!
//! ```text
//! {jobId}/
//! ├── checkpoint.json           # Checkpoint record (points at a snapshot)
//! ├── filter/                   # Seen-set snapshots, one per checkpoint
//! │   ├── 0000000007.bin
//! │   └── 0000000008.bin
//! └── output/                   # Crawl output, replayed on cold start
//!     └── *.jsonl
//! ```
//!
//! Backends implement the narrow [`BlobStore`] contract. [`RetryingStore`]
//! adds the bounded retry policy on top of any of them.

pub mod local;
pub mod memory;
pub mod retry;
#[cfg(feature = "gcs")]
pub mod gcs;
#[cfg(feature = "s3")]
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{Backend, Config};

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::{Fault, MemoryStorage};
pub use retry::{RetryDecision, RetryPolicy, RetryingStore};

/// Get/put/list over one remote object store.
///
/// `get` of a missing blob fails with `AppError::NotFound`. Transport
/// failures are reported as `AppError::TransientStore` when a retry could
/// succeed and `AppError::PermanentStore` otherwise.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()>;

    /// Paths under `prefix`, sorted lexically.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a blob. Deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Human-readable location for logs, e.g. `s3://bucket/prefix`.
    fn describe(&self) -> String;
}

/// `get` that maps a missing blob to `None`.
pub async fn get_optional(store: &dyn BlobStore, path: &str) -> Result<Option<Vec<u8>>> {
    match store.get(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Build the configured backend wrapped in the configured retry policy.
pub async fn open(config: &Config) -> Result<Arc<dyn BlobStore>> {
    let policy = RetryPolicy::from_config(&config.retry);
    let storage = &config.storage;

    let store: Arc<dyn BlobStore> = match storage.backend {
        Backend::Local => Arc::new(RetryingStore::new(LocalStorage::new(&storage.root), policy)),
        Backend::Memory => Arc::new(RetryingStore::new(MemoryStorage::new(), policy)),
        #[cfg(feature = "s3")]
        Backend::S3 => {
            let s3 = s3::S3Storage::from_config(storage).await?;
            Arc::new(RetryingStore::new(s3, policy))
        }
        #[cfg(feature = "gcs")]
        Backend::Gcs => {
            let gcs = gcs::GcsStorage::from_config(storage)?;
            Arc::new(RetryingStore::new(gcs, policy))
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(AppError::config(format!(
                "storage backend {other:?} is not compiled in; enable its cargo feature"
            )));
        }
    };

    log::info!("Using blob store {}", store.describe());
    Ok(store)
}

/// Path layout inside a job namespace.
pub mod paths {
    use std::sync::LazyLock;

    use regex::Regex;

    use crate::error::{AppError, Result};

    static JOB_ID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid regex"));

    /// Reject job ids that would escape or collide in the namespace.
    pub fn validate_job_id(job_id: &str) -> Result<()> {
        if JOB_ID.is_match(job_id) {
            Ok(())
        } else {
            Err(AppError::invalid_path(
                job_id,
                "job id must be 1-128 chars of [A-Za-z0-9._-] starting alphanumeric",
            ))
        }
    }

    /// Reject empty, absolute or traversing blob paths.
    pub fn validate(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(AppError::invalid_path(path, "empty path"));
        }
        if path.starts_with('/') || path.contains('\\') {
            return Err(AppError::invalid_path(path, "path must be relative"));
        }
        if path.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err(AppError::invalid_path(path, "path must not contain dot segments"));
        }
        Ok(())
    }

    pub fn checkpoint(job_id: &str) -> String {
        format!("{job_id}/checkpoint.json")
    }

    pub fn filter_prefix(job_id: &str) -> String {
        format!("{job_id}/filter/")
    }

    /// Zero-padded so lexical order is generation order.
    pub fn filter_snapshot(job_id: &str, generation: u64) -> String {
        format!("{job_id}/filter/{generation:010}.bin")
    }

    pub fn output_prefix(job_id: &str) -> String {
        format!("{job_id}/output/")
    }

    /// Generation number encoded in a snapshot path.
    pub fn snapshot_generation(path: &str) -> Option<u64> {
        path.rsplit('/')
            .next()?
            .strip_suffix(".bin")?
            .parse()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        assert_eq!(paths::checkpoint("site-A"), "site-A/checkpoint.json");
        assert_eq!(
            paths::filter_snapshot("site-A", 12),
            "site-A/filter/0000000012.bin"
        );
        assert_eq!(paths::output_prefix("site-A"), "site-A/output/");
        assert_eq!(
            paths::snapshot_generation("site-A/filter/0000000012.bin"),
            Some(12)
        );
        assert_eq!(paths::snapshot_generation("site-A/filter/notes.txt"), None);
    }

    #[test]
    fn test_generation_paths_sort_in_order() {
        let mut names = vec![
            paths::filter_snapshot("j", 10),
            paths::filter_snapshot("j", 9),
            paths::filter_snapshot("j", 100),
        ];
        names.sort();
        let gens: Vec<_> = names
            .iter()
            .filter_map(|p| paths::snapshot_generation(p))
            .collect();
        assert_eq!(gens, vec![9, 10, 100]);
    }

    #[test]
    fn test_validate_paths() {
        assert!(paths::validate("site-A/output/part-1.jsonl").is_ok());
        assert!(paths::validate("").is_err());
        assert!(paths::validate("/etc/passwd").is_err());
        assert!(paths::validate("site-A/../other").is_err());
    }

    #[test]
    fn test_validate_job_id() {
        assert!(paths::validate_job_id("site-A").is_ok());
        assert!(paths::validate_job_id("books_2026.01").is_ok());
        assert!(paths::validate_job_id("").is_err());
        assert!(paths::validate_job_id("a/b").is_err());
        assert!(paths::validate_job_id(".hidden").is_err());
    }

    #[tokio::test]
    async fn test_get_optional_maps_not_found() {
        let store = MemoryStorage::new();
        assert!(get_optional(&store, "x/y").await.unwrap().is_none());
        store.put("x/y", b"1".to_vec()).await.unwrap();
        assert_eq!(get_optional(&store, "x/y").await.unwrap(), Some(b"1".to_vec()));
    }
}
