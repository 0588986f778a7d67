//! In-memory blob store.
//!
//! Backs the `memory` backend for dry runs and gives tests a store whose
//! failures can be scripted: queue faults for upcoming calls or take the
//! whole store offline.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::storage::{BlobStore, paths};

/// Failure injected into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fails like a timeout or throttling response
    Transient,
    /// Fails like an authorization error
    Permanent,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: BTreeMap<String, Vec<u8>>,
    faults: VecDeque<Fault>,
    offline: bool,
    calls: u64,
}

/// Thread-safe map of path to bytes. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock cannot leave the map half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` calls with `fault`, in order.
    pub fn inject(&self, fault: Fault, count: usize) {
        let mut inner = self.lock();
        inner.faults.extend(std::iter::repeat_n(fault, count));
    }

    /// While offline every call fails transiently.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Calls attempted so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    /// Every stored path, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.lock().blobs.keys().cloned().collect()
    }

    /// Count the call and apply any pending fault.
    fn admit(&self, path: &str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls += 1;
        if inner.offline {
            return Err(AppError::transient(path, "store offline"));
        }
        match inner.faults.pop_front() {
            Some(Fault::Transient) => Err(AppError::transient(path, "injected timeout")),
            Some(Fault::Permanent) => Err(AppError::permanent(path, "injected access denied")),
            None => Ok(inner),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStorage {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        paths::validate(path)?;
        let inner = self.admit(path)?;
        inner
            .blobs
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::not_found(path))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        paths::validate(path)?;
        let mut inner = self.admit(path)?;
        inner.blobs.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.admit(prefix)?;
        Ok(inner
            .blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        paths::validate(path)?;
        let mut inner = self.admit(path)?;
        inner.blobs.remove(path);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryStorage::new();
        store.put("a/output/2", b"two".to_vec()).await.unwrap();
        store.put("a/output/1", b"one".to_vec()).await.unwrap();
        store.put("b/output/1", b"other".to_vec()).await.unwrap();

        assert_eq!(store.get("a/output/1").await.unwrap(), b"one");
        assert_eq!(
            store.list("a/output/").await.unwrap(),
            vec!["a/output/1", "a/output/2"]
        );
        assert!(store.get("a/output/3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = MemoryStorage::new();
        store.inject(Fault::Transient, 1);
        store.inject(Fault::Permanent, 1);

        assert!(store.put("a/x", vec![1]).await.unwrap_err().is_transient());
        let err = store.put("a/x", vec![1]).await.unwrap_err();
        assert!(matches!(err, AppError::PermanentStore { .. }));
        store.put("a/x", vec![1]).await.unwrap();
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let store = MemoryStorage::new();
        store.set_offline(true);
        assert!(store.get("a/x").await.unwrap_err().is_transient());
        store.set_offline(false);
        assert!(store.get("a/x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_clones_share_contents() {
        let store = MemoryStorage::new();
        let clone = store.clone();
        clone.put("a/x", b"v".to_vec()).await.unwrap();
        assert_eq!(store.keys(), vec!["a/x"]);
    }
}
