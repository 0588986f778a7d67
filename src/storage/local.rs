//! Local filesystem blob store.
//!
//! Used for development, single-host crawls and tests. Writes go through a
//! temporary sibling file and a rename, so a crash mid-write never leaves a
//! torn blob behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::{BlobStore, paths};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> Result<PathBuf> {
        paths::validate(key)?;
        Ok(self.root_dir.join(key))
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn classify(key: &str, error: std::io::Error) -> AppError {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::NotFound => AppError::not_found(key),
            ErrorKind::PermissionDenied => AppError::permanent(key, error),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                AppError::transient(key, error)
            }
            _ => AppError::Io(error),
        }
    }

    /// Collect files below `dir` as `/`-separated paths relative to the root.
    async fn walk(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<()> {
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "tmp") {
                    continue;
                } else if let Ok(rel) = path.strip_prefix(&self.root_dir) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::classify(key, e))
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path(key)?;
        Self::ensure_dir(&path).await?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Self::classify(key, e))?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::classify(key, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // walk from the deepest directory fully named by the prefix
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root_dir.clone()
        } else {
            self.path(dir_part)?
        };

        let mut keys = Vec::new();
        self.walk(start, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::classify(key, e)),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root_dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.put("job/test.txt", b"hello".to_vec()).await.unwrap();
        let data = storage.get("job/test.txt").await.unwrap();
        assert_eq!(data, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        let err = storage.get("nope.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.put("job/checkpoint.json", b"1".to_vec()).await.unwrap();
        storage.put("job/checkpoint.json", b"2".to_vec()).await.unwrap();

        assert_eq!(storage.get("job/checkpoint.json").await.unwrap(), b"2");
        assert_eq!(storage.list("job/").await.unwrap(), vec!["job/checkpoint.json"]);
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_prefixed() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        for key in [
            "site-A/output/b.jsonl",
            "site-A/output/a.jsonl",
            "site-A/output/nested/c.jsonl",
            "site-A/filter/0000000001.bin",
            "site-B/output/a.jsonl",
        ] {
            storage.put(key, b"x".to_vec()).await.unwrap();
        }

        assert_eq!(
            storage.list("site-A/output/").await.unwrap(),
            vec![
                "site-A/output/a.jsonl",
                "site-A/output/b.jsonl",
                "site-A/output/nested/c.jsonl",
            ]
        );
        assert!(storage.list("site-C/output/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.put("job/a", b"x".to_vec()).await.unwrap();
        storage.delete("job/a").await.unwrap();
        storage.delete("job/a").await.unwrap();
        assert!(storage.get("job/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        let err = storage.put("../escape", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidPath { .. }));
    }
}
