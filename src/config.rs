// src/config.rs

//! Configuration loading utilities.
//!
//! Reads the TOML file, then lets deployment environments override the
//! storage location without editing it.

use std::path::Path;

use crate::error::Result;
use crate::models::{Backend, Config};

/// Load configuration from a TOML file, apply environment overrides and
/// validate the result.
///
/// A missing or unreadable file falls back to defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        log::warn!("Config file {} not found; using defaults", path.display());
        Config::default()
    };
    apply_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply `DEDUP_*`, `S3_*` and `GCS_*` overrides read through `lookup`.
pub fn apply_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(backend) = get("DEDUP_BACKEND") {
        config.storage.backend = backend.parse()?;
    }
    if let Some(root) = get("DEDUP_ROOT") {
        config.storage.root = root;
    }
    if let Some(endpoint) = get("DEDUP_ENDPOINT") {
        config.storage.endpoint = Some(endpoint);
    }

    match config.storage.backend {
        Backend::S3 => {
            if let Some(bucket) = get("S3_BUCKET") {
                config.storage.bucket = bucket;
            }
            if let Some(prefix) = get("S3_PREFIX") {
                config.storage.prefix = prefix;
            }
        }
        Backend::Gcs => {
            if let Some(bucket) = get("GCS_BUCKET") {
                config.storage.bucket = bucket;
            }
        }
        Backend::Local | Backend::Memory => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_s3_overrides() {
        let mut config = Config::default();
        apply_overrides(
            &mut config,
            env(&[
                ("DEDUP_BACKEND", "s3"),
                ("S3_BUCKET", "crawl-state"),
                ("S3_PREFIX", "prod"),
                ("GCS_BUCKET", "ignored"),
            ]),
        )
        .unwrap();
        assert_eq!(config.storage.backend, Backend::S3);
        assert_eq!(config.storage.bucket, "crawl-state");
        assert_eq!(config.storage.prefix, "prod");
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let mut config = Config::default();
        apply_overrides(&mut config, env(&[("DEDUP_ROOT", "  ")])).unwrap();
        assert_eq!(config.storage.root, Config::default().storage.root);
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let mut config = Config::default();
        assert!(apply_overrides(&mut config, env(&[("DEDUP_BACKEND", "ftp")])).is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.checkpoint.every_items, 1000);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[checkpoint]\nretain_generations = 1\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
