// src/models/mod.rs

//! Domain models for the dedup engine.
//!
//! This module contains the data structures shared across the engine,
//! organized by their primary purpose.

mod checkpoint;
mod config;
mod item;
mod key;

// Re-export all public types
pub use checkpoint::{CheckpointRecord, RunStatus, run_id};
pub use config::{
    Backend, CheckpointConfig, Config, FilterConfig, GrowthPolicy, LoggingConfig, RetryConfig,
    ScannerConfig, StorageConfig,
};
pub use item::{CrawlItem, JobSeq, PageItem, SpiderJob};
pub use key::{IdentityKind, ItemKey, KeyDeriver};
