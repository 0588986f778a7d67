// src/lib.rs

//! Deduplication and checkpoint engine for resumable crawls.
//!
//! A crawl asks a [`engine::RunHandle`] whether each discovered item is new,
//! marks the ones it processed, and lets the handle checkpoint filter and
//! progress to a blob store. A crash or restart resumes from the last
//! checkpoint without reprocessing what it covered.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod models;
pub mod scanner;
pub mod storage;
pub mod utils;
