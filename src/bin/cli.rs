//! crawl-dedup CLI
//!
//! Operator entry point: inspect a job's dedup state, filter a stream of
//! identities through a Run, force a rebuild or run the key-derivation
//! self-check.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use crawl_dedup::{
    config::load_config,
    engine::{DedupEngine, RunHandle, ShutdownOutcome, VerifyReport},
    error::{AppError, Result},
    filter::SeenSet,
    storage::{self, BlobStore, paths},
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

/// crawl-dedup - dedup and checkpoint engine for resumable crawls
#[derive(Parser, Debug)]
#[command(
    name = "crawl-dedup",
    version,
    about = "Deduplication and checkpoint engine for resumable crawls"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "dedup.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the checkpoint record and filter statistics of a job
    Status { job: String },

    /// Print identities not seen before and mark them processed.
    ///
    /// Input lines are `identity` or `identity<TAB>cursor`; the cursor
    /// defaults to the line number.
    Filter {
        job: String,

        /// Read identities from a file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Rebuild the filter from the job's output and commit it
    Rebuild { job: String },

    /// Check a sample of output records against the latest snapshot
    Verify { job: String },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, default_level: &str) {
    let level = if verbose { "debug" } else { default_level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config);
    let level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);
    let config = config?;

    match cli.command {
        Command::Validate => {
            log::info!("✓ Config OK ({})", cli.config.display());
            println!("{}", toml::to_string_pretty(&config).unwrap_or_default());
        }

        Command::Status { job } => {
            let store = storage::open(&config).await?;
            let engine = DedupEngine::new(store.clone(), config.clone())?;
            status(&engine, store.as_ref(), &job).await?;
        }

        Command::Filter { job, input } => {
            let store = storage::open(&config).await?;
            let engine = DedupEngine::new(store, config.clone())?;
            let run = engine.initialize(&job).await?;
            let checkpointer = run.spawn_checkpointer();

            let result = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path).await?;
                    filter_lines(&run, file).await
                }
                None => filter_lines(&run, tokio::io::stdin()).await,
            };

            let outcome = match result {
                Ok(FilterEnd::Eof) => {
                    // retry once, then fall back to a bounded shutdown
                    match run.finalize().await {
                        Ok(()) => ShutdownOutcome::Finalized,
                        Err(_) => run.shutdown(config.checkpoint.shutdown_timeout()).await,
                    }
                }
                Ok(FilterEnd::Interrupted) => {
                    log::warn!("Interrupted; writing final checkpoint");
                    run.shutdown(config.checkpoint.shutdown_timeout()).await
                }
                Err(e) => {
                    log::error!("Filtering stopped: {}", e);
                    run.shutdown(config.checkpoint.shutdown_timeout()).await
                }
            };
            checkpointer.abort();

            let stats = run.stats();
            log::info!(
                "{}: {} processed, cursor {}, {} checkpoint(s), {} failed",
                stats.run_id,
                stats.items_processed,
                stats.cursor,
                stats.checkpoints_committed,
                stats.checkpoints_failed
            );
            match outcome {
                ShutdownOutcome::Finalized => {}
                ShutdownOutcome::CheckpointFailed(e) => return Err(e),
                ShutdownOutcome::TimedOut => {
                    return Err(AppError::validation("final checkpoint timed out"));
                }
            }
        }

        Command::Rebuild { job } => {
            let store = storage::open(&config).await?;
            let engine = DedupEngine::new(store, config.clone())?;
            let run = engine.initialize_rebuilt(&job).await?;
            println!("{}", serde_json::to_string_pretty(&run.stats())?);
        }

        Command::Verify { job } => {
            let store = storage::open(&config).await?;
            let engine = DedupEngine::new(store.clone(), config.clone())?;
            let filter = latest_filter(store.as_ref(), &engine, &job).await?;
            let sample = engine
                .scanner()
                .sample(&job, config.scanner.verify_sample)
                .await?;
            let report = VerifyReport::check(&filter, &sample);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                return Err(AppError::validation(format!(
                    "{} of {} sampled output records are not in the filter",
                    report.missing, report.sampled
                )));
            }
        }
    }

    Ok(())
}

enum FilterEnd {
    Eof,
    Interrupted,
}

/// Feed input lines through the run until EOF or Ctrl-C.
async fn filter_lines<R>(run: &RunHandle, input: R) -> Result<FilterEnd>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut stdout = tokio::io::stdout();
    let resume = run.resume_cursor();
    let mut line_no: u64 = 0;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut ctrl_c => return Ok(FilterEnd::Interrupted),
        };
        let Some(line) = line else {
            stdout.flush().await?;
            return Ok(FilterEnd::Eof);
        };
        line_no += 1;

        let (identity, cursor) = match line.split_once('\t') {
            Some((identity, cursor)) => match cursor.trim().parse::<u64>() {
                Ok(cursor) => (identity, cursor),
                Err(_) => {
                    log::warn!("Line {}: bad cursor '{}'", line_no, cursor);
                    continue;
                }
            },
            None => (line.as_str(), line_no),
        };
        if identity.trim().is_empty() {
            continue;
        }
        // already covered by the run being resumed
        if resume > 0 && cursor <= resume {
            continue;
        }

        let key = match run.deriver().derive(identity) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Line {}: {}", line_no, e);
                continue;
            }
        };
        if run.check_and_mark(&key, cursor)? {
            stdout.write_all(identity.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
    }
}

async fn status(engine: &DedupEngine, store: &dyn BlobStore, job: &str) -> Result<()> {
    let Some(record) = engine.checkpoint_store().load(job).await? else {
        println!("No checkpoint for {job}");
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(&record)?);

    let snapshots = store.list(&paths::filter_prefix(job)).await?;
    log::info!("{} snapshot(s) retained under {}", snapshots.len(), paths::filter_prefix(job));
    if record.has_snapshot() {
        let filter = load_filter(store, &record.filter_snapshot_path).await?;
        println!("{}", serde_json::to_string_pretty(&filter.stats())?);
    }
    Ok(())
}

/// The filter referenced by the job's checkpoint record.
async fn latest_filter(store: &dyn BlobStore, engine: &DedupEngine, job: &str) -> Result<SeenSet> {
    let record = engine
        .checkpoint_store()
        .load(job)
        .await?
        .ok_or_else(|| AppError::validation(format!("no checkpoint for {job}")))?;
    if !record.has_snapshot() {
        return Err(AppError::validation(format!("checkpoint for {job} has no snapshot")));
    }
    load_filter(store, &record.filter_snapshot_path).await
}

async fn load_filter(store: &dyn BlobStore, path: &str) -> Result<SeenSet> {
    let bytes = store.get(path).await?;
    SeenSet::from_bytes(&bytes, path)
}
