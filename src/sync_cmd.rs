//! `mirror init` and `mirror sync`.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::models::CollectionKey;
use crate::pipeline::{Pipeline, RunOptions, RunReport};
use crate::progress::ProgressMode;
use crate::state::SqliteStateBackend;

/// Prepare local state storage.
pub async fn run_init(config: &Config) -> Result<()> {
    match config.state.backend.as_str() {
        "sqlite" => {
            let backend = SqliteStateBackend::open(&config.state.path)
                .await
                .with_context(|| {
                    format!("failed to open state database {}", config.state.path.display())
                })?;
            backend.close().await;
            println!(
                "State database initialized at {}.",
                config.state.path.display()
            );
        }
        _ => println!("State is kept in the source store; nothing to initialize."),
    }
    Ok(())
}

/// Flags of `mirror sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub only: Option<CollectionKey>,
    pub item: Option<String>,
    pub limit: Option<usize>,
    pub force: bool,
    pub no_publish: bool,
}

pub async fn run_sync(config: &Config, args: SyncArgs, mode: ProgressMode) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping after the current record...");
            on_signal.store(true, Ordering::Relaxed);
        }
    });

    let pipeline = Pipeline::connect(config)
        .await
        .context("failed to connect content stores")?
        .with_progress(mode.reporter());

    let report = pipeline
        .run(RunOptions {
            only: args.only,
            item_id: args.item,
            limit: args.limit,
            force: args.force,
            publish: if args.no_publish { Some(false) } else { None },
            cancel,
        })
        .await?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("sync{}", if report.cancelled { " (cancelled)" } else { "" });
    println!("  created: {}", report.created);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  deleted: {}", report.deleted);
    println!("  adopted: {}", report.adopted);
    println!("  published: {}", report.published);
    println!("  failures: {}", report.failures);
    println!("  duration: {:.1}s", report.duration().as_secs_f64());

    for error in &report.errors {
        eprintln!(
            "Warning: {} not reconciled ({}): {}",
            error.collection, error.kind, error.message
        );
    }
    for collection in &report.collections {
        for failure in &collection.failures {
            let id = failure
                .source_id
                .as_deref()
                .or(failure.destination_id.as_deref())
                .unwrap_or("-");
            eprintln!(
                "Warning: {} {} failed ({}): {}",
                collection.collection, id, failure.kind, failure.message
            );
        }
    }
}
