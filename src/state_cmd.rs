//! `mirror state show` and `mirror state reset`.
//!
//! Inspection and recovery for the persisted reconciliation state. Resetting
//! a collection is safe: the next run rebuilds its mappings from the
//! destination listing and rewrites every record once.

use anyhow::Result;

use crate::collections;
use crate::config::Config;
use crate::models::CollectionKey;
use crate::state::{open_backend, ReconciliationState};

pub async fn run_state_show(config: &Config) -> Result<()> {
    let backend = open_backend(config).await?;
    let state = ReconciliationState::load(backend.as_ref()).await;

    println!("Reconciliation State");
    println!("====================");
    println!();
    match config.state.backend.as_str() {
        "sqlite" => println!("  Backend:   sqlite ({})", config.state.path.display()),
        other => println!("  Backend:   {}", other),
    }
    println!("  Mappings:  {}", state.mappings.len());
    println!("  Hashes:    {}", state.hashes.len());
    println!("  Assets:    {}", state.assets.len());
    println!();
    println!("  {:<12} {:>6} {:>9} {:>7}", "COLLECTION", "PHASE", "MAPPINGS", "HASHES");
    println!("  {}", "-".repeat(37));
    for spec in collections::all() {
        println!(
            "  {:<12} {:>6} {:>9} {:>7}",
            spec.key.as_str(),
            spec.phase,
            state.mappings.count(spec.key),
            state.hashes.count(spec.key)
        );
    }
    println!();
    Ok(())
}

pub async fn run_state_reset(config: &Config, only: Option<CollectionKey>) -> Result<()> {
    let backend = open_backend(config).await?;
    let mut state = ReconciliationState::load(backend.as_ref()).await;

    let targets: Vec<CollectionKey> = match only {
        Some(key) => vec![key],
        None => CollectionKey::ALL.to_vec(),
    };
    for key in &targets {
        state.reset_collection(*key);
    }
    state.save(backend.as_ref()).await?;

    let names: Vec<&str> = targets.iter().map(|k| k.as_str()).collect();
    println!("state reset");
    println!("  collections: {}", names.join(", "));
    println!("  mappings left: {}", state.mappings.len());
    Ok(())
}
