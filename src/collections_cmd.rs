use anyhow::{Context, Result};
use std::sync::Arc;

use crate::collections;
use crate::config::Config;
use crate::destination::RestDestination;
use crate::remote::RemoteClient;

/// Print each collection with the destination collection it resolves to.
pub async fn list_collections(config: &Config) -> Result<()> {
    let client = Arc::new(RemoteClient::from_config(&config.destination)?);
    let destination = RestDestination::connect(&config.destination, &config.locales, client)
        .await
        .context("failed to reach destination site")?;

    let locales = destination.locales();
    println!(
        "site {}  locales: {} (primary){}",
        config.destination.site_id,
        config.locales.primary,
        match (&config.locales.secondary, &locales.secondary) {
            (Some(tag), Some(_)) => format!(", {} (secondary)", tag),
            (Some(tag), None) => format!(", {} (secondary, NOT ON SITE)", tag),
            (None, _) => String::new(),
        }
    );
    println!();
    println!(
        "{:<12} {:<6} {:<14} {:<28} {}",
        "COLLECTION", "PHASE", "SOURCE TYPE", "DESTINATION", "STATUS"
    );
    for spec in collections::all() {
        let (id, status) = match destination.collection_id(spec.key) {
            Some(id) if config.destination.collection_override(spec.key).is_some() => {
                (id.to_string(), "OK (configured)")
            }
            Some(id) => (id.to_string(), "OK"),
            None => (spec.destination_slug.to_string(), "NOT FOUND"),
        };
        println!(
            "{:<12} {:<6} {:<14} {:<28} {}",
            spec.key.as_str(),
            spec.phase,
            spec.source_type,
            id,
            status
        );
    }

    let unused: Vec<&str> = destination
        .remote_collections()
        .iter()
        .filter(|c| collections::all().iter().all(|s| s.destination_slug != c.slug))
        .map(|c| c.display_name.as_str())
        .collect();
    if !unused.is_empty() {
        println!();
        println!("Other site collections: {}", unused.join(", "));
    }

    Ok(())
}
