//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
#[cfg(not(feature = "image"))]
use pixcache_client::BytesCodec;
#[cfg(feature = "image")]
use pixcache_client::ImageCodec;
use pixcache_client::{CacheOptions, Codec, FetchConfig, HttpFetcher, ImageCache, Lookup};
use pixcache_core::{AppConfig, DiskCache, derive_key};
use serde::Serialize;

use crate::wanted::Wanted;

/// One line of `get` output.
#[derive(Debug, Serialize)]
struct Outcome<'a> {
    tag: &'a str,
    identifier: &'a str,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn emit(outcome: &Outcome<'_>) -> Result<()> {
    println!("{}", serde_json::to_string(outcome)?);
    Ok(())
}

/// Write the stored form of `value` into `dir`, named by cache key.
fn save<C: Codec>(codec: &C, dir: Option<&Path>, identifier: &str, value: &C::Value) -> Result<Option<String>> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    let bytes = codec.encode(value)?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(derive_key(identifier));
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(Some(path.display().to_string()))
}

/// Look up every identifier, print immediate hits, then wait for fetches.
///
/// Built with the `image` feature, payloads are decoded to pixels and
/// `bytes` reports the decoded size; otherwise payloads are kept as fetched.
pub async fn get(config: &AppConfig, identifiers: &[String], wait: Duration, save_dir: Option<&Path>) -> Result<()> {
    #[cfg(feature = "image")]
    let codec = ImageCodec;
    #[cfg(not(feature = "image"))]
    let codec = BytesCodec;
    lookup_all(config, &codec, identifiers, wait, save_dir).await
}

async fn lookup_all<C: Codec + Clone>(
    config: &AppConfig, codec: &C, identifiers: &[String], wait: Duration, save_dir: Option<&Path>,
) -> Result<()> {
    let fetcher = Arc::new(HttpFetcher::new(FetchConfig::from(config))?);
    let (cache, mut deliveries) = ImageCache::open(&CacheOptions::from(config), codec.clone(), fetcher)
        .with_context(|| format!("opening cache at {}", config.cache_dir.display()))?;

    let mut wanted = Wanted::default();
    for (position, identifier) in identifiers.iter().enumerate() {
        let tag = position.to_string();
        wanted.want(&tag, identifier);
        if let Lookup::Ready(value) = cache.lookup(identifier, tag.as_str()) {
            wanted.release(&tag);
            let saved = save(codec, save_dir, identifier, &value)?;
            let bytes = Some(codec.size_of(&value));
            emit(&Outcome { tag: &tag, identifier, source: "cache", bytes, saved, error: None })?;
        }
    }

    let deadline = tokio::time::Instant::now() + wait;
    while !wanted.is_empty() {
        let delivery = match tokio::time::timeout_at(deadline, deliveries.recv()).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(pending = wanted.len(), "gave up waiting for fetches");
                break;
            }
        };
        if !wanted.accept(&delivery) {
            tracing::debug!(tag = %delivery.tag, identifier = %delivery.identifier, "discarding stale delivery");
            continue;
        }

        let (tag, identifier) = (delivery.tag.as_str(), delivery.identifier.as_str());
        let outcome = match &delivery.result {
            Ok(value) => {
                let saved = save(codec, save_dir, identifier, value)?;
                let bytes = Some(codec.size_of(value));
                Outcome { tag, identifier, source: "network", bytes, saved, error: None }
            }
            Err(e) => Outcome { tag, identifier, source: "network", bytes: None, saved: None, error: Some(e.to_string()) },
        };
        emit(&outcome)?;
    }

    tracing::info!(stats = ?cache.stats(), "lookups finished");
    cache.flush()?;
    cache.close()?;
    Ok(())
}

fn open_disk(config: &AppConfig) -> Result<DiskCache> {
    DiskCache::open(&config.cache_dir, config.app_version, config.values_per_entry, config.disk_max_bytes)
        .with_context(|| format!("opening disk cache at {}", config.cache_dir.display()))
}

/// Print disk tier occupancy as JSON.
pub fn stats(config: &AppConfig) -> Result<()> {
    let disk = open_disk(config)?;
    let report = serde_json::json!({
        "directory": disk.directory().display().to_string(),
        "entries": disk.len(),
        "size": disk.size(),
        "max_size": disk.max_size(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    disk.close()?;
    Ok(())
}

/// Delete the disk tier and everything in it.
pub fn clear(config: &AppConfig) -> Result<()> {
    let disk = open_disk(config)?;
    let entries = disk.len();
    disk.delete()?;
    tracing::info!(directory = %config.cache_dir.display(), entries, "cleared disk cache");
    Ok(())
}

pub fn key(identifier: &str) {
    println!("{}", derive_key(identifier));
}
