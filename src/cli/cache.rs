//! Cache command handlers.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use zeptocache::{CacheConfig, CacheReport, ResponseCache, SettingsUpdate, SettingsWatcher};

use super::{ContextArgs, Resolved, SettingsArgs};

async fn open(config: CacheConfig) -> Result<ResponseCache<Value>> {
    let dir = config.cache_dir();
    ResponseCache::open(config)
        .await
        .with_context(|| format!("Failed to open cache at {}", dir.display()))
}

/// Handle `zeptocache stats`.
pub(crate) async fn cmd_stats(resolved: Resolved, json: bool) -> Result<()> {
    let cache = open(resolved.config).await?;
    let report = cache.stats();
    cache.destroy().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(cache.dir(), &report);
    }
    Ok(())
}

fn print_report(dir: &Path, report: &CacheReport) {
    let meta = &report.metadata;
    println!("Cache:          {}", dir.display());
    println!("Entries:        {}", meta.total_entries);
    println!(
        "Size:           {} / {} bytes",
        meta.total_size_bytes, meta.settings.max_cache_size_bytes
    );
    println!("Requests:       {}", report.total_requests);
    println!(
        "Hits / misses:  {} / {} ({:.1}% hit rate)",
        report.hits,
        report.misses,
        report.hit_rate * 100.0
    );
    println!("Evictions:      {}", report.evictions);
    println!("Avg latency:    {:.3} ms", report.average_response_time_ms);
    println!("Last cleanup:   {}", format_timestamp(meta.last_cleanup_at));
}

fn format_timestamp(ms: Option<u64>) -> String {
    ms.and_then(|ms| i64::try_from(ms).ok())
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Handle `zeptocache cleanup`.
pub(crate) async fn cmd_cleanup(resolved: Resolved) -> Result<()> {
    let cache = open(resolved.config).await?;
    let report = cache.cleanup().await;
    cache.destroy().await;
    println!(
        "Inspected {} entries: removed {} expired, {} corrupt ({} bytes reclaimed).",
        report.inspected, report.expired, report.corrupt, report.bytes_reclaimed
    );
    Ok(())
}

/// Handle `zeptocache clear`.
pub(crate) async fn cmd_clear(resolved: Resolved) -> Result<()> {
    let cache = open(resolved.config).await?;
    cache.clear().await;
    cache.destroy().await;
    println!("Cleared all cache entries.");
    Ok(())
}

/// Handle `zeptocache get`.
pub(crate) async fn cmd_get(resolved: Resolved, key: &str, context: &ContextArgs) -> Result<()> {
    let cache = open(resolved.config).await?;
    let ctx = context.to_context();
    let value = cache.get(key, ctx.as_ref()).await;
    cache.destroy().await;
    match value {
        Some(Value::String(s)) => println!("{s}"),
        Some(other) => println!("{}", serde_json::to_string_pretty(&other)?),
        None => {
            eprintln!("Not cached.");
            std::process::exit(1);
        }
    }
    Ok(())
}

/// Handle `zeptocache set`.
pub(crate) async fn cmd_set(
    resolved: Resolved,
    key: &str,
    raw_value: &str,
    context: &ContextArgs,
    ttl_ms: Option<u64>,
) -> Result<()> {
    let cache = open(resolved.config).await?;
    let value = parse_value(raw_value);
    let ctx = context.to_context();
    cache
        .set(key, &value, ctx.as_ref(), ttl_ms.map(Duration::from_millis))
        .await;
    let fingerprint = cache.fingerprint(key, ctx.as_ref());
    cache.destroy().await;
    println!("Stored under {fingerprint}");
    Ok(())
}

/// JSON when it parses, otherwise the raw string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Handle `zeptocache delete`.
pub(crate) async fn cmd_delete(
    resolved: Resolved,
    fingerprint_or_key: &str,
    context: &ContextArgs,
) -> Result<()> {
    let cache = open(resolved.config).await?;
    let removed = match context.to_context() {
        Some(ctx) => cache.delete_with_context(fingerprint_or_key, Some(&ctx)).await,
        None => cache.delete(fingerprint_or_key).await,
    };
    cache.destroy().await;
    if removed {
        println!("Deleted.");
    } else {
        println!("No matching entry.");
    }
    Ok(())
}

/// Handle `zeptocache config`.
pub(crate) async fn cmd_config(resolved: Resolved, args: SettingsArgs) -> Result<()> {
    let update = SettingsUpdate {
        max_cache_size_bytes: args.max_size_bytes,
        default_ttl_ms: args.default_ttl_ms,
        cleanup_interval_ms: args.cleanup_interval_ms,
        context_sensitive: args.context_sensitive,
    };
    let Resolved {
        mut config,
        config_path,
    } = resolved;

    if update == SettingsUpdate::default() {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let cache = open(config.clone()).await?;
    let applied = cache.update_settings(update).await;
    let settings = cache.settings();
    cache.destroy().await;
    applied.context("Invalid settings")?;

    config.settings = settings;
    save_config(&config, &config_path)?;
    println!("Saved settings to {}", config_path.display());
    println!("{}", serde_json::to_string_pretty(&config.settings)?);
    Ok(())
}

fn save_config(config: &CacheConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}

/// Handle `zeptocache watch`.
pub(crate) async fn cmd_watch(resolved: Resolved, poll_ms: u64) -> Result<()> {
    let cache = open(resolved.config).await?;
    let (settings_tx, mut settings_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = SettingsWatcher::new(resolved.config_path, Duration::from_millis(poll_ms));
    let watcher_task = tokio::spawn(watcher.watch(settings_tx, shutdown_rx));

    info!(
        interval_ms = cache.settings().cleanup_interval_ms,
        "Watching cache; press Ctrl-C to stop"
    );
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            Some(settings) = settings_rx.recv() => {
                if let Err(e) = cache.update_settings(SettingsUpdate::from(&settings)).await {
                    warn!(error = %e, "Ignoring reloaded settings");
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = watcher_task.await;
    cache.destroy().await;
    Ok(())
}
