//! Command-line interface definitions.

mod cache;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use zeptocache::config::CONFIG_FILE_NAME;
use zeptocache::{CacheConfig, CacheContext};

#[derive(Parser, Debug)]
#[command(name = "zeptocache")]
#[command(version)]
#[command(about = "Inspect and maintain a persistent response cache")]
pub(crate) struct Cli {
    /// Cache directory (default: ./.zeptocache)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Config file (default: <cache dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Show hit/miss counters and storage totals
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove expired and corrupt entries now
    Cleanup,
    /// Remove every entry
    Clear,
    /// Look up a cached value
    Get {
        key: String,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Store a value (parsed as JSON, or kept as a string)
    Set {
        key: String,
        value: String,
        #[command(flatten)]
        context: ContextArgs,
        /// TTL override in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Delete an entry by fingerprint or key
    Delete {
        fingerprint_or_key: String,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Show settings, or update them and save to the config file
    Config(SettingsArgs),
    /// Run the background sweeper and reload settings on config changes
    Watch {
        /// Config file poll interval in milliseconds
        #[arg(long, default_value_t = 2_000)]
        poll_ms: u64,
    },
}

/// Request context flags shared by get/set/delete.
#[derive(Args, Debug, Default, Clone)]
pub(crate) struct ContextArgs {
    #[arg(long)]
    project_type: Option<String>,
    /// Only the extension is used
    #[arg(long)]
    file: Option<String>,
    #[arg(long)]
    skill_level: Option<String>,
    #[arg(long)]
    language: Option<String>,
    /// Extra context field as name=value (repeatable)
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
}

impl ContextArgs {
    /// `None` when no context flag was given.
    pub(crate) fn to_context(&self) -> Option<CacheContext> {
        let empty = self.project_type.is_none()
            && self.file.is_none()
            && self.skill_level.is_none()
            && self.language.is_none()
            && self.fields.is_empty();
        if empty {
            return None;
        }
        let mut ctx = CacheContext::new();
        if let Some(v) = &self.project_type {
            ctx = ctx.with_project_type(v);
        }
        if let Some(v) = &self.file {
            ctx = ctx.with_current_file(v);
        }
        if let Some(v) = &self.skill_level {
            ctx = ctx.with_skill_level(v);
        }
        if let Some(v) = &self.language {
            ctx = ctx.with_language(v);
        }
        for (name, value) in &self.fields {
            ctx = ctx.with_field(name, value);
        }
        Some(ctx)
    }
}

#[derive(Args, Debug, Default, Clone)]
pub(crate) struct SettingsArgs {
    #[arg(long)]
    max_size_bytes: Option<u64>,
    #[arg(long)]
    default_ttl_ms: Option<u64>,
    /// 0 disables the background sweeper
    #[arg(long)]
    cleanup_interval_ms: Option<u64>,
    #[arg(long)]
    context_sensitive: Option<bool>,
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("field name must not be empty".to_string());
    }
    Ok((name.to_string(), value.to_string()))
}

/// Resolved config plus the file it was loaded from.
pub(crate) struct Resolved {
    pub config: CacheConfig,
    pub config_path: PathBuf,
}

fn resolve(cli_dir: Option<PathBuf>, cli_config: Option<PathBuf>) -> Result<Resolved> {
    let config_path = cli_config.unwrap_or_else(|| {
        cli_dir
            .clone()
            .or_else(|| {
                std::env::var("ZEPTOCACHE_DIR")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| PathBuf::from(v.trim()))
            })
            .unwrap_or_else(CacheConfig::default_dir)
            .join(CONFIG_FILE_NAME)
    });
    let mut config = CacheConfig::load(Some(&config_path))
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(dir) = cli_dir {
        config.dir = Some(dir);
    }
    Ok(Resolved {
        config,
        config_path,
    })
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let resolved = resolve(cli.dir, cli.config)?;
    match cli.command {
        Commands::Stats { json } => cache::cmd_stats(resolved, json).await,
        Commands::Cleanup => cache::cmd_cleanup(resolved).await,
        Commands::Clear => cache::cmd_clear(resolved).await,
        Commands::Get { key, context } => cache::cmd_get(resolved, &key, &context).await,
        Commands::Set {
            key,
            value,
            context,
            ttl_ms,
        } => cache::cmd_set(resolved, &key, &value, &context, ttl_ms).await,
        Commands::Delete {
            fingerprint_or_key,
            context,
        } => cache::cmd_delete(resolved, &fingerprint_or_key, &context).await,
        Commands::Config(args) => cache::cmd_config(resolved, args).await,
        Commands::Watch { poll_ms } => cache::cmd_watch(resolved, poll_ms).await,
    }
}
