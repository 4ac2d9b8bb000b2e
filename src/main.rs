//! `smart-cached`: runs the cache engine against webhook events read from stdin

use anyhow::{Context, Result};
use bridge_desktop::{EmbyCatalog, RsyncTransfer, TokioFileSystem};
use bridge_traits::MediaCatalog;
use clap::Parser;
use core_cache::{PlaybackEvent, SmartCache, WebhookPayload};
use core_runtime::logging::{init_logging, parse_log_level, LogFormat, LoggingConfig};
use core_runtime::{EngineConfig, PathMapping};
use core_store::{create_pool, CacheStore, DatabaseConfig, SqliteCacheStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "smart-cached", version, about = "Playback-driven media cache daemon")]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, short)]
    config: PathBuf,

    /// Log output format: pretty, json or compact
    #[arg(long)]
    log_format: Option<String>,

    /// Minimum log level, overrides the settings file
    #[arg(long)]
    log_level: Option<String>,

    /// Extra media-server path rewrites as `from:to,from:to`
    #[arg(long)]
    path_map: Option<String>,
}

fn logging_config(cli: &Cli, config: &EngineConfig) -> Result<LoggingConfig> {
    let mut logging = LoggingConfig::default();
    if let Some(format) = cli.log_format.as_deref().or(config.log_format.as_deref()) {
        logging = logging.with_format(format.parse::<LogFormat>()?);
    }
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    Ok(logging.with_level(parse_log_level(level)?))
}

async fn build_engine(config: EngineConfig) -> Result<SmartCache> {
    let pool = create_pool(DatabaseConfig::new(&config.database_path))
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let store: Arc<dyn CacheStore> =
        Arc::new(SqliteCacheStore::new(pool).with_history_limit(config.history_limit));

    let catalog = match (&config.media_server_url, &config.media_server_api_key) {
        (Some(url), Some(key)) => {
            let catalog: Arc<dyn MediaCatalog> = Arc::new(EmbyCatalog::new(url, key)?);
            Some(catalog)
        }
        _ => None,
    };

    let mut builder = SmartCache::builder(
        config,
        store,
        Arc::new(TokioFileSystem::new()),
        Arc::new(RsyncTransfer::new()),
    );
    if let Some(catalog) = catalog {
        builder = builder.with_catalog(catalog);
    }
    Ok(builder.build()?)
}

async fn handle_line(engine: &SmartCache, line: &str) -> core_cache::Result<()> {
    let payload = WebhookPayload::from_json(line)?;
    let event = PlaybackEvent::try_from(payload)?;
    engine.on_playback_event(event).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(list) = cli.path_map.as_deref() {
        config.path_map.extend(PathMapping::parse_list(list)?);
    }
    init_logging(logging_config(&cli, &config)?)?;

    if !config.enabled {
        warn!("Caching disabled in settings; existing items are still maintained");
    }

    let engine = build_engine(config).await?;
    let report = engine.reconcile().await?;
    info!(?report, "Startup reconciliation finished");

    let shutdown = CancellationToken::new();
    let runner = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match handle_line(&engine, &line).await {
                    Ok(()) => debug!("Event applied"),
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Engine stopped");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Ignoring webhook event"),
                },
                Ok(None) => {
                    info!("Event stream closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read events");
                    break;
                }
            },
        }
    }

    shutdown.cancel();
    runner.await.context("scheduler task panicked")??;
    Ok(())
}
