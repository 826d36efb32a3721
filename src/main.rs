//! image-cache-tier: fetch images through a memory + disk LRU cache.
//!
//! Each URL given on the command line is requested through the loader with
//! its own consumer. Results are logged as they arrive, then the loader is
//! shut down and its statistics printed.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use image_cache_tier::config::{Cli, Config};
use image_cache_tier::loader::{ChannelSink, Consumer, Delivery, LoadOutcome, SizeHint, Variant};
use image_cache_tier::ImageLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "image_cache_tier=debug"
    } else {
        "image_cache_tier=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("image-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        cache_root = %config.cache.disk_cache_root().display(),
        memory = config.cache.enable_memory_cache,
        memory_capacity = config.cache.memory_cache_capacity_bytes,
        disk = config.cache.enable_disk_cache,
        disk_capacity = config.cache.disk_cache_capacity_bytes,
        executor = ?config.executor.kind,
        max_in_flight = config.queue.max_in_flight,
        "Configuration loaded"
    );

    let loader = ImageLoader::from_config(&config)?;
    let variant = Variant::rounded(cli.corner_radius, cli.margin);
    let size = SizeHint::new(cli.width, cli.height);

    // One consumer per URL; every consumer reports into the same channel.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumers = HashMap::new();
    let mut pending = 0usize;

    for url in &cli.urls {
        if consumers.contains_key(url) {
            continue;
        }
        let consumer = Consumer::new(ChannelSink::new(url.clone(), tx.clone()));
        match loader.request(url, variant, size, Some(&consumer)) {
            Ok(LoadOutcome::Ready(_)) => {}
            Ok(LoadOutcome::Pending(handle)) => {
                info!(url = %url, request_id = %handle.id(), "Fetch queued");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Request rejected");
                continue;
            }
        }
        pending += 1;
        consumers.insert(url.clone(), consumer);
    }
    drop(tx);

    while pending > 0 {
        let Some(delivery) = rx.recv().await else {
            break;
        };
        pending -= 1;
        match delivery {
            Delivery::Success { tag, bitmap } => info!(
                url = %tag,
                width = bitmap.width(),
                height = bitmap.height(),
                bytes = bitmap.byte_size(),
                "Image ready"
            ),
            Delivery::Failure {
                tag,
                status,
                diagnostic,
            } => error!(url = %tag, status, diagnostic = %diagnostic, "Image failed"),
        }
    }

    loader.shutdown().await;
    let stats = loader.stats().await;
    info!(stats = %serde_json::to_string(&stats)?, "Loader statistics");

    drop(consumers);
    Ok(())
}
