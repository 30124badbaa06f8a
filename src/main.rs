//! The packrat binary: parse flags, load configuration, start the forwarder.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use packrat::config::CacheConfig;
use packrat::gateway::Gateway;
use packrat::server::Server;

/// Local caching forwarder: fetch once, replay from disk until expiry.
#[derive(Parser, Debug)]
#[command(name = "packrat")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory the cache namespace lives under
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Seconds before a cache entry expires (0 keeps entries forever)
    #[arg(long)]
    ttl: Option<u64>,

    /// Store cache entries gzip-compressed
    #[arg(long)]
    compress: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = resolve_config(&args)?;

    let gateway = Gateway::new(&config)
        .await
        .context("initializing cache store and upstream client")?;

    info!(
        cache_dir = %config.cache_dir().display(),
        compress = config.compress,
        "cache ready"
    );
    if config.ttl_seconds == 0 {
        info!("cache entries never expire");
    } else {
        info!(ttl_seconds = config.ttl_seconds, "cache entries expire");
    }

    let server = Server::bind(format!("0.0.0.0:{}", config.port))
        .await
        .context("binding listener")?;
    info!(address = %server.local_addr(), "packrat ready");

    server
        .run(move |request| {
            let gateway = gateway.clone();
            async move { gateway.handle(request).await }
        })
        .await?;

    Ok(())
}

/// Merges the configuration layers: defaults, then the optional file, then
/// any explicit command-line flags.
fn resolve_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_root = dir.clone();
    }
    if let Some(ttl) = args.ttl {
        config.ttl_seconds = ttl;
    }
    if args.compress {
        config.compress = true;
    }

    config.validate().map_err(|reason| anyhow::anyhow!(reason))?;
    Ok(config)
}
