//! aplfs — serve an APL query service as an NFSv3 filesystem.
//!
//! Paths are queries: listing directories browses datasets and fields,
//! reading a file under `<dataset>/q/` compiles the path into a pipeline
//! query and returns the result, and `/_queries/<slot>/apl` accepts raw APL.
//!
//! Usage:
//!   aplfs --url https://api.example.com --token xapl-... --listen 127.0.0.1:11111

mod adapter;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nfsserve::tcp::{NFSTcp, NFSTcpListener};
use tracing::{error, info, warn};

use aplfs_core::query::Executor;
use aplfs_core::{cache::ByteCache, Config, HttpClient, QueryService, Vfs};

use crate::adapter::AplFs;

#[derive(Parser)]
#[command(name = "aplfs")]
#[command(about = "Serve an APL query service as a read-mostly NFS filesystem")]
struct Args {
    /// NFS listen address
    #[arg(long, env = "APLFS_LISTEN", default_value = "127.0.0.1:11111")]
    listen: String,

    /// Default range for queries (ago duration)
    #[arg(long, env = "APLFS_DEFAULT_RANGE", default_value = "1h")]
    default_range: String,

    /// Default row limit when not specified (0 disables)
    #[arg(long, env = "APLFS_DEFAULT_LIMIT", default_value_t = 10_000)]
    default_limit: usize,

    /// Maximum row limit allowed (0 disables)
    #[arg(long, env = "APLFS_MAX_LIMIT", default_value_t = 100_000)]
    max_limit: usize,

    /// Maximum allowed range duration (0s disables)
    #[arg(long, env = "APLFS_MAX_RANGE", default_value = "24h")]
    max_range: humantime::Duration,

    /// Query result cache TTL (0s means no expiry)
    #[arg(long, env = "APLFS_CACHE_TTL", default_value = "10m")]
    cache_ttl: humantime::Duration,

    /// Dataset and field catalog TTL
    #[arg(long, env = "APLFS_METADATA_TTL", default_value = "10m")]
    metadata_ttl: humantime::Duration,

    /// Max cache entries (0 disables)
    #[arg(long, env = "APLFS_CACHE_MAX_ENTRIES", default_value_t = 256)]
    cache_max_entries: usize,

    /// Max cache size in bytes (0 disables)
    #[arg(long, env = "APLFS_CACHE_MAX_BYTES", default_value_t = 50 << 20)]
    cache_max_bytes: usize,

    /// Max in-memory result size before spilling to disk
    #[arg(long, env = "APLFS_MAX_IN_MEMORY_BYTES", default_value_t = 8 << 20)]
    max_in_memory_bytes: usize,

    /// Directory for the persistent result cache
    #[arg(long, env = "APLFS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory for persisted raw queries
    #[arg(long, env = "APLFS_QUERY_DIR")]
    query_dir: Option<PathBuf>,

    /// Temporary directory for large result files
    #[arg(long, env = "APLFS_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Sample size for sample.ndjson
    #[arg(long, env = "APLFS_SAMPLE_LIMIT", default_value_t = 100)]
    sample_limit: usize,

    /// Inject the default range and row cap into raw slot queries instead of
    /// running them verbatim
    #[arg(long, env = "APLFS_RAW_QUERY_DEFAULTS")]
    raw_query_defaults: bool,

    /// Upstream API base URL
    #[arg(long, env = "APLFS_URL")]
    url: String,

    /// Upstream API token
    #[arg(long, env = "APLFS_TOKEN")]
    token: String,

    /// Upstream organization id
    #[arg(long, env = "APLFS_ORG", default_value = "")]
    org: String,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            listen_addr: self.listen,
            default_range: self.default_range,
            default_limit: self.default_limit,
            max_limit: self.max_limit,
            max_range: self.max_range.into(),
            cache_ttl: self.cache_ttl.into(),
            metadata_ttl: self.metadata_ttl.into(),
            max_cache_entries: self.cache_max_entries,
            max_cache_bytes: self.cache_max_bytes,
            max_in_memory_bytes: self.max_in_memory_bytes,
            cache_dir: self.cache_dir.or(defaults.cache_dir),
            query_dir: self.query_dir.or(defaults.query_dir),
            temp_dir: self.temp_dir,
            sample_limit: self.sample_limit,
            raw_query_defaults: self.raw_query_defaults,
            upstream_url: self.url,
            upstream_token: self.token,
            upstream_org: self.org,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Args::parse().into_config();
    if let Err(err) = config.validate() {
        error!(%err, "invalid configuration");
        std::process::exit(1);
    }

    if let Err(err) = run(config).await {
        error!(%err, "server error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client: Arc<dyn QueryService> = Arc::new(HttpClient::new(
        &config.upstream_url,
        &config.upstream_token,
        &config.upstream_org,
    )?);

    let cache = Arc::new(ByteCache::new(
        config.cache_ttl,
        config.max_cache_entries,
        config.max_cache_bytes,
        config.cache_dir.clone(),
    ));
    let executor = Arc::new(Executor::new(
        Arc::clone(&client),
        cache,
        config.default_range.clone(),
        config.default_limit,
        config.max_cache_bytes,
        config.max_in_memory_bytes,
        config.temp_dir.clone(),
    ));

    let listen_addr = config.listen_addr.clone();
    let vfs = Arc::new(Vfs::new(config, Arc::clone(&client), executor));

    // Verify credentials and warm the dataset catalog off the hot path.
    {
        let client = Arc::clone(&client);
        let vfs = Arc::clone(&vfs);
        tokio::task::spawn_blocking(move || {
            match client.current_user() {
                Ok(user) => info!(user = %user.name, email = %user.email, "authenticated"),
                Err(err) => warn!(%err, "could not verify upstream credentials"),
            }
            if let Err(err) = vfs.warm_datasets() {
                warn!(%err, "dataset prefetch failed");
            }
        });
    }

    let listener = NFSTcpListener::bind(&listen_addr, AplFs::new(vfs)).await?;
    info!(addr = %listen_addr, "NFS server listening");
    info!("mount with: sudo mount -t nfs -o vers=3,tcp,port={port},mountport={port} 127.0.0.1:/ /mnt/aplfs",
        port = listen_addr.rsplit(':').next().unwrap_or("11111"));

    tokio::select! {
        result = listener.handle_forever() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
