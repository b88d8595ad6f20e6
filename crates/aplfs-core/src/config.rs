use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime configuration for the filesystem and its subsystems.
///
/// Every field has a CLI flag and `APLFS_*` environment variable in the
/// server binary. A zero duration or zero cap disables the corresponding
/// limit.
#[derive(Clone, Debug)]
pub struct Config {
    /// NFS listen address, `host:port`.
    pub listen_addr: String,
    /// Duration passed to `ago()` when a query has no explicit range.
    pub default_range: String,
    /// Row cap appended when a query has no explicit limit. 0 disables.
    pub default_limit: usize,
    /// Upper bound on `limit`/`top` values. 0 disables.
    pub max_limit: usize,
    /// Upper bound on query time ranges. Zero disables.
    pub max_range: Duration,
    /// TTL for cached query results. Zero means entries never expire.
    pub cache_ttl: Duration,
    /// TTL for the dataset and field catalogs.
    pub metadata_ttl: Duration,
    /// Result cache entry cap. 0 disables.
    pub max_cache_entries: usize,
    /// Result cache byte cap. 0 disables.
    pub max_cache_bytes: usize,
    /// Threshold above which results spill to a temp file.
    pub max_in_memory_bytes: usize,
    /// Directory for the persistent result cache and metadata snapshots.
    pub cache_dir: Option<PathBuf>,
    /// Directory holding `<slot>.apl` files.
    pub query_dir: Option<PathBuf>,
    /// Directory for spill files. Defaults to the OS temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Row count for `sample.ndjson`.
    pub sample_limit: usize,
    /// When true, raw slot queries get the default range and row cap
    /// injected instead of running verbatim.
    pub raw_query_defaults: bool,

    pub upstream_url: String,
    pub upstream_token: String,
    pub upstream_org: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11111".to_string(),
            default_range: "1h".to_string(),
            default_limit: 10_000,
            max_limit: 100_000,
            max_range: Duration::from_secs(24 * 60 * 60),
            cache_ttl: Duration::from_secs(10 * 60),
            metadata_ttl: Duration::from_secs(10 * 60),
            max_cache_entries: 256,
            max_cache_bytes: 50 << 20,
            max_in_memory_bytes: 8 << 20,
            cache_dir: default_state_dir("cache"),
            query_dir: default_state_dir("queries"),
            temp_dir: None,
            sample_limit: 100,
            raw_query_defaults: false,
            upstream_url: String::new(),
            upstream_token: String::new(),
            upstream_org: String::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Config("listen_addr must not be empty".to_string()));
        }
        if self.default_range.is_empty() {
            return Err(Error::Config("default_range must not be empty".to_string()));
        }
        if humantime::parse_duration(&self.default_range).is_err() {
            return Err(Error::Config(format!(
                "default_range is not a valid duration: {:?}",
                self.default_range
            )));
        }
        if self.max_in_memory_bytes == 0 {
            return Err(Error::Config(
                "max_in_memory_bytes must be > 0".to_string(),
            ));
        }
        if self.sample_limit == 0 {
            return Err(Error::Config("sample_limit must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Per-user state directory, `~/.config/aplfs/<leaf>` on unix. Falls back to
/// a relative directory when no home is available.
fn default_state_dir(leaf: &str) -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")));
    match base {
        Some(base) => Some(base.join("aplfs").join(leaf)),
        None => Some(PathBuf::from(format!("aplfs-{leaf}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_default_range() {
        let cfg = Config {
            default_range: "soon".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_spill_threshold() {
        let cfg = Config {
            max_in_memory_bytes: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
