//! Engine configuration.
//!
//! All knobs have programmatic defaults; the environment surface overlays
//! them. Nothing here is global state: configuration is parsed once and
//! passed to the components that need it.

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use tracing::debug;
use url::Url;

/// Default cache directory, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = ".builder-cache";

/// Cache sizing and remote tier configuration.
#[derive(Clone, Debug, Builder)]
pub struct CacheConfig {
    /// Root directory for the CAS, index files, and incremental entries.
    #[builder(into, default = PathBuf::from(DEFAULT_CACHE_DIR))]
    pub root: PathBuf,

    /// Evict LRU entries once total blob bytes exceed this.
    pub max_size: Option<u64>,

    /// Evict LRU entries once the entry count exceeds this.
    pub max_entries: Option<usize>,

    /// Expire entries older than this.
    #[builder(default = Duration::from_secs(7 * 24 * 60 * 60))]
    pub max_age: Duration,

    /// Expire failed-action entries older than this. Failures are cached to
    /// short-circuit repeated identical attempts, but only briefly.
    #[builder(default = Duration::from_secs(60 * 60))]
    pub failed_max_age: Duration,

    /// Remote tier, if one is configured.
    pub remote: Option<RemoteConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Remote cache tier configuration.
#[derive(Clone, Debug, Builder)]
pub struct RemoteConfig {
    /// Base URL of the relay service.
    pub url: Url,

    /// Whether lookups consult the remote at all.
    #[builder(default = true)]
    pub enabled: bool,

    /// Whether local updates are pushed to the remote.
    #[builder(default = true)]
    pub push: bool,

    /// Whether blob bodies are zstd-compressed on the wire.
    #[builder(default)]
    pub compress: bool,

    /// Per-request timeout.
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
}

/// Execution configuration.
#[derive(Clone, Debug, Builder)]
pub struct ExecConfig {
    /// Worker thread count; 0 selects the number of hardware threads.
    #[builder(default)]
    pub workers: usize,

    /// Continue past failures, skipping only affected dependents.
    #[builder(default)]
    pub keep_going: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExecConfig {
    /// The effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

impl CacheConfig {
    /// Build configuration from the `BUILDER_*` environment surface.
    ///
    /// Unset variables keep their defaults; set-but-malformed variables are
    /// errors rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::builder().build();

        if let Some(dir) = var("BUILDER_CACHE_DIR") {
            config.root = PathBuf::from(dir);
        }

        if let Some(raw) = var("BUILDER_CACHE_MAX_SIZE") {
            let bytes = raw
                .parse::<u64>()
                .with_context(|| format!("parse BUILDER_CACHE_MAX_SIZE: {raw:?}"))?;
            config.max_size = Some(bytes);
        }
        if let Some(raw) = var("BUILDER_CACHE_MAX_ENTRIES") {
            let count = raw
                .parse::<usize>()
                .with_context(|| format!("parse BUILDER_CACHE_MAX_ENTRIES: {raw:?}"))?;
            config.max_entries = Some(count);
        }
        if let Some(raw) = var("BUILDER_CACHE_MAX_AGE_DAYS") {
            let days = raw
                .parse::<u64>()
                .with_context(|| format!("parse BUILDER_CACHE_MAX_AGE_DAYS: {raw:?}"))?;
            config.max_age = Duration::from_secs(days * 24 * 60 * 60);
        }

        if let Some(raw) = var("BUILDER_REMOTE_CACHE_URL") {
            let url = Url::parse(&raw)
                .with_context(|| format!("parse BUILDER_REMOTE_CACHE_URL: {raw:?}"))?;
            let mut remote = RemoteConfig::builder().url(url).build();
            if let Some(raw) = var("BUILDER_REMOTE_CACHE_ENABLED") {
                remote.enabled = parse_bool(&raw, "BUILDER_REMOTE_CACHE_ENABLED")?;
            }
            if let Some(raw) = var("BUILDER_REMOTE_CACHE_PUSH") {
                remote.push = parse_bool(&raw, "BUILDER_REMOTE_CACHE_PUSH")?;
            }
            if let Some(raw) = var("BUILDER_REMOTE_CACHE_COMPRESS") {
                remote.compress = parse_bool(&raw, "BUILDER_REMOTE_CACHE_COMPRESS")?;
            }
            config.remote = Some(remote);
        }

        debug!(?config, "cache configuration");
        Ok(config)
    }
}

impl ExecConfig {
    /// Build configuration from the `BUILDER_*` environment surface.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = var("BUILDER_WORKERS") {
            config.workers = raw
                .parse::<usize>()
                .with_context(|| format!("parse BUILDER_WORKERS: {raw:?}"))?;
        }
        debug!(?config, "exec configuration");
        Ok(config)
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_bool(raw: &str, name: &str) -> Result<bool> {
    match raw {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => color_eyre::eyre::bail!("parse {name}: expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        pretty_assert_eq!(config.root, PathBuf::from(DEFAULT_CACHE_DIR));
        pretty_assert_eq!(config.max_age, Duration::from_secs(7 * 24 * 60 * 60));
        assert!(config.remote.is_none());
        assert!(config.max_size.is_none());
    }

    #[test]
    fn worker_count_auto() {
        let config = ExecConfig::default();
        assert!(config.worker_count() >= 1);

        let config = ExecConfig::builder().workers(3).build();
        pretty_assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("true", "X").unwrap());
        assert!(parse_bool("1", "X").unwrap());
        assert!(!parse_bool("off", "X").unwrap());
        assert!(parse_bool("maybe", "X").is_err());
    }
}
