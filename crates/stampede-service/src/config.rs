use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::TtlRange;
use crate::store::{MAX_TTL, RedisStoreConfig, StoreConfig};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for stampede.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stampede".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The stampede configuration file.
///
/// The upstream pool and fan-out fields also accept the capitalized spelling (`URLs`,
/// `MinTimeout`, ...) of older deployment files.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The shared store holding cached results and locks.
    pub store: Option<StoreConfig>,

    /// Shorthand for a redis `store`.
    #[serde(alias = "RedisURL")]
    pub redis_url: Option<String>,

    /// The pool of upstream URLs each stream draws from.
    #[serde(alias = "URLs")]
    pub urls: Vec<String>,

    /// The lower bound, in seconds, for the lifetime of cached results.
    #[serde(alias = "MinTimeout")]
    pub min_timeout: u64,

    /// The upper bound, in seconds, for the lifetime of cached results.
    #[serde(alias = "MaxTimeout")]
    pub max_timeout: u64,

    /// The number of concurrent fetches each stream fans out into.
    #[serde(alias = "NumberOfRequests")]
    pub number_of_requests: usize,

    /// The timeout for a single upstream fetch.
    ///
    /// This is also the lifetime of lock records, and the longest time a caller waits for
    /// somebody else's fetch before fetching on its own.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How often a waiting caller checks whether the lock it waits on was released.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How many times a caller goes back to the cache after seeing a lock released before it
    /// gives up on coordination and fetches on its own.
    pub max_lock_rounds: usize,
}

impl Config {
    /// The effective store configuration.
    ///
    /// An explicit `store` wins over `redis_url`. Without either, the in-process store is used.
    pub fn store(&self) -> StoreConfig {
        match (&self.store, &self.redis_url) {
            (Some(store), _) => store.clone(),
            (None, Some(url)) => StoreConfig::Redis(RedisStoreConfig::new(url.clone())),
            (None, None) => StoreConfig::Memory,
        }
    }

    pub fn cache_ttl(&self) -> TtlRange {
        TtlRange::new(self.min_timeout, self.max_timeout)
    }

    /// Checks the invariants the services rely on.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            anyhow::bail!("`urls` must contain at least one URL");
        }
        if self.min_timeout > self.max_timeout {
            anyhow::bail!(
                "`min_timeout` ({}) must not exceed `max_timeout` ({})",
                self.min_timeout,
                self.max_timeout
            );
        }
        if self.max_timeout > MAX_TTL.as_secs() {
            anyhow::bail!(
                "`max_timeout` ({}) must not exceed one year ({} seconds)",
                self.max_timeout,
                MAX_TTL.as_secs()
            );
        }
        if self.number_of_requests == 0 {
            anyhow::bail!("`number_of_requests` must be positive");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("`request_timeout` must be positive");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("`poll_interval` must be positive");
        }
        if self.max_lock_rounds == 0 {
            anyhow::bail!("`max_lock_rounds` must be positive");
        }
        Ok(())
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            store: None,
            redis_url: None,
            urls: Vec::new(),
            min_timeout: 10,
            max_timeout: 30,
            number_of_requests: 10,
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_lock_rounds: 3,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
