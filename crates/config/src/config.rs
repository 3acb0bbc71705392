use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use rangedb_cache::{ResultCacheConfig, Scorer, TtlPolicy};
use rangedb_engine::EngineConfig;
use rangedb_fetch::{Descriptor, FetchConfig, SpeedThresholds, TimeoutTiers};
use rangedb_pages::PageCacheConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const ENV_PREFIX: &str = "RANGEDB_";
const MIN_PAGE_SIZE: u64 = 512;
const MAX_PAGE_SIZE: u64 = 1024 * 1024;
const MAX_CONCURRENCY: usize = 64;
const MAX_RETRIES: u32 = 16;

/// Complete configuration for one database handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub chunking: ChunkingConfig,
    pub timeouts: TimeoutsConfig,
    pub retry: RetryConfig,
    pub probe: ProbeConfig,
    pub progress: ProgressConfig,
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
    pub ttl: TtlConfig,
    pub engine: WorkerConfig,
}

/// Where the database file lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: Option<String>,
    /// Sidecar JSON [`Descriptor`].
    pub descriptor_url: Option<String>,
    /// Extra headers sent with every request.
    pub request_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Power of two between 512 bytes and 1 MiB.
    pub page_size: u64,
    /// Maximum number of range requests in flight.
    pub concurrency: usize,
}
impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { page_size: 64 * 1024, concurrency: 6 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub fast_secs: u64,
    pub normal_secs: u64,
    pub emergency_secs: u64,
    /// Per-query deadline; the emergency tier when unset.
    pub query_secs: Option<u64>,
}
impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self { fast_secs: 45, normal_secs: 120, emergency_secs: 180, query_secs: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further one.
    pub base_backoff_ms: u64,
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_backoff_ms: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub bytes: u64,
    pub fast_bytes_per_sec: f64,
    pub slow_bytes_per_sec: f64,
}
impl Default for ProbeConfig {
    fn default() -> Self {
        let thresholds = SpeedThresholds::default();
        Self { bytes: 16 * 1024, fast_bytes_per_sec: thresholds.fast, slow_bytes_per_sec: thresholds.slow }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub interval_ms: u64,
}
impl Default for ProgressConfig {
    fn default() -> Self {
        Self { interval_ms: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Bytes that must be resident before the first query runs.
    pub critical_prefix: u64,
    /// Bytes prefetched in the background once the handle is usable.
    pub important_prefix: u64,
}
impl Default for LoaderConfig {
    fn default() -> Self {
        Self { critical_prefix: 256 * 1024, important_prefix: 2 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub page_cache_bytes: u64,
    pub memory_bytes: usize,
    pub memory_entries: usize,
    /// Keep results across sessions in a SQLite file.
    pub durable: bool,
    pub durable_bytes: u64,
    /// Defaults to the platform cache directory.
    pub durable_path: Option<PathBuf>,
    pub recency_weight: f64,
    pub frequency_weight: f64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        let results = ResultCacheConfig::default();
        Self {
            page_cache_bytes: PageCacheConfig::default().capacity_bytes,
            memory_bytes: results.memory_bytes,
            memory_entries: results.memory_entries,
            durable: true,
            durable_bytes: results.durable_bytes,
            durable_path: None,
            recency_weight: results.scorer.recency_weight,
            frequency_weight: results.scorer.frequency_weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub static_secs: u64,
    pub derived_secs: u64,
    pub ephemeral_secs: u64,
}
impl Default for TtlConfig {
    fn default() -> Self {
        let policy = TtlPolicy::default();
        Self {
            static_secs: policy.static_ttl.as_secs(),
            derived_secs: policy.derived_ttl.as_secs(),
            ephemeral_secs: policy.ephemeral_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// SQL worker threads.
    pub workers: usize,
}
impl Default for WorkerConfig {
    fn default() -> Self {
        Self { workers: EngineConfig::default().workers }
    }
}

impl Config {
    /// Load configuration from the defaults, then the file at `path` (if
    /// any, format chosen by extension), then `RANGEDB_*` environment
    /// variables. Nested keys use `__`, e.g. `RANGEDB_CHUNKING__PAGE_SIZE`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.is_file() {
                exn::bail!(ErrorKind::Invalid(format!("configuration file {} does not exist", path.display())));
            }
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
                Some("json") => figment.merge(Json::file_exact(path)),
                _ => exn::bail!(ErrorKind::Invalid(format!("unsupported configuration format: {}", path.display()))),
            };
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let page_size = self.chunking.page_size;
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            exn::bail!(ErrorKind::Invalid(format!(
                "chunking.page_size must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.chunking.concurrency) {
            exn::bail!(ErrorKind::Invalid(format!(
                "chunking.concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.chunking.concurrency
            )));
        }
        if self.retry.max_retries > MAX_RETRIES {
            exn::bail!(ErrorKind::Invalid(format!(
                "retry.max_retries must not exceed {MAX_RETRIES}, got {}",
                self.retry.max_retries
            )));
        }
        let timeouts = &self.timeouts;
        if timeouts.fast_secs == 0 || timeouts.query_secs == Some(0) {
            exn::bail!(ErrorKind::Invalid("timeouts must be greater than zero".into()));
        }
        if timeouts.fast_secs > timeouts.normal_secs || timeouts.normal_secs > timeouts.emergency_secs {
            exn::bail!(ErrorKind::Invalid("timeouts must satisfy fast <= normal <= emergency".into()));
        }
        if self.probe.bytes == 0 {
            exn::bail!(ErrorKind::Invalid("probe.bytes must be greater than zero".into()));
        }
        if !(self.probe.slow_bytes_per_sec > 0.0 && self.probe.slow_bytes_per_sec <= self.probe.fast_bytes_per_sec) {
            exn::bail!(ErrorKind::Invalid("probe thresholds must satisfy 0 < slow <= fast".into()));
        }
        if self.loader.critical_prefix > self.loader.important_prefix {
            exn::bail!(ErrorKind::Invalid("loader.critical_prefix must not exceed loader.important_prefix".into()));
        }
        let weights = [self.cache.recency_weight, self.cache.frequency_weight];
        if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            exn::bail!(ErrorKind::Invalid("cache weights must be finite and non-negative".into()));
        }
        if self.engine.workers == 0 {
            exn::bail!(ErrorKind::Invalid("engine.workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Let a sidecar descriptor override the chunking parameters.
    pub fn apply_descriptor(&mut self, descriptor: &Descriptor) -> Result<()> {
        if let Some(page_size) = descriptor.page_size {
            self.chunking.page_size = page_size;
        }
        if let Some(concurrency) = descriptor.concurrency {
            self.chunking.concurrency = concurrency;
        }
        self.validate()
    }

    pub fn timeout_tiers(&self) -> TimeoutTiers {
        TimeoutTiers {
            fast: Duration::from_secs(self.timeouts.fast_secs),
            normal: Duration::from_secs(self.timeouts.normal_secs),
            emergency: Duration::from_secs(self.timeouts.emergency_secs),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            concurrency: self.chunking.concurrency,
            max_retries: self.retry.max_retries,
            base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            tiers: self.timeout_tiers(),
            probe_bytes: self.probe.bytes,
            thresholds: SpeedThresholds { fast: self.probe.fast_bytes_per_sec, slow: self.probe.slow_bytes_per_sec },
        }
    }

    pub fn page_cache_config(&self) -> PageCacheConfig {
        PageCacheConfig {
            page_size: self.chunking.page_size,
            capacity_bytes: self.cache.page_cache_bytes,
            concurrency: self.chunking.concurrency,
        }
    }

    pub fn result_cache_config(&self) -> ResultCacheConfig {
        ResultCacheConfig {
            memory_bytes: self.cache.memory_bytes,
            memory_entries: self.cache.memory_entries,
            durable_bytes: self.cache.durable_bytes,
            ttl: TtlPolicy {
                static_ttl: Duration::from_secs(self.ttl.static_secs),
                derived_ttl: Duration::from_secs(self.ttl.derived_secs),
                ephemeral_ttl: Duration::from_secs(self.ttl.ephemeral_secs),
            },
            scorer: Scorer {
                recency_weight: self.cache.recency_weight,
                frequency_weight: self.cache.frequency_weight,
                ..Scorer::default()
            },
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.engine.workers,
            query_timeout: Duration::from_secs(self.timeouts.query_secs.unwrap_or(self.timeouts.emergency_secs)),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress.interval_ms)
    }

    /// Location of the durable result cache, if one should be used.
    ///
    /// `None` when durability is switched off, or when no path is configured
    /// and the platform has no cache directory.
    pub fn durable_path(&self) -> Option<PathBuf> {
        if !self.cache.durable {
            return None;
        }
        if let Some(path) = &self.cache.durable_path {
            return Some(path.clone());
        }
        ProjectDirs::from("", "", "rangedb").map(|dirs| dirs.cache_dir().join("results.sqlite"))
    }
}
