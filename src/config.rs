//! Process-wide paging configuration.
//!
//! Values come from defaults, an optional TOML file and `LARGEIMAGE_*`
//! environment variables, applied in that order.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{PagingError, Result};

const ENV_PREFIX: &str = "LARGEIMAGE_";

/// Tunables of the cache manager and of page sizing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Maximum heap the default meter reports, in bytes.
    pub heap_budget_bytes: u64,
    /// Explicit byte budget per page; derived from the heap budget when unset.
    pub page_bytes: Option<u64>,
    /// Pages that must fit in the heap budget simultaneously when sizing pages.
    pub target_resident_pages: u64,
    /// Usage fraction below which eviction stops and backpressure lifts.
    pub low_watermark: f64,
    /// Usage fraction above which eviction is signalled and callers are throttled.
    pub high_watermark: f64,
    /// Pages popped from the eviction queue per batch.
    pub eviction_batch: usize,
    /// Polls a throttled caller waits before proceeding anyway.
    pub backpressure_polls: u32,
    /// Sleep between backpressure polls in milliseconds.
    pub backpressure_interval_ms: u64,
    /// Pause before retrying when the queue is empty under pressure, in milliseconds.
    pub idle_backoff_ms: u64,
    /// Empty-queue retries before an eviction signal gives up.
    pub idle_retries: u32,
    /// Heap monitor polling interval in milliseconds.
    pub monitor_interval_ms: u64,
    /// Directory for backing files; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            heap_budget_bytes: 1 << 30,
            page_bytes: None,
            target_resident_pages: 50,
            low_watermark: 0.90,
            high_watermark: 0.95,
            eviction_batch: 10,
            backpressure_polls: 20,
            backpressure_interval_ms: 1_000,
            idle_backoff_ms: 100,
            idle_retries: 20,
            monitor_interval_ms: 50,
            temp_dir: None,
        }
    }
}

impl PagingConfig {
    /// Reads a TOML file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| PagingError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Parses a TOML document and validates it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|err| PagingError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the default file if it exists, then applies environment overrides.
    pub fn discover() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load(path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/largeimage/paging.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("largeimage").join("paging.toml"))
    }

    /// Applies `LARGEIMAGE_<FIELD>` overrides looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(v) = var("HEAP_BUDGET_BYTES") {
            self.heap_budget_bytes = parse_env("HEAP_BUDGET_BYTES", &v)?;
        }
        if let Some(v) = var("PAGE_BYTES") {
            self.page_bytes = Some(parse_env("PAGE_BYTES", &v)?);
        }
        if let Some(v) = var("TARGET_RESIDENT_PAGES") {
            self.target_resident_pages = parse_env("TARGET_RESIDENT_PAGES", &v)?;
        }
        if let Some(v) = var("LOW_WATERMARK") {
            self.low_watermark = parse_env("LOW_WATERMARK", &v)?;
        }
        if let Some(v) = var("HIGH_WATERMARK") {
            self.high_watermark = parse_env("HIGH_WATERMARK", &v)?;
        }
        if let Some(v) = var("EVICTION_BATCH") {
            self.eviction_batch = parse_env("EVICTION_BATCH", &v)?;
        }
        if let Some(v) = var("BACKPRESSURE_POLLS") {
            self.backpressure_polls = parse_env("BACKPRESSURE_POLLS", &v)?;
        }
        if let Some(v) = var("BACKPRESSURE_INTERVAL_MS") {
            self.backpressure_interval_ms = parse_env("BACKPRESSURE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("IDLE_BACKOFF_MS") {
            self.idle_backoff_ms = parse_env("IDLE_BACKOFF_MS", &v)?;
        }
        if let Some(v) = var("IDLE_RETRIES") {
            self.idle_retries = parse_env("IDLE_RETRIES", &v)?;
        }
        if let Some(v) = var("MONITOR_INTERVAL_MS") {
            self.monitor_interval_ms = parse_env("MONITOR_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("TEMP_DIR") {
            self.temp_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Rejects inconsistent watermarks and zero-sized batches.
    pub fn validate(&self) -> Result<()> {
        let in_range = |w: f64| w > 0.0 && w <= 1.0;
        if !in_range(self.low_watermark) || !in_range(self.high_watermark) {
            return Err(PagingError::Config(
                "watermarks must lie in (0, 1]".to_string(),
            ));
        }
        if self.low_watermark > self.high_watermark {
            return Err(PagingError::Config(format!(
                "low watermark {} exceeds high watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.eviction_batch == 0 {
            return Err(PagingError::Config("eviction_batch must be positive".to_string()));
        }
        if self.target_resident_pages == 0 {
            return Err(PagingError::Config(
                "target_resident_pages must be positive".to_string(),
            ));
        }
        if self.page_bytes == Some(0) {
            return Err(PagingError::Config("page_bytes must be positive".to_string()));
        }
        Ok(())
    }

    /// Sleep between backpressure polls.
    pub fn backpressure_interval(&self) -> Duration {
        Duration::from_millis(self.backpressure_interval_ms)
    }

    /// Pause before retrying an empty eviction queue.
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Heap monitor polling interval.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PagingError::Config(format!("{ENV_PREFIX}{name}: cannot parse `{raw}`")))
}
