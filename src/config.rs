//! Backend-level configuration.
//!
//! The JSON document handed to `init_backend_with_config` is parsed once into a
//! [`serde_json::Value`], each section is deserialized into a `Raw*` struct of
//! optional fields, and [`BackendConfig::from_value`] then applies the
//! validation table below. Nothing here ever fails: bad input is logged and
//! the default for that field (or section) is kept.
//!
//! | key | default | accepted |
//! |---|---|---|
//! | `backend.max_sessions` | 100 | 1..=10000 |
//! | `backend.idle_timeout_ms` | 300000 | 1000..=86400000 |
//! | `backend.auto_cleanup` | true | |
//! | `backend.max_concurrent` | 8 | 1..=256 |
//! | `backend.queue_size` | 50 | 1..=10000 |
//! | `backend.default_task_timeout_ms` | 30000 | 1000..=600000 |
//! | `backend.priority_scheduling_enabled` | true | |
//! | `backend.fair_scheduling_enabled` | false | rotates sessions within a tier |
//! | `backend.auto_queue_cleanup` | true | |
//! | `backend.queue_warning_threshold` | 40 | <= reject |
//! | `backend.queue_reject_threshold` | 50 | <= queue_size |
//! | `memory_policy.context_shifting` | true | |
//! | `memory_policy.cache_strategy` | lru | lru, fifo, smart |
//! | `memory_policy.max_cache_tokens` | 10000 | 1024..=1000000 |
//! | `memory_policy.n_keep_tokens` | 256 | 64..=2048 |
//! | `memory_policy.n_discard_tokens` | 0 (auto) | |
//! | `memory_policy.memory_pressure_threshold` | 0.85 | 0.5..=0.95 |
//! | `memory_policy.max_memory_mb` | 0 (unlimited) | 0 or 128..=32768 |
//! | `memory_policy.cache_deletion_strategy` | cache_strategy | lru, fifo, smart |
//! | `logging.level` | info | debug, info, warn, error, fatal |
//! | `logging.timestamps` / `logging.colors` | true / false | |
//! | `performance.batch_size` | 512 | 1..=2048 |
//!
//! Each section may be given nested (`{"backend": {...}}`) or, for older
//! callers, flat at the document root. The nested form wins when present.

pub mod model;
pub mod runtime;

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackendConfig {
    pub backend: BackendLimits,
    pub memory: MemoryPolicy,
    pub logging: LoggingConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendLimits {
    pub max_sessions: usize,
    pub idle_timeout_ms: u64,
    pub auto_cleanup: bool,
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub default_task_timeout_ms: u64,
    pub priority_scheduling_enabled: bool,
    pub fair_scheduling_enabled: bool,
    pub auto_queue_cleanup: bool,
    pub queue_warning_threshold: usize,
    pub queue_reject_threshold: usize,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout_ms: 300_000,
            auto_cleanup: true,
            max_concurrent: 8,
            queue_size: 50,
            default_task_timeout_ms: 30_000,
            priority_scheduling_enabled: true,
            fair_scheduling_enabled: false,
            auto_queue_cleanup: true,
            queue_warning_threshold: 40,
            queue_reject_threshold: 50,
        }
    }
}

impl BackendLimits {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Lru,
    Fifo,
    Smart,
}

impl FromStr for CacheStrategy {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lru" => Ok(Self::Lru),
            "fifo" => Ok(Self::Fifo),
            "smart" => Ok(Self::Smart),
            other => Err(BackendError::InvalidArgument(format!(
                "unknown cache strategy '{}' (expected lru, fifo or smart)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPolicy {
    pub context_shifting: bool,
    pub cache_strategy: CacheStrategy,
    pub max_cache_tokens: u32,
    pub n_keep_tokens: u32,
    /// 0 discards half of the shiftable window.
    pub n_discard_tokens: u32,
    pub memory_pressure_threshold: f64,
    pub enable_partial_cache_deletion: bool,
    pub enable_token_cache_reuse: bool,
    pub cache_deletion_strategy: Option<CacheStrategy>,
    /// 0 means unlimited; pressure never triggers.
    pub max_memory_mb: u64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            context_shifting: true,
            cache_strategy: CacheStrategy::Lru,
            max_cache_tokens: 10_000,
            n_keep_tokens: 256,
            n_discard_tokens: 0,
            memory_pressure_threshold: 0.85,
            enable_partial_cache_deletion: true,
            enable_token_cache_reuse: true,
            cache_deletion_strategy: None,
            max_memory_mb: 0,
        }
    }
}

impl MemoryPolicy {
    /// Strategy used by pressure remediation and cache trimming.
    pub fn deletion_strategy(&self) -> CacheStrategy {
        self.cache_deletion_strategy.unwrap_or(self.cache_strategy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl FromStr for LogLevel {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(BackendError::InvalidArgument(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub enable_debug: bool,
    pub timestamps: bool,
    pub colors: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_debug: false,
            timestamps: true,
            colors: false,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceConfig {
    /// Prefill a prompt in one forward pass when it fits in `batch_size`.
    pub batch_processing: bool,
    pub batch_size: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_processing: true,
            batch_size: 512,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawBackendLimits {
    max_sessions: Option<i64>,
    idle_timeout_ms: Option<i64>,
    auto_cleanup: Option<bool>,
    max_concurrent: Option<i64>,
    queue_size: Option<i64>,
    default_task_timeout_ms: Option<i64>,
    priority_scheduling_enabled: Option<bool>,
    fair_scheduling_enabled: Option<bool>,
    auto_queue_cleanup: Option<bool>,
    queue_warning_threshold: Option<i64>,
    queue_reject_threshold: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMemoryPolicy {
    context_shifting: Option<bool>,
    cache_strategy: Option<String>,
    max_cache_tokens: Option<i64>,
    n_keep_tokens: Option<i64>,
    n_discard_tokens: Option<i64>,
    memory_pressure_threshold: Option<f64>,
    enable_partial_cache_deletion: Option<bool>,
    enable_token_cache_reuse: Option<bool>,
    cache_deletion_strategy: Option<String>,
    max_memory_mb: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    level: Option<String>,
    enable_debug: Option<bool>,
    timestamps: Option<bool>,
    colors: Option<bool>,
    file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPerformance {
    batch_processing: Option<bool>,
    batch_size: Option<i64>,
}

impl BackendConfig {
    /// Parses the backend JSON. `None`, empty input and malformed JSON all
    /// yield the defaults.
    pub fn from_json(raw: Option<&str>) -> Self {
        let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
            debug!("no backend config supplied, using defaults");
            return Self::default();
        };

        match serde_json::from_str::<Value>(text) {
            Ok(root) => Self::from_value(&root),
            Err(err) => {
                warn!(error = %err, "backend config is not valid JSON, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_value(root: &Value) -> Self {
        let memory_key = if root.get("memory_policy").is_some_and(Value::is_object) {
            "memory_policy"
        } else {
            "memory"
        };

        Self {
            backend: build_limits(read_section(root, "backend")),
            memory: build_memory(read_section(root, memory_key)),
            logging: build_logging(read_section(root, "logging")),
            performance: build_performance(read_section(root, "performance")),
        }
    }
}

/// The nested object named `key` when present, otherwise the root itself.
pub(crate) fn section<'a>(root: &'a Value, key: &str) -> &'a Value {
    match root.get(key) {
        Some(nested) if nested.is_object() => nested,
        _ => root,
    }
}

pub(crate) fn read_section<T: DeserializeOwned + Default>(root: &Value, key: &str) -> T {
    match T::deserialize(section(root, key)) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(section = key, error = %err, "malformed config section, keeping defaults");
            T::default()
        }
    }
}

pub(crate) fn checked<T>(key: &str, value: Option<T>, range: RangeInclusive<T>, default: T) -> T
where
    T: PartialOrd + Display + Copy,
{
    match value {
        Some(v) if range.contains(&v) => v,
        Some(v) => {
            warn!(
                key,
                value = %v,
                min = %range.start(),
                max = %range.end(),
                "config value out of range, keeping default {}",
                default
            );
            default
        }
        None => default,
    }
}

fn checked_usize(key: &str, value: Option<i64>, range: RangeInclusive<i64>, default: usize) -> usize {
    checked(key, value, range, default as i64) as usize
}

fn parse_strategy(key: &str, value: Option<String>) -> Option<CacheStrategy> {
    let raw = value?;
    match raw.parse() {
        Ok(strategy) => Some(strategy),
        Err(err) => {
            warn!(key, error = %err, "ignoring cache strategy");
            None
        }
    }
}

fn build_limits(raw: RawBackendLimits) -> BackendLimits {
    let d = BackendLimits::default();
    let mut limits = BackendLimits {
        max_sessions: checked_usize("max_sessions", raw.max_sessions, 1..=10_000, d.max_sessions),
        idle_timeout_ms: checked("idle_timeout_ms", raw.idle_timeout_ms, 1_000..=86_400_000, d.idle_timeout_ms as i64)
            as u64,
        auto_cleanup: raw.auto_cleanup.unwrap_or(d.auto_cleanup),
        max_concurrent: checked_usize("max_concurrent", raw.max_concurrent, 1..=256, d.max_concurrent),
        queue_size: d.queue_size,
        default_task_timeout_ms: checked(
            "default_task_timeout_ms",
            raw.default_task_timeout_ms,
            1_000..=600_000,
            d.default_task_timeout_ms as i64,
        ) as u64,
        priority_scheduling_enabled: raw
            .priority_scheduling_enabled
            .unwrap_or(d.priority_scheduling_enabled),
        fair_scheduling_enabled: raw.fair_scheduling_enabled.unwrap_or(d.fair_scheduling_enabled),
        auto_queue_cleanup: raw.auto_queue_cleanup.unwrap_or(d.auto_queue_cleanup),
        queue_warning_threshold: d.queue_warning_threshold,
        queue_reject_threshold: d.queue_reject_threshold,
    };

    if raw.queue_size.is_some() {
        let size = checked_usize("queue_size", raw.queue_size, 1..=10_000, d.queue_size);
        limits.queue_size = size;
        limits.queue_warning_threshold = d.queue_warning_threshold.min(size * 4 / 5);
        limits.queue_reject_threshold = size;
    }

    let warning = raw
        .queue_warning_threshold
        .map(|v| v.max(0) as usize)
        .unwrap_or(limits.queue_warning_threshold);
    let reject = raw
        .queue_reject_threshold
        .map(|v| v.max(0) as usize)
        .unwrap_or(limits.queue_reject_threshold);
    if warning <= reject && reject <= limits.queue_size && reject > 0 {
        limits.queue_warning_threshold = warning;
        limits.queue_reject_threshold = reject;
    } else {
        warn!(
            warning,
            reject,
            queue_size = limits.queue_size,
            "queue thresholds must satisfy warning <= reject <= queue_size, keeping {}/{}",
            limits.queue_warning_threshold,
            limits.queue_reject_threshold
        );
    }

    limits
}

fn build_memory(raw: RawMemoryPolicy) -> MemoryPolicy {
    let d = MemoryPolicy::default();

    let max_memory_mb = match raw.max_memory_mb {
        Some(0) => 0,
        other => checked("max_memory_mb", other, 128..=32_768, d.max_memory_mb as i64) as u64,
    };

    MemoryPolicy {
        context_shifting: raw.context_shifting.unwrap_or(d.context_shifting),
        cache_strategy: parse_strategy("cache_strategy", raw.cache_strategy).unwrap_or(d.cache_strategy),
        max_cache_tokens: checked("max_cache_tokens", raw.max_cache_tokens, 1_024..=1_000_000, d.max_cache_tokens as i64)
            as u32,
        n_keep_tokens: checked("n_keep_tokens", raw.n_keep_tokens, 64..=2_048, d.n_keep_tokens as i64) as u32,
        n_discard_tokens: checked("n_discard_tokens", raw.n_discard_tokens, 0..=i64::from(u32::MAX), 0) as u32,
        memory_pressure_threshold: checked(
            "memory_pressure_threshold",
            raw.memory_pressure_threshold,
            0.5..=0.95,
            d.memory_pressure_threshold,
        ),
        enable_partial_cache_deletion: raw
            .enable_partial_cache_deletion
            .unwrap_or(d.enable_partial_cache_deletion),
        enable_token_cache_reuse: raw.enable_token_cache_reuse.unwrap_or(d.enable_token_cache_reuse),
        cache_deletion_strategy: parse_strategy("cache_deletion_strategy", raw.cache_deletion_strategy),
        max_memory_mb,
    }
}

fn build_logging(raw: RawLogging) -> LoggingConfig {
    let d = LoggingConfig::default();
    let level = match raw.level {
        Some(level) => level.parse().unwrap_or_else(|err: BackendError| {
            warn!(error = %err, "keeping default log level");
            d.level
        }),
        None => d.level,
    };

    LoggingConfig {
        level,
        enable_debug: raw.enable_debug.unwrap_or(d.enable_debug),
        timestamps: raw.timestamps.unwrap_or(d.timestamps),
        colors: raw.colors.unwrap_or(d.colors),
        file: raw.file.filter(|f| !f.trim().is_empty()).map(PathBuf::from),
    }
}

fn build_performance(raw: RawPerformance) -> PerformanceConfig {
    let d = PerformanceConfig::default();
    PerformanceConfig {
        batch_processing: raw.batch_processing.unwrap_or(d.batch_processing),
        batch_size: checked("batch_size", raw.batch_size, 1..=2_048, d.batch_size as i64) as u32,
    }
}
