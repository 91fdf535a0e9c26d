use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::BackendError;

/// Seed value asking the engine to draw a fresh seed per load.
pub const RANDOM_SEED: u32 = u32::MAX;
const DEFAULT_DRY_BASE: f32 = 1.75;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Json(String),

    #[error("malformed `{section}` section: {detail}")]
    Section { section: &'static str, detail: String },

    #[error("{key} must be >= -1 (got {value})")]
    BelowSentinel { key: &'static str, value: i64 },

    #[error("dry_sequence_breakers must be a non-empty array of strings")]
    EmptySequenceBreakers,
}

impl From<ConfigError> for BackendError {
    fn from(err: ConfigError) -> Self {
        BackendError::InvalidArgument(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelParams {
    pub n_gpu_layers: i32,
    /// 0 lets the engine use the context length stored in the model file.
    pub ctx_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    /// -1 generates until end of sequence or context exhaustion.
    pub n_predict: i32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            ctx_size: 2048,
            batch_size: 512,
            threads: 8,
            n_predict: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    /// <= 0 disables top-k.
    pub top_k: i32,
    pub min_p: f32,
    pub typical_p: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Resolved against the context size, never -1 after parsing.
    pub penalty_last_n: i32,
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub seed: u32,
    pub n_probs: i32,
    pub min_keep: i32,
    pub grammar: Option<String>,
    pub grammar_lazy: bool,
    pub logit_bias: Vec<(u32, f32)>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: -1,
            min_p: 0.0,
            typical_p: 1.0,
            repeat_penalty: 1.10,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalty_last_n: -1,
            dry_multiplier: 0.0,
            dry_base: DEFAULT_DRY_BASE,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: vec!["\n".into(), ":".into(), "\"".into(), "*".into()],
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: RANDOM_SEED,
            n_probs: 0,
            min_keep: 1,
            grammar: None,
            grammar_lazy: false,
            logit_bias: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StoppingConfig {
    pub stop: Vec<String>,
    pub ignore_eos: bool,
}

/// Everything a model load needs besides the file path. Hot swaps merge the
/// new JSON onto the currently loaded value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub model: ModelParams,
    pub sampling: SamplingConfig,
    pub stopping: StoppingConfig,
    /// Which windows were given as `-1`; they follow `ctx_size` across merges.
    #[serde(skip)]
    auto_windows: AutoWindows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AutoWindows {
    penalty_last_n: bool,
    dry_penalty_last_n: bool,
}

impl Default for AutoWindows {
    fn default() -> Self {
        Self {
            penalty_last_n: true,
            dry_penalty_last_n: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        let mut cfg = Self {
            model: ModelParams::default(),
            sampling: SamplingConfig::default(),
            stopping: StoppingConfig::default(),
            auto_windows: AutoWindows::default(),
        };
        cfg.resolve_sentinels();
        cfg
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawModelParams {
    n_gpu_layers: Option<i32>,
    ctx_size: Option<i64>,
    n_ctx: Option<i64>,
    batch_size: Option<i64>,
    n_batch: Option<i64>,
    threads: Option<i64>,
    n_predict: Option<i32>,
    max_tokens: Option<i32>,
}

/// Legacy keys accepted at the document root.
#[derive(Debug, Default, Deserialize)]
struct RawFlatSampling {
    temp: Option<f32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    repeat_penalty: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSampling {
    temp: Option<f32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<i32>,
    min_p: Option<f32>,
    typical_p: Option<f32>,
    penalty_repeat: Option<f32>,
    repeat_penalty: Option<f32>,
    penalty_freq: Option<f32>,
    frequency_penalty: Option<f32>,
    penalty_present: Option<f32>,
    presence_penalty: Option<f32>,
    penalty_last_n: Option<i64>,
    repeat_last_n: Option<i64>,
    dry_multiplier: Option<f32>,
    dry_base: Option<f32>,
    dry_allowed_length: Option<i32>,
    dry_penalty_last_n: Option<i64>,
    dry_sequence_breakers: Option<Vec<Value>>,
    dynatemp_range: Option<f32>,
    dynatemp_exponent: Option<f32>,
    mirostat: Option<i32>,
    mirostat_tau: Option<f32>,
    mirostat_eta: Option<f32>,
    seed: Option<u32>,
    n_probs: Option<i32>,
    logprobs: Option<i32>,
    min_keep: Option<i32>,
    ignore_eos: Option<bool>,
    grammar: Option<String>,
    grammar_lazy: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStopping {
    stop: Option<Vec<Value>>,
    max_tokens: Option<i32>,
    ignore_eos: Option<bool>,
}

fn deserialize<T: for<'de> Deserialize<'de>>(value: &Value, section: &'static str) -> Result<T, ConfigError> {
    T::deserialize(value).map_err(|err| ConfigError::Section {
        section,
        detail: err.to_string(),
    })
}

fn strings(items: Vec<Value>) -> Vec<String> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        })
        .collect()
}

fn sentinel(key: &'static str, value: Option<i64>) -> Result<Option<i32>, ConfigError> {
    match value {
        Some(v) if v < -1 => Err(ConfigError::BelowSentinel { key, value: v }),
        Some(v) => Ok(Some(v.min(i64::from(i32::MAX)) as i32)),
        None => Ok(None),
    }
}

impl ModelConfig {
    /// Parses `raw` onto a copy of `base`. Any error leaves `base` untouched;
    /// callers log it and keep using `base`.
    pub fn merged(base: &ModelConfig, raw: Option<&str>) -> Result<ModelConfig, ConfigError> {
        let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
            debug!("no model config supplied, keeping current parameters");
            return Ok(base.clone());
        };
        let root: Value = serde_json::from_str(text).map_err(|e| ConfigError::Json(e.to_string()))?;
        let mut cfg = base.clone();
        cfg.apply(&root)?;
        Ok(cfg)
    }

    fn apply(&mut self, root: &Value) -> Result<(), ConfigError> {
        let params: RawModelParams = deserialize(super::section(root, "model"), "model")?;
        if let Some(v) = params.n_predict {
            self.model.n_predict = v;
        }
        if let Some(v) = params.max_tokens {
            self.model.n_predict = v;
        }
        if let Some(v) = params.n_gpu_layers {
            self.model.n_gpu_layers = v;
        }
        if let Some(v) = params.n_ctx.or(params.ctx_size) {
            self.model.ctx_size = super::checked("ctx_size", Some(v), 0..=i64::from(u32::MAX), 2048) as u32;
        }
        if let Some(v) = params.n_batch.or(params.batch_size) {
            self.model.batch_size = super::checked("batch_size", Some(v), 1..=i64::from(u32::MAX), 512) as u32;
        }
        if let Some(v) = params.threads {
            self.model.threads = super::checked("threads", Some(v), 1..=1024, 8) as u32;
        }

        let flat: RawFlatSampling = deserialize(root, "sampling")?;
        let s = &mut self.sampling;
        if let Some(v) = flat.temp.or(flat.temperature) {
            s.temperature = v;
        }
        if let Some(v) = flat.top_p {
            s.top_p = v;
        }
        if let Some(v) = flat.repeat_penalty {
            s.repeat_penalty = v;
        }

        let mut ignore_eos = None;
        if let Some(nested) = root.get("sampling").filter(|v| v.is_object()) {
            let raw: RawSampling = deserialize(nested, "sampling")?;
            if let Some(v) = raw.temp.or(raw.temperature) {
                s.temperature = v;
            }
            if let Some(v) = raw.top_p {
                s.top_p = v;
            }
            if let Some(v) = raw.top_k {
                s.top_k = v;
            }
            if let Some(v) = raw.min_p {
                s.min_p = v;
            }
            if let Some(v) = raw.typical_p {
                s.typical_p = v;
            }
            if let Some(v) = raw.repeat_penalty.or(raw.penalty_repeat) {
                s.repeat_penalty = v;
            }
            if let Some(v) = raw.frequency_penalty.or(raw.penalty_freq) {
                s.frequency_penalty = v;
            }
            if let Some(v) = raw.presence_penalty.or(raw.penalty_present) {
                s.presence_penalty = v;
            }
            if let Some(v) = sentinel("penalty_last_n", raw.repeat_last_n.or(raw.penalty_last_n))? {
                s.penalty_last_n = v;
                self.auto_windows.penalty_last_n = v == -1;
            }
            if let Some(v) = sentinel("dry_penalty_last_n", raw.dry_penalty_last_n)? {
                s.dry_penalty_last_n = v;
                self.auto_windows.dry_penalty_last_n = v == -1;
            }
            if let Some(v) = raw.dry_multiplier {
                s.dry_multiplier = v;
            }
            if let Some(v) = raw.dry_base {
                s.dry_base = v;
            }
            if let Some(v) = raw.dry_allowed_length {
                s.dry_allowed_length = v;
            }
            if let Some(items) = raw.dry_sequence_breakers {
                let breakers = strings(items);
                if breakers.is_empty() {
                    return Err(ConfigError::EmptySequenceBreakers);
                }
                s.dry_sequence_breakers = breakers;
            }
            if let Some(v) = raw.dynatemp_range {
                s.dynatemp_range = v;
            }
            if let Some(v) = raw.dynatemp_exponent {
                s.dynatemp_exponent = v;
            }
            if let Some(v) = raw.mirostat {
                s.mirostat = v;
            }
            if let Some(v) = raw.mirostat_tau {
                s.mirostat_tau = v;
            }
            if let Some(v) = raw.mirostat_eta {
                s.mirostat_eta = v;
            }
            if let Some(v) = raw.seed {
                s.seed = v;
            }
            if let Some(v) = raw.logprobs.or(raw.n_probs) {
                s.n_probs = v;
            }
            if let Some(v) = raw.min_keep {
                s.min_keep = v;
            }
            if raw.grammar.is_some() {
                s.grammar = raw.grammar.filter(|g| !g.is_empty());
            }
            if let Some(v) = raw.grammar_lazy {
                s.grammar_lazy = v;
            }
            ignore_eos = raw.ignore_eos;
        }

        if let Some(nested) = root.get("stopping").filter(|v| v.is_object()) {
            let raw: RawStopping = deserialize(nested, "stopping")?;
            if let Some(v) = raw.max_tokens {
                self.model.n_predict = v;
            }
            if let Some(items) = raw.stop {
                self.stopping.stop = strings(items);
            }
            ignore_eos = raw.ignore_eos.or(ignore_eos);
        }
        if let Some(v) = ignore_eos {
            self.stopping.ignore_eos = v;
        }

        if let Some(entries) = root.get("logit_bias").and_then(Value::as_array) {
            self.sampling.logit_bias = entries
                .iter()
                .filter_map(|pair| {
                    let pair = pair.as_array().filter(|p| p.len() == 2)?;
                    let token = pair[0].as_u64().and_then(|t| u32::try_from(t).ok())?;
                    let bias = pair[1].as_f64()? as f32;
                    Some((token, bias))
                })
                .collect();
        }

        self.resolve_sentinels();
        Ok(())
    }

    /// Resolves `-1` window sizes against the final context size and repairs
    /// `dry_base`. With `ctx_size = 0` the windows stay `-1` (whole history).
    fn resolve_sentinels(&mut self) {
        let ctx = match self.model.ctx_size.min(i32::MAX as u32) as i32 {
            0 => -1,
            n => n,
        };
        if self.auto_windows.penalty_last_n {
            self.sampling.penalty_last_n = ctx;
        }
        if self.auto_windows.dry_penalty_last_n {
            self.sampling.dry_penalty_last_n = ctx;
        }
        if self.sampling.dry_base < 1.0 {
            warn!(
                dry_base = self.sampling.dry_base,
                "dry_base < 1.0, resetting to {}", DEFAULT_DRY_BASE
            );
            self.sampling.dry_base = DEFAULT_DRY_BASE;
        }
    }
}
