//! Per-call generation overrides passed alongside a prompt.
//!
//! Negative numbers mean "not set" for every numeric knob, mirroring how the
//! base sampling config treats its sentinels. Overrides never outlive the call
//! they came with.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::model::ModelConfig;
use crate::queue::TaskPriority;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RuntimeOverrides {
    temperature: Option<f32>,
    temp: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<i32>,
    min_p: Option<f32>,
    typical_p: Option<f32>,
    repeat_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    presence_penalty: Option<f32>,
    penalty_last_n: Option<i32>,
    repeat_last_n: Option<i32>,
    seed: Option<i64>,
    max_tokens: Option<i32>,
    n_predict: Option<i32>,
    ignore_eos: Option<bool>,
    stop: Option<Vec<Value>>,
    grammar: Option<String>,
    n_probs: Option<i32>,
    logprobs: Option<i32>,
    min_keep: Option<i32>,
    dry_multiplier: Option<f32>,
    dry_base: Option<f32>,
    dry_allowed_length: Option<i32>,
    dry_penalty_last_n: Option<i32>,
    dynatemp_range: Option<f32>,
    dynatemp_exponent: Option<f32>,
    mirostat: Option<i32>,
    mirostat_tau: Option<f32>,
    mirostat_eta: Option<f32>,
    priority: Option<TaskPriority>,
}

impl RuntimeOverrides {
    /// Parses the optional runtime JSON. A payload that is not a JSON object
    /// is logged and treated as "no overrides"; a field of the wrong type is
    /// skipped on its own.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
            return Self::default();
        };

        let fields = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                error!(payload = %other, "runtime config is not a JSON object, using session defaults");
                return Self::default();
            }
            Err(err) => {
                error!(error = %err, "failed to parse runtime config, using session defaults");
                return Self::default();
            }
        };

        let usable: Map<String, Value> = fields
            .into_iter()
            .filter(|(key, value)| {
                let single = Value::Object(Map::from_iter([(key.clone(), value.clone())]));
                match serde_json::from_value::<RuntimeOverrides>(single) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!(field = %key, error = %err, "ignoring malformed runtime override");
                        false
                    }
                }
            })
            .collect();

        match serde_json::from_value::<RuntimeOverrides>(Value::Object(usable)) {
            Ok(mut overrides) => {
                overrides.validate();
                debug!(?overrides, "runtime overrides parsed");
                overrides
            }
            Err(err) => {
                error!(error = %err, "failed to parse runtime config, using session defaults");
                Self::default()
            }
        }
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority.unwrap_or_default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    fn temperature(&self) -> Option<f32> {
        self.temp.or(self.temperature).filter(|t| *t >= 0.0)
    }

    fn validate(&mut self) {
        if let Some(t) = self.temperature().filter(|t| *t > 0.0) {
            if !(0.01..=10.0).contains(&t) {
                warn!(temperature = t, "temperature outside [0.01, 10.0], using as-is");
            }
        }
        if let Some(p) = self.top_p.filter(|p| *p > 0.0) {
            let clamped = p.clamp(0.01, 1.0);
            if clamped != p {
                warn!(top_p = p, clamped, "top_p out of range, clamping");
            }
            self.top_p = Some(clamped);
        }
        if let Some(r) = self.repeat_penalty.filter(|r| *r > 0.0 && *r < 0.1) {
            warn!(repeat_penalty = r, "repeat_penalty too low, raising to 0.1");
            self.repeat_penalty = Some(0.1);
        }
    }

    /// Returns `base` with every set override applied.
    pub fn apply_to(&self, base: &ModelConfig) -> ModelConfig {
        let mut cfg = base.clone();
        let s = &mut cfg.sampling;

        fn set<T: Copy>(slot: &mut T, value: Option<T>, keep: impl Fn(&T) -> bool) {
            if let Some(v) = value.filter(|v| keep(v)) {
                *slot = v;
            }
        }
        let non_negative_f = |v: &f32| *v >= 0.0;
        let non_negative_i = |v: &i32| *v >= 0;

        set(&mut s.temperature, self.temperature(), non_negative_f);
        set(&mut s.top_p, self.top_p, non_negative_f);
        set(&mut s.top_k, self.top_k, non_negative_i);
        set(&mut s.min_p, self.min_p, non_negative_f);
        set(&mut s.typical_p, self.typical_p, non_negative_f);
        set(&mut s.repeat_penalty, self.repeat_penalty, non_negative_f);
        set(&mut s.frequency_penalty, self.frequency_penalty, non_negative_f);
        set(&mut s.presence_penalty, self.presence_penalty, non_negative_f);
        set(&mut s.penalty_last_n, self.repeat_last_n.or(self.penalty_last_n), non_negative_i);
        set(&mut s.n_probs, self.logprobs.or(self.n_probs), non_negative_i);
        set(&mut s.min_keep, self.min_keep, non_negative_i);
        set(&mut s.dry_multiplier, self.dry_multiplier, non_negative_f);
        set(&mut s.dry_base, self.dry_base, |v| *v >= 1.0);
        set(&mut s.dry_allowed_length, self.dry_allowed_length, non_negative_i);
        set(&mut s.dry_penalty_last_n, self.dry_penalty_last_n, non_negative_i);
        set(&mut s.dynatemp_range, self.dynatemp_range, non_negative_f);
        set(&mut s.dynatemp_exponent, self.dynatemp_exponent, non_negative_f);
        set(&mut s.mirostat, self.mirostat, non_negative_i);
        set(&mut s.mirostat_tau, self.mirostat_tau, non_negative_f);
        set(&mut s.mirostat_eta, self.mirostat_eta, non_negative_f);
        if let Some(seed) = self.seed.filter(|v| *v >= 0) {
            s.seed = seed.min(i64::from(u32::MAX)) as u32;
        }
        if let Some(grammar) = &self.grammar {
            s.grammar = Some(grammar.clone()).filter(|g| !g.is_empty());
        }

        set(&mut cfg.model.n_predict, self.max_tokens.or(self.n_predict), |v| *v > 0);
        if let Some(ignore_eos) = self.ignore_eos {
            cfg.stopping.ignore_eos = ignore_eos;
        }
        if let Some(stop) = &self.stop {
            cfg.stopping.stop = stop
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        cfg
    }
}
