//! KV-cache window management and memory-pressure hygiene.
//!
//! Everything here operates on positions through [`KvCache`]; the manager
//! itself only keeps counters. Failures inside pressure handling are logged
//! and swallowed so the inference that triggered them still runs.

pub mod ledger;

use std::fs;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{CacheStrategy, MemoryPolicy};
use crate::engine::{KvCache, SeqId};
use crate::error::{BackendError, Result};

/// Returns resident memory in bytes.
pub type UsageProbe = Box<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub usage_bytes: u64,
    pub max_memory_mb: u64,
    pub pressure_threshold: f64,
    pub under_pressure: bool,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub context_shifts: u64,
    pub partial_clears: u64,
    pub full_clears: u64,
    pub pressure_events: u64,
}

#[derive(Default)]
struct MemoryCounters {
    usage_bytes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    context_shifts: AtomicU64,
    partial_clears: AtomicU64,
    full_clears: AtomicU64,
    pressure_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftPlan {
    pub n_keep: u32,
    pub n_discard: u32,
    pub n_past: u32,
}

/// Computes the sliding-window move for `n_past` used positions, or `None`
/// when nothing past `n_keep` can be discarded.
pub fn plan_context_shift(n_keep: u32, n_past: u32, n_discard: u32) -> Option<ShiftPlan> {
    let n_left = n_past.checked_sub(n_keep).filter(|n| *n > 0)?;
    let n_discard = if n_discard > 0 {
        n_discard.min(n_left)
    } else {
        n_left / 2
    };
    (n_discard > 0).then_some(ShiftPlan {
        n_keep,
        n_discard,
        n_past,
    })
}

/// Position range a partial deletion removes from a window of `n_past`.
pub fn partial_range(strategy: CacheStrategy, n_keep: u32, n_past: u32) -> Option<Range<u32>> {
    let range = match strategy {
        CacheStrategy::Lru => 0..n_past / 4,
        CacheStrategy::Fifo => n_past - n_past / 4..n_past,
        CacheStrategy::Smart => {
            let n_clear = n_past.checked_sub(n_keep)?;
            let start = n_keep + n_clear / 4;
            start..start + n_clear / 2
        }
    };
    (!range.is_empty()).then_some(range)
}

/// Whether the call that triggered the token-cache check had to trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSignal {
    Hit,
    Miss,
}

pub struct MemoryManager {
    policy: MemoryPolicy,
    probe: UsageProbe,
    counters: MemoryCounters,
}

impl MemoryManager {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self::with_probe(policy, Box::new(process_rss_bytes))
    }

    pub fn with_probe(policy: MemoryPolicy, probe: UsageProbe) -> Self {
        Self {
            policy,
            probe,
            counters: MemoryCounters::default(),
        }
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.policy
    }

    /// Drops the oldest shiftable positions of `seq` and renumbers the rest so
    /// decoding can continue past the context size.
    pub fn perform_context_shift(&self, kv: &(impl KvCache + ?Sized), seq: SeqId) -> Result<Option<ShiftPlan>> {
        if !self.policy.context_shifting {
            return Err(BackendError::Runtime("context shifting is disabled".into()));
        }

        let n_past = kv.n_past(seq);
        let Some(plan) = plan_context_shift(self.policy.n_keep_tokens, n_past, self.policy.n_discard_tokens)
        else {
            debug!(session = seq, n_past, n_keep = self.policy.n_keep_tokens, "context shift not needed");
            return Ok(None);
        };

        let cut = plan.n_keep + plan.n_discard;
        if !kv.seq_rm(Some(seq), plan.n_keep, Some(cut)) {
            return Err(BackendError::Runtime(format!(
                "kv cache refused removal of [{}, {}) for session {}",
                plan.n_keep, cut, seq
            )));
        }
        kv.seq_add(seq, cut, Some(n_past), -(plan.n_discard as i32));

        self.counters.context_shifts.fetch_add(1, Ordering::Relaxed);
        info!(
            session = seq,
            n_keep = plan.n_keep,
            n_discard = plan.n_discard,
            n_past,
            "context shifted"
        );
        Ok(Some(plan))
    }

    /// Removes part of the window of `seq` (or of all sequences) following
    /// `strategy`. Returns the number of positions removed.
    pub fn clear_partial_kv_cache(&self, kv: &(impl KvCache + ?Sized), seq: Option<SeqId>, strategy: CacheStrategy) -> Result<u32> {
        if !self.policy.enable_partial_cache_deletion {
            return Err(BackendError::InvalidArgument("partial cache deletion is disabled".into()));
        }

        let n_past = kv.seq_pos_max(seq).map_or(0, |p| p + 1);
        let Some(range) = partial_range(strategy, self.policy.n_keep_tokens, n_past) else {
            return Ok(0);
        };

        if !kv.seq_rm(seq, range.start, Some(range.end)) {
            return Err(BackendError::Runtime(format!(
                "kv cache refused partial removal of [{}, {})",
                range.start, range.end
            )));
        }

        self.counters.partial_clears.fetch_add(1, Ordering::Relaxed);
        debug!(?seq, ?strategy, start = range.start, end = range.end, "partial kv clear");
        Ok(range.end - range.start)
    }

    /// `seq = None` wipes the whole cache.
    pub fn clear_kv_cache(&self, kv: &(impl KvCache + ?Sized), seq: Option<SeqId>) {
        match seq {
            Some(seq) => {
                kv.seq_rm(Some(seq), 0, None);
                debug!(session = seq, "kv cache cleared for session");
            }
            None => {
                kv.clear();
                self.counters.full_clears.fetch_add(1, Ordering::Relaxed);
                debug!("kv cache cleared");
            }
        }
    }

    pub fn refresh_usage(&self) -> u64 {
        let bytes = (self.probe)();
        self.counters.usage_bytes.store(bytes, Ordering::Relaxed);
        bytes
    }

    pub fn usage_mb(&self) -> f64 {
        self.counters.usage_bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0)
    }

    pub fn is_under_pressure(&self) -> bool {
        if self.policy.max_memory_mb == 0 {
            return false;
        }
        self.usage_mb() / self.policy.max_memory_mb as f64 >= self.policy.memory_pressure_threshold
    }

    /// Partial deletion first, full clear if that fails. Never fails itself.
    pub fn handle_memory_pressure(&self, kv: &(impl KvCache + ?Sized)) {
        self.counters.pressure_events.fetch_add(1, Ordering::Relaxed);
        warn!(
            usage_mb = self.usage_mb(),
            max_memory_mb = self.policy.max_memory_mb,
            "memory pressure detected"
        );

        match self.clear_partial_kv_cache(kv, None, self.policy.deletion_strategy()) {
            Ok(removed) => debug!(removed, "pressure relieved by partial deletion"),
            Err(err) => {
                warn!(error = %err, "partial deletion failed, clearing the whole kv cache");
                self.clear_kv_cache(kv, None);
            }
        }
        self.refresh_usage();
    }

    /// Trims the session's window when it holds more than `max_cache_tokens`.
    pub fn optimize_token_cache(&self, kv: &(impl KvCache + ?Sized), seq: SeqId) -> CacheSignal {
        let cached = kv.n_past(seq);
        if cached <= self.policy.max_cache_tokens {
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            return CacheSignal::Miss;
        }

        if let Err(err) = self.clear_partial_kv_cache(kv, Some(seq), self.policy.deletion_strategy()) {
            warn!(session = seq, error = %err, "token cache trim failed");
        }
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        CacheSignal::Hit
    }

    /// Hygiene run before every turn of `seq`. `incoming` is the prompt the
    /// turn still has to ingest. Returns the session's `n_past` afterwards.
    pub fn prepare_turn(&self, kv: &(impl KvCache + ?Sized), seq: SeqId, incoming: u32, n_predict: i32) -> u32 {
        self.refresh_usage();
        if self.is_under_pressure() {
            self.handle_memory_pressure(kv);
        }

        if self.policy.enable_token_cache_reuse {
            self.optimize_token_cache(kv, seq);
        }

        let reserve = u32::try_from(n_predict).unwrap_or(0);
        let projected = kv.n_past(seq).saturating_add(incoming).saturating_add(reserve);
        if self.policy.context_shifting && projected > kv.n_ctx() {
            if let Err(err) = self.perform_context_shift(kv, seq) {
                warn!(session = seq, error = %err, "context shift failed");
            }
        }
        kv.n_past(seq)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let c = &self.counters;
        MemorySnapshot {
            usage_bytes: c.usage_bytes.load(Ordering::Relaxed),
            max_memory_mb: self.policy.max_memory_mb,
            pressure_threshold: self.policy.memory_pressure_threshold,
            under_pressure: self.is_under_pressure(),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            context_shifts: c.context_shifts.load(Ordering::Relaxed),
            partial_clears: c.partial_clears.load(Ordering::Relaxed),
            full_clears: c.full_clears.load(Ordering::Relaxed),
            pressure_events: c.pressure_events.load(Ordering::Relaxed),
        }
    }
}

/// Resident set size from `/proc/self/status`; 0 where unavailable.
pub fn process_rss_bytes() -> u64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map_or(0, |kb| kb * 1024)
}
