//! GGUF inference on candle's quantized Llama and Qwen2 models.
//!
//! candle's attention cache cannot be edited per position, so the engine keeps
//! a [`PositionLedger`](crate::memory::ledger::PositionLedger) of the prompt
//! tokens each sequence has ingested and re-prefills that token list from
//! position 0 on every turn. Context shifts and partial clears edit the ledger;
//! the next turn decodes whatever it still holds.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use candle_transformers::utils::apply_repeat_penalty;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::template::{ChatTemplate, PromptFamily};
use super::tokenizer::{resolve_special_tokens, resolve_tokenizer_path, SpecialTokens};
use super::{
    find_stop, ChatMessage, EngineError, EngineResult, Generation, GenerationRequest, InferenceEngine, KvCache,
    ModelDescription, SeqId, StopReason,
};
use crate::config::model::{ModelConfig, SamplingConfig, RANDOM_SEED};
use crate::config::PerformanceConfig;
use crate::memory::ledger::SharedLedger;

const FALLBACK_SEED: u64 = 299_792_458;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    fn from_gguf(architecture: &str, content: gguf_file::Content, file: &mut File, device: &Device) -> Result<Self> {
        match architecture {
            "llama" => Ok(Self::Llama(quantized_llama::ModelWeights::from_gguf(content, file, device)?)),
            "qwen2" => match quantized_qwen2::ModelWeights::from_gguf(content, file, device) {
                Ok(model) => Ok(Self::Qwen2(model)),
                Err(e) if e.to_string().contains("output_norm.weight") => Err(E::msg(
                    "qwen2 weights lack 'output_norm.weight'; the GGUF is probably one shard of a split export, merge it first",
                )),
                Err(e) => Err(e.into()),
            },
            other => Err(E::msg(format!("unsupported architecture '{}'", other))),
        }
    }

    fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input, position)?),
            Self::Qwen2(model) => Ok(model.forward(input, position)?),
        }
    }

    /// Llama weights share their tensors on clone; Qwen2 weights cannot be
    /// cloned and decode on the single master instance.
    fn duplicate_if_supported(&self) -> Option<Self> {
        match self {
            Self::Llama(model) => Some(Self::Llama(model.clone())),
            Self::Qwen2(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct GgufMetadata {
    architecture: String,
    context_length: u32,
    size_label: Option<String>,
    file_type: Option<u32>,
    chat_template: Option<String>,
}

impl GgufMetadata {
    fn read(content: &gguf_file::Content) -> Self {
        let string = |key: &str| {
            content
                .metadata
                .get(key)
                .and_then(|v| v.to_string().ok())
                .cloned()
        };
        let number = |key: &str| {
            content.metadata.get(key).and_then(|v| {
                v.to_u32()
                    .ok()
                    .or_else(|| v.to_u64().ok().map(|n| n.min(u32::MAX as u64) as u32))
            })
        };

        let architecture = string("general.architecture").unwrap_or_else(|| "unknown".into());
        Self {
            context_length: number(&format!("{}.context_length", architecture)).unwrap_or(0),
            size_label: string("general.size_label"),
            file_type: number("general.file_type"),
            chat_template: string("tokenizer.chat_template"),
            architecture,
        }
    }

    fn description(&self) -> String {
        let mut description = self.architecture.clone();
        if let Some(size) = &self.size_label {
            description.push(' ');
            description.push_str(size);
        }
        if let Some(file_type) = self.file_type {
            description.push_str(&format!(" ftype{}", file_type));
        }
        description
    }
}

struct LoadedModel {
    master: Mutex<RuntimeModel>,
    /// Idle clones of `master`, one per concurrent decode that needed one.
    pool: Mutex<Vec<RuntimeModel>>,
    tokenizer: Tokenizer,
    special: SpecialTokens,
    template: ChatTemplate,
    context_length: u32,
}

impl LoadedModel {
    fn with_model<R>(&self, f: impl FnOnce(&mut RuntimeModel) -> R) -> R {
        let spare = lock(&self.pool).pop().or_else(|| lock(&self.master).duplicate_if_supported());
        match spare {
            Some(mut model) => {
                let out = f(&mut model);
                lock(&self.pool).push(model);
                out
            }
            None => f(&mut lock(&self.master)),
        }
    }

    fn encode(&self, text: &str) -> EngineResult<Vec<u32>> {
        self.tokenizer
            .encode(text, false)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }

    fn decode(&self, tokens: &[u32]) -> EngineResult<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct RuntimeSettings {
    n_ctx: u32,
    prefill_batch: usize,
}

/// Ledger edit made for one turn, undone when decoding fails.
struct Staged {
    seq: SeqId,
    first_pos: u32,
    previous_ingested: Option<usize>,
}

pub struct CandleEngine {
    device: Device,
    performance: PerformanceConfig,
    kv: SharedLedger,
    loaded: RwLock<Option<LoadedModel>>,
    runtime: Mutex<Option<RuntimeSettings>>,
    /// Length of the rendered conversation each sequence has ingested so far.
    ingested: Mutex<HashMap<SeqId, usize>>,
}

impl Default for CandleEngine {
    fn default() -> Self {
        Self::new(PerformanceConfig::default())
    }
}

impl CandleEngine {
    pub fn new(performance: PerformanceConfig) -> Self {
        Self {
            device: Device::Cpu,
            performance,
            kv: SharedLedger::new(0),
            loaded: RwLock::new(None),
            runtime: Mutex::new(None),
            ingested: Mutex::new(HashMap::new()),
        }
    }

    fn loaded(&self) -> RwLockReadGuard<'_, Option<LoadedModel>> {
        self.loaded.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded_mut(&self) -> RwLockWriteGuard<'_, Option<LoadedModel>> {
        self.loaded.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the new part of `full` in the ledger and returns the token list
    /// to prefill.
    fn stage_prompt(&self, seq: SeqId, full: &[u32]) -> (Vec<u32>, Staged) {
        let mut ingested = lock(&self.ingested);
        let mut ledger = self.kv.lock();
        let previous_ingested = ingested.get(&seq).copied();
        let seen = previous_ingested.unwrap_or(0);

        let staged = if ledger.len(seq) == 0 || seen > full.len() {
            let previous = ledger.tokens(seq);
            ledger.replace(seq, full);
            debug!(seq, dropped = previous.len(), tokens = full.len(), "sequence re-ingested from scratch");
            Staged {
                seq,
                first_pos: 0,
                previous_ingested: None,
            }
        } else {
            let first_pos = ledger.next_pos(seq);
            ledger.append(seq, &full[seen..]);
            Staged {
                seq,
                first_pos,
                previous_ingested,
            }
        };
        ingested.insert(seq, full.len());
        (ledger.tokens(seq), staged)
    }

    /// Tokens of a `full_len`-token rendering that [`Self::stage_prompt`]
    /// would add to what `seq` already holds.
    fn unseen_len(&self, seq: SeqId, full_len: usize) -> usize {
        let ingested = lock(&self.ingested);
        let ledger = self.kv.lock();
        let seen = ingested.get(&seq).copied().unwrap_or(0);
        if ledger.len(seq) == 0 || seen > full_len {
            full_len.saturating_sub(ledger.len(seq))
        } else {
            full_len - seen
        }
    }

    fn rollback(&self, staged: Staged) {
        let mut ingested = lock(&self.ingested);
        self.kv.lock().remove(Some(staged.seq), staged.first_pos, None);
        match staged.previous_ingested {
            Some(previous) => ingested.insert(staged.seq, previous),
            None => ingested.remove(&staged.seq),
        };
    }

    fn forward(&self, model: &mut RuntimeModel, tokens: &[u32], position: usize) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = model.forward(&input, position)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
    }

    /// Runs the prompt through the model from position 0. The first
    /// `batch` tokens go in one pass; the causal mask is only valid for a
    /// multi-token pass at position 0, so the rest is fed one at a time.
    fn prefill(&self, model: &mut RuntimeModel, prompt: &[u32], batch: usize) -> Result<Tensor> {
        let head = batch.clamp(1, prompt.len());
        let mut logits = self.forward(model, &prompt[..head], 0)?;
        for (position, &token) in prompt.iter().enumerate().skip(head) {
            logits = self.forward(model, &[token], position)?;
        }
        Ok(logits)
    }

    fn decode_turn(
        &self,
        model: &mut RuntimeModel,
        loaded: &LoadedModel,
        prompt: &[u32],
        request: &GenerationRequest<'_>,
        settings: RuntimeSettings,
    ) -> Result<Generation> {
        let n_ctx = settings.n_ctx as usize;
        let stops: Vec<String> = request
            .stop
            .iter()
            .cloned()
            .chain(loaded.template.family().stop_markers().iter().map(|m| m.to_string()))
            .collect();
        let mut sampler = Sampler::new(request.sampling);

        let mut logits = self.prefill(model, prompt, settings.prefill_batch)?;
        let mut position = prompt.len();
        let mut history = prompt.to_vec();
        let mut generated: Vec<u32> = Vec::new();
        let mut text = String::new();

        let stop_reason = loop {
            let next = sampler.sample(&logits, &history)?;
            if !request.ignore_eos && loaded.special.is_terminal(next) {
                break StopReason::EndOfSequence;
            }
            generated.push(next);
            history.push(next);
            text = loaded.decode(&generated).map_err(E::msg)?;

            if let Some(cut) = find_stop(&text, &stops) {
                text.truncate(cut);
                break StopReason::StopSequence;
            }
            if request.max_tokens > 0 && generated.len() >= request.max_tokens as usize {
                break StopReason::MaxTokens;
            }
            if position + 1 >= n_ctx {
                break StopReason::ContextFull;
            }
            logits = self.forward(model, &[next], position)?;
            position += 1;
        };

        Ok(Generation {
            text,
            prompt_tokens: prompt.len() as u32,
            generated_tokens: generated.len() as u32,
            stop_reason,
        })
    }
}

/// Sampling knobs this engine has no implementation for.
fn unsupported_knobs(config: &SamplingConfig) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if config.mirostat != 0 {
        ignored.push("mirostat");
    }
    if config.dry_multiplier > 0.0 {
        ignored.push("dry");
    }
    if config.typical_p < 1.0 {
        ignored.push("typical_p");
    }
    if config.dynatemp_range > 0.0 {
        ignored.push("dynatemp");
    }
    if config.grammar.is_some() {
        ignored.push("grammar");
    }
    if config.n_probs > 0 {
        ignored.push("n_probs");
    }
    ignored
}

fn sampling_mode(config: &SamplingConfig) -> Sampling {
    let temperature = f64::from(config.temperature);
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let top_k = (config.top_k > 0).then_some(config.top_k as usize);
    let top_p = (config.top_p > 0.0 && config.top_p < 1.0).then_some(f64::from(config.top_p));
    match (top_k, top_p) {
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (None, None) => Sampling::All { temperature },
    }
}

fn resolve_seed(seed: u32) -> u64 {
    if seed != RANDOM_SEED {
        return u64::from(seed);
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(FALLBACK_SEED)
}

/// Tail of `history` the penalties look at.
/// `-1` covers the whole history, `0` disables the window.
fn penalty_window(history: &[u32], last_n: i32) -> &[u32] {
    if last_n < 0 {
        return history;
    }
    if last_n == 0 {
        return &[];
    }
    let start = history.len().saturating_sub(last_n as usize);
    &history[start..]
}

/// Applies logit bias, frequency and presence penalties, then the min-p cut.
fn shape_logits(logits: &mut [f32], config: &SamplingConfig, window: &[u32]) {
    for &(token, bias) in &config.logit_bias {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit += bias;
        }
    }

    if config.frequency_penalty != 0.0 || config.presence_penalty != 0.0 {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        for &token in window {
            *counts.entry(token).or_default() += 1;
        }
        for (token, count) in counts {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit -= count as f32 * config.frequency_penalty + config.presence_penalty;
            }
        }
    }

    if config.min_p > 0.0 && config.min_p < 1.0 {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let threshold = max + config.min_p.ln();
        let survivors = logits.iter().filter(|&&l| l >= threshold).count();
        if survivors >= config.min_keep.max(1) as usize {
            for logit in logits.iter_mut().filter(|l| **l < threshold) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

struct Sampler<'a> {
    config: &'a SamplingConfig,
    processor: LogitsProcessor,
}

impl<'a> Sampler<'a> {
    fn new(config: &'a SamplingConfig) -> Self {
        Self {
            config,
            processor: LogitsProcessor::from_sampling(resolve_seed(config.seed), sampling_mode(config)),
        }
    }

    fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32> {
        let window = penalty_window(history, self.config.penalty_last_n);
        let mut values = logits.to_vec1::<f32>()?;
        shape_logits(&mut values, self.config, window);
        let len = values.len();
        let mut logits = Tensor::from_vec(values, len, logits.device())?;
        if (self.config.repeat_penalty - 1.0).abs() > f32::EPSILON && !window.is_empty() {
            logits = apply_repeat_penalty(&logits, self.config.repeat_penalty, window)?;
        }
        Ok(self.processor.sample(&logits)?)
    }
}

impl KvCache for CandleEngine {
    fn n_ctx(&self) -> u32 {
        self.kv.n_ctx()
    }

    fn seq_pos_max(&self, seq: Option<SeqId>) -> Option<u32> {
        self.kv.seq_pos_max(seq)
    }

    /// Keeps `ingested` in step with the ledger: an emptied sequence forgets
    /// its conversation, a trimmed tail is re-ingested on the next turn.
    fn seq_rm(&self, seq: Option<SeqId>, p0: u32, p1: Option<u32>) -> bool {
        let mut ingested = lock(&self.ingested);
        let mut ledger = self.kv.lock();
        let affected: Vec<SeqId> = match seq {
            Some(seq) => vec![seq],
            None => ingested.keys().copied().collect(),
        };
        let before: Vec<(SeqId, usize, bool)> = affected
            .into_iter()
            .map(|s| {
                let tail = match (p1, ledger.pos_max(Some(s))) {
                    (None, _) | (_, None) => true,
                    (Some(p1), Some(max)) => max < p1,
                };
                (s, ledger.len(s), tail)
            })
            .collect();

        ledger.remove(seq, p0, p1);

        for (s, len_before, tail) in before {
            let removed = len_before - ledger.len(s);
            if ledger.len(s) == 0 {
                ingested.remove(&s);
            } else if tail && removed > 0 {
                if let Some(seen) = ingested.get_mut(&s) {
                    *seen = seen.saturating_sub(removed);
                }
            }
        }
        true
    }

    fn seq_add(&self, seq: SeqId, p0: u32, p1: Option<u32>, delta: i32) {
        self.kv.seq_add(seq, p0, p1, delta);
    }

    fn clear(&self) {
        let mut ingested = lock(&self.ingested);
        self.kv.clear();
        ingested.clear();
    }
}

impl InferenceEngine for CandleEngine {
    fn load_model(&self, path: &Path, _config: &ModelConfig) -> EngineResult<ModelDescription> {
        let started = Instant::now();
        let load_err = |e: E| EngineError::ModelLoad(format!("{}: {:#}", path.display(), e));

        let mut file = File::open(path)
            .map_err(|e| EngineError::ModelLoad(format!("cannot open {}: {}", path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| load_err(e.into()))?;
        let meta = GgufMetadata::read(&content);
        let family = PromptFamily::detect(&meta.architecture, path);
        let model = RuntimeModel::from_gguf(&meta.architecture, content, &mut file, &self.device).map_err(load_err)?;

        let tokenizer_path = resolve_tokenizer_path(path).ok_or_else(|| {
            EngineError::ModelLoad(format!("no tokenizer.json found for {}", path.display()))
        })?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::ModelLoad(format!("{}: {}", tokenizer_path.display(), e)))?;
        let special = resolve_special_tokens(&tokenizer, family)?;
        let template = ChatTemplate::new(family, meta.chat_template.clone(), &special.bos_text, &special.eos_text);

        let description = ModelDescription {
            description: meta.description(),
            vocab_size: tokenizer.get_vocab_size(true) as u32,
            context_length: meta.context_length,
        };

        *self.loaded_mut() = Some(LoadedModel {
            master: Mutex::new(model),
            pool: Mutex::new(Vec::new()),
            tokenizer,
            special,
            template,
            context_length: meta.context_length,
        });
        KvCache::clear(self);

        info!(
            model = %path.display(),
            tokenizer = %tokenizer_path.display(),
            family = ?family,
            description = %description.description,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gguf weights loaded"
        );
        Ok(description)
    }

    fn init_runtime(&self, config: &ModelConfig) -> EngineResult<()> {
        let guard = self.loaded();
        let loaded = guard.as_ref().ok_or(EngineError::NotLoaded)?;

        let n_ctx = match (config.model.ctx_size, loaded.context_length) {
            (0, model_ctx) => model_ctx,
            (requested, 0) => requested,
            (requested, model_ctx) => requested.min(model_ctx),
        };
        if n_ctx == 0 {
            return Err(EngineError::ModelLoad(
                "context size unknown: set ctx_size, the model file does not carry one".into(),
            ));
        }
        let prefill_batch = if self.performance.batch_processing {
            config.model.batch_size.min(self.performance.batch_size).max(1) as usize
        } else {
            1
        };

        self.kv.set_n_ctx(n_ctx);
        *lock(&self.runtime) = Some(RuntimeSettings { n_ctx, prefill_batch });

        let ignored = unsupported_knobs(&config.sampling);
        if !ignored.is_empty() {
            warn!(?ignored, "sampling options without candle support are ignored");
        }
        if config.model.n_gpu_layers > 0 {
            info!(n_gpu_layers = config.model.n_gpu_layers, "GPU offload requested; this build decodes on CPU");
        }
        debug!(n_ctx, prefill_batch, "runtime initialised");
        Ok(())
    }

    fn release_slots(&self) {
        if let Some(loaded) = self.loaded().as_ref() {
            lock(&loaded.pool).clear();
        }
        *lock(&self.runtime) = None;
    }

    fn unload_model(&self) {
        *lock(&self.runtime) = None;
        if self.loaded_mut().take().is_some() {
            KvCache::clear(self);
            debug!("model unloaded");
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded().is_some()
    }

    fn pending_tokens(&self, seq: SeqId, messages: &[ChatMessage]) -> u32 {
        let guard = self.loaded();
        let Some(loaded) = guard.as_ref() else {
            return 0;
        };
        match loaded.template.render(messages).and_then(|rendered| loaded.encode(&rendered)) {
            Ok(full) => u32::try_from(self.unseen_len(seq, full.len())).unwrap_or(u32::MAX),
            Err(err) => {
                debug!(seq, error = %err, "cannot measure pending prompt");
                0
            }
        }
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> EngineResult<Generation> {
        let guard = self.loaded();
        let loaded = guard.as_ref().ok_or(EngineError::NotLoaded)?;
        let settings = (*lock(&self.runtime)).ok_or(EngineError::NotLoaded)?;

        let rendered = loaded.template.render(request.messages)?;
        let full = loaded.encode(&rendered)?;
        if full.is_empty() {
            return Err(EngineError::Tokenization("prompt encodes to zero tokens".into()));
        }

        let (prompt, staged) = self.stage_prompt(request.seq, &full);
        if prompt.len() >= settings.n_ctx as usize {
            self.rollback(staged);
            return Err(EngineError::Inference(format!(
                "prompt of {} tokens does not fit a context of {}",
                prompt.len(),
                settings.n_ctx
            )));
        }

        match loaded.with_model(|model| self.decode_turn(model, loaded, &prompt, request, settings)) {
            Ok(generation) => Ok(generation),
            Err(err) => {
                self.rollback(staged);
                Err(EngineError::Inference(format!("{:#}", err)))
            }
        }
    }
}
