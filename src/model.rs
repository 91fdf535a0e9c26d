//! Loaded-model state and the hot-swap protocol.
//!
//! Generation holds a [`ModelLease`] (a read guard) for its whole duration;
//! a switch takes the write side, so a model is never torn down under a
//! running decode. Only one switch may run at a time.

use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::model::ModelConfig;
use crate::engine::{EngineResult, InferenceEngine, ModelDescription};
use crate::error::{BackendError, Result};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Empty,
    Ready,
    Switching,
    /// A switch failed and so did the restore. Only a new load recovers.
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelState {
    pub status: ModelStatus,
    /// Incremented on every successful load; handed out as the graph id.
    pub graph: u32,
    pub path: Option<PathBuf>,
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub description: String,
    pub vocab_size: u32,
    pub context_length: u32,
    #[serde(skip)]
    pub config: ModelConfig,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            status: ModelStatus::Empty,
            graph: 0,
            path: None,
            name: String::new(),
            version: String::new(),
            architecture: String::new(),
            description: String::new(),
            vocab_size: 0,
            context_length: 0,
            config: ModelConfig::default(),
        }
    }
}

impl ModelState {
    fn refresh(&mut self, path: &Path, desc: &ModelDescription, config: ModelConfig) {
        self.status = ModelStatus::Ready;
        self.graph = self.graph.wrapping_add(1).max(1);
        self.path = Some(path.to_path_buf());
        self.name = model_name(path);
        self.version = version_fingerprint(path);
        self.architecture = desc.architecture().to_string();
        self.description = desc.description.clone();
        self.vocab_size = desc.vocab_size;
        self.context_length = desc.context_length;
        self.config = config;
    }
}

/// File basename, used as the human-facing model name.
pub fn model_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// `size_<bytes>_mtime_<unix secs>` of the model file.
pub fn version_fingerprint(path: &Path) -> String {
    match fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs());
            format!("size_{}_mtime_{}", meta.len(), mtime)
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Callbacks the switcher needs from the rest of the backend.
pub trait SwitchHooks {
    /// Queued plus running inference work.
    fn outstanding_work(&self) -> usize;

    /// Runs after a new model is in place; conversational state is stale.
    fn on_model_replaced(&self);
}

pub struct ModelLease<'a> {
    state: RwLockReadGuard<'a, ModelState>,
    engine: &'a dyn InferenceEngine,
}

impl<'a> ModelLease<'a> {
    pub fn engine(&self) -> &'a dyn InferenceEngine {
        self.engine
    }
}

impl Deref for ModelLease<'_> {
    type Target = ModelState;

    fn deref(&self) -> &ModelState {
        &self.state
    }
}

pub struct ModelSwitcher {
    engine: Arc<dyn InferenceEngine>,
    state: RwLock<ModelState>,
    swap: Mutex<()>,
    drain_timeout: Duration,
}

impl ModelSwitcher {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            state: RwLock::new(ModelState::default()),
            swap: Mutex::new(()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    fn read(&self) -> RwLockReadGuard<'_, ModelState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModelState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read access for one generation. Fails while no usable model exists.
    pub fn lease(&self) -> Result<ModelLease<'_>> {
        let state = self.read();
        match state.status {
            ModelStatus::Ready => Ok(ModelLease {
                state,
                engine: self.engine.as_ref(),
            }),
            ModelStatus::Unstable => Err(BackendError::Unstable(
                "no usable model after a failed switch; load a model first".into(),
            )),
            ModelStatus::Empty | ModelStatus::Switching => {
                Err(BackendError::Runtime("no model loaded".into()))
            }
        }
    }

    /// Current state; reports `Switching` instead of blocking while a swap
    /// holds the write lock.
    pub fn snapshot(&self) -> ModelState {
        match self.state.try_read() {
            Ok(state) => state.clone(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
            Err(TryLockError::WouldBlock) => ModelState {
                status: ModelStatus::Switching,
                ..ModelState::default()
            },
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.snapshot().status
    }

    pub fn current_graph(&self) -> Option<u32> {
        let state = self.read();
        (state.status == ModelStatus::Ready).then_some(state.graph)
    }

    /// Loads `path`, either as the first model or by hot-swapping the current
    /// one. Returns the new graph id.
    pub fn load(&self, path: &Path, raw_config: Option<&str>, hooks: &dyn SwitchHooks) -> Result<u32> {
        let _swap = match self.swap.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(BackendError::AlreadyInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let current = self.read().status;
        if current == ModelStatus::Ready {
            self.hot_swap(path, raw_config, hooks)
        } else {
            self.first_load(path, raw_config, hooks)
        }
    }

    fn merged_config(base: &ModelConfig, raw: Option<&str>) -> ModelConfig {
        ModelConfig::merged(base, raw).unwrap_or_else(|err| {
            warn!(error = %err, "model config rejected, keeping previous parameters");
            base.clone()
        })
    }

    fn bring_up(&self, path: &Path, config: &ModelConfig) -> EngineResult<ModelDescription> {
        let desc = self.engine.load_model(path, config)?;
        if let Err(err) = self.engine.init_runtime(config) {
            self.engine.unload_model();
            return Err(err);
        }
        Ok(desc)
    }

    fn first_load(&self, path: &Path, raw_config: Option<&str>, hooks: &dyn SwitchHooks) -> Result<u32> {
        let config = Self::merged_config(&ModelConfig::default(), raw_config);
        let mut state = self.write();

        // An unstable engine may still hold half-initialised resources.
        self.engine.release_slots();
        self.engine.unload_model();

        let desc = self.bring_up(path, &config).map_err(|err| {
            error!(path = %path.display(), error = %err, "model load failed");
            BackendError::from(err)
        })?;
        state.refresh(path, &desc, config);
        let graph = state.graph;
        info!(
            model = %state.name,
            version = %state.version,
            architecture = %state.architecture,
            context_length = state.context_length,
            "model loaded"
        );
        drop(state);

        hooks.on_model_replaced();
        Ok(graph)
    }

    fn drain(&self, hooks: &dyn SwitchHooks) {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let outstanding = hooks.outstanding_work();
            if outstanding == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    outstanding,
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "drain timed out, switching model with work still pending"
                );
                return;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    fn hot_swap(&self, path: &Path, raw_config: Option<&str>, hooks: &dyn SwitchHooks) -> Result<u32> {
        info!(path = %path.display(), "model switch requested");
        self.drain(hooks);

        let (backup_path, backup_config) = {
            let state = self.read();
            (state.path.clone(), state.config.clone())
        };
        let config = Self::merged_config(&backup_config, raw_config);

        let mut state = self.write();
        state.status = ModelStatus::Switching;
        self.engine.release_slots();
        self.engine.clear();
        self.engine.unload_model();

        match self.bring_up(path, &config) {
            Ok(desc) => {
                state.refresh(path, &desc, config);
                let graph = state.graph;
                info!(model = %state.name, version = %state.version, graph, "model switched");
                drop(state);
                hooks.on_model_replaced();
                Ok(graph)
            }
            Err(load_err) => {
                error!(path = %path.display(), error = %load_err, "model switch failed, restoring previous model");
                let restored = match &backup_path {
                    Some(previous) => self.bring_up(previous, &backup_config),
                    None => Err(load_err.clone()),
                };
                match restored {
                    Ok(_) => {
                        state.status = ModelStatus::Ready;
                        warn!(model = %state.name, "previous model restored");
                        Err(BackendError::Runtime(format!(
                            "model switch failed ({}); previous model restored",
                            load_err
                        )))
                    }
                    Err(restore_err) => {
                        state.status = ModelStatus::Unstable;
                        error!(error = %restore_err, "restore failed, backend is unstable");
                        Err(BackendError::Unstable(format!(
                            "model switch failed ({}) and restore failed ({})",
                            load_err, restore_err
                        )))
                    }
                }
            }
        }
    }

    /// Releases every engine resource. Used at backend shutdown.
    pub fn unload(&self) {
        let mut state = self.write();
        self.engine.release_slots();
        self.engine.unload_model();
        let graph = state.graph;
        *state = ModelState {
            graph,
            ..ModelState::default()
        };
    }
}
