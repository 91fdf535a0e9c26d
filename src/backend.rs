//! The backend context: one per `init_backend_with_config` call.
//!
//! It owns the session table, the overflow queue and its worker thread, the
//! admission gate, the memory manager and the model switcher. Callers hold it
//! (or the opaque C handle wrapping it) and pass it to every operation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::runtime::RuntimeOverrides;
use crate::config::BackendConfig;
use crate::engine::{GenerationRequest, InferenceEngine};
use crate::error::{BackendError, Result};
use crate::gate::{ConcurrencyGate, GateSnapshot};
use crate::logging;
use crate::memory::{MemoryManager, MemorySnapshot, UsageProbe};
use crate::model::{ModelState, ModelStatus, ModelSwitcher, SwitchHooks, DEFAULT_DRAIN_TIMEOUT};
use crate::queue::{QueueStats, Task, TaskId, TaskQueue};
use crate::session::{SessionId, SessionInfo, SessionPolicy, SessionStore};

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub version: &'static str,
    pub model: ModelState,
    pub sessions: usize,
    pub gate: GateSnapshot,
    pub queue: QueueStats,
    pub memory: MemorySnapshot,
}

/// Outcome of [`Backend::submit_inference`].
pub enum Submission {
    Completed(String),
    Queued(TaskTicket),
}

/// Handle on a turn that overflowed into the queue.
pub struct TaskTicket {
    id: TaskId,
    reply: Receiver<Result<String>>,
}

impl TaskTicket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the worker answers. Every queued task is answered, expires
    /// with `Timeout`, or is dropped (`Cancelled`).
    pub fn wait(self) -> Result<String> {
        self.reply.recv().unwrap_or(Err(BackendError::Cancelled))
    }
}

/// Ids handed out for turns that completed inline. Queue ids count up from 1
/// and never reach this range.
const INLINE_TASK_BASE: TaskId = 1 << 63;

/// A submitted turn waiting to be collected by [`Backend::task_result`].
enum PendingResult {
    Ready(Result<String>),
    Waiting(Receiver<Result<String>>),
}

pub struct BackendOptions {
    pub drain_timeout: Duration,
    pub usage_probe: Option<UsageProbe>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            usage_probe: None,
        }
    }
}

struct Shared {
    config: BackendConfig,
    /// Serialises changes to the session table with the gate's session count.
    admission: Mutex<()>,
    sessions: SessionStore,
    queue: TaskQueue,
    gate: ConcurrencyGate,
    memory: MemoryManager,
    model: ModelSwitcher,
}

pub struct Backend {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    results: Mutex<HashMap<TaskId, PendingResult>>,
    next_inline: AtomicU64,
}

impl Backend {
    /// Parses `config_json`, installs logging and starts the backend.
    pub fn from_json(config_json: Option<&str>, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let config = BackendConfig::from_json(config_json);
        logging::init_logging(&config.logging);
        Self::new(config, engine)
    }

    pub fn new(config: BackendConfig, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        Self::with_options(config, engine, BackendOptions::default())
    }

    pub fn with_options(config: BackendConfig, engine: Arc<dyn InferenceEngine>, options: BackendOptions) -> Result<Self> {
        let memory = match options.usage_probe {
            Some(probe) => MemoryManager::with_probe(config.memory.clone(), probe),
            None => MemoryManager::new(config.memory.clone()),
        };
        let shared = Arc::new(Shared {
            admission: Mutex::new(()),
            sessions: SessionStore::new(SessionPolicy::from(&config.backend)),
            queue: TaskQueue::new(&config.backend),
            gate: ConcurrencyGate::new(config.backend.max_concurrent),
            memory,
            model: ModelSwitcher::new(engine).with_drain_timeout(options.drain_timeout),
            config,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("nn-task-worker".into())
                .spawn(move || run_task_worker(shared))
                .map_err(|e| BackendError::Runtime(format!("failed to start task worker: {}", e)))?
        };

        let limits = &shared.config.backend;
        info!(
            max_sessions = limits.max_sessions,
            max_concurrent = limits.max_concurrent,
            queue_capacity = shared.queue.capacity(),
            idle_timeout_ms = limits.idle_timeout_ms,
            "backend initialised"
        );

        Ok(Self {
            shared,
            worker: Some(worker),
            results: Mutex::new(HashMap::new()),
            next_inline: AtomicU64::new(INLINE_TASK_BASE),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    /// Loads a model, hot-swapping the current one if any. Returns the graph
    /// id sessions must be opened against.
    pub fn load_model(&self, path: impl AsRef<Path>, config_json: Option<&str>) -> Result<u32> {
        let shared = self.shared.as_ref();
        shared.model.load(path.as_ref(), config_json, shared)
    }

    pub fn model_state(&self) -> ModelState {
        self.shared.model.snapshot()
    }

    /// Opens a session on the loaded model. `graph`, when given, must be the
    /// id returned by the latest load.
    pub fn create_session(&self, graph: Option<u32>) -> Result<SessionId> {
        let shared = &self.shared;
        let current = shared.current_graph()?;
        if let Some(graph) = graph.filter(|g| *g != current) {
            return Err(BackendError::NotFound(format!(
                "graph {} (current graph is {})",
                graph, current
            )));
        }

        let _admission = shared.admit();
        let idle = shared.sessions.evict_idle();
        shared.retire_sessions(&idle);

        shared.gate.admit_session()?;
        match shared.sessions.create(None) {
            Ok(created) => {
                shared.retire_sessions(&created.evicted);
                debug!(session = created.id, "execution context created");
                Ok(created.id)
            }
            Err(err) => {
                shared.gate.release_sessions(1);
                Err(err)
            }
        }
    }

    /// Closes a session. Queued turns for it are cancelled; a turn already
    /// decoding runs to completion.
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        let shared = &self.shared;
        let _admission = shared.admit();
        shared.sessions.close(id)?;
        shared.retire_sessions(&[id]);
        if shared.sessions.is_empty() {
            shared.memory.clear_kv_cache(shared.model.engine(), None);
        }
        debug!(session = id, "execution context closed");
        Ok(())
    }

    /// Runs a turn inline when a compute slot is free, otherwise queues it.
    pub fn submit_inference(&self, id: SessionId, prompt: &str, overrides: RuntimeOverrides) -> Result<Submission> {
        let shared = &self.shared;
        if !shared.sessions.contains(id) {
            return Err(BackendError::NotFound(format!("session {}", id)));
        }
        shared.current_graph()?;

        if let Some(_permit) = shared.gate.try_begin_compute() {
            return shared.execute(id, prompt, &overrides).map(Submission::Completed);
        }

        let (tx, rx) = mpsc::channel();
        let task = Task::new(id, prompt, shared.config.backend.task_timeout())
            .with_overrides(overrides)
            .with_reply(tx);
        let task_id = shared.queue.enqueue(task)?;
        debug!(session = id, task = task_id, "compute slots busy, turn queued");
        Ok(Submission::Queued(TaskTicket { id: task_id, reply: rx }))
    }

    /// Blocking inference with optional runtime JSON overrides.
    pub fn run_inference(&self, id: SessionId, prompt: &str, runtime_json: Option<&str>) -> Result<String> {
        match self.submit_inference(id, prompt, RuntimeOverrides::parse(runtime_json))? {
            Submission::Completed(text) => Ok(text),
            Submission::Queued(ticket) => ticket.wait(),
        }
    }

    /// Submits a turn whose outcome is collected later with
    /// [`Backend::task_result`]. Turns that run inline get an id too; it
    /// cannot be cancelled.
    pub fn submit_task(&self, id: SessionId, prompt: &str, overrides: RuntimeOverrides) -> Result<TaskId> {
        let (task, pending) = match self.submit_inference(id, prompt, overrides)? {
            Submission::Completed(text) => (
                self.next_inline.fetch_add(1, Ordering::Relaxed),
                PendingResult::Ready(Ok(text)),
            ),
            Submission::Queued(ticket) => (ticket.id, PendingResult::Waiting(ticket.reply)),
        };
        self.lock_results().insert(task, pending);
        Ok(task)
    }

    /// Outcome of a task from [`Backend::submit_task`]. Waits up to `wait`
    /// (`None` blocks until the worker answers) and returns `Ok(None)` while
    /// the task is still pending. A delivered outcome is forgotten, so a
    /// second call for the same id is `NotFound`.
    pub fn task_result(&self, task: TaskId, wait: Option<Duration>) -> Result<Option<String>> {
        let pending = self
            .lock_results()
            .remove(&task)
            .ok_or_else(|| BackendError::NotFound(format!("task {}", task)))?;

        let reply = match pending {
            PendingResult::Ready(outcome) => return outcome.map(Some),
            PendingResult::Waiting(reply) => reply,
        };
        let received = match wait {
            None => reply.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(wait) => reply.recv_timeout(wait),
        };
        match received {
            Ok(outcome) => outcome.map(Some),
            Err(RecvTimeoutError::Timeout) => {
                self.lock_results().insert(task, PendingResult::Waiting(reply));
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::Cancelled),
        }
    }

    fn lock_results(&self) -> MutexGuard<'_, HashMap<TaskId, PendingResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancels a queued turn. Turns already decoding are not interrupted.
    pub fn cancel_task(&self, task: TaskId) -> Result<()> {
        match self.shared.queue.cancel(task) {
            Some(task) => {
                debug!(task = task.id, session = task.session, "task cancelled");
                task.respond(Err(BackendError::Cancelled));
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("queued task {}", task))),
        }
    }

    pub fn session_info(&self, id: SessionId) -> Result<SessionInfo> {
        self.shared.sessions.info(id)
    }

    pub fn status(&self) -> BackendStatus {
        let shared = &self.shared;
        BackendStatus {
            version: crate::backend_version(),
            model: shared.model.snapshot(),
            sessions: shared.sessions.len(),
            gate: shared.gate.snapshot(),
            queue: shared.queue.stats(),
            memory: shared.memory.snapshot(),
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shared.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("task worker panicked");
            }
        }
        self.shared.model.unload();
        info!("backend shut down");
    }
}

impl Shared {
    fn admit(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_graph(&self) -> Result<u32> {
        match self.model.current_graph() {
            Some(graph) => Ok(graph),
            None if self.model.status() == ModelStatus::Unstable => Err(BackendError::Unstable(
                "no usable model after a failed switch; load a model first".into(),
            )),
            None => Err(BackendError::Runtime("no model loaded".into())),
        }
    }

    /// Frees what sessions that are already gone from the table still hold.
    fn retire_sessions(&self, ids: &[SessionId]) {
        if ids.is_empty() {
            return;
        }
        self.gate.release_sessions(ids.len());
        for &id in ids {
            for task in self.queue.cancel_session(id) {
                task.respond(Err(BackendError::Cancelled));
            }
            self.memory.clear_kv_cache(self.model.engine(), Some(id));
        }
    }

    fn execute(&self, id: SessionId, prompt: &str, overrides: &RuntimeOverrides) -> Result<String> {
        let lease = self.model.lease()?;
        let engine = lease.engine();
        let config = overrides.apply_to(&lease.config);

        let (history, _) = self.sessions.begin_turn(id, prompt)?;
        let incoming = engine.pending_tokens(id, &history);
        let n_past = self.memory.prepare_turn(engine, id, incoming, config.model.n_predict);

        let request = GenerationRequest {
            seq: id,
            messages: &history,
            sampling: &config.sampling,
            max_tokens: config.model.n_predict,
            stop: &config.stopping.stop,
            ignore_eos: config.stopping.ignore_eos,
        };

        match engine.generate(&request) {
            Ok(generation) => {
                let n_past = engine.n_past(id);
                if let Err(err) = self.sessions.finish_turn(id, Some(&generation.text), n_past) {
                    debug!(session = id, error = %err, "session closed while its turn was decoding");
                }
                debug!(
                    session = id,
                    prompt_tokens = generation.prompt_tokens,
                    generated_tokens = generation.generated_tokens,
                    stop_reason = ?generation.stop_reason,
                    n_past,
                    "turn complete"
                );
                Ok(generation.text)
            }
            Err(err) => {
                let _ = self.sessions.finish_turn(id, None, n_past);
                error!(session = id, error = %err, "inference failed");
                Err(err.into())
            }
        }
    }
}

impl SwitchHooks for Shared {
    fn outstanding_work(&self) -> usize {
        self.queue.stats().active as usize + self.gate.in_flight()
    }

    fn on_model_replaced(&self) {
        let _admission = self.admit();
        for id in self.sessions.ids() {
            for task in self.queue.cancel_session(id) {
                task.respond(Err(BackendError::Cancelled));
            }
        }
        let dropped = self.sessions.clear();
        self.gate.reset_sessions();
        if dropped > 0 {
            info!(dropped, "sessions cleared after model change");
        }
    }
}

fn run_task_worker(shared: Arc<Shared>) {
    debug!("task worker started");
    while let Some(task) = shared.queue.dequeue() {
        let Some(permit) = shared.gate.begin_compute_until(task.timeout_at) else {
            warn!(task = task.id, session = task.session, "no compute slot before task deadline");
            shared.queue.mark_timed_out();
            task.respond(Err(BackendError::Timeout(
                "no compute slot became free before the task deadline".into(),
            )));
            continue;
        };

        let outcome = shared.execute(task.session, &task.prompt, &task.overrides);
        drop(permit);
        shared.queue.mark_completed();
        task.respond(outcome);
    }
    debug!("task worker stopped");
}
