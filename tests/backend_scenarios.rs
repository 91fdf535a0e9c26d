use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use llama_nn_backend::config::model::ModelConfig;
use llama_nn_backend::config::runtime::RuntimeOverrides;
use llama_nn_backend::config::{BackendConfig, BackendLimits};
use llama_nn_backend::engine::{
    EngineError, EngineResult, Generation, GenerationRequest, InferenceEngine, KvCache, ModelDescription, Role, SeqId,
    StopReason,
};
use llama_nn_backend::memory::ledger::SharedLedger;
use llama_nn_backend::model::ModelStatus;
use llama_nn_backend::{Backend, BackendError, BackendOptions, Submission};

/// Blocks callers of `pass` while closed.
#[derive(Default)]
struct Latch {
    closed: Mutex<bool>,
    opened: Condvar,
}

impl Latch {
    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.opened.notify_all();
    }

    fn pass(&self) {
        let mut closed = self.closed.lock().unwrap();
        while *closed {
            closed = self.opened.wait(closed).unwrap();
        }
    }
}

/// Scripted engine: echoes the last user message, appends a fixed number of
/// cells per turn to a ledger-backed KV cache, fails loads of chosen files.
struct MockEngine {
    kv: SharedLedger,
    loaded: Mutex<Option<PathBuf>>,
    failing: Mutex<HashSet<String>>,
    cells_per_turn: u32,
    generation_latch: Latch,
    load_latch: Latch,
    generating: AtomicUsize,
    loads_started: AtomicUsize,
}

impl MockEngine {
    fn new() -> Self {
        Self::with_cells_per_turn(16)
    }

    fn with_cells_per_turn(cells_per_turn: u32) -> Self {
        Self {
            kv: SharedLedger::new(0),
            loaded: Mutex::new(None),
            failing: Mutex::new(HashSet::new()),
            cells_per_turn,
            generation_latch: Latch::default(),
            load_latch: Latch::default(),
            generating: AtomicUsize::new(0),
            loads_started: AtomicUsize::new(0),
        }
    }

    fn fail_loads_of(&self, file: &str) {
        self.failing.lock().unwrap().insert(file.to_string());
    }

    fn allow_loads_of(&self, file: &str) {
        self.failing.lock().unwrap().remove(file);
    }

    fn loaded_file(&self) -> Option<String> {
        self.loaded
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

impl KvCache for MockEngine {
    fn n_ctx(&self) -> u32 {
        self.kv.n_ctx()
    }

    fn seq_pos_max(&self, seq: Option<SeqId>) -> Option<u32> {
        self.kv.seq_pos_max(seq)
    }

    fn seq_rm(&self, seq: Option<SeqId>, p0: u32, p1: Option<u32>) -> bool {
        self.kv.seq_rm(seq, p0, p1)
    }

    fn seq_add(&self, seq: SeqId, p0: u32, p1: Option<u32>, delta: i32) {
        self.kv.seq_add(seq, p0, p1, delta)
    }

    fn clear(&self) {
        self.kv.clear()
    }
}

impl InferenceEngine for MockEngine {
    fn load_model(&self, path: &Path, _config: &ModelConfig) -> EngineResult<ModelDescription> {
        self.loads_started.fetch_add(1, Ordering::SeqCst);
        self.load_latch.pass();
        let file = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if self.failing.lock().unwrap().contains(&file) {
            return Err(EngineError::ModelLoad(format!("{} is corrupt", file)));
        }
        *self.loaded.lock().unwrap() = Some(path.to_path_buf());
        Ok(ModelDescription {
            description: "llama 7B Q4_K_M".into(),
            vocab_size: 32_000,
            context_length: 4096,
        })
    }

    fn init_runtime(&self, config: &ModelConfig) -> EngineResult<()> {
        self.kv.set_n_ctx(config.model.ctx_size);
        Ok(())
    }

    fn release_slots(&self) {}

    fn unload_model(&self) {
        *self.loaded.lock().unwrap() = None;
        self.kv.clear();
    }

    fn is_loaded(&self) -> bool {
        self.loaded.lock().unwrap().is_some()
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> EngineResult<Generation> {
        self.generating.fetch_add(1, Ordering::SeqCst);
        self.generation_latch.pass();
        self.generating.fetch_sub(1, Ordering::SeqCst);

        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.kv
            .lock()
            .append(request.seq, &vec![7; self.cells_per_turn as usize]);
        Ok(Generation {
            text: format!("echo:{}:{}", request.max_tokens, user),
            prompt_tokens: self.cells_per_turn,
            generated_tokens: 1,
            stop_reason: StopReason::EndOfSequence,
        })
    }
}

fn config(json: &str) -> BackendConfig {
    BackendConfig::from_json(Some(json))
}

fn start(config: BackendConfig, engine: &Arc<MockEngine>) -> Backend {
    let engine: Arc<dyn InferenceEngine> = engine.clone();
    Backend::new(config, engine).expect("backend starts")
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn queued(submission: Submission) -> llama_nn_backend::TaskTicket {
    match submission {
        Submission::Queued(ticket) => ticket,
        Submission::Completed(text) => panic!("expected the turn to queue, it completed with {:?}", text),
    }
}

#[test]
fn second_close_frees_slot_for_third_session() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":2}}"#), &engine);
    let graph = backend.load_model("/models/a.gguf", None).expect("load");

    let first = backend.create_session(Some(graph)).expect("first session");
    backend.create_session(Some(graph)).expect("second session");
    let err = backend.create_session(Some(graph)).expect_err("third must be refused");
    assert_eq!(err, BackendError::ConcurrencyLimitExceeded { active: 2, limit: 2 });

    backend.close_session(first).expect("close");
    backend.create_session(Some(graph)).expect("third session after close");
    assert_eq!(backend.status().gate.active_sessions, 2);
}

#[test]
fn concurrent_creates_never_exceed_max_concurrent() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":3}}"#), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..12).map(|_| scope.spawn(|| backend.create_session(None))).collect();
        handles.into_iter().map(|h| h.join().expect("creator thread")).collect()
    });

    let created = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(created, 3);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, BackendError::ConcurrencyLimitExceeded { limit: 3, .. })));
    assert_eq!(backend.status().gate.active_sessions, 3);
}

#[test]
fn session_count_stays_in_step_with_the_gate_across_switches() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":4}}"#), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    if let Ok(id) = backend.create_session(None) {
                        let _ = backend.close_session(id);
                    }
                    let _ = backend.create_session(None);
                }
            });
        }
        scope.spawn(|| {
            for i in 0..20 {
                let model = if i % 2 == 0 { "/models/b.gguf" } else { "/models/a.gguf" };
                backend.load_model(model, None).expect("switch");
            }
        });
    });

    let status = backend.status();
    assert_eq!(status.gate.active_sessions, status.sessions);
    assert!(status.sessions <= 4);
}

#[test]
fn sessions_need_a_loaded_model_and_the_current_graph() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    assert!(matches!(backend.create_session(None), Err(BackendError::Runtime(_))));

    let old = backend.load_model("/models/a.gguf", None).expect("load a");
    let new = backend.load_model("/models/b.gguf", None).expect("load b");
    assert_ne!(old, new);
    assert!(matches!(backend.create_session(Some(old)), Err(BackendError::NotFound(_))));
    backend.create_session(Some(new)).expect("session on current graph");
}

#[test]
fn turns_accumulate_history_and_positions() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    assert_eq!(backend.run_inference(session, "hello", None).expect("turn 1"), "echo:512:hello");
    assert_eq!(backend.run_inference(session, "again", None).expect("turn 2"), "echo:512:again");

    let info = backend.session_info(session).expect("info");
    assert_eq!(info.turns, 2);
    assert_eq!(info.messages, 4);
    assert_eq!(info.n_past, 32);
    assert_eq!(info.label, format!("session_{}", session));
}

#[test]
fn runtime_overrides_apply_to_one_call_only() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend
        .load_model("/models/a.gguf", Some(r#"{"model":{"n_predict":64}}"#))
        .expect("load");
    let session = backend.create_session(None).expect("session");

    let reply = backend
        .run_inference(session, "short", Some(r#"{"max_tokens":3,"temperature":0.1}"#))
        .expect("turn with overrides");
    assert_eq!(reply, "echo:3:short");
    assert_eq!(backend.run_inference(session, "base", None).expect("turn"), "echo:64:base");
    assert_eq!(
        backend.run_inference(session, "bad json", Some("{not json")).expect("turn"),
        "echo:64:bad json"
    );
}

#[test]
fn inference_on_unknown_session_is_not_found() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    assert!(matches!(backend.run_inference(42, "hi", None), Err(BackendError::NotFound(_))));

    let session = backend.create_session(None).expect("session");
    backend.close_session(session).expect("close");
    assert!(matches!(backend.close_session(session), Err(BackendError::NotFound(_))));
}

#[test]
fn failed_switch_restores_previous_model() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load a");
    let session = backend.create_session(None).expect("session");
    let before = backend.model_state();

    engine.fail_loads_of("b.gguf");
    let err = backend.load_model("/models/b.gguf", None).expect_err("switch fails");
    assert!(matches!(err, BackendError::Runtime(_)), "got {:?}", err);

    let after = backend.model_state();
    assert_eq!(after, before);
    assert_eq!(after.status, ModelStatus::Ready);
    assert_eq!(engine.loaded_file().as_deref(), Some("a.gguf"));

    assert_eq!(backend.run_inference(session, "still here?", None).expect("turn"), "echo:512:still here?");
}

#[test]
fn failed_switch_and_restore_leave_backend_unstable_until_next_load() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load a");
    let session = backend.create_session(None).expect("session");

    engine.fail_loads_of("a.gguf");
    engine.fail_loads_of("b.gguf");
    let err = backend.load_model("/models/b.gguf", None).expect_err("switch fails");
    assert!(matches!(err, BackendError::Unstable(_)), "got {:?}", err);
    assert_eq!(backend.status().model.status, ModelStatus::Unstable);

    assert!(matches!(backend.run_inference(session, "hi", None), Err(BackendError::Unstable(_))));
    assert!(matches!(backend.create_session(None), Err(BackendError::Unstable(_))));

    engine.allow_loads_of("a.gguf");
    backend.load_model("/models/c.gguf", None).expect("recovering load");
    assert_eq!(backend.status().model.status, ModelStatus::Ready);
    assert_eq!(backend.status().sessions, 0);
    backend.create_session(None).expect("session after recovery");
}

#[test]
fn successful_switch_drops_sessions_and_bumps_graph() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    let first = backend.load_model("/models/a.gguf", None).expect("load a");
    let session = backend.create_session(None).expect("session");
    backend.run_inference(session, "hi", None).expect("turn");

    let second = backend.load_model("/models/b.gguf", None).expect("switch");
    assert_eq!(second, first + 1);
    assert!(matches!(backend.session_info(session), Err(BackendError::NotFound(_))));

    let status = backend.status();
    assert_eq!(status.sessions, 0);
    assert_eq!(status.gate.active_sessions, 0);
    assert_eq!(status.model.name, "b.gguf");
    assert_eq!(engine.seq_pos_max(None), None);
}

#[test]
fn overlapping_switch_is_already_in_progress() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load a");

    engine.load_latch.close();
    thread::scope(|scope| {
        let switch = scope.spawn(|| backend.load_model("/models/b.gguf", None));
        wait_until("switch to reach the engine", || engine.loads_started.load(Ordering::SeqCst) == 2);

        assert_eq!(backend.load_model("/models/c.gguf", None), Err(BackendError::AlreadyInProgress));
        assert_eq!(backend.model_state().status, ModelStatus::Switching);

        engine.load_latch.open();
        assert_eq!(switch.join().expect("switch thread"), Ok(2));
    });
    assert_eq!(backend.model_state().name, "b.gguf");
}

#[test]
fn overflowing_turn_runs_on_the_worker() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":1}}"#), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    engine.generation_latch.close();
    thread::scope(|scope| {
        let first = scope.spawn(|| backend.run_inference(session, "first", None));
        wait_until("first turn to start", || engine.generating.load(Ordering::SeqCst) == 1);

        let ticket = queued(
            backend
                .submit_inference(session, "second", RuntimeOverrides::default())
                .expect("submit"),
        );
        assert_eq!(backend.status().queue.active, 1);

        engine.generation_latch.open();
        assert_eq!(first.join().expect("first thread").expect("first turn"), "echo:512:first");
        assert_eq!(ticket.wait().expect("queued turn"), "echo:512:second");
    });

    let stats = backend.status().queue;
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(backend.session_info(session).expect("info").turns, 2);
}

#[test]
fn queued_turn_times_out_when_no_slot_frees() {
    let engine = Arc::new(MockEngine::new());
    let mut cfg = BackendConfig::default();
    cfg.backend = BackendLimits {
        max_concurrent: 1,
        default_task_timeout_ms: 50,
        ..BackendLimits::default()
    };
    let backend = start(cfg, &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    engine.generation_latch.close();
    thread::scope(|scope| {
        let first = scope.spawn(|| backend.run_inference(session, "slow", None));
        wait_until("first turn to start", || engine.generating.load(Ordering::SeqCst) == 1);

        let ticket = queued(
            backend
                .submit_inference(session, "late", RuntimeOverrides::default())
                .expect("submit"),
        );
        assert!(matches!(ticket.wait(), Err(BackendError::Timeout(_))));

        engine.generation_latch.open();
        first.join().expect("first thread").expect("first turn");
    });
    assert_eq!(backend.status().queue.timed_out, 1);
}

#[test]
fn queued_turns_can_be_cancelled() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":1}}"#), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    engine.generation_latch.close();
    thread::scope(|scope| {
        let first = scope.spawn(|| backend.run_inference(session, "busy", None));
        wait_until("first turn to start", || engine.generating.load(Ordering::SeqCst) == 1);

        let kept = queued(backend.submit_inference(session, "kept", RuntimeOverrides::default()).expect("submit"));
        let dropped = queued(
            backend
                .submit_inference(session, "dropped", RuntimeOverrides::default())
                .expect("submit"),
        );
        let dropped_id = dropped.id();
        backend.cancel_task(dropped_id).expect("cancel queued task");
        assert_eq!(dropped.wait(), Err(BackendError::Cancelled));
        assert!(matches!(backend.cancel_task(dropped_id), Err(BackendError::NotFound(_))));

        engine.generation_latch.open();
        first.join().expect("first thread").expect("first turn");
        assert_eq!(kept.wait().expect("kept turn"), "echo:512:kept");
    });
    assert_eq!(backend.status().queue.cancelled, 1);
}

#[test]
fn idle_eviction_frees_the_slot_and_cancels_queued_turns() {
    let engine = Arc::new(MockEngine::new());
    let mut cfg = BackendConfig::default();
    cfg.backend = BackendLimits {
        max_concurrent: 2,
        idle_timeout_ms: 50,
        ..BackendLimits::default()
    };
    let backend = start(cfg, &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let idle = backend.create_session(None).expect("idle session");
    let busy = backend.create_session(None).expect("busy session");
    assert!(matches!(
        backend.create_session(None),
        Err(BackendError::ConcurrencyLimitExceeded { active: 2, limit: 2 })
    ));

    engine.generation_latch.close();
    thread::scope(|scope| {
        let first = scope.spawn(|| backend.run_inference(busy, "one", None));
        let second = scope.spawn(|| backend.run_inference(busy, "two", None));
        wait_until("both slots to be taken", || engine.generating.load(Ordering::SeqCst) == 2);

        // The worker takes this one and waits for a slot, so the next task stays queued.
        let held = queued(backend.submit_inference(busy, "three", RuntimeOverrides::default()).expect("submit"));
        wait_until("worker to pick up the held task", || backend.status().queue.queued == 0);
        let stale = queued(backend.submit_inference(idle, "stale", RuntimeOverrides::default()).expect("submit"));
        assert_eq!(backend.status().queue.queued, 1);

        thread::sleep(Duration::from_millis(120));
        let fresh = backend.create_session(None).expect("slot freed by idle eviction");
        assert_ne!(fresh, idle);
        assert_eq!(stale.wait(), Err(BackendError::Cancelled));
        assert!(matches!(backend.session_info(idle), Err(BackendError::NotFound(_))));
        assert!(backend.session_info(busy).is_ok());
        assert_eq!(backend.status().gate.active_sessions, 2);

        engine.generation_latch.open();
        first.join().expect("first thread").expect("first turn");
        second.join().expect("second thread").expect("second turn");
        held.wait().expect("held turn");
    });
    assert_eq!(engine.seq_pos_max(Some(idle)), None);
}

#[test]
fn submitted_tasks_are_collected_by_id() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":1}}"#), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    let inline = backend
        .submit_task(session, "now", RuntimeOverrides::default())
        .expect("inline submit");
    assert_eq!(backend.task_result(inline, Some(Duration::ZERO)), Ok(Some("echo:512:now".into())));
    assert!(matches!(backend.task_result(inline, None), Err(BackendError::NotFound(_))));
    assert!(matches!(backend.cancel_task(inline), Err(BackendError::NotFound(_))));

    engine.generation_latch.close();
    thread::scope(|scope| {
        let first = scope.spawn(|| backend.run_inference(session, "busy", None));
        wait_until("first turn to start", || engine.generating.load(Ordering::SeqCst) == 1);

        let later = backend
            .submit_task(session, "later", RuntimeOverrides::default())
            .expect("queued submit");
        let doomed = backend
            .submit_task(session, "doomed", RuntimeOverrides::default())
            .expect("queued submit");
        assert_eq!(backend.task_result(later, Some(Duration::from_millis(20))), Ok(None));

        backend.cancel_task(doomed).expect("cancel");
        assert_eq!(backend.task_result(doomed, None), Err(BackendError::Cancelled));

        engine.generation_latch.open();
        first.join().expect("first thread").expect("first turn");
        assert_eq!(backend.task_result(later, None), Ok(Some("echo:512:later".into())));
    });
}

#[test]
fn full_queue_rejects_overflow() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(config(r#"{"backend":{"max_concurrent":1,"queue_size":1}}"#), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    engine.generation_latch.close();
    thread::scope(|scope| {
        let first = scope.spawn(|| backend.run_inference(session, "busy", None));
        wait_until("first turn to start", || engine.generating.load(Ordering::SeqCst) == 1);

        let one = queued(backend.submit_inference(session, "one", RuntimeOverrides::default()).expect("submit"));
        // The worker may already hold `one`; fill whatever room is left.
        let mut extra = Vec::new();
        let rejected = loop {
            match backend.submit_inference(session, "more", RuntimeOverrides::default()) {
                Ok(submission) => extra.push(queued(submission)),
                Err(err) => break err,
            }
            assert!(extra.len() <= 1, "queue of size 1 accepted too many tasks");
        };
        assert!(matches!(rejected, BackendError::ResourceExhausted(_)));
        assert!(backend.status().queue.rejected >= 1);

        engine.generation_latch.open();
        first.join().expect("first thread").expect("first turn");
        one.wait().expect("queued turn");
        for ticket in extra {
            ticket.wait().expect("extra turn");
        }
    });
}

#[test]
fn long_conversations_shift_the_context_window() {
    let engine = Arc::new(MockEngine::with_cells_per_turn(300));
    let backend = start(config(r#"{"memory_policy":{"n_keep_tokens":64}}"#), &engine);
    backend
        .load_model("/models/a.gguf", Some(r#"{"model":{"ctx_size":600,"n_predict":100}}"#))
        .expect("load");
    let session = backend.create_session(None).expect("session");

    backend.run_inference(session, "one", None).expect("turn 1");
    backend.run_inference(session, "two", None).expect("turn 2");
    assert_eq!(backend.status().memory.context_shifts, 0);
    assert_eq!(backend.session_info(session).expect("info").n_past, 600);

    backend.run_inference(session, "three", None).expect("turn 3");
    assert_eq!(backend.status().memory.context_shifts, 1);
    // 600 - (600 - 64) / 2 retained, then another 300 cells.
    assert_eq!(backend.session_info(session).expect("info").n_past, 632);
}

#[test]
fn memory_pressure_is_handled_before_a_turn() {
    let engine = Arc::new(MockEngine::new());
    let cfg = config(r#"{"memory_policy":{"max_memory_mb":256,"memory_pressure_threshold":0.8}}"#);
    let options = BackendOptions {
        usage_probe: Some(Box::new(|| 250 * 1024 * 1024)),
        ..BackendOptions::default()
    };
    let shared: Arc<dyn InferenceEngine> = engine.clone();
    let backend = Backend::with_options(cfg, shared, options).expect("backend");
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");

    backend.run_inference(session, "hi", None).expect("turn under pressure");
    let memory = backend.status().memory;
    assert_eq!(memory.pressure_events, 1);
    assert!(memory.under_pressure);
}

#[test]
fn closing_last_session_clears_the_whole_cache() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let a = backend.create_session(None).expect("a");
    let b = backend.create_session(None).expect("b");
    backend.run_inference(a, "x", None).expect("turn a");
    backend.run_inference(b, "y", None).expect("turn b");

    backend.close_session(a).expect("close a");
    assert_eq!(engine.seq_pos_max(Some(a)), None);
    assert!(engine.seq_pos_max(Some(b)).is_some());

    backend.close_session(b).expect("close b");
    assert_eq!(engine.seq_pos_max(None), None);
    assert_eq!(backend.status().memory.full_clears, 1);
}

#[test]
fn status_json_matches_schema() {
    let engine = Arc::new(MockEngine::new());
    let backend = start(BackendConfig::default(), &engine);
    backend.load_model("/models/a.gguf", None).expect("load");
    let session = backend.create_session(None).expect("session");
    backend.run_inference(session, "hi", None).expect("turn");

    let schema = serde_json::json!({
        "type": "object",
        "required": ["version", "model", "sessions", "gate", "queue", "memory"],
        "properties": {
            "version": { "type": "string" },
            "sessions": { "type": "integer", "minimum": 0 },
            "model": {
                "type": "object",
                "required": ["status", "graph", "name", "version", "architecture", "context_length"],
                "properties": {
                    "status": { "enum": ["empty", "ready", "switching", "unstable"] },
                    "graph": { "type": "integer", "minimum": 0 }
                }
            },
            "gate": {
                "type": "object",
                "required": ["active_sessions", "in_flight", "max_concurrent"]
            },
            "queue": {
                "type": "object",
                "required": ["queued", "active", "capacity", "submitted", "completed", "timed_out", "rejected", "cancelled"]
            },
            "memory": {
                "type": "object",
                "required": ["usage_bytes", "context_shifts", "partial_clears", "full_clears", "pressure_events"]
            }
        }
    });
    let compiled = jsonschema::JSONSchema::compile(&schema).expect("schema compiles");

    let status = serde_json::to_value(backend.status()).expect("status serialises");
    assert!(compiled.is_valid(&status), "status JSON: {}", status);
    assert_eq!(status["model"]["architecture"], "llama");
    assert_eq!(status["sessions"], 1);

    let info = serde_json::to_value(backend.session_info(session).expect("info")).expect("info serialises");
    assert_eq!(info["turns"], 1);
    assert_eq!(info["state"], "ready");
}
