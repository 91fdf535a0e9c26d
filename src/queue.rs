//! Bounded three-tier task queue feeding the background worker.
//!
//! Tiers are drained urgent first, then normal (which also holds `High`
//! tasks), then low. Within a tier ordering is FIFO; with fair scheduling on,
//! the oldest task of a session other than the one served last goes first so
//! one chatty session cannot starve the others. A single mutex
//! guards all tiers and counters so [`TaskQueue::stats`] is always a
//! consistent snapshot.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BackendLimits;
use crate::config::runtime::RuntimeOverrides;
use crate::error::{BackendError, Result};
use crate::session::SessionId;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// An inference request that overflowed the concurrency gate.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub session: SessionId,
    pub priority: TaskPriority,
    pub created_at: Instant,
    pub timeout_at: Instant,
    pub prompt: String,
    pub overrides: RuntimeOverrides,
    reply: Option<Sender<Result<String>>>,
}

impl Task {
    pub fn new(session: SessionId, prompt: impl Into<String>, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: 0,
            session,
            priority: TaskPriority::Normal,
            created_at: now,
            timeout_at: now + timeout,
            prompt: prompt.into(),
            overrides: RuntimeOverrides::default(),
            reply: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_overrides(mut self, overrides: RuntimeOverrides) -> Self {
        self.priority = overrides.priority();
        self.overrides = overrides;
        self
    }

    pub fn with_reply(mut self, reply: Sender<Result<String>>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.timeout_at
    }

    /// Delivers the outcome to whoever is waiting on this task, if anyone.
    pub fn respond(mut self, outcome: Result<String>) {
        if let Some(reply) = self.reply.take() {
            // The waiter may have given up already.
            let _ = reply.send(outcome);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    /// Accepted tasks not yet completed, timed out or cancelled.
    pub active: u64,
    pub capacity: usize,
    pub urgent: usize,
    pub normal: usize,
    pub low: usize,
    pub submitted: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct QueueCounters {
    submitted: u64,
    completed: u64,
    timed_out: u64,
    rejected: u64,
    cancelled: u64,
}

struct QueueInner {
    urgent: VecDeque<Task>,
    normal: VecDeque<Task>,
    low: VecDeque<Task>,
    running: bool,
    next_id: TaskId,
    counters: QueueCounters,
    fair: bool,
    last_served: Option<SessionId>,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len() + self.low.len()
    }

    fn tiers_mut(&mut self) -> [&mut VecDeque<Task>; 3] {
        [&mut self.urgent, &mut self.normal, &mut self.low]
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for tier in self.tiers_mut() {
            let mut kept = VecDeque::with_capacity(tier.len());
            for task in tier.drain(..) {
                if task.is_expired(now) {
                    expired.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            *tier = kept;
        }

        let count = expired.len();
        self.counters.timed_out += count as u64;
        for task in expired {
            debug!(task = task.id, session = task.session, "queued task expired before dispatch");
            let waited = now.saturating_duration_since(task.created_at);
            task.respond(Err(BackendError::Timeout(format!(
                "task expired after {} ms in queue",
                waited.as_millis()
            ))));
        }
        count
    }

    fn pop_next(&mut self) -> Option<Task> {
        let fair = self.fair;
        let last = self.last_served;
        let task = self
            .tiers_mut()
            .into_iter()
            .find(|tier| !tier.is_empty())
            .and_then(|tier| {
                let pick = match last {
                    Some(last) if fair => tier.iter().position(|t| t.session != last).unwrap_or(0),
                    _ => 0,
                };
                tier.remove(pick)
            })?;
        self.last_served = Some(task.session);
        Some(task)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.urgent
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .map(|t| t.timeout_at)
            .min()
    }

    fn remove_where(&mut self, mut matches: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let mut removed = Vec::new();
        for tier in self.tiers_mut() {
            let mut i = 0;
            while i < tier.len() {
                if matches(&tier[i]) {
                    if let Some(task) = tier.remove(i) {
                        removed.push(task);
                    }
                } else {
                    i += 1;
                }
            }
        }
        self.counters.cancelled += removed.len() as u64;
        removed
    }
}

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
    warning_threshold: usize,
    priority_scheduling: bool,
    purge_on_enqueue: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskQueue {
    pub fn new(limits: &BackendLimits) -> Self {
        let capacity = limits.queue_size.min(limits.queue_reject_threshold).max(1);
        Self {
            inner: Mutex::new(QueueInner {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                running: true,
                next_id: 1,
                counters: QueueCounters::default(),
                fair: limits.fair_scheduling_enabled,
                last_served: None,
            }),
            available: Condvar::new(),
            capacity,
            warning_threshold: limits.queue_warning_threshold.min(capacity),
            priority_scheduling: limits.priority_scheduling_enabled,
            purge_on_enqueue: limits.auto_queue_cleanup,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let limits = BackendLimits {
            queue_size: capacity,
            queue_reject_threshold: capacity,
            queue_warning_threshold: capacity,
            fair_scheduling_enabled: false,
            ..BackendLimits::default()
        };
        Self::new(&limits)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds a task, assigning an id when it has none. A full queue rejects the
    /// task with `ResourceExhausted` and counts the rejection.
    pub fn enqueue(&self, mut task: Task) -> Result<TaskId> {
        let mut inner = lock(&self.inner);
        inner.counters.submitted += 1;

        if !inner.running {
            inner.counters.rejected += 1;
            return Err(BackendError::ResourceExhausted("task queue is shut down".into()));
        }
        if self.purge_on_enqueue {
            inner.purge_expired(Instant::now());
        }

        let size = inner.len();
        if size >= self.capacity {
            inner.counters.rejected += 1;
            warn!(size, capacity = self.capacity, "task queue full, rejecting task");
            return Err(BackendError::ResourceExhausted(format!(
                "task queue full ({}/{})",
                size, self.capacity
            )));
        }

        if task.id == 0 {
            task.id = inner.next_id;
            inner.next_id += 1;
        } else {
            inner.next_id = inner.next_id.max(task.id + 1);
        }
        let id = task.id;
        let priority = if self.priority_scheduling {
            task.priority
        } else {
            TaskPriority::Normal
        };

        match priority {
            TaskPriority::Urgent => inner.urgent.push_back(task),
            TaskPriority::High | TaskPriority::Normal => inner.normal.push_back(task),
            TaskPriority::Low => inner.low.push_back(task),
        }

        if size + 1 >= self.warning_threshold {
            warn!(size = size + 1, threshold = self.warning_threshold, "task queue nearing capacity");
        }
        debug!(task = id, ?priority, "task enqueued");
        drop(inner);
        self.available.notify_one();
        Ok(id)
    }

    /// Blocks until a live task is available or the queue is shut down
    /// (`None`). Expired tasks are purged on every wake-up and answered with
    /// `Timeout`.
    pub fn dequeue(&self) -> Option<Task> {
        let mut inner = lock(&self.inner);
        loop {
            if !inner.running {
                return None;
            }
            let now = Instant::now();
            inner.purge_expired(now);
            if let Some(task) = inner.pop_next() {
                return Some(task);
            }

            inner = match inner.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now) + Duration::from_millis(1);
                    self.available
                        .wait_timeout(inner, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Non-blocking variant used when draining.
    pub fn try_dequeue(&self) -> Option<Task> {
        let mut inner = lock(&self.inner);
        inner.purge_expired(Instant::now());
        inner.pop_next()
    }

    pub fn mark_completed(&self) {
        lock(&self.inner).counters.completed += 1;
    }

    /// Counts a dequeued task that missed its deadline before it could run.
    pub fn mark_timed_out(&self) {
        lock(&self.inner).counters.timed_out += 1;
    }

    /// Removes a still-queued task. Started tasks cannot be cancelled.
    pub fn cancel(&self, id: TaskId) -> Option<Task> {
        lock(&self.inner).remove_where(|t| t.id == id).pop()
    }

    pub fn cancel_session(&self, session: SessionId) -> Vec<Task> {
        lock(&self.inner).remove_where(|t| t.session == session)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner).running
    }

    /// Wakes every blocked consumer with the termination signal. Tasks still
    /// queued are answered with `Cancelled`.
    pub fn shutdown(&self) {
        let abandoned = {
            let mut inner = lock(&self.inner);
            inner.running = false;
            inner.remove_where(|_| true)
        };
        self.available.notify_all();
        if !abandoned.is_empty() {
            warn!(abandoned = abandoned.len(), "task queue shut down with unclaimed tasks");
        }
        for task in abandoned {
            task.respond(Err(BackendError::Cancelled));
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = lock(&self.inner);
        let c = &inner.counters;
        QueueStats {
            queued: inner.len(),
            active: c
                .submitted
                .saturating_sub(c.completed + c.timed_out + c.rejected + c.cancelled),
            capacity: self.capacity,
            urgent: inner.urgent.len(),
            normal: inner.normal.len(),
            low: inner.low.len(),
            submitted: c.submitted,
            completed: c.completed,
            timed_out: c.timed_out,
            rejected: c.rejected,
            cancelled: c.cancelled,
        }
    }
}
