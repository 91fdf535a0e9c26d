use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::BackendLimits;
use crate::engine::{ChatMessage, Role};
use crate::error::{BackendError, Result};

pub type SessionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Ready,
    /// A turn is being generated; eviction skips the session.
    Running,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub label: String,
    pub state: SessionState,
    pub history: Vec<ChatMessage>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub turns: u32,
    /// Next free KV position for this session's sequence.
    pub n_past: u32,
}

impl Session {
    fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            label: format!("session_{}", id),
            state: SessionState::Ready,
            history: Vec::new(),
            created_at: now,
            last_activity: now,
            turns: 0,
            n_past: 0,
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub label: String,
    pub state: SessionState,
    pub turns: u32,
    pub messages: usize,
    pub n_past: u32,
    pub idle_ms: u64,
    pub age_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub auto_cleanup: bool,
}

impl From<&BackendLimits> for SessionPolicy {
    fn from(limits: &BackendLimits) -> Self {
        Self {
            max_sessions: limits.max_sessions,
            idle_timeout: limits.idle_timeout(),
            auto_cleanup: limits.auto_cleanup,
        }
    }
}

/// Result of a successful `create`: the new id plus whatever had to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: SessionId,
    pub evicted: Vec<SessionId>,
}

struct StoreInner {
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
}

/// Conversation table keyed by session id.
pub struct SessionStore {
    policy: SessionPolicy,
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(StoreInner {
                sessions: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, requested: Option<SessionId>) -> Result<Created> {
        self.create_at(requested, Instant::now())
    }

    pub(crate) fn create_at(&self, requested: Option<SessionId>, now: Instant) -> Result<Created> {
        let mut inner = self.lock();

        if let Some(id) = requested {
            if inner.sessions.contains_key(&id) {
                return Err(BackendError::InvalidArgument(format!("session {} already exists", id)));
            }
        }

        let evicted = if self.policy.auto_cleanup {
            let mut evicted = self.evict_idle_locked(&mut inner, now);
            evicted.extend(self.evict_lru_locked(&mut inner));
            evicted
        } else {
            Vec::new()
        };

        if inner.sessions.len() >= self.policy.max_sessions {
            return Err(BackendError::ResourceExhausted(format!(
                "session table full ({}/{})",
                inner.sessions.len(),
                self.policy.max_sessions
            )));
        }

        let id = match requested {
            Some(id) => {
                inner.next_id = inner.next_id.max(id.saturating_add(1));
                id
            }
            None => {
                let mut id = inner.next_id;
                while inner.sessions.contains_key(&id) {
                    id = id.wrapping_add(1).max(1);
                }
                inner.next_id = id.wrapping_add(1).max(1);
                id
            }
        };

        inner.sessions.insert(id, Session::new(id, now));
        debug!(session = id, total = inner.sessions.len(), "session created");
        Ok(Created { id, evicted })
    }

    /// Idle sweep alone; the backend runs it before admission so idle
    /// sessions free their concurrency slots first.
    pub fn evict_idle(&self) -> Vec<SessionId> {
        self.evict_idle_at(Instant::now())
    }

    pub(crate) fn evict_idle_at(&self, now: Instant) -> Vec<SessionId> {
        if !self.policy.auto_cleanup {
            return Vec::new();
        }
        let mut inner = self.lock();
        self.evict_idle_locked(&mut inner, now)
    }

    fn evict_idle_locked(&self, inner: &mut StoreInner, now: Instant) -> Vec<SessionId> {
        let mut idle: Vec<(Instant, SessionId)> = inner
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Ready && s.idle_for(now) > self.policy.idle_timeout)
            .map(|s| (s.last_activity, s.id))
            .collect();
        idle.sort();

        for (_, id) in &idle {
            inner.sessions.remove(id);
            info!(session = id, "evicted idle session");
        }
        idle.into_iter().map(|(_, id)| id).collect()
    }

    fn evict_lru_locked(&self, inner: &mut StoreInner) -> Vec<SessionId> {
        let count = inner.sessions.len();
        if count < self.policy.max_sessions {
            return Vec::new();
        }

        let mut candidates: Vec<(Instant, SessionId)> = inner
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Ready)
            .map(|s| (s.last_activity, s.id))
            .collect();
        candidates.sort();

        let excess = count - self.policy.max_sessions + 1;
        candidates
            .into_iter()
            .take(excess)
            .map(|(_, id)| {
                inner.sessions.remove(&id);
                info!(session = id, "evicted least recently used session");
                id
            })
            .collect()
    }

    /// Removes a session. A second close of the same id is `NotFound`.
    pub fn close(&self, id: SessionId) -> Result<Session> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .remove(&id)
            .ok_or_else(|| BackendError::NotFound(format!("session {}", id)))?;
        debug!(session = id, remaining = inner.sessions.len(), "session closed");
        Ok(session)
    }

    pub fn touch(&self, id: SessionId) -> Result<()> {
        self.with_session(id, |s| s.last_activity = Instant::now())
    }

    pub fn append(&self, id: SessionId, role: Role, content: &str) -> Result<()> {
        self.with_session(id, |s| {
            s.history.push(ChatMessage::new(role, content));
            s.last_activity = Instant::now();
        })
    }

    /// Starts a turn: records the user message, marks the session running and
    /// returns the history to render.
    pub fn begin_turn(&self, id: SessionId, prompt: &str) -> Result<(Vec<ChatMessage>, u32)> {
        self.with_session(id, |s| {
            s.history.push(ChatMessage::new(Role::User, prompt));
            s.state = SessionState::Running;
            s.last_activity = Instant::now();
            (s.history.clone(), s.n_past)
        })
    }

    /// Ends a turn. A failed turn drops its user message so the history stays
    /// a sequence of answered exchanges.
    pub fn finish_turn(&self, id: SessionId, reply: Option<&str>, n_past: u32) -> Result<()> {
        self.with_session(id, |s| {
            match reply {
                Some(text) => {
                    s.history.push(ChatMessage::new(Role::Assistant, text));
                    s.turns += 1;
                    s.n_past = n_past;
                }
                None => {
                    if s.history.last().is_some_and(|m| m.role == Role::User) {
                        s.history.pop();
                    }
                }
            }
            s.state = SessionState::Ready;
            s.last_activity = Instant::now();
        })
    }

    pub fn set_n_past(&self, id: SessionId, n_past: u32) -> Result<()> {
        self.with_session(id, |s| s.n_past = n_past)
    }

    pub fn n_past(&self, id: SessionId) -> Result<u32> {
        self.with_session(id, |s| s.n_past)
    }

    pub fn history(&self, id: SessionId) -> Result<Vec<ChatMessage>> {
        self.with_session(id, |s| s.history.clone())
    }

    pub fn info(&self, id: SessionId) -> Result<SessionInfo> {
        let now = Instant::now();
        self.with_session(id, |s| SessionInfo {
            id: s.id,
            label: s.label.clone(),
            state: s.state,
            turns: s.turns,
            messages: s.history.len(),
            n_past: s.n_past,
            idle_ms: s.idle_for(now).as_millis() as u64,
            age_ms: now.saturating_duration_since(s.created_at).as_millis() as u64,
        })
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every session and restarts ids at 1. Returns how many were open.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.sessions.len();
        inner.sessions.clear();
        inner.next_id = 1;
        dropped
    }

    fn with_session<T>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("session {}", id)))?;
        Ok(f(session))
    }

    #[cfg(test)]
    fn set_last_activity(&self, id: SessionId, at: Instant) {
        if let Some(s) = self.lock().sessions.get_mut(&id) {
            s.last_activity = at;
        }
    }
}
