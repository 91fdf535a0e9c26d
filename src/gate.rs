//! Admission control for sessions and inference compute.
//!
//! Opening a session past `max_concurrent` fails outright. Inference on an
//! existing session asks for a [`ComputePermit`]; when none is free the caller
//! routes the turn through the task queue and the worker waits here instead.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::error::{BackendError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    pub active_sessions: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

#[derive(Default)]
struct GateState {
    sessions: usize,
    in_flight: usize,
}

pub struct ConcurrencyGate {
    max_concurrent: usize,
    state: Mutex<GateState>,
    released: Condvar,
}

/// Held for the duration of one inference; dropping it frees the slot.
#[must_use = "dropping the permit releases the compute slot"]
pub struct ComputePermit<'a> {
    gate: &'a ConcurrencyGate,
}

impl Drop for ComputePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.gate.released.notify_all();
    }
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(GateState::default()),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Claims a session slot or fails with `ConcurrencyLimitExceeded`.
    pub fn admit_session(&self) -> Result<()> {
        let mut state = self.lock();
        if state.sessions + 1 > self.max_concurrent {
            return Err(BackendError::ConcurrencyLimitExceeded {
                active: state.sessions,
                limit: self.max_concurrent,
            });
        }
        state.sessions += 1;
        Ok(())
    }

    pub fn release_sessions(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        state.sessions = state.sessions.saturating_sub(count);
        debug!(released = count, active = state.sessions, "session slots released");
    }

    pub fn reset_sessions(&self) {
        self.lock().sessions = 0;
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().sessions
    }

    pub fn try_begin_compute(&self) -> Option<ComputePermit<'_>> {
        let mut state = self.lock();
        if state.in_flight + 1 > self.max_concurrent {
            return None;
        }
        state.in_flight += 1;
        Some(ComputePermit { gate: self })
    }

    /// Waits for a compute slot until `deadline`.
    pub fn begin_compute_until(&self, deadline: Instant) -> Option<ComputePermit<'_>> {
        let mut state = self.lock();
        while state.in_flight + 1 > self.max_concurrent {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        state.in_flight += 1;
        Some(ComputePermit { gate: self })
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.lock();
        GateSnapshot {
            active_sessions: state.sessions,
            in_flight: state.in_flight,
            max_concurrent: self.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn session_admission_is_capped() {
        let gate = ConcurrencyGate::new(2);
        gate.admit_session().expect("first");
        gate.admit_session().expect("second");
        let err = gate.admit_session().expect_err("third must fail");
        assert_eq!(err, BackendError::ConcurrencyLimitExceeded { active: 2, limit: 2 });

        gate.release_sessions(1);
        gate.admit_session().expect("slot freed");
        assert_eq!(gate.active_sessions(), 2);
    }

    #[test]
    fn permits_release_on_drop() {
        let gate = ConcurrencyGate::new(1);
        let permit = gate.try_begin_compute().expect("free slot");
        assert!(gate.try_begin_compute().is_none());
        drop(permit);
        assert!(gate.try_begin_compute().is_some());
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn waiting_for_a_permit_respects_the_deadline() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.try_begin_compute().expect("free slot");
        let started = Instant::now();
        assert!(gate
            .begin_compute_until(started + Duration::from_millis(30))
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn waiter_gets_the_slot_once_it_frees() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let held = gate.try_begin_compute().expect("free slot");
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.begin_compute_until(Instant::now() + Duration::from_secs(5))
                    .is_some()
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().expect("waiter thread"));
    }
}
