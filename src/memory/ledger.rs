use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::{KvCache, SeqId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cell {
    pos: u32,
    token: u32,
}

/// Book-keeping of which token sits at which KV position, per sequence.
///
/// Engines whose attention cache cannot be edited in place keep one of these
/// and rebuild the cache from [`PositionLedger::tokens`] before decoding.
#[derive(Debug, Default, Clone)]
pub struct PositionLedger {
    seqs: BTreeMap<SeqId, Vec<Cell>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_pos(&self, seq: SeqId) -> u32 {
        self.pos_max(Some(seq)).map_or(0, |p| p + 1)
    }

    /// Appends tokens after the current last position of `seq`.
    pub fn append(&mut self, seq: SeqId, tokens: &[u32]) {
        let start = self.next_pos(seq);
        let cells = self.seqs.entry(seq).or_default();
        cells.extend(
            tokens
                .iter()
                .enumerate()
                .map(|(i, &token)| Cell {
                    pos: start + i as u32,
                    token,
                }),
        );
    }

    /// Replaces the whole sequence with `tokens` at positions `0..len`.
    pub fn replace(&mut self, seq: SeqId, tokens: &[u32]) {
        self.seqs.remove(&seq);
        self.append(seq, tokens);
    }

    /// Tokens of `seq` in position order.
    pub fn tokens(&self, seq: SeqId) -> Vec<u32> {
        self.seqs
            .get(&seq)
            .map(|cells| cells.iter().map(|c| c.token).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, seq: SeqId) -> usize {
        self.seqs.get(&seq).map_or(0, Vec::len)
    }

    pub fn used_cells(&self) -> usize {
        self.seqs.values().map(Vec::len).sum()
    }

    pub fn pos_max(&self, seq: Option<SeqId>) -> Option<u32> {
        match seq {
            Some(seq) => self.seqs.get(&seq)?.iter().map(|c| c.pos).max(),
            None => self.seqs.values().flatten().map(|c| c.pos).max(),
        }
    }

    pub fn remove(&mut self, seq: Option<SeqId>, p0: u32, p1: Option<u32>) {
        let end = p1.unwrap_or(u32::MAX);
        let in_range = |c: &Cell| c.pos >= p0 && c.pos < end;
        match seq {
            Some(seq) => {
                if let Some(cells) = self.seqs.get_mut(&seq) {
                    cells.retain(|c| !in_range(c));
                }
            }
            None => {
                for cells in self.seqs.values_mut() {
                    cells.retain(|c| !in_range(c));
                }
            }
        }
        self.seqs.retain(|_, cells| !cells.is_empty());
    }

    /// Shifts positions in `[p0, p1)` by `delta`; cells pushed below zero are
    /// dropped.
    pub fn shift(&mut self, seq: SeqId, p0: u32, p1: Option<u32>, delta: i32) {
        let end = p1.unwrap_or(u32::MAX);
        if let Some(cells) = self.seqs.get_mut(&seq) {
            cells.retain_mut(|c| {
                if c.pos < p0 || c.pos >= end {
                    return true;
                }
                match c.pos.checked_add_signed(delta) {
                    Some(pos) => {
                        c.pos = pos;
                        true
                    }
                    None => false,
                }
            });
            cells.sort_by_key(|c| c.pos);
        }
    }

    pub fn clear(&mut self) {
        self.seqs.clear();
    }
}

/// A [`PositionLedger`] behind a mutex, usable as a [`KvCache`].
#[derive(Debug)]
pub struct SharedLedger {
    n_ctx: Mutex<u32>,
    ledger: Mutex<PositionLedger>,
}

impl SharedLedger {
    pub fn new(n_ctx: u32) -> Self {
        Self {
            n_ctx: Mutex::new(n_ctx),
            ledger: Mutex::new(PositionLedger::new()),
        }
    }

    pub fn set_n_ctx(&self, n_ctx: u32) {
        *self.n_ctx.lock().unwrap_or_else(PoisonError::into_inner) = n_ctx;
    }

    pub fn lock(&self) -> MutexGuard<'_, PositionLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvCache for SharedLedger {
    fn n_ctx(&self) -> u32 {
        *self.n_ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seq_pos_max(&self, seq: Option<SeqId>) -> Option<u32> {
        self.lock().pos_max(seq)
    }

    fn seq_rm(&self, seq: Option<SeqId>, p0: u32, p1: Option<u32>) -> bool {
        self.lock().remove(seq, p0, p1);
        true
    }

    fn seq_add(&self, seq: SeqId, p0: u32, p1: Option<u32>, delta: i32) {
        self.lock().shift(seq, p0, p1, delta);
    }

    fn clear(&self) {
        self.lock().clear();
    }
}
