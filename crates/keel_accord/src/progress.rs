//! Per-store progress driving.
//!
//! Every transaction a store knows about but has not seen to completion owns
//! an entry here, scheduled on the timer wheel. When a deadline fires the
//! store decides what attention the transaction needs: seek a commit (and
//! eventually take over coordination), chase missing dependency state, seek
//! durability, or erase an expired ephemeral read.

use std::collections::HashMap;

use crate::timers::{LogGroupTimers, TimerToken};
use crate::txn::TxnId;

/// What stage of progress a transaction is being driven toward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressPhase {
    /// No commit witnessed yet; if this persists the store begins recovery.
    Undecided,
    /// Committed/stable but blocked on dependencies; chase their status.
    Awaiting,
    /// Applied locally; drive durability dissemination.
    Durable,
    /// Ephemeral read awaiting its expiry deadline.
    EphemeralExpiry,
}

/// Attention required for a transaction whose timer fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub txn_id: TxnId,
    pub phase: ProgressPhase,
    /// How many times this transaction has already demanded attention.
    pub retries: u32,
}

struct ProgressState {
    token: TimerToken,
    phase: ProgressPhase,
    retries: u32,
}

/// The store's registry of transactions needing future attention.
pub struct ProgressLog {
    timers: LogGroupTimers<TxnId>,
    entries: HashMap<TxnId, ProgressState>,
}

impl ProgressLog {
    /// `bucket_shift` is in the same unit as the deadlines supplied (the
    /// store uses milliseconds).
    pub fn new(bucket_shift: u32) -> Self {
        Self {
            timers: LogGroupTimers::new(bucket_shift),
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn phase_of(&self, txn_id: TxnId) -> Option<ProgressPhase> {
        self.entries.get(&txn_id).map(|s| s.phase)
    }

    /// Register or reschedule a transaction. A phase change resets the retry
    /// counter; re-registering the same phase keeps it (the deadline moves).
    pub fn register(&mut self, txn_id: TxnId, phase: ProgressPhase, deadline: u64) {
        match self.entries.get_mut(&txn_id) {
            Some(state) => {
                if state.phase != phase {
                    state.phase = phase;
                    state.retries = 0;
                }
                if !self.timers.update(state.token, deadline) {
                    state.token = self.timers.add(deadline, txn_id);
                }
            }
            None => {
                let token = self.timers.add(deadline, txn_id);
                self.entries.insert(
                    txn_id,
                    ProgressState {
                        token,
                        phase,
                        retries: 0,
                    },
                );
            }
        }
    }

    /// Drop a transaction entirely (it completed or was erased).
    pub fn clear(&mut self, txn_id: TxnId) {
        if let Some(state) = self.entries.remove(&txn_id) {
            self.timers.remove(state.token);
        }
    }

    /// The next instant at which `tick` could produce events.
    pub fn wake_at(&self) -> Option<u64> {
        self.timers.wake_at()
    }

    /// Collect every transaction whose deadline has passed. Fired entries
    /// stay registered with a bumped retry count; the caller reschedules or
    /// clears them based on the action taken.
    pub fn tick(&mut self, now: u64) -> Vec<ProgressEvent> {
        let mut fired: Vec<TxnId> = Vec::new();
        self.timers.advance(now, &mut |_, _, txn_id| {
            fired.push(txn_id);
        });
        let mut events = Vec::with_capacity(fired.len());
        for txn_id in fired {
            let Some(state) = self.entries.get_mut(&txn_id) else {
                continue;
            };
            state.retries += 1;
            // the timer was consumed by advance; the entry now has no
            // scheduled deadline until the caller re-registers it
            state.token = self.timers.add(u64::MAX - 1, txn_id);
            events.push(ProgressEvent {
                txn_id,
                phase: state.phase,
                retries: state.retries,
            });
        }
        events
    }
}

impl std::fmt::Debug for ProgressLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProgressLog({} entries, wake_at={:?})",
            self.entries.len(),
            self.timers.wake_at()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{Domain, Kind};

    fn id(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, Kind::Write, Domain::Key, 1)
    }

    #[test]
    fn tick_fires_expired_entries_with_retry_counts() {
        let mut log = ProgressLog::new(4);
        log.register(id(1), ProgressPhase::Undecided, 100);
        log.register(id(2), ProgressPhase::Awaiting, 5_000);

        let events = log.tick(200);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].txn_id, id(1));
        assert_eq!(events[0].phase, ProgressPhase::Undecided);
        assert_eq!(events[0].retries, 1);

        // rescheduled and fired again: retries accumulate
        log.register(id(1), ProgressPhase::Undecided, 300);
        let events = log.tick(400);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].retries, 2);
    }

    #[test]
    fn phase_change_resets_retries() {
        let mut log = ProgressLog::new(4);
        log.register(id(1), ProgressPhase::Undecided, 100);
        assert_eq!(log.tick(200)[0].retries, 1);
        log.register(id(1), ProgressPhase::Awaiting, 300);
        let events = log.tick(400);
        assert_eq!(events[0].phase, ProgressPhase::Awaiting);
        assert_eq!(events[0].retries, 1);
    }

    #[test]
    fn clear_removes_entry_and_timer() {
        let mut log = ProgressLog::new(4);
        log.register(id(1), ProgressPhase::Durable, 100);
        log.clear(id(1));
        assert!(log.tick(1_000).is_empty());
        assert!(log.is_empty());
    }
}
