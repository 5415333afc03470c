//! Remote todo ledger.
//!
//! Tracks request signals sent to the peer that still await a correlated
//! `SUCCESS` or `FAILURE`. Entries are kept FIFO per key, so several requests
//! of different kinds may be in flight while a completion for one kind can
//! never consume an entry of another.
//!
//! The ledger is owned by a single coordinator and only touched from its
//! polling thread.

use std::collections::VecDeque;

use thiserror::Error;

use crate::protocol::{Completion, Signal, SignalKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A completion arrived for a key with no outstanding request.
    #[error("no outstanding {key} request for completion")]
    Unmatched { key: SignalKey },
}

#[derive(Debug, Default)]
pub struct RemoteTodoLedger {
    entries: VecDeque<Signal>,
}

impl RemoteTodoLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `signal` as awaiting completion. Must be called before the
    /// signal is sent so a fast reply always finds its entry.
    pub fn append_todo(&mut self, signal: Signal) {
        self.entries.push_back(signal);
    }

    /// True if a request with `key` is outstanding.
    #[must_use]
    pub fn has_todo(&self, key: SignalKey) -> bool {
        self.entries.iter().any(|s| s.key() == key)
    }

    /// Removes and returns the oldest entry correlated with `completion`.
    ///
    /// On no match the ledger is left untouched.
    pub fn finish(&mut self, completion: &Completion) -> Result<Signal, LedgerError> {
        self.position(completion.key)
            .and_then(|idx| self.entries.remove(idx))
            .ok_or(LedgerError::Unmatched {
                key: completion.key,
            })
    }

    /// The entry `finish` would remove, without removing it.
    #[must_use]
    pub fn get_todo(&self, completion: &Completion) -> Option<&Signal> {
        self.position(completion.key).map(|i| &self.entries[i])
    }

    /// Drops every entry, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.entries.iter()
    }

    fn position(&self, key: SignalKey) -> Option<usize> {
        self.entries.iter().position(|s| s.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FailureReport, MeasureMode, MeasurementId, PlanRef};

    fn requests() -> Vec<Signal> {
        vec![
            Signal::Unpair { unpaired: false },
            Signal::Open(PlanRef::new("door-left")),
            Signal::Start,
            Signal::Measure(MeasureMode::Digitize),
            Signal::Save(vec![MeasurementId(1)]),
            Signal::Start,
        ]
    }

    #[test]
    fn n_appends_then_n_finishes_is_empty() {
        let mut ledger = RemoteTodoLedger::new();
        let reqs = requests();
        for r in &reqs {
            ledger.append_todo(r.clone());
        }
        assert_eq!(ledger.len(), reqs.len());

        // complete in reverse order to exercise per-key matching
        for r in reqs.iter().rev() {
            let done = ledger.finish(&Completion::success(r.key())).unwrap();
            assert_eq!(done.key(), r.key());
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn finish_is_fifo_per_key() {
        let mut ledger = RemoteTodoLedger::new();
        ledger.append_todo(Signal::Open(PlanRef::new("a")));
        ledger.append_todo(Signal::Start);
        ledger.append_todo(Signal::Open(PlanRef::new("b")));

        let first = ledger.finish(&Completion::success(SignalKey::Open)).unwrap();
        assert_eq!(first, Signal::Open(PlanRef::new("a")));
        assert!(ledger.has_todo(SignalKey::Open));
        assert!(ledger.has_todo(SignalKey::Start));
    }

    #[test]
    fn unmatched_leaves_ledger_untouched() {
        let mut ledger = RemoteTodoLedger::new();
        ledger.append_todo(Signal::Start);
        let err = ledger
            .finish(&Completion::success(SignalKey::Save))
            .unwrap_err();
        assert_eq!(err, LedgerError::Unmatched { key: SignalKey::Save });
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn finish_after_clear_reports_no_match() {
        let mut ledger = RemoteTodoLedger::new();
        for r in requests() {
            ledger.append_todo(r);
        }
        assert_eq!(ledger.clear(), 6);
        for key in [SignalKey::Start, SignalKey::Open, SignalKey::Unpair] {
            assert!(ledger.finish(&Completion::success(key)).is_err());
        }
    }

    #[test]
    fn get_todo_peeks_for_failures() {
        let mut ledger = RemoteTodoLedger::new();
        ledger.append_todo(Signal::Save(vec![MeasurementId(4)]));
        let failure = Completion::failure(SignalKey::Save, FailureReport::parse("303 - bad mlist"));
        assert_eq!(
            ledger.get_todo(&failure),
            Some(&Signal::Save(vec![MeasurementId(4)]))
        );
        assert_eq!(ledger.len(), 1);
    }
}
