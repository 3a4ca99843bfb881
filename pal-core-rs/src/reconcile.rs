//! Replicated state log with rank-based reconciliation.
//!
//! Implements:
//! - Sparse seqno-indexed replica log
//! - The VERIFY/NOOP reconciliation state machine as a pure function
//! - An engine that serializes local appends and remote changes per node
//!
//! Convergence: for any seqno, the entry with the smallest rank
//! (oldest timestamp, then longest payload) is re-asserted by every node
//! that holds it, and adopted by every node that holds a loser.

use crate::bus::Publish;
use crate::types::{unix_timestamp_micros, PeerId};
use crate::wire::{StateChange, StateEntry, StateEvent, WireMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Invariant violations that abort processing of a single message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("message seqno {message} does not match entry seqno {entry}")]
    SeqnoMismatch { message: u64, entry: u64 },

    #[error("entry {seqno} has no origin node")]
    MissingOrigin { seqno: u64 },

    #[error("entry {seqno} claims to originate from {origin} but this node does not hold it")]
    ForgedOrigin { seqno: u64, origin: PeerId },
}

/// Sparse log of state entries keyed by seqno
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLog {
    entries: BTreeMap<u64, StateEntry>,
    /// Smallest seqno not yet assigned locally
    next_seqno: u64,
}

impl ReplicaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored entries
    pub fn from_entries(entries: impl IntoIterator<Item = StateEntry>, next_seqno: u64) -> Self {
        let entries: BTreeMap<u64, StateEntry> =
            entries.into_iter().map(|e| (e.seqno, e)).collect();
        let floor = entries.keys().next_back().map(|s| s + 1).unwrap_or(0);
        Self {
            entries,
            next_seqno: next_seqno.max(floor),
        }
    }

    pub fn get(&self, seqno: u64) -> Option<&StateEntry> {
        self.entries.get(&seqno)
    }

    pub fn next_seqno(&self) -> u64 {
        self.next_seqno
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in seqno order
    pub fn entries(&self) -> impl Iterator<Item = &StateEntry> {
        self.entries.values()
    }

    /// Store an entry, advancing `next_seqno` past it
    fn insert(&mut self, entry: StateEntry) {
        self.next_seqno = self.next_seqno.max(entry.seqno + 1);
        self.entries.insert(entry.seqno, entry);
    }

    /// Overwrite the entry at its seqno
    fn replace(&mut self, entry: StateEntry) {
        self.entries.insert(entry.seqno, entry);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.next_seqno = 0;
    }
}

/// Result of applying one state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Reply to publish (NOOP means nothing to say)
    pub reply: StateChange,
    /// Entry that was stored or replaced locally, if the log changed
    pub adopted: Option<StateEntry>,
}

impl Reconciliation {
    fn reply(reply: StateChange) -> Self {
        Self { reply, adopted: None }
    }
}

/// Apply `change` to `log` as seen by node `local_id`.
///
/// NOOP is echoed back. An empty VERIFY never changes the log. A VERIFY with
/// an entry either loses against the local entry (which is returned as the
/// correction), wins and is adopted (acknowledged with an empty VERIFY), is
/// new and appended, or refers to a seqno below `next_seqno` that we no
/// longer hold and is ignored.
pub fn reconcile(
    log: &mut ReplicaLog,
    local_id: &str,
    change: StateChange,
) -> Result<Reconciliation, ReconcileError> {
    if change.event == StateEvent::Noop {
        return Ok(Reconciliation::reply(change));
    }

    let incoming = match &change.entry {
        Some(entry) => entry,
        None => return Ok(Reconciliation::reply(change.to_noop())),
    };

    if incoming.seqno != change.seqno {
        return Err(ReconcileError::SeqnoMismatch {
            message: change.seqno,
            entry: incoming.seqno,
        });
    }
    if incoming.origin_node.is_empty() {
        return Err(ReconcileError::MissingOrigin { seqno: change.seqno });
    }

    let ack = change.to_ack();
    match log.get(change.seqno).cloned() {
        Some(local) if local.precedes(incoming) => {
            Ok(Reconciliation::reply(StateChange::verify(local)))
        }
        Some(local) if &local == incoming => Ok(Reconciliation::reply(ack)),
        Some(_) => {
            log.replace(incoming.clone());
            Ok(Reconciliation {
                reply: ack,
                adopted: Some(incoming.clone()),
            })
        }
        None if change.seqno >= log.next_seqno() => {
            check_origin(local_id, incoming)?;
            log.insert(incoming.clone());
            Ok(Reconciliation {
                reply: ack,
                adopted: Some(incoming.clone()),
            })
        }
        None => Ok(Reconciliation::reply(change.to_noop())),
    }
}

/// A seqno we do not hold is never filled with an entry attributed to us;
/// our own entries only enter the log through `append`
fn check_origin(local_id: &str, incoming: &StateEntry) -> Result<(), ReconcileError> {
    if incoming.origin_node == local_id {
        return Err(ReconcileError::ForgedOrigin {
            seqno: incoming.seqno,
            origin: incoming.origin_node.clone(),
        });
    }
    Ok(())
}

struct EngineState {
    log: ReplicaLog,
    last_timestamp: u64,
}

impl EngineState {
    /// Wall clock, forced strictly increasing for our own entries
    fn next_timestamp(&mut self) -> u64 {
        let ts = unix_timestamp_micros().max(self.last_timestamp.saturating_add(1));
        self.last_timestamp = ts;
        ts
    }
}

/// Per-node replica of the shared log
pub struct ReconciliationEngine {
    node_id: PeerId,
    state: Mutex<EngineState>,
    publisher: Arc<dyn Publish>,
}

impl ReconciliationEngine {
    pub fn new(node_id: impl Into<PeerId>, publisher: Arc<dyn Publish>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(EngineState {
                log: ReplicaLog::new(),
                last_timestamp: 0,
            }),
            publisher,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append a local entry and broadcast it; returns the assigned seqno
    pub fn append(&self, payload: Vec<u8>) -> u64 {
        let entry = {
            let mut state = self.state.lock();
            let timestamp = state.next_timestamp();
            let entry = StateEntry::new(state.log.next_seqno(), timestamp, self.node_id.clone(), payload);
            state.log.insert(entry.clone());
            entry
        };

        let seqno = entry.seqno;
        debug!("Engine: Appended entry {} ({} bytes)", seqno, entry.payload.len());
        self.send(&StateChange::verify(entry));
        seqno
    }

    /// Drop the local log and signal the reset with an empty VERIFY
    pub fn reset(&self) {
        self.state.lock().log.clear();
        info!("Engine: Log reset");
        self.send(&StateChange::empty_verify(0));
    }

    /// Re-broadcast every local entry as a VERIFY
    pub fn resync(&self) -> usize {
        let entries: Vec<StateEntry> = self.state.lock().log.entries().cloned().collect();
        let count = entries.len();
        for entry in entries {
            self.send(&StateChange::verify(entry));
        }
        debug!("Engine: Re-asserted {} entries", count);
        count
    }

    /// Reconcile a change received from `peer` and publish the reply
    pub fn on_message(&self, peer: &str, change: StateChange) -> Result<Reconciliation, ReconcileError> {
        let seqno = change.seqno;
        let outcome = {
            let mut state = self.state.lock();
            reconcile(&mut state.log, &self.node_id, change)
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Engine: Rejected change {} from {}: {}", seqno, peer, e);
                return Err(e);
            }
        };

        if let Some(entry) = &outcome.adopted {
            info!(
                "Engine: Adopted entry {} from {} (origin {})",
                entry.seqno, peer, entry.origin_node
            );
        }
        if !outcome.reply.is_noop() {
            debug!(
                "Engine: Replying {:?} for {} to {}",
                outcome.reply.event, outcome.reply.seqno, peer
            );
            self.send(&outcome.reply);
        }
        Ok(outcome)
    }

    pub fn get(&self, seqno: u64) -> Option<StateEntry> {
        self.state.lock().log.get(seqno).cloned()
    }

    pub fn next_seqno(&self) -> u64 {
        self.state.lock().log.next_seqno()
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in seqno order
    pub fn entries(&self) -> Vec<StateEntry> {
        self.state.lock().log.entries().cloned().collect()
    }

    /// Copy of the whole replica
    pub fn snapshot(&self) -> ReplicaLog {
        self.state.lock().log.clone()
    }

    /// Replace the replica, e.g. with one loaded from disk
    pub fn restore(&self, log: ReplicaLog) {
        let mut state = self.state.lock();
        let newest_own = log
            .entries()
            .filter(|e| e.origin_node == self.node_id)
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(0);
        state.last_timestamp = state.last_timestamp.max(newest_own);
        info!(
            "Engine: Restored {} entries (next seqno {})",
            log.len(),
            log.next_seqno()
        );
        state.log = log;
    }

    fn send(&self, change: &StateChange) {
        match WireMessage::State(change.clone()).to_bytes() {
            Ok(bytes) => {
                self.publisher.publish(bytes);
            }
            Err(e) => warn!("Engine: Failed to encode change {}: {}", change.seqno, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<StateChange>>,
    }

    impl Publish for Recorder {
        fn publish(&self, payload: Vec<u8>) -> usize {
            match WireMessage::from_bytes(&payload).unwrap() {
                WireMessage::State(change) => self.sent.lock().push(change),
                other => panic!("Unexpected frame: {:?}", other),
            }
            1
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<StateChange> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    fn engine(id: &str) -> (ReconciliationEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (ReconciliationEngine::new(id, recorder.clone()), recorder)
    }

    fn entry(seqno: u64, timestamp: u64, origin: &str, payload: &str) -> StateEntry {
        StateEntry::new(seqno, timestamp, origin, payload.as_bytes().to_vec())
    }

    #[test]
    fn test_append_on_empty_log() {
        let (engine, recorder) = engine("self");

        let seqno = engine.append(b"hello".to_vec());

        assert_eq!(seqno, 0);
        let stored = engine.get(0).unwrap();
        assert_eq!(stored.seqno, 0);
        assert_eq!(stored.origin_node, "self");
        assert_eq!(stored.payload, b"hello");
        assert_eq!(engine.next_seqno(), 1);

        let sent = recorder.take();
        assert_eq!(sent, vec![StateChange::verify(stored)]);
    }

    #[test]
    fn test_append_is_monotonic_without_gaps() {
        let (engine, _) = engine("self");

        let seqnos: Vec<u64> = (0..20u8).map(|i| engine.append(vec![i])).collect();

        assert_eq!(seqnos, (0..20u64).collect::<Vec<_>>());
        let timestamps: Vec<u64> = engine.entries().iter().map(|e| e.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_incoming_older_entry_is_adopted() {
        let mut log = ReplicaLog::from_entries(vec![entry(5, 100, "a", "mine")], 6);
        let theirs = entry(5, 50, "b", "theirs");

        let outcome = reconcile(&mut log, "a", StateChange::verify(theirs.clone())).unwrap();

        assert_eq!(log.get(5), Some(&theirs));
        assert!(outcome.reply.is_empty_verify());
        assert_eq!(outcome.reply.seqno, 5);
        assert_eq!(outcome.adopted, Some(theirs));
    }

    #[test]
    fn test_local_winner_is_reasserted() {
        let mine = entry(5, 50, "a", "mine");
        let mut log = ReplicaLog::from_entries(vec![mine.clone()], 6);

        let outcome = reconcile(&mut log, "a", StateChange::verify(entry(5, 100, "b", "x"))).unwrap();

        assert_eq!(outcome.reply, StateChange::verify(mine.clone()));
        assert_eq!(outcome.adopted, None);
        assert_eq!(log.get(5), Some(&mine));
    }

    #[test]
    fn test_new_seqno_at_frontier_is_accepted() {
        let mut log = ReplicaLog::from_entries(Vec::new(), 9);
        let x = entry(9, 10, "b", "x");

        let outcome = reconcile(&mut log, "a", StateChange::verify(x.clone())).unwrap();

        assert_eq!(log.get(9), Some(&x));
        assert_eq!(log.next_seqno(), 10);
        assert!(outcome.reply.is_empty_verify());
        assert_eq!(outcome.reply.seqno, 9);
    }

    #[test]
    fn test_new_seqno_ahead_of_frontier_skips_gap() {
        let mut log = ReplicaLog::new();

        reconcile(&mut log, "a", StateChange::verify(entry(4, 10, "b", "x"))).unwrap();

        assert_eq!(log.next_seqno(), 5);
        assert_eq!(log.len(), 1);
        assert!(log.get(0).is_none());
    }

    #[test]
    fn test_stale_seqno_is_ignored() {
        let mut log = ReplicaLog::from_entries(Vec::new(), 9);

        let outcome = reconcile(&mut log, "a", StateChange::verify(entry(3, 10, "b", "y"))).unwrap();

        assert!(outcome.reply.is_noop());
        assert_eq!(outcome.reply.seqno, 3);
        assert!(log.is_empty());
        assert_eq!(log.next_seqno(), 9);
    }

    #[test]
    fn test_noop_is_echoed() {
        let mut log = ReplicaLog::new();
        let noop = StateChange::verify(entry(1, 1, "b", "z")).to_noop();

        let outcome = reconcile(&mut log, "a", noop.clone()).unwrap();

        assert_eq!(outcome.reply, noop);
        assert!(log.is_empty());
    }

    #[test]
    fn test_empty_verify_never_deletes() {
        let kept = entry(2, 1, "b", "kept");
        let mut log = ReplicaLog::from_entries(vec![kept.clone()], 3);

        let known = reconcile(&mut log, "a", StateChange::empty_verify(2)).unwrap();
        let unknown = reconcile(&mut log, "a", StateChange::empty_verify(7)).unwrap();

        assert!(known.reply.is_noop());
        assert!(unknown.reply.is_noop());
        assert_eq!(log.get(2), Some(&kept));
        assert_eq!(log.next_seqno(), 3);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut log = ReplicaLog::new();
        let change = StateChange::verify(entry(0, 10, "b", "once"));

        let first = reconcile(&mut log, "a", change.clone()).unwrap();
        let after_first = log.clone();
        let second = reconcile(&mut log, "a", change).unwrap();

        assert_eq!(log, after_first);
        assert_eq!(first.reply.event, second.reply.event);
        assert_eq!(first.reply.entry.is_some(), second.reply.entry.is_some());
        assert_eq!(second.adopted, None);
    }

    #[test]
    fn test_two_replicas_converge() {
        let a_entry = entry(5, 100, "a", "from a");
        let b_entry = entry(5, 50, "b", "from b");
        let cases = [(a_entry.clone(), b_entry.clone()), (b_entry.clone(), a_entry.clone())];

        for (held_by_a, held_by_b) in cases {
            let mut a = ReplicaLog::from_entries(vec![held_by_a.clone()], 6);
            let mut b = ReplicaLog::from_entries(vec![held_by_b.clone()], 6);

            // A sends its entry, B replies, A applies the reply
            let reply = reconcile(&mut b, "node-b", StateChange::verify(held_by_a.clone()))
                .unwrap()
                .reply;
            reconcile(&mut a, "node-a", reply).unwrap();

            let winner = if held_by_a.precedes(&held_by_b) { &held_by_a } else { &held_by_b };
            assert_eq!(a.get(5), Some(winner));
            assert_eq!(b.get(5), Some(winner));
        }
    }

    #[test]
    fn test_mismatched_seqno_is_rejected() {
        let mut log = ReplicaLog::new();
        let mut change = StateChange::verify(entry(1, 1, "b", "x"));
        change.seqno = 2;

        let err = reconcile(&mut log, "a", change).unwrap_err();

        assert_eq!(err, ReconcileError::SeqnoMismatch { message: 2, entry: 1 });
        assert!(log.is_empty());
    }

    #[test]
    fn test_forged_origin_is_rejected() {
        let mut log = ReplicaLog::new();

        let err = reconcile(&mut log, "a", StateChange::verify(entry(0, 1, "a", "fake"))).unwrap_err();

        assert!(matches!(err, ReconcileError::ForgedOrigin { seqno: 0, .. }));
        assert!(log.is_empty());
        assert_eq!(log.next_seqno(), 0);
    }

    #[test]
    fn test_own_entry_echo_is_acknowledged() {
        let (engine, recorder) = engine("a");
        engine.append(b"mine".to_vec());
        let own = engine.get(0).unwrap();
        recorder.take();

        let outcome = engine.on_message("b", StateChange::verify(own)).unwrap();

        assert!(outcome.reply.is_empty_verify());
        assert_eq!(outcome.adopted, None);
        assert_eq!(recorder.take(), vec![outcome.reply]);
    }

    #[test]
    fn test_engine_does_not_publish_noop() {
        let (engine, recorder) = engine("a");

        let outcome = engine.on_message("b", StateChange::empty_verify(3)).unwrap();

        assert!(outcome.reply.is_noop());
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_engine_rejection_leaves_log_untouched() {
        let (engine, recorder) = engine("a");

        assert!(engine.on_message("b", StateChange::verify(entry(0, 1, "", "x"))).is_err());
        assert!(engine.is_empty());
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_reset_clears_and_signals() {
        let (engine, recorder) = engine("a");
        engine.append(b"one".to_vec());
        engine.append(b"two".to_vec());
        recorder.take();

        engine.reset();

        assert!(engine.is_empty());
        assert_eq!(engine.next_seqno(), 0);
        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_empty_verify());
        assert_eq!(engine.append(b"again".to_vec()), 0);
    }

    #[test]
    fn test_reset_does_not_resurrect_own_entries() {
        let (engine, _) = engine("a");
        engine.append(b"old".to_vec());
        let old = engine.get(0).unwrap();
        engine.reset();

        assert!(engine.on_message("b", StateChange::verify(old)).is_err());
        assert!(engine.is_empty());
    }

    #[test]
    fn test_reset_then_append_yields_to_older_own_entry() {
        let (a, a_sent) = engine("a");
        let (b, b_sent) = engine("b");

        a.append(b"old".to_vec());
        for change in a_sent.take() {
            b.on_message("a", change).unwrap();
        }
        let old = b.get(0).unwrap();

        a.reset();
        a.append(b"new".to_vec());
        for change in a_sent.take() {
            b.on_message("a", change).unwrap();
        }

        // B keeps the older entry and re-asserts it
        let correction = b_sent.take().into_iter().find(|c| c.entry.is_some()).unwrap();
        assert_eq!(correction, StateChange::verify(old.clone()));

        let outcome = a.on_message("b", correction).unwrap();
        assert_eq!(outcome.adopted, Some(old.clone()));
        assert_eq!(a.get(0), Some(old.clone()));
        assert_eq!(b.get(0), Some(old));
    }

    #[test]
    fn test_append_after_maximal_restored_timestamp() {
        let (engine, _) = engine("a");
        engine.restore(ReplicaLog::from_entries(vec![entry(0, u64::MAX, "a", "x")], 1));

        assert_eq!(engine.append(b"next".to_vec()), 1);
        assert_eq!(engine.get(1).unwrap().timestamp, u64::MAX);
    }

    #[test]
    fn test_resync_reasserts_everything() {
        let (engine, recorder) = engine("a");
        engine.restore(ReplicaLog::from_entries(
            vec![entry(0, 1, "b", "x"), entry(3, 2, "c", "y")],
            4,
        ));

        assert_eq!(engine.resync(), 2);
        let seqnos: Vec<u64> = recorder.take().iter().map(|c| c.seqno).collect();
        assert_eq!(seqnos, vec![0, 3]);
    }

    #[test]
    fn test_restore_keeps_own_timestamps_increasing() {
        let (engine, _) = engine("a");
        let future = unix_timestamp_micros() + 60_000_000;
        engine.restore(ReplicaLog::from_entries(vec![entry(0, future, "a", "x")], 1));

        engine.append(b"later".to_vec());

        assert!(engine.get(1).unwrap().timestamp > future);
    }
}
