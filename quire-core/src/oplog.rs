//! Operation log: local sequence/Lamport counters, the history served to
//! peers during sync, and the queue of local operations not yet
//! acknowledged by any peer.

use std::collections::{BTreeMap, VecDeque};

use crate::clock::VectorClock;
use crate::id::{OperationId, ReplicaId};
use crate::operation::Operation;

#[derive(Debug, Clone)]
pub struct OperationLog {
    replica: ReplicaId,
    seq: u64,
    lamport: u64,
    pending: VecDeque<Operation>,
    history: BTreeMap<ReplicaId, BTreeMap<u64, Operation>>,
    /// Everything at or below this frontier has been dropped from history.
    compacted: VectorClock,
}

impl OperationLog {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            seq: 0,
            lamport: 0,
            pending: VecDeque::new(),
            history: BTreeMap::new(),
            compacted: VectorClock::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Id the next local operation will get.
    pub fn next_id(&self) -> OperationId {
        OperationId::new(self.replica, self.seq + 1)
    }

    /// Lamport time the next local operation will get.
    pub fn next_lamport(&self) -> u64 {
        self.lamport + 1
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    /// Record a local operation built from `next_id`/`next_lamport`.
    pub fn append(&mut self, op: Operation) {
        debug_assert_eq!(op.id, self.next_id());
        self.seq = op.id.seq;
        self.lamport = self.lamport.max(op.lamport);
        self.pending.push_back(op.clone());
        self.insert(op);
    }

    /// Record a remote operation. Returns false if it was already known.
    pub fn observe(&mut self, op: &Operation) -> bool {
        self.lamport = self.lamport.max(op.lamport);
        if op.id.replica == self.replica {
            self.seq = self.seq.max(op.id.seq);
        }
        if self.contains(&op.id) {
            return false;
        }
        self.insert(op.clone());
        true
    }

    fn insert(&mut self, op: Operation) {
        self.history
            .entry(op.id.replica)
            .or_default()
            .insert(op.id.seq, op);
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.history
            .get(&id.replica)
            .is_some_and(|ops| ops.contains_key(&id.seq))
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.history.get(&id.replica)?.get(&id.seq)
    }

    /// Drop pending operations covered by a peer's acknowledged frontier.
    pub fn ack(&mut self, frontier: &VectorClock) -> usize {
        let acked = frontier.get(&self.replica);
        let mut trimmed = 0;
        while self.pending.front().is_some_and(|op| op.id.seq <= acked) {
            self.pending.pop_front();
            trimmed += 1;
        }
        trimmed
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Operations the holder of `remote` has not applied, in an order
    /// consistent with causality.
    pub fn missing_for(&self, remote: &VectorClock) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .history
            .iter()
            .flat_map(|(replica, ops)| ops.range(remote.get(replica) + 1..).map(|(_, op)| op))
            .cloned()
            .collect();
        sort_causally(&mut ops);
        ops
    }

    /// Every retained operation in causal order.
    pub fn history(&self) -> Vec<Operation> {
        self.missing_for(&VectorClock::new())
    }

    /// Whether history still holds every operation `remote` lacks.
    pub fn can_serve(&self, remote: &VectorClock) -> bool {
        remote.dominates(&self.compacted)
    }

    /// Drop history at or below `stable`. Returns the number dropped.
    pub fn compact(&mut self, stable: &VectorClock) -> usize {
        let mut dropped = 0;
        for (replica, ops) in self.history.iter_mut() {
            let keep = ops.split_off(&(stable.get(replica) + 1));
            dropped += ops.len();
            *ops = keep;
        }
        self.history.retain(|_, ops| !ops.is_empty());
        self.compacted.merge(stable);
        dropped
    }

    pub fn compacted(&self) -> &VectorClock {
        &self.compacted
    }

    /// Retained operations.
    pub fn len(&self) -> usize {
        self.history.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Lamport order extends happened-before, so sorting by stamp yields a
/// valid delivery order.
fn sort_causally(ops: &mut [Operation]) {
    ops.sort_by_key(|op| (op.lamport, op.id.replica, op.id.seq));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeKey;
    use crate::operation::OpBody;

    const A: ReplicaId = ReplicaId::from_u128(1);
    const B: ReplicaId = ReplicaId::from_u128(2);

    fn op(replica: ReplicaId, seq: u64, lamport: u64) -> Operation {
        Operation {
            id: OperationId::new(replica, seq),
            lamport,
            deps: VectorClock::new(),
            body: OpBody::RemoveNode { key: NodeKey::ROOT },
        }
    }

    fn local(log: &mut OperationLog) -> Operation {
        let op = op(log.replica(), log.next_id().seq, log.next_lamport());
        log.append(op.clone());
        op
    }

    #[test]
    fn test_append_advances_counters() {
        let mut log = OperationLog::new(A);
        assert_eq!(log.next_id(), OperationId::new(A, 1));
        local(&mut log);
        local(&mut log);
        assert_eq!(log.next_id(), OperationId::new(A, 3));
        assert_eq!(log.lamport(), 2);
        assert_eq!(log.pending_len(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_observe_raises_lamport() {
        let mut log = OperationLog::new(A);
        assert!(log.observe(&op(B, 1, 9)));
        assert!(!log.observe(&op(B, 1, 9)));
        assert_eq!(log.next_lamport(), 10);
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn test_ack_trims_pending_prefix() {
        let mut log = OperationLog::new(A);
        for _ in 0..3 {
            local(&mut log);
        }
        let frontier: VectorClock = [(A, 2)].into_iter().collect();
        assert_eq!(log.ack(&frontier), 2);
        assert_eq!(log.pending().map(|op| op.id.seq).collect::<Vec<_>>(), vec![3]);
        // History is unaffected by acknowledgement.
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_missing_for_is_causally_ordered() {
        let mut log = OperationLog::new(A);
        log.observe(&op(B, 1, 1));
        local(&mut log);
        log.observe(&op(B, 2, 5));
        local(&mut log);

        let remote: VectorClock = [(B, 1)].into_iter().collect();
        let missing: Vec<_> = log.missing_for(&remote).iter().map(|op| op.id).collect();
        assert_eq!(
            missing,
            vec![
                OperationId::new(A, 1),
                OperationId::new(B, 2),
                OperationId::new(A, 2)
            ]
        );
        assert_eq!(log.history().len(), 4);
    }

    #[test]
    fn test_compact_drops_stable_prefix() {
        let mut log = OperationLog::new(A);
        local(&mut log);
        local(&mut log);
        log.observe(&op(B, 1, 1));

        let stable: VectorClock = [(A, 1), (B, 1)].into_iter().collect();
        assert_eq!(log.compact(&stable), 2);
        assert_eq!(log.len(), 1);
        assert!(log.contains(&OperationId::new(A, 2)));

        assert!(log.can_serve(&stable));
        assert!(!log.can_serve(&VectorClock::new()));
    }
}
