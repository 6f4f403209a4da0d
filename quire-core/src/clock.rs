//! Vector clock tracking the applied frontier of a replica.
//!
//! Each entry is the highest *contiguous* sequence number applied from a
//! replica. Causal readiness and "what is the peer missing" reduce to
//! integer comparisons against these entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{OperationId, ReplicaId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest applied sequence number for `replica` (0 if unknown).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Raise the entry for `replica` to at least `seq`.
    pub fn observe(&mut self, replica: ReplicaId, seq: u64) {
        let entry = self.entries.entry(replica).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Whether the operation `id` is covered by this frontier.
    pub fn contains(&self, id: &OperationId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, seq) in &other.entries {
            self.observe(*replica, *seq);
        }
    }

    /// Pointwise minimum. Replicas absent from either side count as 0.
    pub fn meet(&self, other: &VectorClock) -> VectorClock {
        let entries = self
            .entries
            .iter()
            .filter_map(|(replica, seq)| {
                let min = (*seq).min(other.get(replica));
                (min > 0).then_some((*replica, min))
            })
            .collect();
        VectorClock { entries }
    }

    /// `self ⊒ other`: every entry of `other` is covered.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(replica, seq)| self.get(replica) >= *seq)
    }

    /// Entries of `required` that this frontier does not yet cover.
    pub fn missing(&self, required: &VectorClock) -> VectorClock {
        let entries = required
            .entries
            .iter()
            .filter(|(replica, seq)| self.get(replica) < **seq)
            .map(|(replica, seq)| (*replica, *seq))
            .collect();
        VectorClock { entries }
    }

    /// Copy without the entry for `replica`.
    pub fn without(&self, replica: &ReplicaId) -> VectorClock {
        let mut entries = self.entries.clone();
        entries.remove(replica);
        VectorClock { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.entries.keys()
    }
}

impl FromIterator<(ReplicaId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (replica, seq) in iter {
            clock.observe(replica, seq);
        }
        clock
    }
}
