//! Replicated ordered sequence (RGA) keyed by identity.
//!
//! Used both for a node's children and for a text node's characters.
//! Items are never physically removed: a removed item stays in place as a
//! tombstone so that any identity ever inserted remains a valid anchor.
//!
//! Integration rule: a new item anchored after `origin` is placed after the
//! origin and after every following item with a greater `Stamp`. Because a
//! causally later insert always carries a greater Lamport time, this yields
//! the same order on every replica regardless of arrival order, and siblings
//! sharing an anchor end up in descending stamp order.
//!
//! Storage is a list of chunks of at most `2 * CHUNK_SIZE` items, each
//! carrying its visible count, plus an index from id to chunk:
//!
//! ```text
//!  ids ──► slots ──► uid ──► ranks ──► chunks[rank] ──► item
//! ```
//!
//! Looking up an id costs one hash lookup and a scan of one chunk. Offsets
//! are resolved by summing chunk counts. A run inserted by one operation is
//! spliced in at once.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::id::{Anchor, Stamp};

const CHUNK_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Item<K, V> {
    id: K,
    stamp: Stamp,
    value: V,
    removed: bool,
}

#[derive(Debug, Clone)]
struct Chunk<K, V> {
    uid: usize,
    items: Vec<Item<K, V>>,
    visible: usize,
}

impl<K, V> Chunk<K, V> {
    fn new(uid: usize, items: Vec<Item<K, V>>) -> Self {
        let visible = items.iter().filter(|item| !item.removed).count();
        Self {
            uid,
            items,
            visible,
        }
    }
}

/// Insertion point: before `chunks[chunk].items[offset]`, or at the end
/// of that chunk when `offset` equals its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    chunk: usize,
    offset: usize,
}

#[derive(Clone)]
pub struct Sequence<K, V> {
    chunks: Vec<Chunk<K, V>>,
    /// Position in `chunks` of every chunk, indexed by `Chunk::uid`.
    ranks: Vec<usize>,
    /// Uid of the chunk holding each id.
    slots: HashMap<K, usize>,
    len: usize,
    visible: usize,
}

/// The anchor an insert referenced is not part of this sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingAnchor<K>(pub K);

impl<K, V> Default for Sequence<K, V> {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            ranks: Vec::new(),
            slots: HashMap::new(),
            len: 0,
            visible: 0,
        }
    }
}

impl<K, V> Sequence<K, V> {
    fn items(&self) -> impl Iterator<Item = &Item<K, V>> {
        self.chunks.iter().flat_map(|chunk| chunk.items.iter())
    }
}

// Equality is over the items in order; chunk boundaries depend on edit
// history and are not part of the value.
impl<K: PartialEq, V: PartialEq> PartialEq for Sequence<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.items().eq(other.items())
    }
}

impl<K: Eq, V: Eq> Eq for Sequence<K, V> {}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Sequence<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items()).finish()
    }
}

impl<K: Copy + Eq + Hash, V> Sequence<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate an item. Returns `Ok(false)` if `id` is already present.
    pub fn integrate(
        &mut self,
        origin: Anchor<K>,
        id: K,
        stamp: Stamp,
        value: V,
    ) -> Result<bool, MissingAnchor<K>> {
        if self.slots.contains_key(&id) {
            return Ok(false);
        }
        self.insert_fresh(origin, vec![(id, value)], stamp)?;
        Ok(true)
    }

    /// Integrate a run of values inserted by one operation. Item `i` of the
    /// run is anchored after item `i - 1`.
    pub fn integrate_run(
        &mut self,
        origin: Anchor<K>,
        ids: impl IntoIterator<Item = (K, V)>,
        stamp: Stamp,
    ) -> Result<usize, MissingAnchor<K>> {
        let run: Vec<(K, V)> = ids.into_iter().collect();
        if run.is_empty() {
            return Ok(0);
        }

        // Nothing after the first item of a fresh run can carry a greater
        // stamp, so the whole run lands contiguously.
        if run.iter().all(|(id, _)| !self.slots.contains_key(id)) {
            let count = run.len();
            self.insert_fresh(origin, run, stamp)?;
            return Ok(count);
        }

        let mut anchor = origin;
        let mut inserted = 0;
        for (id, value) in run {
            if self.integrate(anchor, id, stamp, value)? {
                inserted += 1;
            }
            anchor = Anchor::After(id);
        }
        Ok(inserted)
    }

    /// Tombstone an item. `None` if unknown, `Some(true)` if it was visible.
    pub fn remove(&mut self, id: &K) -> Option<bool> {
        let at = self.locate(id)?;
        let chunk = &mut self.chunks[at.chunk];
        let item = &mut chunk.items[at.offset];
        let was_visible = !item.removed;
        if was_visible {
            item.removed = true;
            chunk.visible -= 1;
            self.visible -= 1;
        }
        Some(was_visible)
    }

    pub fn contains(&self, id: &K) -> bool {
        self.slots.contains_key(id)
    }

    pub fn is_removed(&self, id: &K) -> Option<bool> {
        self.locate(id)
            .map(|at| self.chunks[at.chunk].items[at.offset].removed)
    }

    /// Visible items in order.
    pub fn visible(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items()
            .filter(|item| !item.removed)
            .map(|item| (&item.id, &item.value))
    }

    pub fn visible_ids(&self) -> Vec<K> {
        self.visible().map(|(id, _)| *id).collect()
    }

    pub fn visible_len(&self) -> usize {
        self.visible
    }

    /// Total items including tombstones.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every id, tombstones included, in sequence order.
    pub fn ids(&self) -> impl Iterator<Item = &K> {
        self.items().map(|item| &item.id)
    }

    /// Anchor that places a new item at visible `index`. Clamped to the end.
    pub fn anchor_at(&self, index: usize) -> Anchor<K> {
        let index = index.min(self.visible);
        if index == 0 {
            return Anchor::Start;
        }
        match self.nth_visible(index - 1) {
            Some(id) => Anchor::After(id),
            None => Anchor::Start,
        }
    }

    /// Ids of the visible items in `[start, start + count)`, clamped.
    pub fn visible_range(&self, start: usize, count: usize) -> Vec<K> {
        let mut skip = start;
        let mut out = Vec::with_capacity(count.min(self.visible));
        for chunk in &self.chunks {
            if skip >= chunk.visible {
                skip -= chunk.visible;
                continue;
            }
            for item in chunk.items.iter().filter(|item| !item.removed) {
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                if out.len() == count {
                    return out;
                }
                out.push(item.id);
            }
        }
        out
    }

    fn nth_visible(&self, mut n: usize) -> Option<K> {
        for chunk in &self.chunks {
            if n >= chunk.visible {
                n -= chunk.visible;
                continue;
            }
            return chunk
                .items
                .iter()
                .filter(|item| !item.removed)
                .nth(n)
                .map(|item| item.id);
        }
        None
    }

    fn locate(&self, id: &K) -> Option<Cursor> {
        let uid = *self.slots.get(id)?;
        let chunk = *self.ranks.get(uid)?;
        let offset = self
            .chunks
            .get(chunk)?
            .items
            .iter()
            .position(|item| item.id == *id)?;
        Some(Cursor { chunk, offset })
    }

    /// First item at or after `at`, crossing chunk boundaries.
    fn item_from(&self, mut at: Cursor) -> Option<(Cursor, &Item<K, V>)> {
        while let Some(chunk) = self.chunks.get(at.chunk) {
            if let Some(item) = chunk.items.get(at.offset) {
                return Some((at, item));
            }
            at = Cursor {
                chunk: at.chunk + 1,
                offset: 0,
            };
        }
        None
    }

    /// Place a run whose ids are all new.
    fn insert_fresh(
        &mut self,
        origin: Anchor<K>,
        run: Vec<(K, V)>,
        stamp: Stamp,
    ) -> Result<(), MissingAnchor<K>> {
        let mut cursor = match origin {
            Anchor::Start => Cursor {
                chunk: 0,
                offset: 0,
            },
            Anchor::After(anchor) => {
                let at = self.locate(&anchor).ok_or(MissingAnchor(anchor))?;
                Cursor {
                    chunk: at.chunk,
                    offset: at.offset + 1,
                }
            }
        };
        while let Some((at, item)) = self.item_from(cursor) {
            if item.stamp <= stamp {
                cursor = at;
                break;
            }
            cursor = Cursor {
                chunk: at.chunk,
                offset: at.offset + 1,
            };
        }

        if self.chunks.is_empty() {
            let uid = self.ranks.len();
            self.ranks.push(0);
            self.chunks.push(Chunk::new(uid, Vec::new()));
        }

        let added = run.len();
        let chunk = &mut self.chunks[cursor.chunk];
        for (id, _) in &run {
            self.slots.insert(*id, chunk.uid);
        }
        let items = run.into_iter().map(|(id, value)| Item {
            id,
            stamp,
            value,
            removed: false,
        });
        let tail = chunk.items.split_off(cursor.offset);
        chunk.items.extend(items);
        chunk.items.extend(tail);
        chunk.visible += added;
        self.len += added;
        self.visible += added;

        if self.chunks[cursor.chunk].items.len() > 2 * CHUNK_SIZE {
            self.split(cursor.chunk);
        }
        Ok(())
    }

    /// Cut an oversized chunk into pieces of `CHUNK_SIZE` items.
    fn split(&mut self, rank: usize) {
        let chunk = &mut self.chunks[rank];
        let mut rest = chunk.items.split_off(CHUNK_SIZE);
        chunk.visible = chunk.items.iter().filter(|item| !item.removed).count();

        let mut pieces = Vec::with_capacity(rest.len() / CHUNK_SIZE + 1);
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(CHUNK_SIZE));
            let uid = self.ranks.len();
            self.ranks.push(0);
            for item in &rest {
                self.slots.insert(item.id, uid);
            }
            pieces.push(Chunk::new(uid, rest));
            rest = tail;
        }

        let tail = self.chunks.split_off(rank + 1);
        self.chunks.extend(pieces);
        self.chunks.extend(tail);
        for (position, chunk) in self.chunks.iter().enumerate().skip(rank + 1) {
            self.ranks[chunk.uid] = position;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ReplicaId;

    fn stamp(lamport: u64, replica: u128) -> Stamp {
        Stamp::new(lamport, ReplicaId::from_u128(replica))
    }

    fn values(seq: &Sequence<u32, char>) -> String {
        seq.visible().map(|(_, c)| *c).collect()
    }

    #[test]
    fn test_integrate_in_order() {
        let mut seq = Sequence::new();
        seq.integrate(Anchor::Start, 1, stamp(1, 1), 'a').unwrap();
        seq.integrate(Anchor::After(1), 2, stamp(2, 1), 'b').unwrap();
        seq.integrate(Anchor::After(2), 3, stamp(3, 1), 'c').unwrap();
        assert_eq!(values(&seq), "abc");
    }

    #[test]
    fn test_integrate_is_idempotent() {
        let mut seq = Sequence::new();
        assert_eq!(seq.integrate(Anchor::Start, 1, stamp(1, 1), 'a'), Ok(true));
        assert_eq!(seq.integrate(Anchor::Start, 1, stamp(1, 1), 'a'), Ok(false));
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_missing_anchor() {
        let mut seq: Sequence<u32, char> = Sequence::new();
        assert_eq!(
            seq.integrate(Anchor::After(9), 1, stamp(1, 1), 'a'),
            Err(MissingAnchor(9))
        );
        assert!(seq.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_same_anchor_converge() {
        // Two replicas insert at the start concurrently; arrival order differs.
        let mut left = Sequence::new();
        left.integrate(Anchor::Start, 1, stamp(1, 1), 'x').unwrap();
        left.integrate(Anchor::Start, 2, stamp(1, 2), 'y').unwrap();

        let mut right = Sequence::new();
        right.integrate(Anchor::Start, 2, stamp(1, 2), 'y').unwrap();
        right.integrate(Anchor::Start, 1, stamp(1, 1), 'x').unwrap();

        assert_eq!(values(&left), values(&right));
        // Greater stamp sits closer to the anchor.
        assert_eq!(values(&left), "yx");
    }

    #[test]
    fn test_causally_later_insert_stays_next_to_anchor() {
        let mut seq = Sequence::new();
        seq.integrate(Anchor::Start, 1, stamp(1, 1), 'a').unwrap();
        seq.integrate(Anchor::After(1), 2, stamp(2, 1), 'c').unwrap();
        // Inserted between 'a' and 'c' by a replica that had seen both.
        seq.integrate(Anchor::After(1), 3, stamp(3, 2), 'b').unwrap();
        assert_eq!(values(&seq), "abc");
    }

    #[test]
    fn test_skips_subtree_of_greater_sibling() {
        // O, then X (stamp 5) and its child Z (stamp 6), then N (stamp 4) after O.
        let mut seq = Sequence::new();
        seq.integrate(Anchor::Start, 0, stamp(1, 1), 'o').unwrap();
        seq.integrate(Anchor::After(0), 1, stamp(5, 1), 'x').unwrap();
        seq.integrate(Anchor::After(1), 2, stamp(6, 1), 'z').unwrap();
        seq.integrate(Anchor::After(0), 3, stamp(4, 2), 'n').unwrap();
        assert_eq!(values(&seq), "oxzn");
    }

    #[test]
    fn test_run_integration_stays_contiguous() {
        let mut seq = Sequence::new();
        seq.integrate(Anchor::Start, 10, stamp(1, 1), '!').unwrap();
        let run = [(1, 'h'), (2, 'i')];
        assert_eq!(seq.integrate_run(Anchor::Start, run, stamp(2, 2)), Ok(2));
        assert_eq!(values(&seq), "hi!");
    }

    #[test]
    fn test_remove_keeps_tombstone_as_anchor() {
        let mut seq = Sequence::new();
        seq.integrate(Anchor::Start, 1, stamp(1, 1), 'a').unwrap();
        seq.integrate(Anchor::After(1), 2, stamp(2, 1), 'b').unwrap();
        assert_eq!(seq.remove(&1), Some(true));
        assert_eq!(seq.remove(&1), Some(false));
        assert_eq!(seq.remove(&7), None);

        seq.integrate(Anchor::After(1), 3, stamp(3, 2), 'z').unwrap();
        assert_eq!(values(&seq), "zb");
        assert_eq!(seq.visible_len(), 2);
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn test_anchor_at_and_visible_range() {
        let mut seq = Sequence::new();
        seq.integrate_run(Anchor::Start, [(1, 'a'), (2, 'b'), (3, 'c')], stamp(1, 1))
            .unwrap();
        seq.remove(&2);

        assert_eq!(seq.anchor_at(0), Anchor::Start);
        assert_eq!(seq.anchor_at(1), Anchor::After(1));
        assert_eq!(seq.anchor_at(2), Anchor::After(3));
        // Clamped past the end.
        assert_eq!(seq.anchor_at(10), Anchor::After(3));

        assert_eq!(seq.visible_range(0, 5), vec![1, 3]);
        assert_eq!(seq.visible_range(1, 1), vec![3]);
    }

    #[test]
    fn test_large_run_spans_chunks() {
        let mut seq = Sequence::new();
        let run = (0..1000u32).map(|i| (i, char::from(b'a' + (i % 26) as u8)));
        assert_eq!(seq.integrate_run(Anchor::Start, run, stamp(1, 1)), Ok(1000));
        assert_eq!(seq.len(), 1000);
        assert!(seq.chunks.len() > 1);

        // Insert in the middle, then tombstone a range crossing chunk edges.
        let anchor = seq.anchor_at(500);
        assert_eq!(anchor, Anchor::After(499));
        seq.integrate(anchor, 5000, stamp(2, 2), '#').unwrap();
        assert_eq!(seq.visible_range(500, 1), vec![5000]);

        for id in seq.visible_range(100, 700) {
            assert_eq!(seq.remove(&id), Some(true));
        }
        assert_eq!(seq.visible_len(), 301);
        assert_eq!(seq.is_removed(&150), Some(true));
        assert_eq!(seq.is_removed(&900), Some(false));
        assert_eq!(seq.visible_ids().len(), 301);
    }

    #[test]
    fn test_equality_ignores_chunk_layout() {
        let mut bulk = Sequence::new();
        bulk.integrate_run(Anchor::Start, (0..300u32).map(|i| (i, ())), stamp(1, 1))
            .unwrap();

        let mut single = Sequence::new();
        let mut anchor = Anchor::Start;
        for i in 0..300u32 {
            single.integrate(anchor, i, stamp(1, 1), ()).unwrap();
            anchor = Anchor::After(i);
        }
        assert_eq!(bulk, single);

        single.remove(&7);
        assert_ne!(bulk, single);
    }

    #[test]
    fn test_partially_known_run_only_adds_new_items() {
        let mut seq = Sequence::new();
        seq.integrate(Anchor::Start, 1, stamp(1, 1), 'a').unwrap();
        let run = [(1, 'a'), (2, 'b'), (3, 'c')];
        assert_eq!(seq.integrate_run(Anchor::Start, run, stamp(1, 1)), Ok(2));
        assert_eq!(values(&seq), "abc");
    }

    /// Straightforward array form of the integration rule.
    #[derive(Default)]
    struct ArraySequence {
        items: Vec<(u32, Stamp, bool)>,
    }

    impl ArraySequence {
        fn integrate(&mut self, origin: Anchor<u32>, id: u32, stamp: Stamp) {
            let mut index = match origin {
                Anchor::Start => 0,
                Anchor::After(anchor) => {
                    self.items.iter().position(|item| item.0 == anchor).unwrap() + 1
                }
            };
            while index < self.items.len() && self.items[index].1 > stamp {
                index += 1;
            }
            self.items.insert(index, (id, stamp, false));
        }

        fn visible_ids(&self) -> Vec<u32> {
            self.items.iter().filter(|item| !item.2).map(|item| item.0).collect()
        }
    }

    #[derive(Debug, Clone)]
    enum Edit {
        Insert {
            at: usize,
            len: u32,
            lamport: u64,
            replica: u128,
        },
        Remove {
            at: usize,
        },
    }

    fn edit_strategy() -> impl proptest::strategy::Strategy<Value = Edit> {
        use proptest::prelude::*;
        prop_oneof![
            3 => (any::<usize>(), 1..160u32, 1..40u64, 1..4u128).prop_map(
                |(at, len, lamport, replica)| Edit::Insert { at, len, lamport, replica }
            ),
            1 => any::<usize>().prop_map(|at| Edit::Remove { at }),
        ]
    }

    proptest::proptest! {
        #[test]
        fn test_matches_array_rendition(edits in proptest::collection::vec(edit_strategy(), 1..80)) {
            let mut seq: Sequence<u32, ()> = Sequence::new();
            let mut expected = ArraySequence::default();
            let mut next_id = 0u32;

            for edit in edits {
                match edit {
                    Edit::Insert { at, len, lamport, replica } => {
                        let at = at % (expected.items.len() + 1);
                        let origin = match at {
                            0 => Anchor::Start,
                            _ => Anchor::After(expected.items[at - 1].0),
                        };
                        let stamp = stamp(lamport, replica);
                        let ids: Vec<u32> = (next_id..next_id + len).collect();
                        next_id += len;

                        let mut anchor = origin;
                        for id in &ids {
                            expected.integrate(anchor, *id, stamp);
                            anchor = Anchor::After(*id);
                        }
                        let run = ids.iter().map(|id| (*id, ()));
                        proptest::prop_assert_eq!(seq.integrate_run(origin, run, stamp), Ok(len as usize));
                    }
                    Edit::Remove { at } => {
                        if expected.items.is_empty() {
                            continue;
                        }
                        let len = expected.items.len();
                        let item = &mut expected.items[at % len];
                        let was_visible = !item.2;
                        item.2 = true;
                        proptest::prop_assert_eq!(seq.remove(&item.0), Some(was_visible));
                    }
                }
            }

            let all: Vec<u32> = expected.items.iter().map(|item| item.0).collect();
            proptest::prop_assert_eq!(seq.ids().copied().collect::<Vec<_>>(), all);
            let visible = expected.visible_ids();
            proptest::prop_assert_eq!(seq.visible_len(), visible.len());
            proptest::prop_assert_eq!(seq.visible_ids(), visible.clone());
            for index in [0, 1, visible.len() / 2, visible.len()] {
                let want = match index.min(visible.len()) {
                    0 => Anchor::Start,
                    i => Anchor::After(visible[i - 1]),
                };
                proptest::prop_assert_eq!(seq.anchor_at(index), want);
            }
            let start = visible.len() / 3;
            let end = (start + 10).min(visible.len());
            proptest::prop_assert_eq!(seq.visible_range(start, 10), visible[start..end].to_vec());
        }
    }
}
