#![expect(
    unsafe_code,
    reason = "searches hand out `Shared` pointers to nodes which remain live for as long as \
              the operation's epoch guard is pinned, and destruction of unlinked nodes is \
              deferred through the collector",
)]

use std::fmt;
use std::{cmp::Ordering as CmpOrdering, ptr, sync::atomic::Ordering};
use std::sync::atomic::AtomicIsize;

use crossbeam_epoch::{Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use parking_lot::MutexGuard;

use crate::{node_heights::{HeightPrng, MAX_HEIGHT}, ranking::{HashRanking, OrdRanking, Ranking}};
use crate::node::{FULLY_LINKED, MARKED, Node};


/// Predecessor or successor snapshots recorded by a search, one per level.
type Levels<'g, K, V> = [Shared<'g, Node<K, V>>; MAX_HEIGHT];

/// A [`SkipMap`] which keeps entries in the ascending [`Ord`] order of their keys.
///
/// [`for_each`] visits entries in that order, smallest key first.
///
/// [`for_each`]: SkipMap::for_each
pub type OrdSkipMap<K, V> = SkipMap<K, V, OrdRanking>;

/// A sorted map which may be read and written from any number of threads in parallel.
///
/// Entries are kept in ascending order of their [`Ranking`], in a skip list. Reads
/// ([`get`], [`contains_key`], [`for_each`]) take no locks and never wait for writers;
/// writes ([`insert`], [`remove`], [`take`]) briefly lock the few nodes adjacent to the
/// affected entry, so writes to different parts of the map proceed in parallel.
///
/// Every operation takes `&self`; wrap the map in an [`Arc`] to share it across threads.
///
/// ```
/// use anchored_skipmap::SkipMap;
///
/// let map = SkipMap::new();
/// map.insert("two", 2_u32);
/// map.insert("one", 1);
///
/// assert_eq!(map.get(&"one"), Some(1));
/// assert!(map.remove(&"two"));
/// assert_eq!(map.len(), 1);
/// ```
///
/// [`get`]: SkipMap::get
/// [`contains_key`]: SkipMap::contains_key
/// [`for_each`]: SkipMap::for_each
/// [`insert`]: SkipMap::insert
/// [`remove`]: SkipMap::remove
/// [`take`]: SkipMap::take
/// [`Arc`]: std::sync::Arc
pub struct SkipMap<K, V, R = HashRanking> {
    /// Sentinel below every key, linked at all of `MAX_HEIGHT` levels.
    head:    Box<Node<K, V>>,
    ranking: R,
    heights: HeightPrng,
    /// Signed so that racing removals may transiently drive it below zero.
    length:  CachePadded<AtomicIsize>,
}

impl<K, V> SkipMap<K, V> {
    /// Create an empty map ranked by randomized hashing of its keys.
    ///
    /// Entries are ordered by hash value, so [`for_each`] visits them in an arbitrary
    /// (but stable) order. Use [`OrdSkipMap`] for the keys' natural order instead.
    ///
    /// [`for_each`]: SkipMap::for_each
    #[must_use]
    pub fn new() -> Self {
        Self::with_ranking(HashRanking::default())
    }
}

impl<K, V, S> SkipMap<K, V, HashRanking<S>> {
    /// Create an empty hash-ranked map which hashes keys with `hash_builder`.
    #[must_use]
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_ranking(HashRanking::with_hasher(hash_builder))
    }
}

impl<K, V> OrdSkipMap<K, V> {
    /// Create an empty map ordered by the keys' [`Ord`] instance.
    #[must_use]
    pub fn new_ordered() -> Self {
        Self::with_ranking(OrdRanking)
    }
}

impl<K, V, R> SkipMap<K, V, R> {
    /// Create an empty map which orders its keys by `ranking`.
    #[must_use]
    pub fn with_ranking(ranking: R) -> Self {
        Self {
            head:    Box::new(Node::head()),
            ranking,
            heights: HeightPrng::new(),
            length:  CachePadded::new(AtomicIsize::new(0)),
        }
    }

    /// The number of entries in the map.
    ///
    /// Exact while no writes are in flight. Concurrent inserts and removals may make the
    /// count momentarily stale, but it always settles to the true length once they finish.
    #[must_use]
    pub fn len(&self) -> usize {
        let length = self.length.load(Ordering::Relaxed);
        usize::try_from(length).unwrap_or(0)
    }

    /// Whether the map has no entries, with the same caveat as [`len`](Self::len).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `visit` on each entry in ranking order, until it returns `false` or every
    /// entry has been seen.
    ///
    /// Entries inserted or removed while the walk is underway may or may not be visited;
    /// each visited entry was present in the map at some point during the walk.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = &crossbeam_epoch::pin();
        let mut node = self.head.load_next(0, guard);

        // SAFETY: nodes reached through bottom-level links remain live while `guard`
        // is pinned.
        while let Some(node_ref) = unsafe { node.as_ref() } {
            if node_ref.flags().is_visible() && !visit(node_ref.key(), node_ref.value(guard)) {
                return;
            }
            node = node_ref.load_next(0, guard);
        }
    }

    /// The sentinel head as a `Shared`, so that searches can treat it like any other
    /// predecessor. The head is owned by `self` and outlives any guard used against it.
    fn head_shared<'g>(&self, _guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        Shared::from(ptr::from_ref(&*self.head))
    }
}

impl<K, V, R: Ranking<K>> SkipMap<K, V, R> {
    /// Whether `key` has a visible entry in the map.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let guard = &crossbeam_epoch::pin();
        let score = self.ranking.score(key);
        self.find_match(score, key, guard)
            .is_some_and(|node| node.flags().is_visible())
    }

    /// Get a clone of the value stored for `key`, or `None` if the key is absent.
    ///
    /// Lock-free: returns without waiting even while the entry is being concurrently
    /// replaced or removed. A key whose insertion has not finished linking, or whose
    /// removal has begun, counts as absent.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let score = self.ranking.score(key);
        let node = self.find_match(score, key, guard)?;
        node.flags().is_visible().then(|| node.value(guard).clone())
    }

    /// Search for a node ranking equal to `(score, key)`, returning as soon as one is
    /// seen at any level. Does not record predecessors; use for pure lookups.
    fn find_match<'g>(&self, score: u64, key: &K, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let mut pred = self.head_shared(guard);

        for level in (0..MAX_HEIGHT).rev() {
            // SAFETY: `pred` is the head or was reached through links under `guard`.
            let mut succ = unsafe { pred.deref() }.load_next(level, guard);
            loop {
                // SAFETY: as above; successors are reached through links under `guard`.
                let Some(succ_ref) = (unsafe { succ.as_ref() }) else { break };
                match succ_ref.cmp_target(&self.ranking, score, key) {
                    CmpOrdering::Less => {
                        pred = succ;
                        succ = succ_ref.load_next(level, guard);
                    }
                    CmpOrdering::Equal => return Some(succ_ref),
                    CmpOrdering::Greater => break,
                }
            }
        }
        None
    }

    /// Search for `(score, key)`, recording the last node ranking below the target and
    /// that node's successor at each level descended through.
    ///
    /// Returns the matching node as soon as one is seen; entries of `preds` and `succs`
    /// below that level are then left stale. When no match exists, every level is filled
    /// and the target belongs between `preds[level]` and `succs[level]` at each level.
    fn find_with_levels<'g>(
        &self,
        score:  u64,
        key:    &K,
        preds:  &mut Levels<'g, K, V>,
        succs:  &mut Levels<'g, K, V>,
        guard:  &'g Guard,
    ) -> Option<Shared<'g, Node<K, V>>> {
        #![expect(clippy::indexing_slicing, reason = "0 <= level < MAX_HEIGHT")]
        let mut pred = self.head_shared(guard);

        for level in (0..MAX_HEIGHT).rev() {
            // SAFETY: `pred` is the head or was reached through links under `guard`.
            let mut succ = unsafe { pred.deref() }.load_next(level, guard);
            loop {
                // SAFETY: as above.
                let Some(succ_ref) = (unsafe { succ.as_ref() }) else { break };
                match succ_ref.cmp_target(&self.ranking, score, key) {
                    CmpOrdering::Less => {
                        pred = succ;
                        succ = succ_ref.load_next(level, guard);
                    }
                    CmpOrdering::Equal => {
                        preds[level] = pred;
                        succs[level] = succ;
                        return Some(succ);
                    }
                    CmpOrdering::Greater => break,
                }
            }
            preds[level] = pred;
            succs[level] = succ;
        }
        None
    }

    /// Search for `(score, key)` like [`find_with_levels`](Self::find_with_levels), but
    /// always descend to the bottom so that every level of `preds` and `succs` is filled.
    ///
    /// Returns the highest level at which a matching node was seen. Once the node is
    /// fully linked that is its top layer, which removal uses to know how many levels
    /// to unlink.
    fn find_for_removal<'g>(
        &self,
        score:  u64,
        key:    &K,
        preds:  &mut Levels<'g, K, V>,
        succs:  &mut Levels<'g, K, V>,
        guard:  &'g Guard,
    ) -> Option<usize> {
        #![expect(clippy::indexing_slicing, reason = "0 <= level < MAX_HEIGHT")]
        let mut found = None;
        let mut pred = self.head_shared(guard);

        for level in (0..MAX_HEIGHT).rev() {
            // SAFETY: `pred` is the head or was reached through links under `guard`.
            let mut succ = unsafe { pred.deref() }.load_next(level, guard);
            loop {
                // SAFETY: as above.
                let Some(succ_ref) = (unsafe { succ.as_ref() }) else { break };
                match succ_ref.cmp_target(&self.ranking, score, key) {
                    CmpOrdering::Less => {
                        pred = succ;
                        succ = succ_ref.load_next(level, guard);
                    }
                    CmpOrdering::Equal => {
                        if found.is_none() {
                            found = Some(level);
                        }
                        break;
                    }
                    CmpOrdering::Greater => break,
                }
            }
            preds[level] = pred;
            succs[level] = succ;
        }
        found
    }
}

impl<K, V, R> SkipMap<K, V, R>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    R: Ranking<K>,
{
    /// Insert `key` with `value`.
    ///
    /// If the key is already present its value is replaced, and the old value is dropped
    /// once no reader can still be using it. A key whose removal is underway counts as
    /// absent; the insert waits out the unlinking and then re-adds the key as a fresh
    /// entry.
    pub fn insert(&self, key: K, value: V) {
        let guard = &crossbeam_epoch::pin();
        let score = self.ranking.score(&key);
        // One draw per insert, not per attempt, so retries splice the same tower.
        let height = self.heights.next_height();
        let mut preds = [Shared::null(); MAX_HEIGHT];
        let mut succs = [Shared::null(); MAX_HEIGHT];

        let mut entry = (key, value);
        loop {
            entry = match self.insert_attempt(score, height, entry, &mut preds, &mut succs, guard)
            {
                None        => return,
                Some(entry) => entry,
            };
        }
    }

    /// Get a clone of the value stored for `key`, inserting `value` if the key is absent.
    ///
    /// Returns the already-present value, or `None` if `value` was inserted. The lookup
    /// and the insert are not atomic with respect to other writers: if a racing removal
    /// or insert lands between them, this falls back to a plain [`insert`](Self::insert)
    /// of `value` and returns `None`.
    #[must_use]
    pub fn get_or_insert(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        if let Some(present) = self.get(&key) {
            return Some(present);
        }
        self.insert(key, value);
        None
    }

    /// Like [`get_or_insert`](Self::get_or_insert), but the value is built only if the
    /// lookup misses. The same non-atomicity applies, so `make_value` may run and its
    /// result still replace a concurrently-inserted value.
    #[must_use]
    pub fn get_or_insert_with<F>(&self, key: K, make_value: F) -> Option<V>
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        if let Some(present) = self.get(&key) {
            return Some(present);
        }
        self.insert(key, make_value());
        None
    }

    /// Remove `key` from the map, returning whether this call removed it.
    ///
    /// When several threads race to remove the same entry, exactly one of them
    /// observes `true`.
    #[expect(clippy::must_use_candidate, reason = "ignoring whether the key was present is routine")]
    pub fn remove(&self, key: &K) -> bool {
        let guard = &crossbeam_epoch::pin();
        let score = self.ranking.score(key);
        self.remove_inner(score, key, guard).is_some()
    }

    /// Remove `key` from the map, returning a clone of the removed value.
    ///
    /// Like [`remove`](Self::remove), exactly one of any number of racing callers gets
    /// the value; the rest get `None`.
    #[must_use]
    pub fn take(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let score = self.ranking.score(key);
        self.remove_inner(score, key, guard)
            .map(|node| node.value(guard).clone())
    }

    /// One optimistic pass of an insert. Returns `None` once the entry is committed, or
    /// gives `entry` back for another pass when a concurrent writer invalidated the
    /// splice point.
    fn insert_attempt<'g>(
        &self,
        score:  u64,
        height: usize,
        entry:  (K, V),
        preds:  &mut Levels<'g, K, V>,
        succs:  &mut Levels<'g, K, V>,
        guard:  &'g Guard,
    ) -> Option<(K, V)> {
        #![expect(clippy::indexing_slicing, reason = "layers stay below the drawn height")]
        let (key, value) = entry;

        if let Some(found) = self.find_with_levels(score, &key, preds, succs, guard) {
            // SAFETY: found under `guard`.
            let found_ref = unsafe { found.deref() };
            return if found_ref.flags().get(MARKED) {
                // A deleter owns the node; retry once it is unlinked.
                Some((key, value))
            } else {
                // Present, whether or not it has finished linking. Only the value slot
                // needs to change.
                found_ref.replace_value(value, guard);
                None
            };
        }

        // The key is absent at the moment. Lock the would-be predecessor at each of the
        // new node's layers, and re-check that the splice points still hold under those
        // locks. Consecutive layers often share a predecessor; lock each node once.
        #[expect(clippy::collection_is_never_read, reason = "holds the guards until the splice")]
        let mut locks: Vec<MutexGuard<'g, ()>> = Vec::with_capacity(height);
        let mut prev_pred = Shared::null();
        let mut valid = true;
        for layer in 0..height {
            let pred = preds[layer];
            let succ = succs[layer];
            if pred != prev_pred {
                // SAFETY: predecessors recorded by the search stay live under `guard`.
                locks.push(unsafe { pred.deref() }.lock());
                prev_pred = pred;
            }
            // SAFETY: as above, for both the predecessor and its recorded successor.
            let pred_ref = unsafe { pred.deref() };
            let succ_unmarked =
                unsafe { succ.as_ref() }.is_none_or(|succ| !succ.flags().get(MARKED));
            valid = !pred_ref.flags().get(MARKED)
                && succ_unmarked
                && pred_ref.load_next(layer, guard) == succ;
            if !valid {
                break;
            }
        }
        if !valid {
            // A neighbor changed underneath us; unlock and retry from the search.
            return Some((key, value));
        }

        let node = Owned::new(Node::new(key, score, value, height)).into_shared(guard);
        // SAFETY: freshly allocated, and not destroyed until unlinked and retired.
        let node_ref = unsafe { node.deref() };
        for layer in 0..height {
            node_ref.store_next(layer, succs[layer]);
            // SAFETY: every `preds[layer]` is locked and live under `guard`.
            unsafe { preds[layer].deref() }.store_next(layer, node);
        }
        // The bottom-level link published the node; this makes readers treat it as live.
        node_ref.flags().set_true(FULLY_LINKED);
        drop(locks);
        self.length.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove the entry matching `(score, key)`, returning the unlinked node so callers
    /// can read out its value before the collector frees it.
    ///
    /// Marks the node first, which settles races between removers, then retries the
    /// physical unlinking until the predecessor locks validate.
    fn remove_inner<'g>(&self, score: u64, key: &K, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        #![expect(clippy::indexing_slicing, reason = "layers stay below the candidate's height")]
        let mut preds: Levels<'g, K, V> = [Shared::null(); MAX_HEIGHT];
        let mut succs: Levels<'g, K, V> = [Shared::null(); MAX_HEIGHT];
        let mut candidate = Shared::null();
        let mut candidate_lock: Option<MutexGuard<'g, ()>> = None;
        let mut top_layer = 0;

        loop {
            let found = self.find_for_removal(score, key, &mut preds, &mut succs, guard);

            if candidate_lock.is_none() {
                let Some(layer) = found else { return None };
                candidate = succs[layer];
                // SAFETY: found under `guard`.
                let candidate_ref = unsafe { candidate.deref() };

                // Only a fully-linked, unmarked node seen at its own top layer may be
                // removed; anything else is mid-insert, or another remover's claim.
                if !(candidate_ref.flags().is_visible() && candidate_ref.height() - 1 == layer) {
                    return None;
                }
                let lock = candidate_ref.lock();
                if candidate_ref.flags().get(MARKED) {
                    // Lost the race; the winner will unlink it.
                    return None;
                }
                candidate_ref.flags().set_true(MARKED);
                candidate_lock = Some(lock);
                top_layer = layer;
            }

            // SAFETY: marked and locked by this call, and live under `guard`.
            let candidate_ref = unsafe { candidate.deref() };

            #[expect(clippy::collection_is_never_read, reason = "holds the guards until the unlink")]
            let mut locks: Vec<MutexGuard<'g, ()>> = Vec::with_capacity(top_layer + 1);
            let mut prev_pred = Shared::null();
            let mut valid = true;
            for layer in 0..=top_layer {
                let pred = preds[layer];
                if pred != prev_pred {
                    // SAFETY: predecessors recorded by the search stay live under `guard`.
                    locks.push(unsafe { pred.deref() }.lock());
                    prev_pred = pred;
                }
                // SAFETY: as above.
                let pred_ref = unsafe { pred.deref() };
                valid = !pred_ref.flags().get(MARKED)
                    && pred_ref.load_next(layer, guard) == succs[layer];
                if !valid {
                    break;
                }
            }
            if !valid {
                // A neighbor changed; unlock the predecessors and search again. The mark
                // set above stays, so no competing remover can claim the node meanwhile.
                continue;
            }

            for layer in (0..=top_layer).rev() {
                // SAFETY: every `preds[layer]` is locked, and the candidate's own lock
                // freezes its links.
                unsafe { preds[layer].deref() }
                    .store_next(layer, candidate_ref.load_next(layer, guard));
            }
            drop(candidate_lock);
            drop(locks);
            self.length.fetch_sub(1, Ordering::Relaxed);
            // SAFETY: unlinked from every level, so no new traversal can reach the node,
            // and threads which already hold it are waited out by the collector.
            unsafe { guard.defer_destroy(candidate) };
            return Some(candidate_ref);
        }
    }
}

impl<K, V, R: Default> Default for SkipMap<K, V, R> {
    fn default() -> Self {
        Self::with_ranking(R::default())
    }
}

impl<K: fmt::Debug, V: fmt::Debug, R> fmt::Debug for SkipMap<K, V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.for_each(|key, value| {
            map.entry(key, value);
            true
        });
        map.finish()
    }
}

impl<K, V, R> Drop for SkipMap<K, V, R> {
    fn drop(&mut self) {
        // Nodes already retired by removals belong to the collector; everything still
        // linked at the bottom level is exclusively ours to free.
        // SAFETY: `&mut self` means no thread holds a guard over this map's nodes, so
        // unprotected access cannot race.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut node = self.head.load_next(0, guard);
        // SAFETY: bottom-level links reach every live node exactly once.
        while let Some(node_ref) = unsafe { node.as_ref() } {
            let next = node_ref.load_next(0, guard);
            // SAFETY: non-null, and no longer reachable by anyone else.
            drop(unsafe { node.into_owned() });
            node = next;
        }
    }
}
