#![expect(
    unsafe_code,
    reason = "dereference epoch-protected value pointers, which stay live while the caller's \
              guard is pinned, and release a node's final value when the node is destroyed",
)]

use std::{cmp::Ordering as CmpOrdering, iter, sync::atomic::Ordering};
use std::sync::atomic::AtomicU8;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::{Mutex, MutexGuard};

use crate::{node_heights::MAX_HEIGHT, ranking::Ranking};


/// Set once a node's structural insertion has completed. Searches treat a node without this
/// flag as absent, even though it may already be reachable at some levels.
pub(crate) const FULLY_LINKED: u8 = 1 << 0;
/// Set once a node has been logically deleted. The deleter which sets this flag owns the
/// physical unlink.
pub(crate) const MARKED: u8 = 1 << 1;


/// Composite per-node state, read and written atomically.
///
/// Both flags are monotonic: each is set at most once and never cleared, so an observer which
/// sees a flag set may rely on it staying set.
#[derive(Debug)]
pub(crate) struct NodeFlags(AtomicU8);

impl NodeFlags {
    const fn empty() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Atomically test a single flag.
    #[must_use]
    pub(crate) fn get(&self, flag: u8) -> bool {
        self.0.load(Ordering::Acquire) & flag != 0
    }

    /// Atomically set a flag. Idempotent; no flag is ever cleared.
    pub(crate) fn set_true(&self, flag: u8) {
        self.0.fetch_or(flag, Ordering::Release);
    }

    /// Atomically read the flags selected by `mask` and compare them against `expected` as one
    /// unit.
    ///
    /// Unlike two separate [`get`](Self::get) calls, the combined load cannot observe two
    /// different points in time.
    #[must_use]
    pub(crate) fn masked_get(&self, mask: u8, expected: u8) -> bool {
        self.0.load(Ordering::Acquire) & mask == expected
    }

    /// Whether the node is observably present: fully linked and not marked, as one atomic
    /// read.
    #[must_use]
    pub(crate) fn is_visible(&self) -> bool {
        self.masked_get(FULLY_LINKED | MARKED, FULLY_LINKED)
    }
}


/// A tower in the map: key, cached score, the atomically replaceable value slot, one successor
/// link per level, the structural lock, and the flag word.
///
/// # Invariants, which may be relied on by unsafe code:
/// - `key` is `None` and the value slot is null for exactly one node per map, the sentinel
///   head. The head is never reachable through successor links, so successors and search
///   results always carry a key and a non-null value.
/// - Every other node's value slot is non-null from construction onward; it changes only
///   through [`replace_value`](Self::replace_value), which retires the previous value to the
///   epoch collector. The final value is released when the node itself is destroyed.
/// - A node's height (the length of `links`) never changes after construction.
/// - Every non-null link points to a node of the same map, which is destroyed only through
///   the epoch collector after being unlinked, so anything loaded from a link under a pinned
///   guard stays valid for that guard's lifetime.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    /// `None` exactly for the sentinel head.
    key: Option<K>,
    score: u64,
    value: Atomic<V>,
    mutex: Mutex<()>,
    flags: NodeFlags,
    links: Box<[Atomic<Self>]>,
}

impl<K, V> Node<K, V> {
    /// Create the sentinel head of a map, spanning every level.
    pub(crate) fn head() -> Self {
        let head = Self {
            key: None,
            score: 0,
            value: Atomic::null(),
            mutex: Mutex::new(()),
            flags: NodeFlags::empty(),
            links: iter::repeat_with(Atomic::null).take(MAX_HEIGHT).collect(),
        };
        head.flags.set_true(FULLY_LINKED);
        head
    }

    /// Create an unlinked node. Its links start null and its flags start clear; the inserter
    /// fills the links and sets [`FULLY_LINKED`] while splicing.
    pub(crate) fn new(key: K, score: u64, value: V, height: usize) -> Self {
        debug_assert!(
            1 <= height && height <= MAX_HEIGHT,
            "node heights must lie in 1..=MAX_HEIGHT",
        );
        Self {
            key: Some(key),
            score,
            value: Atomic::new(value),
            mutex: Mutex::new(()),
            flags: NodeFlags::empty(),
            links: iter::repeat_with(Atomic::null).take(height).collect(),
        }
    }

    /// The number of levels this node participates in; its top layer is `height() - 1`.
    #[must_use]
    pub(crate) fn height(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub(crate) const fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    /// The node's key.
    ///
    /// # Panics
    /// Panics if called on the sentinel head, which has no key. The head is never returned by
    /// a search and never appears as a successor, so reaching the panic would mean the search
    /// protocol itself is broken.
    #[must_use]
    pub(crate) fn key(&self) -> &K {
        #[expect(clippy::unreachable, reason = "the head is the only keyless node")]
        match &self.key {
            Some(key) => key,
            None => unreachable!("the sentinel head is never a search result"),
        }
    }

    /// Compare this node's `(score, key)` against a search target under `ranking`.
    #[must_use]
    pub(crate) fn cmp_target<R>(&self, ranking: &R, score: u64, key: &K) -> CmpOrdering
    where
        R: Ranking<K>,
    {
        self.score
            .cmp(&score)
            .then_with(|| ranking.tie_break(self.key(), key))
    }

    /// Acquire this node's structural lock.
    #[must_use]
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }

    /// Load the successor at `level`; null means end-of-level.
    ///
    /// # Panics
    /// Panics if `level` is not below this node's height.
    #[must_use]
    pub(crate) fn load_next<'g>(&self, level: usize, guard: &'g Guard) -> Shared<'g, Self> {
        #[expect(clippy::indexing_slicing, reason = "callers keep `level` below the height")]
        self.links[level].load(Ordering::Acquire, guard)
    }

    /// Publish `next` as the successor at `level`.
    ///
    /// # Panics
    /// Panics if `level` is not below this node's height.
    pub(crate) fn store_next(&self, level: usize, next: Shared<'_, Self>) {
        #[expect(clippy::indexing_slicing, reason = "callers keep `level` below the height")]
        self.links[level].store(next, Ordering::Release);
    }

    /// Borrow the current value for the lifetime of `guard`.
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> &'g V {
        let value = self.value.load(Ordering::Acquire, guard);
        debug_assert!(!value.is_null(), "the sentinel head has no value");
        // SAFETY: every node except the head holds a non-null value, and a loaded value is
        // destroyed only through the epoch collector, no earlier than when `guard` unpins.
        // The head is never a search result, so `self` is not the head.
        unsafe { value.deref() }
    }

    /// Replace the value, retiring the previous one to the collector. Never requires the
    /// structural lock.
    pub(crate) fn replace_value(&self, value: V, guard: &Guard) {
        let old = self.value.swap(Owned::new(value), Ordering::AcqRel, guard);
        debug_assert!(!old.is_null(), "the sentinel head has no value");
        // SAFETY: `old` was this node's live value and is now unreachable from the slot;
        // readers which already loaded it are pinned, and the collector waits for them.
        unsafe { guard.defer_destroy(old) };
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // Values replaced while the node was live were retired by `replace_value`; the slot
        // still holds the final value.
        // SAFETY: `&mut self` means no guard can reach this node any longer, so the
        // unprotected access cannot race.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let value = self.value.load(Ordering::Relaxed, guard);
        if !value.is_null() {
            // SAFETY: non-null, and owned by this node alone.
            drop(unsafe { value.into_owned() });
        }
    }
}


#[cfg(test)]
mod tests {
    use crate::ranking::OrdRanking;
    use super::*;

    #[test]
    fn flags_start_clear_and_set_monotonically() {
        let flags = NodeFlags::empty();
        assert!(!flags.get(FULLY_LINKED));
        assert!(!flags.get(MARKED));
        assert!(!flags.is_visible());

        flags.set_true(FULLY_LINKED);
        assert!(flags.get(FULLY_LINKED));
        assert!(flags.is_visible());

        // Setting a set flag changes nothing.
        flags.set_true(FULLY_LINKED);
        assert!(flags.is_visible());

        flags.set_true(MARKED);
        assert!(flags.get(FULLY_LINKED));
        assert!(flags.get(MARKED));
        assert!(!flags.is_visible());
    }

    #[test]
    fn masked_get_reads_both_flags_at_once() {
        let flags = NodeFlags::empty();
        assert!(flags.masked_get(FULLY_LINKED | MARKED, 0));
        flags.set_true(MARKED);
        assert!(flags.masked_get(FULLY_LINKED | MARKED, MARKED));
        assert!(!flags.masked_get(FULLY_LINKED | MARKED, FULLY_LINKED));
    }

    #[test]
    fn head_spans_every_level_and_is_linked() {
        let head = Node::<String, u32>::head();
        assert_eq!(head.height(), MAX_HEIGHT);
        assert!(head.flags().get(FULLY_LINKED));
        assert!(!head.flags().get(MARKED));
    }

    #[test]
    fn new_nodes_start_invisible() {
        let node = Node::new(String::from("key"), 7, 13_u32, 4);
        assert_eq!(node.height(), 4);
        assert_eq!(node.key(), "key");
        assert!(!node.flags().is_visible());
    }

    #[test]
    fn values_can_be_read_and_replaced() {
        let guard = &crossbeam_epoch::pin();
        let node = Node::new(String::from("key"), 7, 13_u32, 1);
        assert_eq!(*node.value(guard), 13);
        node.replace_value(14, guard);
        assert_eq!(*node.value(guard), 14);
    }

    #[test]
    fn nodes_compare_by_score_then_key() {
        let ranking = OrdRanking;
        let node = Node::new(5_u64, 100, (), 1);
        assert_eq!(node.cmp_target(&ranking, 200, &5), CmpOrdering::Less);
        assert_eq!(node.cmp_target(&ranking, 100, &5), CmpOrdering::Equal);
        assert_eq!(node.cmp_target(&ranking, 100, &6), CmpOrdering::Less);
        assert_eq!(node.cmp_target(&ranking, 100, &4), CmpOrdering::Greater);
        assert_eq!(node.cmp_target(&ranking, 50, &5), CmpOrdering::Greater);
    }
}
