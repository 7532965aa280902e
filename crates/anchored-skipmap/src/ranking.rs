use std::{cmp::Ordering, collections::hash_map::RandomState};
use std::hash::{BuildHasher, Hash};


/// A strategy which assigns every key a 64-bit score, together with an exact comparison
/// used to break ties between keys with equal scores.
///
/// Entries of a [`SkipMap`] are ordered by `(score, tie_break)`, ascending. For that order
/// to be total and stable, an implementation must return the same score for a given key every
/// time it is asked (within one map), and `tie_break` must be a total order consistent with
/// key equality: `tie_break(a, b) == Ordering::Equal` if and only if `a` and `b` are the same
/// key.
///
/// [`SkipMap`]: crate::SkipMap
pub trait Ranking<K> {
    /// Produce the 64-bit orderable projection of `key`.
    ///
    /// Equal keys must map to equal scores; distinct keys may collide, in which case their
    /// relative order falls back to [`tie_break`](Self::tie_break).
    #[must_use]
    fn score(&self, key: &K) -> u64;

    /// Compare two keys exactly, resolving the order of keys whose scores collide.
    #[must_use]
    fn tie_break(&self, lhs: &K, rhs: &K) -> Ordering;
}


/// Ranks keys by a [`BuildHasher`]'s 64-bit hash, falling back to the key's [`Ord`] when two
/// hashes collide.
///
/// Iteration order of a map using this ranking is ascending hash order, which is effectively
/// arbitrary (and, with the default [`RandomState`], differs between map instances). Use
/// [`OrdRanking`] if callers depend on the keys' natural order.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashRanking<S = RandomState> {
    hash_builder: S,
}

impl<S> HashRanking<S> {
    /// Create a ranking which scores keys with the provided hasher.
    ///
    /// A deterministic [`BuildHasher`] makes the iteration order of the map reproducible
    /// across instances and runs.
    #[inline]
    #[must_use]
    pub const fn with_hasher(hash_builder: S) -> Self {
        Self { hash_builder }
    }
}

impl<K: Hash + Ord, S: BuildHasher> Ranking<K> for HashRanking<S> {
    #[inline]
    fn score(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    #[inline]
    fn tie_break(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}


/// Ranks keys purely by their [`Ord`] implementation.
///
/// Every key gets the same score, so every comparison falls through to the tie-break and the
/// map iterates in the keys' natural ascending order.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdRanking;

impl<K: Ord> Ranking<K> for OrdRanking {
    #[inline]
    fn score(&self, _key: &K) -> u64 {
        0
    }

    #[inline]
    fn tie_break(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}
