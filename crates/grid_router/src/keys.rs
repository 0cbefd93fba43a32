//! Key and key-span primitives plus meta-index addressing.
//!
//! Keys are opaque, lexicographically ordered byte strings. The routing
//! metadata for user keys lives in a two-level meta index: descriptors for
//! user ranges are stored under meta2 keys, descriptors for meta2 ranges
//! under meta1 keys, and the meta1 range itself is advertised via gossip.

use serde::{Deserialize, Serialize};

/// An opaque ordered byte-string key.
pub type Key = Vec<u8>;

/// The minimum key (empty byte string).
pub const KEY_MIN: &[u8] = &[];

/// The maximum key. No user or meta key sorts after this.
pub const KEY_MAX: &[u8] = &[0xff, 0xff];

/// Prefix byte for first-level meta index entries.
pub const META1_PREFIX: u8 = 0x02;

/// Prefix byte for second-level meta index entries.
pub const META2_PREFIX: u8 = 0x03;

/// Returns the immediate lexicographic successor of `key`.
pub fn next_key(key: &[u8]) -> Key {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Returns the meta-index key addressing the range descriptor that covers
/// `key`. Meta1 keys resolve to the minimum key, whose descriptor is served
/// from gossip rather than the meta index.
pub fn range_meta_key(key: &[u8]) -> Key {
    match key.first() {
        None => KEY_MIN.to_vec(),
        Some(&META1_PREFIX) => KEY_MIN.to_vec(),
        Some(&META2_PREFIX) => {
            let mut meta = Vec::with_capacity(key.len());
            meta.push(META1_PREFIX);
            meta.extend_from_slice(&key[1..]);
            meta
        }
        Some(_) => {
            let mut meta = Vec::with_capacity(key.len() + 1);
            meta.push(META2_PREFIX);
            meta.extend_from_slice(key);
            meta
        }
    }
}

/// A half-open span of keys `[start, end)`.
///
/// A point key `k` is represented as the span `[k, k+\0)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeySpan {
    pub start: Key,
    pub end: Key,
}

impl KeySpan {
    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The span covering exactly the point key `key`.
    pub fn point(key: impl Into<Key>) -> Self {
        let start = key.into();
        let end = next_key(&start);
        Self { start, end }
    }

    /// True when the span covers no keys.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when `key` lies within `[start, end)`.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }

    /// True when `key` lies within `(start, end]`. Used when seeking in
    /// descending direction, where the cursor key is an exclusive end.
    pub fn contains_exclusive_end(&self, key: &[u8]) -> bool {
        key > self.start.as_slice() && key <= self.end.as_slice()
    }

    /// True when the two spans share at least one key.
    pub fn overlaps(&self, other: &KeySpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The intersection of two spans, or `None` when they are disjoint.
    pub fn intersect(&self, other: &KeySpan) -> Option<KeySpan> {
        let start = self.start.clone().max(other.start.clone());
        let end = self.end.clone().min(other.end.clone());
        if start >= end {
            return None;
        }
        Some(KeySpan { start, end })
    }
}

impl std::fmt::Display for KeySpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.start),
            String::from_utf8_lossy(&self.end)
        )
    }
}
