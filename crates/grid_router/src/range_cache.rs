//! Range descriptor cache.
//!
//! Maps keys to the descriptor of the range that owns them. Entries are
//! filled from the meta index through a [`RangeDescriptorDB`] and removed
//! through [`EvictionToken`]s, which are bound to the exact descriptor
//! instance a lookup returned: evicting through a token is a no-op if the
//! cached entry has since been replaced.
//!
//! Lookups for the same key coalesce so that at most one meta-index scan is
//! in flight per distinct key; followers wait for the leader's result.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::descriptor::RangeDescriptor;
use crate::error::RoutingError;
use crate::keys::{range_meta_key, Key, KEY_MIN};

/// Source of routing metadata behind the cache.
///
/// `range_lookup` performs an inconsistent scan of the meta index; stale
/// results cost extra lookups later but are never incorrect. The first
/// range is special: its descriptor is advertised via gossip, not stored in
/// the meta index.
#[async_trait]
pub trait RangeDescriptorDB: Send + Sync {
    async fn range_lookup(
        &self,
        ctx: &CancellationToken,
        meta_key: &[u8],
        max_ranges: u32,
        use_reverse_scan: bool,
    ) -> Result<(Vec<RangeDescriptor>, Vec<RangeDescriptor>), RoutingError>;

    fn first_range(&self) -> Result<RangeDescriptor, RoutingError>;
}

struct CacheEntry {
    desc: RangeDescriptor,
    generation: u64,
}

struct CacheState {
    /// Entries keyed by the end key of the descriptor's span.
    by_end: BTreeMap<Key, CacheEntry>,
    /// Insertion order, used to shed the oldest entries past capacity.
    insertion: VecDeque<Key>,
    next_generation: u64,
    capacity: usize,
}

struct CacheShared {
    state: Mutex<CacheState>,
}

impl CacheShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cached_locked(
        state: &CacheState,
        key: &[u8],
        use_reverse_scan: bool,
    ) -> Option<(RangeDescriptor, u64)> {
        let candidate = if use_reverse_scan {
            state
                .by_end
                .range::<Key, _>((Included(key.to_vec()), Unbounded))
                .next()
        } else {
            state
                .by_end
                .range::<Key, _>((Excluded(key.to_vec()), Unbounded))
                .next()
        };
        let (_, entry) = candidate?;
        let contains = if use_reverse_scan {
            entry.desc.contains_exclusive_end(key)
        } else {
            entry.desc.contains_key(key)
        };
        if !contains {
            return None;
        }
        Some((entry.desc.clone(), entry.generation))
    }

    /// Remove entries overlapping `desc`, then insert it. Returns the new
    /// entry's generation.
    fn insert_locked(state: &mut CacheState, desc: RangeDescriptor) -> u64 {
        let stale: Vec<Key> = state
            .by_end
            .range::<Key, _>((Excluded(desc.span.start.clone()), Unbounded))
            .take_while(|(_, entry)| entry.desc.span.start < desc.span.end)
            .map(|(end, _)| end.clone())
            .collect();
        for end in stale {
            state.by_end.remove(&end);
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let end = desc.span.end.clone();
        state.by_end.insert(end.clone(), CacheEntry { desc, generation });
        state.insertion.push_back(end);

        while state.by_end.len() > state.capacity {
            let Some(oldest) = state.insertion.pop_front() else {
                break;
            };
            state.by_end.remove(&oldest);
        }
        generation
    }

    fn evict_locked(state: &mut CacheState, desc: &RangeDescriptor, generation: u64) -> bool {
        match state.by_end.get(&desc.span.end) {
            Some(entry) if entry.generation == generation => {
                state.by_end.remove(&desc.span.end);
                true
            }
            _ => false,
        }
    }
}

/// Handle bound to the exact descriptor a lookup returned.
///
/// Tokens pair the cache slot with the generation the descriptor was
/// inserted at, so an evict through a stale token never removes a newer
/// descriptor that has since replaced it.
#[derive(Clone)]
pub struct EvictionToken {
    shared: Weak<CacheShared>,
    desc: RangeDescriptor,
    generation: u64,
}

impl EvictionToken {
    /// The descriptor this token was issued for.
    pub fn descriptor(&self) -> &RangeDescriptor {
        &self.desc
    }

    /// Remove the referenced descriptor from the cache if it is still the
    /// cached instance.
    pub fn evict(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        CacheShared::evict_locked(&mut state, &self.desc, self.generation);
    }

    /// Atomically evict the referenced descriptor and insert replacements.
    pub fn evict_and_replace(&self, replacements: Vec<RangeDescriptor>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        CacheShared::evict_locked(&mut state, &self.desc, self.generation);
        for desc in replacements {
            CacheShared::insert_locked(&mut state, desc);
        }
    }
}

impl std::fmt::Debug for EvictionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionToken")
            .field("desc", &self.desc)
            .field("generation", &self.generation)
            .finish()
    }
}

type LookupResult = Result<(RangeDescriptor, EvictionToken), RoutingError>;

/// Cache of range descriptors with coalesced meta-index lookups.
pub struct RangeDescriptorCache {
    db: Arc<dyn RangeDescriptorDB>,
    shared: Arc<CacheShared>,
    max_lookup_ranges: u32,
    inflight: tokio::sync::Mutex<HashMap<(Key, bool), Vec<oneshot::Sender<LookupResult>>>>,
}

impl RangeDescriptorCache {
    pub fn new(db: Arc<dyn RangeDescriptorDB>, capacity: usize, max_lookup_ranges: u32) -> Self {
        Self {
            db,
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    by_end: BTreeMap::new(),
                    insertion: VecDeque::new(),
                    next_generation: 0,
                    capacity: capacity.max(1),
                }),
            }),
            max_lookup_ranges,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn token(&self, desc: RangeDescriptor, generation: u64) -> EvictionToken {
        EvictionToken {
            shared: Arc::downgrade(&self.shared),
            desc,
            generation,
        }
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.shared.lock().by_end.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the descriptor covering `key` (or, for a reverse lookup, the
    /// descriptor whose span ends at `key`).
    ///
    /// `prev_token`, when provided, is the token from a previous lookup of
    /// the same key whose descriptor turned out to be stale; the caller is
    /// expected to have evicted through it already.
    pub async fn lookup(
        &self,
        ctx: &CancellationToken,
        key: &[u8],
        _prev_token: Option<&EvictionToken>,
        use_reverse_scan: bool,
    ) -> LookupResult {
        if let Some((desc, generation)) = {
            let state = self.shared.lock();
            CacheShared::cached_locked(&state, key, use_reverse_scan)
        } {
            return Ok((desc.clone(), self.token(desc, generation)));
        }

        let inflight_key = (key.to_vec(), use_reverse_scan);
        let receiver = {
            let mut inflight = self.inflight.lock().await;
            // Double-check under the coalescing lock: the leader may have
            // completed between the fast path and here.
            if let Some((desc, generation)) = {
                let state = self.shared.lock();
                CacheShared::cached_locked(&state, key, use_reverse_scan)
            } {
                return Ok((desc.clone(), self.token(desc, generation)));
            }
            match inflight.entry(inflight_key.clone()) {
                std::collections::hash_map::Entry::Occupied(mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.get_mut().push(tx);
                    Some(rx)
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = receiver {
            return match rx.await {
                Ok(result) => result,
                Err(_) => Err(RoutingError::from_msg(
                    "coalesced range lookup abandoned by leader",
                )),
            };
        }

        let result = self.perform_lookup(ctx, key, use_reverse_scan).await;
        let waiters = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&inflight_key).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn perform_lookup(
        &self,
        ctx: &CancellationToken,
        key: &[u8],
        use_reverse_scan: bool,
    ) -> LookupResult {
        let meta_key = range_meta_key(key);
        if meta_key == KEY_MIN {
            let desc = self.db.first_range()?;
            let generation = {
                let mut state = self.shared.lock();
                CacheShared::insert_locked(&mut state, desc.clone())
            };
            return Ok((desc.clone(), self.token(desc, generation)));
        }

        let (ranges, prefetched) = self
            .db
            .range_lookup(ctx, &meta_key, self.max_lookup_ranges, use_reverse_scan)
            .await?;
        let Some(matching) = ranges.first().cloned() else {
            return Err(RoutingError::from_msg(format!(
                "no range descriptors returned for key {:?}",
                String::from_utf8_lossy(key)
            )));
        };

        let mut state = self.shared.lock();
        let mut generation = 0;
        for desc in ranges {
            let g = CacheShared::insert_locked(&mut state, desc.clone());
            if desc.same_span(&matching) {
                generation = g;
            }
        }
        for desc in prefetched {
            CacheShared::insert_locked(&mut state, desc);
        }
        drop(state);
        Ok((matching.clone(), self.token(matching, generation)))
    }

    /// Drop the cached descriptor covering `key`, regardless of generation.
    /// Used when gossip announces a new first range.
    pub fn evict_cached_descriptor(&self, key: &[u8]) {
        let mut state = self.shared.lock();
        let Some((desc, _)) = CacheShared::cached_locked(&state, key, false) else {
            return;
        };
        state.by_end.remove(&desc.span.end);
        tracing::debug!(%desc, "evicted range descriptor");
    }

    /// Insert descriptors directly, clearing any overlapping entries. Used
    /// by tests and by embedders seeding known topology.
    pub fn insert(&self, descriptors: impl IntoIterator<Item = RangeDescriptor>) {
        let mut state = self.shared.lock();
        for desc in descriptors {
            CacheShared::insert_locked(&mut state, desc);
        }
    }
}

impl std::fmt::Debug for RangeDescriptorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeDescriptorCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
