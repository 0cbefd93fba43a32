//! Range, replica, and node descriptors.
//!
//! Descriptors are immutable snapshots of routing metadata. The router never
//! mutates a descriptor in place; stale ones are evicted from the cache and
//! replaced wholesale.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::gossip::{self, Gossip};
use crate::keys::KeySpan;

pub type NodeId = u64;
pub type StoreId = u64;
pub type ReplicaId = u64;
pub type RangeId = u64;

/// One member of a range's replication group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

/// An immutable snapshot of a range's identity, span, and replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub span: KeySpan,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl RangeDescriptor {
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.span.contains_key(key)
    }

    pub fn contains_exclusive_end(&self, key: &[u8]) -> bool {
        self.span.contains_exclusive_end(key)
    }

    /// Two descriptors are considered the same iff their spans are equal.
    pub fn same_span(&self, other: &RangeDescriptor) -> bool {
        self.span == other.span
    }
}

impl std::fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}:{}", self.range_id, self.span)
    }
}

/// Descriptor for a node, carrying the locality attributes used to order
/// replicas by expected proximity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub attrs: Vec<String>,
    pub address: String,
}

/// A replica paired with the locality attributes of the node it lives on.
#[derive(Clone, Debug)]
pub struct ReplicaInfo {
    pub replica: ReplicaDescriptor,
    pub node_attrs: Vec<String>,
}

/// An ordered set of candidate replicas. The ordering encodes preference:
/// the best candidate to contact first.
#[derive(Clone, Debug, Default)]
pub struct ReplicaSet {
    replicas: Vec<ReplicaInfo>,
}

impl ReplicaSet {
    /// Build the candidate set for `desc`, resolving node attributes through
    /// gossip. Replicas on nodes gossip doesn't know about yet are skipped
    /// since they cannot be dialed.
    pub fn new(gossip: &dyn Gossip, desc: &RangeDescriptor) -> Self {
        let mut replicas = Vec::with_capacity(desc.replicas.len());
        for replica in &desc.replicas {
            let Some(node) = gossip::node_descriptor(gossip, replica.node_id) else {
                tracing::debug!(
                    node_id = replica.node_id,
                    range_id = desc.range_id,
                    "skipping replica on node unknown to gossip"
                );
                continue;
            };
            replicas.push(ReplicaInfo {
                replica: replica.clone(),
                node_attrs: node.attrs,
            });
        }
        Self { replicas }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.iter()
    }

    pub fn descriptors(&self) -> Vec<ReplicaDescriptor> {
        self.replicas.iter().map(|r| r.replica.clone()).collect()
    }

    /// Index of the replica on `store_id`, if present.
    pub fn find_replica(&self, store_id: StoreId) -> Option<usize> {
        self.replicas.iter().position(|r| r.replica.store_id == store_id)
    }

    pub fn move_to_front(&mut self, index: usize) {
        if index < self.replicas.len() {
            let info = self.replicas.remove(index);
            self.replicas.insert(0, info);
        }
    }

    /// Randomize the candidate order. Used for meta-index lookups, which any
    /// replica can serve inconsistently.
    pub fn shuffle(&mut self) {
        self.replicas.shuffle(&mut rand::thread_rng());
    }

    /// Stable-sort the set so that replicas sharing a longer locality
    /// attribute prefix with the local node come first. A replica on the
    /// local node itself always sorts to the front.
    pub fn optimize_order(&mut self, node: Option<&NodeDescriptor>) {
        let Some(node) = node else { return };
        self.replicas.sort_by_key(|info| {
            let local = info.replica.node_id == node.node_id;
            let shared = common_prefix_len(&node.attrs, &info.node_attrs);
            // Sort keys ascend, so negate the preference.
            (std::cmp::Reverse(local), std::cmp::Reverse(shared))
        });
    }
}

fn common_prefix_len(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
