//! Gossip collaborator interface.
//!
//! The router only consumes gossip: it reads the first-range descriptor and
//! node descriptors, and registers a callback to hear about first-range
//! changes. Propagation itself lives elsewhere; `MemGossip` is an in-process
//! implementation used by embedders and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::descriptor::{NodeDescriptor, NodeId, RangeDescriptor};

/// Gossip key under which the descriptor of the first range is advertised.
pub const KEY_FIRST_RANGE_DESCRIPTOR: &str = "first-range-descriptor";

/// Gossip key under which node `node_id` advertises its descriptor.
pub fn node_descriptor_key(node_id: NodeId) -> String {
    format!("node-id-{node_id}")
}

/// Callback invoked when a registered gossip key changes. Receives the key
/// and the serialized payload.
pub type InfoCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Read-side interface onto the gossip network.
pub trait Gossip: Send + Sync {
    /// The local node's id, or 0 when the node hasn't joined gossip yet.
    fn node_id(&self) -> NodeId;

    /// The serialized payload stored under `key`, if any.
    fn info(&self, key: &str) -> Option<Vec<u8>>;

    /// Register `callback` to fire whenever `key` is updated.
    fn register_callback(&self, key: &str, callback: InfoCallback);
}

/// Decode the payload under `key` as JSON.
pub fn info_proto<T: DeserializeOwned>(gossip: &dyn Gossip, key: &str) -> Option<T> {
    let raw = gossip.info(key)?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, error = ?err, "failed to decode gossip payload");
            None
        }
    }
}

/// The gossiped first-range descriptor, if the node has received it.
pub fn first_range_descriptor(gossip: &dyn Gossip) -> Option<RangeDescriptor> {
    info_proto(gossip, KEY_FIRST_RANGE_DESCRIPTOR)
}

/// The gossiped descriptor for `node_id`, if known.
pub fn node_descriptor(gossip: &dyn Gossip, node_id: NodeId) -> Option<NodeDescriptor> {
    info_proto(gossip, &node_descriptor_key(node_id))
}

/// In-memory gossip store.
pub struct MemGossip {
    node_id: AtomicU64,
    infos: RwLock<HashMap<String, Vec<u8>>>,
    callbacks: RwLock<Vec<(String, InfoCallback)>>,
}

impl MemGossip {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id: AtomicU64::new(node_id),
            infos: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn set_node_id(&self, node_id: NodeId) {
        self.node_id.store(node_id, Ordering::Relaxed);
    }

    /// Store a JSON-encoded payload under `key` and fire matching callbacks.
    pub fn set_info_proto<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key, error = ?err, "failed to encode gossip payload");
                return;
            }
        };
        if let Ok(mut infos) = self.infos.write() {
            infos.insert(key.to_string(), raw.clone());
        }
        if let Ok(callbacks) = self.callbacks.read() {
            for (registered, callback) in callbacks.iter() {
                if registered == key {
                    callback(key, &raw);
                }
            }
        }
    }

    pub fn set_first_range_descriptor(&self, desc: &RangeDescriptor) {
        self.set_info_proto(KEY_FIRST_RANGE_DESCRIPTOR, desc);
    }

    pub fn set_node_descriptor(&self, desc: &NodeDescriptor) {
        self.set_info_proto(&node_descriptor_key(desc.node_id), desc);
    }
}

impl Gossip for MemGossip {
    fn node_id(&self) -> NodeId {
        self.node_id.load(Ordering::Relaxed)
    }

    fn info(&self, key: &str) -> Option<Vec<u8>> {
        self.infos.read().ok()?.get(key).cloned()
    }

    fn register_callback(&self, key: &str, callback: InfoCallback) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push((key.to_string(), callback));
        }
    }
}
