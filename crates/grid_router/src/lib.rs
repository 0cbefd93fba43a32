//! Distributed request router for the GridStore key/value store.
//!
//! The router accepts logical batches of key-addressed operations, resolves
//! which ranges own the implicated keys, splits the batch across those
//! ranges, picks a replica of each range to contact, and recombines the
//! partial responses into a single reply aligned with the original batch.
//! Storage, consensus, and the RPC wire stack live behind small
//! collaborator traits ([`gossip::Gossip`], [`transport::ReplicaClient`],
//! [`range_cache::RangeDescriptorDB`]); higher layers construct a
//! [`DistSender`] and drive everything through [`DistSender::send`].

pub mod batch;
pub mod descriptor;
pub mod error;
pub mod gossip;
pub mod hlc;
pub mod keys;
pub mod leaseholder_cache;
pub mod metrics;
pub mod range_cache;
pub mod range_iter;
pub mod retry;
pub mod sender;
pub mod stopper;
pub mod transport;
pub mod truncate;

pub use batch::{
    BatchHeader, BatchRequest, BatchResponse, KeyValue, ReadConsistency, Request, Response,
    ResponseHeader, Transaction, TxnId,
};
pub use descriptor::{
    NodeDescriptor, NodeId, RangeDescriptor, RangeId, ReplicaDescriptor, ReplicaId, ReplicaSet,
    StoreId,
};
pub use error::{ErrorDetail, RoutingError};
pub use hlc::{Clock, Timestamp};
pub use keys::{Key, KeySpan};
pub use metrics::MetricsSnapshot;
pub use range_cache::{EvictionToken, RangeDescriptorCache, RangeDescriptorDB};
pub use retry::RetryOptions;
pub use sender::{DistSender, DistSenderConfig};
pub use stopper::Stopper;
pub use transport::{
    BatchCall, ClientTransportFactory, ReplicaClient, SendOptions, Transport, TransportError,
    TransportFactory,
};
