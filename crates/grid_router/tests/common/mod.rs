//! Shared helpers for router integration tests.
//!
//! `TestCluster` wires a `DistSender` to an in-memory gossip network, a
//! scripted replica client, and either a flat descriptor source or the full
//! meta-index lookup path. `FakeStore` implements just enough server-side
//! batch evaluation (ownership checks, key limits, resume spans) to
//! exercise the router end to end.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use grid_router::batch::{
    BatchRequest, BatchResponse, KeyValue, Request, Response, ResponseHeader, Transaction, TxnId,
};
use grid_router::descriptor::{NodeDescriptor, RangeDescriptor, ReplicaDescriptor};
use grid_router::error::{ErrorDetail, RoutingError};
use grid_router::gossip::MemGossip;
use grid_router::hlc::{Clock, Timestamp};
use grid_router::keys::{next_key, KeySpan};
use grid_router::range_cache::RangeDescriptorDB;
use grid_router::retry::RetryOptions;
use grid_router::sender::{DistSender, DistSenderConfig};
use grid_router::stopper::Stopper;
use grid_router::transport::{ClientTransportFactory, ReplicaClient, TransportError};

/// Node id the test gossip reports for the local node. Not a replica of any
/// range, so replica ordering stays the descriptor order.
pub const LOCAL_NODE_ID: u64 = 99;

pub fn replica(node_id: u64) -> ReplicaDescriptor {
    ReplicaDescriptor {
        node_id,
        store_id: node_id * 10,
        replica_id: node_id,
    }
}

pub fn range_desc(range_id: u64, start: &[u8], end: &[u8], nodes: &[u64]) -> RangeDescriptor {
    RangeDescriptor {
        range_id,
        span: KeySpan::new(start.to_vec(), end.to_vec()),
        replicas: nodes.iter().map(|n| replica(*n)).collect(),
    }
}

pub fn get(key: &[u8]) -> Request {
    Request::Get {
        span: KeySpan::point(key.to_vec()),
    }
}

pub fn put(key: &[u8], value: &[u8]) -> Request {
    Request::Put {
        span: KeySpan::point(key.to_vec()),
        value: value.to_vec(),
    }
}

pub fn scan(start: &[u8], end: &[u8]) -> Request {
    Request::Scan {
        span: KeySpan::new(start.to_vec(), end.to_vec()),
    }
}

pub fn reverse_scan(start: &[u8], end: &[u8]) -> Request {
    Request::ReverseScan {
        span: KeySpan::new(start.to_vec(), end.to_vec()),
    }
}

pub fn begin_txn(key: &[u8]) -> Request {
    Request::BeginTransaction {
        span: KeySpan::point(key.to_vec()),
    }
}

pub fn end_txn(key: &[u8], commit: bool) -> Request {
    Request::EndTransaction {
        span: KeySpan::point(key.to_vec()),
        commit,
    }
}

pub fn batch_of(requests: Vec<Request>) -> BatchRequest {
    let mut ba = BatchRequest::default();
    for req in requests {
        ba.add(req);
    }
    ba
}

/// Attach a fresh transaction record to `ba`.
pub fn with_txn(mut ba: BatchRequest) -> BatchRequest {
    let ts = Timestamp {
        wall_time: 10,
        logical: 0,
    };
    ba.header.txn = Some(Transaction {
        id: TxnId {
            node_id: LOCAL_NODE_ID,
            counter: 1,
        },
        timestamp: ts,
        orig_timestamp: ts,
        observed_timestamps: BTreeMap::new(),
        writing: false,
    });
    ba
}

/// A reply carrying an application-level error, the way a store reports
/// routing problems.
pub fn error_reply(err: RoutingError) -> BatchResponse {
    BatchResponse {
        error: Some(err),
        ..BatchResponse::default()
    }
}

/// One recorded RPC.
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub replica: ReplicaDescriptor,
    pub range_id: u64,
    pub summary: String,
}

pub type Handler = Box<
    dyn Fn(&ReplicaDescriptor, &BatchRequest) -> Result<BatchResponse, TransportError>
        + Send
        + Sync,
>;

/// Replica client driven by a test-provided handler, recording every call.
pub struct ScriptedClient {
    handler: Handler,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedClient {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl ReplicaClient for ScriptedClient {
    async fn send_batch(
        &self,
        replica: &ReplicaDescriptor,
        batch: BatchRequest,
    ) -> Result<BatchResponse, TransportError> {
        self.calls.lock().expect("calls lock").push(CallRecord {
            replica: replica.clone(),
            range_id: batch.header.range_id,
            summary: batch.summary(),
        });
        (self.handler)(replica, &batch)
    }
}

/// Minimal server-side batch evaluation over an in-memory key space.
pub struct FakeStore {
    pub kv: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    pub topology: Arc<Mutex<Vec<RangeDescriptor>>>,
}

impl FakeStore {
    pub fn new(topology: Arc<Mutex<Vec<RangeDescriptor>>>) -> Self {
        Self {
            kv: Mutex::new(BTreeMap::new()),
            topology,
        }
    }

    pub fn load(&self, pairs: &[(&[u8], &[u8])]) {
        let mut kv = self.kv.lock().expect("kv lock");
        for (k, v) in pairs {
            kv.insert(k.to_vec(), v.to_vec());
        }
    }

    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.lock().expect("kv lock").get(key).cloned()
    }

    /// Evaluate one range-addressed batch the way a store would: reject
    /// unknown ranges and unowned spans, honor the batch-wide key limit,
    /// and stamp resume spans for cut-short range requests.
    pub fn serve(&self, ba: &BatchRequest) -> BatchResponse {
        let desc = {
            let topology = self.topology.lock().expect("topology lock");
            topology
                .iter()
                .find(|d| d.range_id == ba.header.range_id)
                .cloned()
        };
        let Some(desc) = desc else {
            return error_reply(RoutingError::new(ErrorDetail::RangeNotFound {
                range_id: ba.header.range_id,
            }));
        };

        for req in &ba.requests {
            if matches!(req, Request::RangeLookup { .. }) {
                continue;
            }
            let span = req.span();
            let owned = desc.span.contains_key(&span.start) && span.end <= desc.span.end;
            if !owned {
                let suggested = {
                    let topology = self.topology.lock().expect("topology lock");
                    topology
                        .iter()
                        .find(|d| d.contains_key(&span.start))
                        .cloned()
                };
                return error_reply(RoutingError::new(ErrorDetail::RangeKeyMismatch {
                    requested: span.clone(),
                    mismatched: Some(desc.clone()),
                    suggested,
                }));
            }
        }

        let unlimited = ba.header.max_span_request_keys == 0;
        let mut remaining = ba.header.max_span_request_keys;
        let mut kv = self.kv.lock().expect("kv lock");
        let mut responses = Vec::with_capacity(ba.requests.len());
        for req in &ba.requests {
            let resp = match req {
                Request::Get { span } => {
                    let value = kv.get(&span.start).cloned();
                    Response::Get {
                        header: ResponseHeader {
                            num_keys: u64::from(value.is_some()),
                            resume_span: None,
                        },
                        value,
                    }
                }
                Request::Put { span, value } => {
                    kv.insert(span.start.clone(), value.clone());
                    Response::Put {
                        header: ResponseHeader {
                            num_keys: 1,
                            resume_span: None,
                        },
                    }
                }
                Request::Delete { span } => {
                    let removed = kv.remove(&span.start).is_some();
                    Response::Delete {
                        header: ResponseHeader {
                            num_keys: u64::from(removed),
                            resume_span: None,
                        },
                    }
                }
                Request::Scan { span } => {
                    let mut rows = Vec::new();
                    let mut resume = None;
                    for (k, v) in kv.range(span.start.clone()..span.end.clone()) {
                        if !unlimited && remaining == 0 {
                            resume = Some(KeySpan::new(k.clone(), span.end.clone()));
                            break;
                        }
                        rows.push(KeyValue {
                            key: k.clone(),
                            value: v.clone(),
                        });
                        if !unlimited {
                            remaining -= 1;
                        }
                    }
                    Response::Scan {
                        header: ResponseHeader {
                            num_keys: rows.len() as u64,
                            resume_span: resume,
                        },
                        rows,
                    }
                }
                Request::ReverseScan { span } => {
                    let mut rows = Vec::new();
                    let mut resume = None;
                    for (k, v) in kv.range(span.start.clone()..span.end.clone()).rev() {
                        if !unlimited && remaining == 0 {
                            resume = Some(KeySpan::new(span.start.clone(), next_key(k)));
                            break;
                        }
                        rows.push(KeyValue {
                            key: k.clone(),
                            value: v.clone(),
                        });
                        if !unlimited {
                            remaining -= 1;
                        }
                    }
                    Response::ReverseScan {
                        header: ResponseHeader {
                            num_keys: rows.len() as u64,
                            resume_span: resume,
                        },
                        rows,
                    }
                }
                Request::DeleteRange { span } => {
                    let doomed: Vec<Vec<u8>> = kv
                        .range(span.start.clone()..span.end.clone())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in &doomed {
                        kv.remove(k);
                    }
                    Response::DeleteRange {
                        header: ResponseHeader {
                            num_keys: doomed.len() as u64,
                            resume_span: None,
                        },
                    }
                }
                Request::BeginTransaction { .. } => Response::BeginTransaction {
                    header: ResponseHeader::default(),
                },
                Request::EndTransaction { commit, .. } => Response::EndTransaction {
                    header: ResponseHeader::default(),
                    committed: *commit,
                },
                Request::RangeLookup {
                    span,
                    max_ranges,
                    reverse,
                } => self.serve_range_lookup(&span.start, *max_ranges, *reverse),
            };
            responses.push(resp);
        }

        BatchResponse {
            txn: ba.header.txn.clone(),
            now: Timestamp {
                wall_time: 1_000,
                logical: 0,
            },
            collected_spans: Vec::new(),
            error: None,
            responses,
        }
    }

    /// Answer a meta-index scan. Level-1 keys resolve to the range holding
    /// the level-2 entries; level-2 keys resolve to user ranges, with the
    /// following descriptors prefetched.
    fn serve_range_lookup(&self, meta_key: &[u8], max_ranges: u32, reverse: bool) -> Response {
        let topology = self.topology.lock().expect("topology lock");
        let (ranges, prefetched) = match meta_key.first() {
            Some(&2) => {
                let mut meta2_key = vec![3u8];
                meta2_key.extend_from_slice(&meta_key[1..]);
                let found = topology
                    .iter()
                    .find(|d| d.contains_key(&meta2_key))
                    .cloned();
                (found.into_iter().collect(), Vec::new())
            }
            Some(&3) => {
                let user_key = &meta_key[1..];
                let found = topology.iter().position(|d| {
                    if reverse {
                        d.contains_exclusive_end(user_key)
                    } else {
                        d.contains_key(user_key)
                    }
                });
                match found {
                    Some(pos) => {
                        let prefetched: Vec<RangeDescriptor> = if reverse {
                            Vec::new()
                        } else {
                            topology
                                .iter()
                                .skip(pos + 1)
                                .take(max_ranges.saturating_sub(1) as usize)
                                .cloned()
                                .collect()
                        };
                        (vec![topology[pos].clone()], prefetched)
                    }
                    None => (Vec::new(), Vec::new()),
                }
            }
            _ => (Vec::new(), Vec::new()),
        };
        Response::RangeLookup {
            header: ResponseHeader::default(),
            ranges,
            prefetched,
        }
    }
}

/// Flat descriptor source resolving directly against the topology,
/// bypassing the meta-index RPC path. Counts lookups.
pub struct TopologyDb {
    pub topology: Arc<Mutex<Vec<RangeDescriptor>>>,
    pub lookups: AtomicUsize,
}

#[async_trait]
impl RangeDescriptorDB for TopologyDb {
    async fn range_lookup(
        &self,
        _ctx: &CancellationToken,
        meta_key: &[u8],
        max_ranges: u32,
        use_reverse_scan: bool,
    ) -> Result<(Vec<RangeDescriptor>, Vec<RangeDescriptor>), RoutingError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let user_key = &meta_key[1..];
        let topology = self.topology.lock().expect("topology lock");
        let found = topology.iter().position(|d| {
            if use_reverse_scan {
                d.contains_exclusive_end(user_key)
            } else {
                d.contains_key(user_key)
            }
        });
        match found {
            Some(pos) => {
                let prefetched: Vec<RangeDescriptor> = if use_reverse_scan {
                    Vec::new()
                } else {
                    topology
                        .iter()
                        .skip(pos + 1)
                        .take(max_ranges.saturating_sub(1) as usize)
                        .cloned()
                        .collect()
                };
                Ok((vec![topology[pos].clone()], prefetched))
            }
            None => Ok((Vec::new(), Vec::new())),
        }
    }

    fn first_range(&self) -> Result<RangeDescriptor, RoutingError> {
        let topology = self.topology.lock().expect("topology lock");
        topology
            .iter()
            .find(|d| d.span.start.is_empty())
            .cloned()
            .ok_or_else(|| RoutingError::new(ErrorDetail::FirstRangeMissing))
    }
}

/// A router wired to an in-memory cluster.
pub struct TestCluster {
    pub gossip: Arc<MemGossip>,
    pub topology: Arc<Mutex<Vec<RangeDescriptor>>>,
    pub client: Arc<ScriptedClient>,
    pub stopper: Arc<Stopper>,
    pub db: Option<Arc<TopologyDb>>,
    use_meta_path: bool,
}

impl TestCluster {
    /// Cluster whose descriptor lookups go straight to the topology map.
    pub fn new(ranges: Vec<RangeDescriptor>, handler: Handler) -> Self {
        Self::build(Arc::new(Mutex::new(ranges)), handler, false)
    }

    /// Cluster whose replicas evaluate batches against a shared
    /// [`FakeStore`].
    pub fn with_store(ranges: Vec<RangeDescriptor>) -> (Self, Arc<FakeStore>) {
        let topology = Arc::new(Mutex::new(ranges));
        let store = Arc::new(FakeStore::new(topology.clone()));
        let cluster = Self::build(topology, store_handler(&store), false);
        (cluster, store)
    }

    /// Like [`TestCluster::with_store`], but descriptor lookups run the
    /// full meta-index RPC path instead of a flat source.
    pub fn with_store_meta_path(ranges: Vec<RangeDescriptor>) -> (Self, Arc<FakeStore>) {
        let topology = Arc::new(Mutex::new(ranges));
        let store = Arc::new(FakeStore::new(topology.clone()));
        let cluster = Self::build(topology, store_handler(&store), true);
        (cluster, store)
    }

    fn build(
        topology: Arc<Mutex<Vec<RangeDescriptor>>>,
        handler: Handler,
        use_meta_path: bool,
    ) -> Self {
        let ranges = topology.lock().expect("topology lock").clone();
        let gossip = Arc::new(MemGossip::new(LOCAL_NODE_ID));
        for desc in &ranges {
            for rep in &desc.replicas {
                gossip.set_node_descriptor(&NodeDescriptor {
                    node_id: rep.node_id,
                    attrs: Vec::new(),
                    address: format!("127.0.0.1:{}", 26000 + rep.node_id),
                });
            }
        }
        if use_meta_path {
            if let Some(first) = ranges.iter().find(|d| d.span.start.is_empty()) {
                gossip.set_first_range_descriptor(first);
            }
        }

        let db = if use_meta_path {
            None
        } else {
            Some(Arc::new(TopologyDb {
                topology: topology.clone(),
                lookups: AtomicUsize::new(0),
            }))
        };

        Self {
            gossip,
            topology,
            client: Arc::new(ScriptedClient::new(handler)),
            stopper: Arc::new(Stopper::new()),
            db,
            use_meta_path,
        }
    }

    pub fn db_lookups(&self) -> usize {
        self.db
            .as_ref()
            .map(|db| db.lookups.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn sender(&self) -> DistSender {
        self.sender_with(|_| {})
    }

    pub fn sender_with(&self, tweak: impl FnOnce(&mut DistSenderConfig)) -> DistSender {
        let factory = Arc::new(ClientTransportFactory::new(self.client.clone()));
        let mut cfg = DistSenderConfig::new(Arc::new(Clock::system()), factory);
        cfg.rpc_retry_options = Some(RetryOptions {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            max_retries: 0,
            closer: None,
        });
        cfg.stopper = Some(self.stopper.clone());
        if !self.use_meta_path {
            cfg.range_descriptor_db = self
                .db
                .as_ref()
                .map(|db| db.clone() as Arc<dyn RangeDescriptorDB>);
        }
        tweak(&mut cfg);
        DistSender::new(cfg, self.gossip.clone())
    }
}

/// Handler that evaluates every batch against `store`.
pub fn store_handler(store: &Arc<FakeStore>) -> Handler {
    let store = store.clone();
    Box::new(move |_replica, ba| Ok(store.serve(ba)))
}

/// Extract scan rows from a response, whichever scan direction produced it.
pub fn scan_rows(resp: &Response) -> Vec<KeyValue> {
    match resp {
        Response::Scan { rows, .. } | Response::ReverseScan { rows, .. } => rows.clone(),
        other => panic!("expected a scan response, got {other:?}"),
    }
}
