//! The distributed request router.
//!
//! `DistSender` accepts logical batches addressed by key, resolves the
//! ranges that own those keys, splits the batch along range boundaries,
//! picks a replica of each range to contact, and recombines the partial
//! responses into one reply whose entries line up positionally with the
//! original requests.
//!
//! Failures are handled at the narrowest scope that can absorb them:
//! replica-local errors rotate to the next replica, stale-descriptor errors
//! evict routing metadata and re-resolve, and everything else surfaces to
//! the caller unchanged.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::batch::{
    BatchRequest, BatchResponse, ReadConsistency, Request, Response, Transaction,
};
use crate::descriptor::{NodeDescriptor, RangeDescriptor, RangeId, ReplicaDescriptor, ReplicaSet};
use crate::error::{ErrorDetail, RoutingError};
use crate::gossip::{self, Gossip, KEY_FIRST_RANGE_DESCRIPTOR};
use crate::hlc::{Clock, Timestamp};
use crate::keys::{KeySpan, KEY_MIN};
use crate::leaseholder_cache::LeaseHolderCache;
use crate::metrics::{DistSenderMetrics, MetricsSnapshot, SlowRequestGuard};
use crate::range_cache::{EvictionToken, RangeDescriptorCache, RangeDescriptorDB};
use crate::range_iter::{RangeIterator, ScanDirection};
use crate::retry::{Retry, RetryOptions};
use crate::stopper::Stopper;
use crate::transport::{SendOptions, Transport, TransportError, TransportFactory};
use crate::truncate::{fill_skipped_responses, next_seek_key, prev_seek_key, truncate};

/// Default number of descriptors prefetched per meta-index lookup.
pub const DEFAULT_RANGE_LOOKUP_MAX_RANGES: u32 = 8;
/// Default capacity of the lease-holder cache.
pub const DEFAULT_LEASE_HOLDER_CACHE_SIZE: usize = 1 << 20;
/// Default capacity of the range descriptor cache.
pub const DEFAULT_RANGE_DESCRIPTOR_CACHE_SIZE: usize = 1 << 20;
/// Default number of concurrently dispatched partial batches.
pub const DEFAULT_SENDER_CONCURRENCY: usize = 500;
/// Default threshold past which a pending RPC counts as slow.
pub const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(60);

/// Configuration for [`DistSender::new`].
pub struct DistSenderConfig {
    pub clock: Arc<Clock>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub range_descriptor_cache_size: usize,
    pub lease_holder_cache_size: usize,
    /// How many descriptors a meta-index lookup prefetches into the cache.
    pub range_lookup_max_ranges: u32,
    /// Permits for parallel partial-batch dispatch, shared process-wide.
    pub sender_concurrency: usize,
    pub rpc_retry_options: Option<RetryOptions>,
    /// Local node descriptor override. Usually discovered via gossip.
    pub node_descriptor: Option<NodeDescriptor>,
    /// Routing metadata source override. Defaults to the router itself,
    /// which resolves descriptors by scanning the meta index.
    pub range_descriptor_db: Option<Arc<dyn RangeDescriptorDB>>,
    /// Required for parallel dispatch; without it every partial batch is
    /// sent synchronously.
    pub stopper: Option<Arc<Stopper>>,
    pub slow_request_threshold: Duration,
}

impl DistSenderConfig {
    pub fn new(clock: Arc<Clock>, transport_factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            clock,
            transport_factory,
            range_descriptor_cache_size: DEFAULT_RANGE_DESCRIPTOR_CACHE_SIZE,
            lease_holder_cache_size: DEFAULT_LEASE_HOLDER_CACHE_SIZE,
            range_lookup_max_ranges: DEFAULT_RANGE_LOOKUP_MAX_RANGES,
            sender_concurrency: DEFAULT_SENDER_CONCURRENCY,
            rpc_retry_options: None,
            node_descriptor: None,
            range_descriptor_db: None,
            stopper: None,
            slow_request_threshold: DEFAULT_SLOW_REQUEST_THRESHOLD,
        }
    }
}

pub(crate) struct SenderInner {
    clock: Arc<Clock>,
    gossip: Arc<dyn Gossip>,
    metrics: DistSenderMetrics,
    range_cache: RangeDescriptorCache,
    lease_holder_cache: LeaseHolderCache,
    transport_factory: Arc<dyn TransportFactory>,
    retry_options: RetryOptions,
    stopper: Option<Arc<Stopper>>,
    async_sender_sem: Arc<Semaphore>,
    /// Local node descriptor, populated opportunistically from gossip.
    node_descriptor: OnceLock<NodeDescriptor>,
    slow_request_threshold: Duration,
}

/// Routes batches of key-addressed operations across the ranges of the
/// cluster. Cheap to clone; clones share all caches and counters.
#[derive(Clone)]
pub struct DistSender {
    inner: Arc<SenderInner>,
}

/// Result of sending one truncated batch to one range: the reply plus the
/// positions its responses map back to in the caller's batch.
struct PartialResult {
    reply: Option<BatchResponse>,
    positions: Vec<usize>,
    err: Option<RoutingError>,
}

impl PartialResult {
    fn from_err(err: RoutingError) -> Self {
        Self {
            reply: None,
            positions: Vec::new(),
            err: Some(err),
        }
    }
}

/// A dispatched partial batch: already resolved, or still in flight on an
/// async task. Collected strictly in dispatch order, which equals range
/// order along the span, so recombination is positional regardless of RPC
/// completion order.
enum PendingResponse {
    Ready(PartialResult),
    Waiting(oneshot::Receiver<PartialResult>),
}

/// Closes the transport on every exit path.
struct TransportGuard {
    transport: Box<dyn Transport>,
}

impl Deref for TransportGuard {
    type Target = dyn Transport;
    fn deref(&self) -> &Self::Target {
        self.transport.as_ref()
    }
}

impl DerefMut for TransportGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport.as_mut()
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// Meta-index lookups route back through the sender itself: resolving a
/// meta key uses the cache one level up and a direct replica send, never
/// the batch splitter.
struct MetaLookupDb {
    sender: Weak<SenderInner>,
}

#[async_trait]
impl RangeDescriptorDB for MetaLookupDb {
    async fn range_lookup(
        &self,
        ctx: &CancellationToken,
        meta_key: &[u8],
        max_ranges: u32,
        use_reverse_scan: bool,
    ) -> Result<(Vec<RangeDescriptor>, Vec<RangeDescriptor>), RoutingError> {
        let Some(inner) = self.sender.upgrade() else {
            return Err(RoutingError::from_msg("router has shut down"));
        };
        let ds = DistSender { inner };
        let (desc, _) = ds
            .inner
            .range_cache
            .lookup(ctx, meta_key, None, use_reverse_scan)
            .await?;
        ds.range_lookup(ctx, meta_key, &desc, max_ranges, use_reverse_scan)
            .await
    }

    fn first_range(&self) -> Result<RangeDescriptor, RoutingError> {
        let Some(inner) = self.sender.upgrade() else {
            return Err(RoutingError::from_msg("router has shut down"));
        };
        gossip::first_range_descriptor(inner.gossip.as_ref())
            .ok_or_else(|| RoutingError::new(ErrorDetail::FirstRangeMissing))
    }
}

impl DistSender {
    pub fn new(cfg: DistSenderConfig, gossip_net: Arc<dyn Gossip>) -> Self {
        let mut retry_options = cfg.rpc_retry_options.unwrap_or_default();
        if retry_options.closer.is_none() {
            if let Some(stopper) = &cfg.stopper {
                retry_options.closer = Some(stopper.should_quiesce());
            }
        }

        let clock = cfg.clock;
        let transport_factory = cfg.transport_factory;
        let explicit_db = cfg.range_descriptor_db;
        let gossip_for_inner = gossip_net.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<SenderInner>| {
            let db = explicit_db.unwrap_or_else(|| {
                Arc::new(MetaLookupDb {
                    sender: weak.clone(),
                }) as Arc<dyn RangeDescriptorDB>
            });
            SenderInner {
                clock,
                gossip: gossip_for_inner,
                metrics: DistSenderMetrics::default(),
                range_cache: RangeDescriptorCache::new(
                    db,
                    cfg.range_descriptor_cache_size.max(1),
                    cfg.range_lookup_max_ranges.max(1),
                ),
                lease_holder_cache: LeaseHolderCache::new(cfg.lease_holder_cache_size.max(1)),
                transport_factory,
                retry_options,
                stopper: cfg.stopper,
                async_sender_sem: Arc::new(Semaphore::new(cfg.sender_concurrency.max(1))),
                node_descriptor: OnceLock::new(),
                slow_request_threshold: cfg.slow_request_threshold,
            }
        });
        if let Some(node_descriptor) = cfg.node_descriptor {
            let _ = inner.node_descriptor.set(node_descriptor);
        }

        // When gossip announces a new first range, the cached descriptor
        // for the minimum key is stale.
        let weak = Arc::downgrade(&inner);
        gossip_net.register_callback(
            KEY_FIRST_RANGE_DESCRIPTOR,
            Box::new(move |_, _| {
                if let Some(inner) = weak.upgrade() {
                    tracing::info!("gossiped first-range descriptor changed; evicting cache entry");
                    inner.range_cache.evict_cached_descriptor(KEY_MIN);
                }
            }),
        );

        Self { inner }
    }

    /// Counters describing the router's activity so far.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Partial batches the router has dispatched in parallel over its
    /// lifetime.
    pub fn parallel_send_count(&self) -> u64 {
        self.inner.metrics.async_sends.load(Ordering::Relaxed)
    }

    pub fn range_cache(&self) -> &RangeDescriptorCache {
        &self.inner.range_cache
    }

    pub fn lease_holder_cache(&self) -> &LeaseHolderCache {
        &self.inner.lease_holder_cache
    }

    pub(crate) fn retry_options(&self) -> &RetryOptions {
        &self.inner.retry_options
    }

    /// Number of ranges covering `span`.
    pub async fn count_ranges(
        &self,
        ctx: &CancellationToken,
        span: &KeySpan,
    ) -> Result<u64, RoutingError> {
        let mut count = 0u64;
        let mut ri = RangeIterator::new(self);
        ri.seek(ctx, &span.start, ScanDirection::Ascending).await;
        while ri.valid() {
            count += 1;
            if !ri.need_another(span) {
                break;
            }
            ri.next(ctx).await;
        }
        if let Some(err) = ri.error() {
            return Err(err.clone());
        }
        Ok(count)
    }

    /// The local node descriptor, fetched from gossip on first use. `None`
    /// while the node is still bootstrapping.
    fn get_node_descriptor(&self) -> Option<NodeDescriptor> {
        if let Some(desc) = self.inner.node_descriptor.get() {
            return Some(desc.clone());
        }
        let node_id = self.inner.gossip.node_id();
        if node_id > 0 {
            if let Some(desc) = gossip::node_descriptor(self.inner.gossip.as_ref(), node_id) {
                let _ = self.inner.node_descriptor.set(desc.clone());
                return Some(desc);
            }
        }
        tracing::info!(
            "unable to determine this node's attributes for replica selection; \
             node is most likely bootstrapping"
        );
        None
    }

    /// Scan the meta index held by `desc` for the descriptor(s) covering
    /// `meta_key`. Reads inconsistently: stale results cost an extra lookup
    /// later but are never incorrect. Bypasses the batch splitter entirely.
    async fn range_lookup(
        &self,
        ctx: &CancellationToken,
        meta_key: &[u8],
        desc: &RangeDescriptor,
        max_ranges: u32,
        use_reverse_scan: bool,
    ) -> Result<(Vec<RangeDescriptor>, Vec<RangeDescriptor>), RoutingError> {
        let mut ba = BatchRequest::default();
        ba.header.read_consistency = ReadConsistency::Inconsistent;
        ba.add(Request::RangeLookup {
            span: KeySpan::point(meta_key.to_vec()),
            max_ranges,
            reverse: use_reverse_scan,
        });

        // Any replica can serve an inconsistent meta scan; spread the load.
        let mut replicas = ReplicaSet::new(self.inner.gossip.as_ref(), desc);
        replicas.shuffle();

        let mut reply = self.send_rpc(ctx, desc.range_id, replicas, ba).await?;
        if let Some(err) = reply.error.take() {
            return Err(err);
        }
        match reply.responses.into_iter().next() {
            Some(Response::RangeLookup {
                ranges, prefetched, ..
            }) => Ok((ranges, prefetched)),
            _ => Err(RoutingError::from_msg("malformed range-lookup response")),
        }
    }

    /// Verify batch constraints and stamp header fields that depend on the
    /// local node: gateway id, clock timestamp for inconsistent reads, and
    /// the transaction's observed timestamp for this node.
    fn init_and_verify_batch(&self, ba: &mut BatchRequest) -> Result<(), RoutingError> {
        if ba.header.gateway_node_id == 0 {
            ba.header.gateway_node_id = self.inner.gossip.node_id();
        }

        if ba.header.read_consistency == ReadConsistency::Inconsistent
            && ba.header.timestamp.is_zero()
        {
            ba.header.timestamp = self.inner.clock.now();
        }

        if let Some(txn) = ba.header.txn.as_mut() {
            if txn.observed_timestamps.is_empty() {
                // The transaction's timestamp came off this node's clock, so
                // this node contributes no uncertainty.
                if let Some(node) = self.get_node_descriptor() {
                    let orig = txn.orig_timestamp;
                    txn.update_observed_timestamp(node.node_id, orig);
                }
            }
        }

        if ba.requests.is_empty() {
            return Err(RoutingError::new(ErrorDetail::EmptyBatch));
        }

        if ba.header.max_span_request_keys != 0 {
            let is_reverse = ba.is_reverse();
            for req in &ba.requests {
                match req {
                    Request::Scan { .. } | Request::DeleteRange { .. } => {
                        if is_reverse {
                            return Err(RoutingError::new(ErrorDetail::IllegalMixture));
                        }
                    }
                    Request::ReverseScan { .. }
                    | Request::BeginTransaction { .. }
                    | Request::EndTransaction { .. } => {}
                    _ => return Err(RoutingError::new(ErrorDetail::IllegalMixture)),
                }
            }
        }

        Ok(())
    }

    /// Route one batch and return the combined response.
    ///
    /// The batch is first split into parts that may not be dispatched
    /// together; each part may still span multiple ranges. Transaction
    /// updates from each part are threaded into the next, and the final
    /// response concatenates the per-part response vectors in order.
    pub async fn send(
        &self,
        ctx: &CancellationToken,
        mut ba: BatchRequest,
    ) -> Result<BatchResponse, RoutingError> {
        self.inner.metrics.batches.fetch_add(1, Ordering::Relaxed);

        self.init_and_verify_batch(&mut ba)?;

        let parts = ba.split(false);
        if parts.len() > 1 && ba.header.max_span_request_keys != 0 {
            // Verification only admits homogeneous scan batches alongside a
            // key limit; a multi-part split means the batch mixed kinds
            // whose responses cannot share one limit.
            return Err(RoutingError::new(ErrorDetail::IllegalMixture));
        }

        let mut queue: VecDeque<Vec<Request>> = parts.into();
        let mut chunks: Vec<BatchResponse> = Vec::new();
        while let Some(part) = queue.pop_front() {
            ba.requests = part;
            let rs = ba.span()?;
            match self
                .divide_and_send_batch_to_ranges(ctx, ba.clone(), rs, 0)
                .await
            {
                Err(err) if err.is_detail(&ErrorDetail::NoOnePhaseCommit) => {
                    // A one-round-trip commit turned out to span ranges:
                    // re-split with EndTransaction isolated and run both
                    // parts in order.
                    if !queue.is_empty() {
                        return Err(RoutingError::from_msg(
                            "EndTransaction was not in the final part of the batch",
                        ));
                    }
                    let resplit = ba.split(true);
                    if resplit.len() != 2 {
                        return Err(RoutingError::from_msg(
                            "re-split of a 1PC batch did not isolate EndTransaction",
                        ));
                    }
                    queue = resplit.into();
                }
                Err(err) => return Err(err),
                Ok(reply) => {
                    ba.update_txn(reply.txn.as_ref());
                    chunks.push(reply);
                }
            }
        }

        let Some(last) = chunks.last() else {
            return Err(RoutingError::from_msg("batch produced no response parts"));
        };
        let txn = last.txn.clone();
        let now = last.now;
        let mut responses = Vec::with_capacity(ba.requests.len());
        let mut collected_spans = Vec::new();
        for chunk in chunks {
            responses.extend(chunk.responses);
            collected_spans.extend(chunk.collected_spans);
        }
        Ok(BatchResponse {
            txn,
            now,
            collected_spans,
            error: None,
            responses,
        })
    }

    /// Send `ba` to every range covering `rs`, in the batch's direction,
    /// dispatching in parallel where eligible, and recombine the partial
    /// responses positionally.
    fn divide_and_send_batch_to_ranges<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        ba: BatchRequest,
        rs: KeySpan,
        batch_idx: usize,
    ) -> BoxFuture<'a, Result<BatchResponse, RoutingError>> {
        Box::pin(async move {
            let mut ba = ba;
            let mut rs = rs;
            let mut batch_idx = batch_idx;

            let total = ba.requests.len();
            let mut slots: Vec<Option<Response>> = vec![None; total];
            let mut pending: Vec<PendingResponse> = Vec::new();
            let mut could_have_skipped = false;

            let is_reverse = ba.is_reverse();
            let scan_dir = if is_reverse {
                ScanDirection::Descending
            } else {
                ScanDirection::Ascending
            };
            let mut seek_key = if is_reverse {
                rs.end.clone()
            } else {
                rs.start.clone()
            };

            let mut ri = RangeIterator::new(self);
            loop {
                ri.seek(ctx, &seek_key, scan_dir).await;
                if !ri.valid() {
                    let err = ri.error().cloned().unwrap_or_else(|| {
                        RoutingError::from_msg("range iterator became invalid without an error")
                    });
                    pending.push(PendingResponse::Ready(PartialResult::from_err(err)));
                    break;
                }
                let Some(desc) = ri.desc().cloned() else {
                    pending.push(PendingResponse::Ready(PartialResult::from_err(
                        RoutingError::from_msg("valid range iterator without a descriptor"),
                    )));
                    break;
                };
                let token = ri.token().cloned();

                // One sequence bump per range addressed, not per RPC, so a
                // server-side replay detector can reject a duplicate
                // delivery of this same address attempt.
                ba.set_new_request();

                if batch_idx == 0 && ri.need_another(&rs) {
                    // A multi-range operation that could be transactional
                    // needs either a transaction or inconsistent reads.
                    if ba.header.txn.is_none()
                        && ba.is_possible_transaction()
                        && ba.header.read_consistency != ReadConsistency::Inconsistent
                    {
                        pending.push(PendingResponse::Ready(PartialResult::from_err(
                            RoutingError::new(ErrorDetail::OpRequiresTxn),
                        )));
                        break;
                    }
                    // A trailing EndTransaction cannot commit in one phase
                    // across ranges; have the caller re-split.
                    if ba.requests.len() > 1
                        && matches!(ba.requests.last(), Some(Request::EndTransaction { .. }))
                    {
                        pending.push(PendingResponse::Ready(PartialResult::from_err(
                            RoutingError::new(ErrorDetail::NoOnePhaseCommit),
                        )));
                        break;
                    }
                }

                // Compute the next frontier from the *current* descriptor's
                // boundary. Using the next range's start key would rewind
                // into this range when that descriptor is stale across a
                // merge, scanning keys twice.
                let mut next_rs = rs.clone();
                match scan_dir {
                    ScanDirection::Descending => {
                        seek_key = prev_seek_key(&ba, &desc.span.start);
                        next_rs.end = seek_key.clone();
                    }
                    ScanDirection::Ascending => {
                        seek_key = next_seek_key(&ba, &desc.span.end);
                        next_rs.start = seek_key.clone();
                    }
                }

                let need_more = ri.need_another(&rs);
                let mut dispatched_async = false;
                if ba.header.max_span_request_keys == 0 && need_more {
                    // More ranges follow and no key limit constrains them:
                    // try to dispatch this one in parallel. The clone hands
                    // the task its own deep copy of the batch (transaction
                    // included), so siblings never observe each other's
                    // mutations.
                    let (tx, rx) = oneshot::channel();
                    if self.send_partial_batch_async(
                        ctx,
                        ba.clone(),
                        rs.clone(),
                        desc.clone(),
                        token.clone(),
                        batch_idx,
                        tx,
                    ) {
                        pending.push(PendingResponse::Waiting(rx));
                        dispatched_async = true;
                    }
                }

                if !dispatched_async {
                    let result = self
                        .send_partial_batch(ctx, &ba, &rs, desc, token, batch_idx)
                        .await;
                    let failed = result.err.is_some();
                    let reply_txn = result.reply.as_ref().and_then(|r| r.txn.clone());
                    let num_results: u64 = result
                        .reply
                        .as_ref()
                        .map(|r| r.responses.iter().map(|resp| resp.header().num_keys).sum())
                        .unwrap_or(0);
                    pending.push(PendingResponse::Ready(result));
                    if failed {
                        break;
                    }
                    ba.update_txn(reply_txn.as_ref());

                    if ba.header.max_span_request_keys > 0 {
                        if num_results > ba.header.max_span_request_keys {
                            pending.push(PendingResponse::Ready(PartialResult::from_err(
                                RoutingError::from_msg(format!(
                                    "received {num_results} results, limit was {}",
                                    ba.header.max_span_request_keys
                                )),
                            )));
                            break;
                        }
                        ba.header.max_span_request_keys -= num_results;
                        if ba.header.max_span_request_keys == 0 {
                            // Later requests will never run; their slots are
                            // filled with trivial responses after combining.
                            could_have_skipped = true;
                            break;
                        }
                    }
                }

                // Done when the current range covers the rest of the span,
                // or when the next span inverted, which legitimately
                // happens when re-invoked after a merge shrank the span.
                if !need_more || next_rs.start >= next_rs.end {
                    break;
                }
                batch_idx += 1;
                rs = next_rs;
            }

            // Collect in dispatch order. The first error wins; later ones
            // are discarded but their channels are still drained.
            let mut combined_txn: Option<Transaction> = None;
            let mut now = Timestamp::ZERO;
            let mut collected_spans: Vec<String> = Vec::new();
            let mut out_err: Option<RoutingError> = None;
            for entry in pending {
                let result = match entry {
                    PendingResponse::Ready(result) => result,
                    PendingResponse::Waiting(rx) => rx.await.unwrap_or_else(|_| {
                        PartialResult::from_err(RoutingError::from_msg(
                            "parallel partial batch was abandoned",
                        ))
                    }),
                };
                if let Some(err) = result.err {
                    if out_err.is_none() {
                        out_err = Some(err);
                    }
                    continue;
                }
                let Some(reply) = result.reply else {
                    if out_err.is_none() {
                        out_err = Some(RoutingError::from_msg(
                            "partial batch produced neither reply nor error",
                        ));
                    }
                    continue;
                };
                if reply.responses.len() != result.positions.len() {
                    if out_err.is_none() {
                        out_err = Some(RoutingError::from_msg(format!(
                            "partial reply has {} responses for {} positions",
                            reply.responses.len(),
                            result.positions.len()
                        )));
                    }
                    continue;
                }
                if let Some(txn) = &reply.txn {
                    match &mut combined_txn {
                        Some(existing) => existing.update(txn),
                        None => combined_txn = Some(txn.clone()),
                    }
                }
                now.forward(reply.now);
                collected_spans.extend(reply.collected_spans);
                for (resp, pos) in reply.responses.into_iter().zip(result.positions) {
                    match &mut slots[pos] {
                        Some(existing) => {
                            if let Err(err) = existing.combine(resp) {
                                if out_err.is_none() {
                                    out_err = Some(err);
                                }
                            }
                        }
                        None => slots[pos] = Some(resp),
                    }
                }
            }

            if let Some(mut err) = out_err {
                // Hand any transaction progress from sibling responses back
                // with the error so it isn't lost.
                if let Some(txn) = &combined_txn {
                    err.update_txn(txn);
                }
                return Err(err);
            }

            if could_have_skipped {
                fill_skipped_responses(&ba, &mut slots, &seek_key, is_reverse);
            }

            let mut responses = Vec::with_capacity(total);
            for slot in slots {
                match slot {
                    Some(resp) => responses.push(resp),
                    None => {
                        return Err(RoutingError::from_msg(
                            "combined response left a request position unfilled",
                        ))
                    }
                }
            }
            Ok(BatchResponse {
                txn: combined_txn,
                now,
                collected_spans,
                error: None,
                responses,
            })
        })
    }

    /// Dispatch a partial batch on a detached task if a concurrency permit
    /// is immediately available. Returns whether the dispatch happened.
    #[allow(clippy::too_many_arguments)]
    fn send_partial_batch_async(
        &self,
        ctx: &CancellationToken,
        ba: BatchRequest,
        rs: KeySpan,
        desc: RangeDescriptor,
        token: Option<EvictionToken>,
        batch_idx: usize,
        tx: oneshot::Sender<PartialResult>,
    ) -> bool {
        let Some(stopper) = self.inner.stopper.clone() else {
            return false;
        };
        let ds = self.clone();
        let ctx = ctx.clone();
        let sem = self.inner.async_sender_sem.clone();
        stopper.run_limited_async(&sem, async move {
            ds.inner.metrics.async_sends.fetch_add(1, Ordering::Relaxed);
            let result = ds
                .send_partial_batch(&ctx, &ba, &rs, desc, token, batch_idx)
                .await;
            let _ = tx.send(result);
        })
    }

    /// Truncate `ba` to the descriptor's span and send it there, retrying
    /// through replica failures and stale metadata. When the range turns
    /// out to have split, recurses back into the range router over the
    /// truncated batch.
    async fn send_partial_batch(
        &self,
        ctx: &CancellationToken,
        ba: &BatchRequest,
        rs: &KeySpan,
        desc: RangeDescriptor,
        token: Option<EvictionToken>,
        batch_idx: usize,
    ) -> PartialResult {
        if batch_idx == 1 {
            // First recursion level: retroactively account for the initial
            // partial batch as well.
            self.inner
                .metrics
                .partial_batches
                .fetch_add(2, Ordering::Relaxed);
        } else if batch_idx > 1 {
            self.inner
                .metrics
                .partial_batches
                .fetch_add(1, Ordering::Relaxed);
        }

        let is_reverse = ba.is_reverse();
        let Some(intersected) = rs.intersect(&desc.span) else {
            return PartialResult::from_err(RoutingError::from_msg(format!(
                "span {rs} does not overlap the descriptor {desc}"
            )));
        };
        let (trunc_ba, positions) = truncate(ba, &intersected);
        if positions.is_empty() {
            return PartialResult::from_err(RoutingError::from_msg(format!(
                "truncation to {intersected} resulted in an empty batch"
            )));
        }

        let mut desc = Some(desc);
        let mut token = token;
        let mut last_err: Option<RoutingError> = None;
        let mut retry = Retry::new(&self.inner.retry_options);
        while retry.next(ctx).await {
            // If the descriptor was cleared on a previous attempt,
            // re-resolve from the leading edge of the intersected span.
            let current = match &desc {
                Some(d) => d.clone(),
                None => {
                    let desc_key = if is_reverse {
                        intersected.end.as_slice()
                    } else {
                        intersected.start.as_slice()
                    };
                    match self
                        .inner
                        .range_cache
                        .lookup(ctx, desc_key, None, is_reverse)
                        .await
                    {
                        Ok((d, t)) => {
                            token = Some(t);
                            desc = Some(d.clone());
                            d
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "range descriptor re-lookup failed");
                            continue;
                        }
                    }
                }
            };

            let err = match self.send_single_range(ctx, trunc_ba.clone(), &current).await {
                Ok(reply) => {
                    return PartialResult {
                        reply: Some(reply),
                        positions,
                        err: None,
                    }
                }
                Err(err) => err,
            };
            tracing::debug!(batch = %trunc_ba.summary(), error = %err, "reply error");

            match err.detail.clone() {
                Some(ErrorDetail::Send) | Some(ErrorDetail::RangeNotFound { .. }) => {
                    // Every replica failed: either they're all down or the
                    // descriptor is stale. Evict and re-resolve after
                    // backoff.
                    tracing::debug!(desc = %current, "evicting range descriptor on send error");
                    if let Some(t) = &token {
                        t.evict();
                    }
                    desc = None;
                    last_err = Some(err);
                }
                Some(ErrorDetail::RangeKeyMismatch {
                    mismatched,
                    suggested,
                    ..
                }) => {
                    // The range no longer owns (all of) the span, most
                    // likely a split. Install the server's fresher
                    // descriptors as long as they make progress over the
                    // one we used.
                    let mut replacements = Vec::new();
                    if let Some(m) = mismatched {
                        if !m.same_span(&current) {
                            replacements.push(m);
                        }
                    }
                    if let Some(s) = suggested {
                        if !s.same_span(&current)
                            && includes_front_of_cur_span(is_reverse, &s, rs)
                        {
                            replacements.push(s);
                        }
                    }
                    if let Some(t) = &token {
                        t.evict_and_replace(replacements);
                    }
                    // Re-enumerate the ranges under the truncated batch so
                    // the recursion's responses still map onto `positions`.
                    tracing::debug!(error = %err, span = %intersected,
                        "likely split; resending batch to intersected span");
                    return match self
                        .divide_and_send_batch_to_ranges(
                            ctx,
                            trunc_ba.clone(),
                            intersected.clone(),
                            batch_idx,
                        )
                        .await
                    {
                        Ok(reply) => PartialResult {
                            reply: Some(reply),
                            positions,
                            err: None,
                        },
                        Err(err) => PartialResult {
                            reply: None,
                            positions,
                            err: Some(err),
                        },
                    };
                }
                _ => {
                    // Not replica- or metadata-local; surface unchanged.
                    return PartialResult {
                        reply: None,
                        positions,
                        err: Some(err),
                    };
                }
            }
        }

        // The retry loop gave up: shutdown, caller cancellation, or a
        // bounded envelope that ran dry without metadata progress.
        let err = self
            .retry_early_exit_error(ctx)
            .or(last_err)
            .unwrap_or_else(|| {
                RoutingError::from_msg("partial batch retry loop exited without an error")
            });
        PartialResult::from_err(err)
    }

    /// Why the retry loop stopped early, if an external signal did it.
    pub(crate) fn retry_early_exit_error(&self, ctx: &CancellationToken) -> Option<RoutingError> {
        if let Some(closer) = &self.inner.retry_options.closer {
            if closer.is_cancelled() {
                return Some(RoutingError::new(ErrorDetail::NodeUnavailable));
            }
        }
        if ctx.is_cancelled() {
            return Some(RoutingError::new(ErrorDetail::ContextCanceled));
        }
        None
    }

    /// Order the replicas of `desc` by preference and send to them. Feeds
    /// any timestamp in the reply into the local clock and untangles the
    /// application error from the reply.
    async fn send_single_range(
        &self,
        ctx: &CancellationToken,
        ba: BatchRequest,
        desc: &RangeDescriptor,
    ) -> Result<BatchResponse, RoutingError> {
        let mut replicas = ReplicaSet::new(self.inner.gossip.as_ref(), desc);
        replicas.optimize_order(self.get_node_descriptor().as_ref());

        // Requests that must reach the lease holder start there when a hint
        // is cached; inconsistent reads may be served by any replica.
        if !(ba.is_read_only() && ba.header.read_consistency == ReadConsistency::Inconsistent) {
            if let Some(lease_holder) = self.inner.lease_holder_cache.lookup(desc.range_id) {
                if let Some(i) = replicas.find_replica(lease_holder.store_id) {
                    replicas.move_to_front(i);
                }
            }
        }

        let mut reply = self.send_rpc(ctx, desc.range_id, replicas, ba).await?;

        // Fold the remote clock reading into ours before anything else can
        // observe the response.
        if let Some(err) = &reply.error {
            if !err.now.is_zero() {
                self.inner.clock.update(err.now);
            }
        } else if !reply.now.is_zero() {
            self.inner.clock.update(reply.now);
        }

        match reply.error.take() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    /// Send `ba` to the replicas in preference order. Outstanding sibling
    /// attempts are cancelled as soon as one response settles the call.
    async fn send_rpc(
        &self,
        ctx: &CancellationToken,
        range_id: RangeId,
        replicas: ReplicaSet,
        mut ba: BatchRequest,
    ) -> Result<BatchResponse, RoutingError> {
        if replicas.is_empty() {
            return Err(RoutingError::send_error(format!(
                "no replica node addresses available via gossip for r{range_id}"
            )));
        }
        ba.header.range_id = range_id;

        let rpc_ctx = ctx.child_token();
        let _cancel_outstanding = rpc_ctx.clone().drop_guard();
        self.send_to_replicas(&rpc_ctx, range_id, replicas, ba).await
    }

    /// Try replicas one at a time until a reply settles the send.
    ///
    /// Per-replica errors rotate to the next candidate; a NotLeaseHolder
    /// hint reorders the queue; any other application error propagates. A
    /// transport error seen after a commit was sent taints the outcome: if
    /// nothing succeeds afterwards the result is ambiguous, because the
    /// commit may have applied on the server.
    async fn send_to_replicas(
        &self,
        ctx: &CancellationToken,
        range_id: RangeId,
        replicas: ReplicaSet,
        ba: BatchRequest,
    ) -> Result<BatchResponse, RoutingError> {
        let replica_count = replicas.len();
        if replica_count < 1 {
            return Err(RoutingError::send_error(format!(
                "insufficient replicas ({replica_count}) to satisfy send request"
            )));
        }
        let have_commit = ba
            .end_transaction()
            .map(|(_, commit)| commit)
            .unwrap_or(false);

        let opts = SendOptions {
            slow_request_threshold: self.inner.slow_request_threshold,
        };
        let transport = self
            .inner
            .transport_factory
            .transport(opts, &replicas, &ba)
            .map_err(|err| {
                RoutingError::send_error(format!("transport construction failed: {err}"))
            })?;
        let mut transport = TransportGuard { transport };
        if transport.is_exhausted() {
            return Err(RoutingError::send_error(format!(
                "sending to all {replica_count} replicas failed"
            )));
        }

        let (done_tx, mut done_rx) = mpsc::channel(replica_count);
        let mut ambiguous: Option<TransportError> = None;

        tracing::trace!(range_id, batch = %ba.summary(),
            replica = ?transport.next_replica(), "sending batch");
        self.record_rpc_sent(transport.next_replica());
        transport.send_next(ctx, done_tx.clone());

        let slow_timer = tokio::time::sleep(self.inner.slow_request_threshold);
        tokio::pin!(slow_timer);
        let mut slow_guard: Option<SlowRequestGuard<'_>> = None;

        loop {
            tokio::select! {
                _ = &mut slow_timer, if slow_guard.is_none() => {
                    tracing::warn!(range_id, batch = %ba.summary(),
                        threshold = ?self.inner.slow_request_threshold,
                        "slow RPC to range; still waiting for a replica");
                    slow_guard = Some(SlowRequestGuard::new(&self.inner.metrics));
                }
                call = done_rx.recv() => {
                    let Some(call) = call else {
                        return Err(RoutingError::send_error("rpc completion channel closed"));
                    };
                    if let Some(err) = call.err {
                        // A connection error (other than a fail-fast refusal,
                        // which is guaranteed unsent) may have executed on
                        // the server. Once a commit rode along, no later
                        // failure may be reported as a clean error.
                        if have_commit && !err.is_fail_fast() {
                            ambiguous = Some(err.clone());
                        }
                        tracing::debug!(node_id = call.replica.node_id, error = %err, "rpc error");
                    } else if let Some(mut reply) = call.reply {
                        if reply.error.is_none() {
                            return Ok(reply);
                        }
                        let mut propagate = false;
                        let detail = reply.error.as_ref().and_then(|e| e.detail.clone());
                        match detail {
                            Some(ErrorDetail::StoreNotFound { .. })
                            | Some(ErrorDetail::NodeUnavailable) => {
                                // Unique to the reporting replica; the next
                                // one may well succeed.
                            }
                            Some(ErrorDetail::NotLeaseHolder { lease_holder, .. }) => {
                                self.inner
                                    .metrics
                                    .not_lease_holder_errors
                                    .fetch_add(1, Ordering::Relaxed);
                                if let Some(lease_holder) = lease_holder {
                                    self.inner
                                        .lease_holder_cache
                                        .update(range_id, lease_holder.clone());
                                    if replicas.find_replica(lease_holder.store_id).is_none() {
                                        // The hint names a replica outside
                                        // the descriptor we routed by, so
                                        // the descriptor itself is stale.
                                        reply.error = Some(RoutingError::new(
                                            ErrorDetail::RangeNotFound { range_id },
                                        ));
                                        propagate = true;
                                    } else {
                                        transport.move_to_front(&lease_holder);
                                    }
                                }
                            }
                            _ => propagate = true,
                        }
                        if propagate {
                            if let Some(cause) = ambiguous.take() {
                                return Err(RoutingError::ambiguous_result(format!(
                                    "error={cause}"
                                )));
                            }
                            return Ok(reply);
                        }
                        tracing::debug!(node_id = call.replica.node_id, error = ?reply.error,
                            "application error; trying next replica");
                    }

                    if transport.is_exhausted() {
                        if let Some(cause) = ambiguous.take() {
                            return Err(RoutingError::ambiguous_result(format!("error={cause}")));
                        }
                        return Err(RoutingError::send_error(format!(
                            "sending to all {replica_count} replicas failed"
                        )));
                    }
                    self.inner
                        .metrics
                        .next_replica_errors
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(range_id, replica = ?transport.next_replica(),
                        "trying next replica");
                    self.record_rpc_sent(transport.next_replica());
                    transport.send_next(ctx, done_tx.clone());
                }
            }
        }
    }

    fn record_rpc_sent(&self, replica: Option<ReplicaDescriptor>) {
        self.inner.metrics.rpc_sent.fetch_add(1, Ordering::Relaxed);
        let Some(replica) = replica else { return };
        let local_node = self
            .inner
            .node_descriptor
            .get()
            .map(|n| n.node_id)
            .unwrap_or_else(|| self.inner.gossip.node_id());
        if replica.node_id == local_node {
            self.inner
                .metrics
                .rpc_sent_local
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for DistSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistSender")
            .field("range_cache", &self.inner.range_cache)
            .field("lease_holder_cache", &self.inner.lease_holder_cache)
            .finish_non_exhaustive()
    }
}

/// Whether `desc` covers the leading edge of the remaining span in the
/// current direction of travel.
fn includes_front_of_cur_span(is_reverse: bool, desc: &RangeDescriptor, rs: &KeySpan) -> bool {
    if is_reverse {
        desc.contains_exclusive_end(&rs.end)
    } else {
        desc.contains_key(&rs.start)
    }
}
