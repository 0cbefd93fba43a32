//! Batch requests, responses, and the transaction record.
//!
//! A batch is an ordered list of key-addressed operations sharing one
//! header. The router splits batches along range boundaries and recombines
//! the partial responses so that `responses[i]` always answers
//! `requests[i]` of the original batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::{NodeId, RangeId, RangeDescriptor};
use crate::error::RoutingError;
use crate::hlc::Timestamp;
use crate::keys::KeySpan;

/// Transaction identity: the originating node plus a per-node counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId {
    pub node_id: NodeId,
    pub counter: u64,
}

/// The client-side transaction record threaded through batches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub timestamp: Timestamp,
    pub orig_timestamp: Timestamp,
    /// Per-node clock readings observed by this transaction, used to bound
    /// uncertainty on those nodes.
    pub observed_timestamps: BTreeMap<NodeId, Timestamp>,
    pub writing: bool,
}

impl Transaction {
    /// Record the clock reading observed on `node_id` if none is known yet.
    pub fn update_observed_timestamp(&mut self, node_id: NodeId, ts: Timestamp) {
        self.observed_timestamps.entry(node_id).or_insert(ts);
    }

    /// Fold a newer version of the same transaction record into `self`.
    pub fn update(&mut self, other: &Transaction) {
        self.timestamp.forward(other.timestamp);
        self.writing |= other.writing;
        for (node_id, ts) in &other.observed_timestamps {
            self.update_observed_timestamp(*node_id, *ts);
        }
    }
}

/// Read-consistency level for a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    #[default]
    Consistent,
    Inconsistent,
}

/// Header shared by every request in a batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub txn: Option<Transaction>,
    pub read_consistency: ReadConsistency,
    pub timestamp: Timestamp,
    /// Node through which the request entered the cluster. 0 = unset.
    pub gateway_node_id: NodeId,
    /// Upper bound on keys returned across all range-typed requests in the
    /// batch. 0 = unlimited.
    pub max_span_request_keys: u64,
    /// Bumped once per range addressed (not per RPC attempt), so replays of
    /// an earlier address attempt can be rejected server-side.
    pub sequence: u64,
    /// Range the batch is addressed to; stamped immediately before an RPC.
    pub range_id: RangeId,
}

const IS_READ: u32 = 1;
const IS_WRITE: u32 = 1 << 1;
const IS_TXN: u32 = 1 << 2;
const IS_RANGE: u32 = 1 << 3;
const IS_REVERSE: u32 = 1 << 4;
const IS_ALONE: u32 = 1 << 5;

/// One key-addressed operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get { span: KeySpan },
    Put { span: KeySpan, value: Vec<u8> },
    Delete { span: KeySpan },
    Scan { span: KeySpan },
    ReverseScan { span: KeySpan },
    DeleteRange { span: KeySpan },
    BeginTransaction { span: KeySpan },
    EndTransaction { span: KeySpan, commit: bool },
    RangeLookup { span: KeySpan, max_ranges: u32, reverse: bool },
}

impl Request {
    pub fn span(&self) -> &KeySpan {
        match self {
            Request::Get { span }
            | Request::Put { span, .. }
            | Request::Delete { span }
            | Request::Scan { span }
            | Request::ReverseScan { span }
            | Request::DeleteRange { span }
            | Request::BeginTransaction { span }
            | Request::EndTransaction { span, .. }
            | Request::RangeLookup { span, .. } => span,
        }
    }

    pub fn set_span(&mut self, new: KeySpan) {
        match self {
            Request::Get { span }
            | Request::Put { span, .. }
            | Request::Delete { span }
            | Request::Scan { span }
            | Request::ReverseScan { span }
            | Request::DeleteRange { span }
            | Request::BeginTransaction { span }
            | Request::EndTransaction { span, .. }
            | Request::RangeLookup { span, .. } => *span = new,
        }
    }

    fn flags(&self) -> u32 {
        match self {
            Request::Get { .. } => IS_READ | IS_TXN,
            Request::Put { .. } => IS_WRITE | IS_TXN,
            Request::Delete { .. } => IS_WRITE | IS_TXN,
            Request::Scan { .. } => IS_READ | IS_RANGE | IS_TXN,
            Request::ReverseScan { .. } => IS_READ | IS_RANGE | IS_TXN | IS_REVERSE,
            Request::DeleteRange { .. } => IS_WRITE | IS_RANGE | IS_TXN,
            Request::BeginTransaction { .. } => IS_WRITE | IS_TXN,
            Request::EndTransaction { .. } => IS_WRITE | IS_TXN | IS_ALONE,
            Request::RangeLookup { .. } => IS_READ | IS_RANGE,
        }
    }

    /// True for requests that operate on a span of keys rather than a point
    /// and may carry a resume span in their response.
    pub fn is_range(&self) -> bool {
        self.flags() & IS_RANGE != 0
    }

    pub fn method(&self) -> &'static str {
        match self {
            Request::Get { .. } => "Get",
            Request::Put { .. } => "Put",
            Request::Delete { .. } => "Delete",
            Request::Scan { .. } => "Scan",
            Request::ReverseScan { .. } => "ReverseScan",
            Request::DeleteRange { .. } => "DeleteRange",
            Request::BeginTransaction { .. } => "BeginTransaction",
            Request::EndTransaction { .. } => "EndTransaction",
            Request::RangeLookup { .. } => "RangeLookup",
        }
    }
}

/// One key/value row returned by a scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Header shared by every response kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Number of keys this response touched; counted against the batch-wide
    /// key limit.
    pub num_keys: u64,
    /// The unprocessed suffix of the request's span, set when the request
    /// was cut short by a key limit.
    pub resume_span: Option<KeySpan>,
}

/// Response to one [`Request`], positionally aligned with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get {
        header: ResponseHeader,
        value: Option<Vec<u8>>,
    },
    Put {
        header: ResponseHeader,
    },
    Delete {
        header: ResponseHeader,
    },
    Scan {
        header: ResponseHeader,
        rows: Vec<KeyValue>,
    },
    ReverseScan {
        header: ResponseHeader,
        rows: Vec<KeyValue>,
    },
    DeleteRange {
        header: ResponseHeader,
    },
    BeginTransaction {
        header: ResponseHeader,
    },
    EndTransaction {
        header: ResponseHeader,
        committed: bool,
    },
    RangeLookup {
        header: ResponseHeader,
        ranges: Vec<RangeDescriptor>,
        prefetched: Vec<RangeDescriptor>,
    },
}

impl Response {
    pub fn header(&self) -> &ResponseHeader {
        match self {
            Response::Get { header, .. }
            | Response::Put { header }
            | Response::Delete { header }
            | Response::Scan { header, .. }
            | Response::ReverseScan { header, .. }
            | Response::DeleteRange { header }
            | Response::BeginTransaction { header }
            | Response::EndTransaction { header, .. }
            | Response::RangeLookup { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut ResponseHeader {
        match self {
            Response::Get { header, .. }
            | Response::Put { header }
            | Response::Delete { header }
            | Response::Scan { header, .. }
            | Response::ReverseScan { header, .. }
            | Response::DeleteRange { header }
            | Response::BeginTransaction { header }
            | Response::EndTransaction { header, .. }
            | Response::RangeLookup { header, .. } => header,
        }
    }

    /// Merge the response from the next range along a request's span into
    /// the one accumulated so far. Only range-typed responses of the same
    /// kind combine; a point request never receives two responses.
    pub fn combine(&mut self, other: Response) -> Result<(), RoutingError> {
        match (self, other) {
            (
                Response::Scan { header, rows },
                Response::Scan {
                    header: other_header,
                    rows: other_rows,
                },
            )
            | (
                Response::ReverseScan { header, rows },
                Response::ReverseScan {
                    header: other_header,
                    rows: other_rows,
                },
            ) => {
                rows.extend(other_rows);
                header.num_keys += other_header.num_keys;
                merge_resume_spans(&mut header.resume_span, other_header.resume_span);
                Ok(())
            }
            (
                Response::DeleteRange { header },
                Response::DeleteRange {
                    header: other_header,
                },
            ) => {
                header.num_keys += other_header.num_keys;
                merge_resume_spans(&mut header.resume_span, other_header.resume_span);
                Ok(())
            }
            (
                Response::RangeLookup {
                    header,
                    ranges,
                    prefetched,
                },
                Response::RangeLookup {
                    header: other_header,
                    ranges: other_ranges,
                    prefetched: other_prefetched,
                },
            ) => {
                ranges.extend(other_ranges);
                prefetched.extend(other_prefetched);
                header.num_keys += other_header.num_keys;
                Ok(())
            }
            _ => Err(RoutingError::from_msg(
                "cannot combine responses of mismatched or non-range kinds",
            )),
        }
    }

    /// A trivial zero-value response matching the kind of `req`. Used to
    /// fill positions the router skipped once a key limit was exhausted.
    pub fn empty_for(req: &Request) -> Response {
        let header = ResponseHeader::default();
        match req {
            Request::Get { .. } => Response::Get {
                header,
                value: None,
            },
            Request::Put { .. } => Response::Put { header },
            Request::Delete { .. } => Response::Delete { header },
            Request::Scan { .. } => Response::Scan {
                header,
                rows: Vec::new(),
            },
            Request::ReverseScan { .. } => Response::ReverseScan {
                header,
                rows: Vec::new(),
            },
            Request::DeleteRange { .. } => Response::DeleteRange { header },
            Request::BeginTransaction { .. } => Response::BeginTransaction { header },
            Request::EndTransaction { .. } => Response::EndTransaction {
                header,
                committed: false,
            },
            Request::RangeLookup { .. } => Response::RangeLookup {
                header,
                ranges: Vec::new(),
                prefetched: Vec::new(),
            },
        }
    }
}

fn merge_resume_spans(existing: &mut Option<KeySpan>, other: Option<KeySpan>) {
    match (existing.as_mut(), other) {
        (Some(span), Some(other)) => {
            if other.start < span.start {
                span.start = other.start;
            }
            if other.end > span.end {
                span.end = other.end;
            }
        }
        (None, Some(other)) => *existing = Some(other),
        _ => {}
    }
}

/// A batch of requests sharing one header.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub header: BatchHeader,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn add(&mut self, req: Request) {
        self.requests.push(req);
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.requests.iter().any(|r| r.flags() & flag != 0)
    }

    /// True when the batch contains a reverse-direction request.
    pub fn is_reverse(&self) -> bool {
        self.has_flag(IS_REVERSE)
    }

    /// True when no request in the batch mutates state.
    pub fn is_read_only(&self) -> bool {
        !self.has_flag(IS_WRITE)
    }

    /// True when the batch contains a request that can run inside a
    /// transaction.
    pub fn is_possible_transaction(&self) -> bool {
        self.has_flag(IS_TXN)
    }

    /// The EndTransaction request in the batch, if any.
    pub fn end_transaction(&self) -> Option<(&KeySpan, bool)> {
        self.requests.iter().find_map(|r| match r {
            Request::EndTransaction { span, commit } => Some((span, *commit)),
            _ => None,
        })
    }

    /// Bump the sequence counter. Called once per range addressed so the
    /// server-side replay detector can tell a fresh address attempt from a
    /// replica-level retry of the same one.
    pub fn set_new_request(&mut self) {
        self.header.sequence += 1;
    }

    /// Fold a transaction record from a reply into the batch header.
    pub fn update_txn(&mut self, other: Option<&Transaction>) {
        if let (Some(txn), Some(other)) = (self.header.txn.as_mut(), other) {
            txn.update(other);
        }
    }

    /// The minimal key span encompassing every request in the batch.
    pub fn span(&self) -> Result<KeySpan, RoutingError> {
        let mut iter = self.requests.iter();
        let Some(first) = iter.next() else {
            return Err(RoutingError::from_msg("cannot compute span of empty batch"));
        };
        let mut out = first.span().clone();
        for req in iter {
            let span = req.span();
            if span.start < out.start {
                out.start = span.start.clone();
            }
            if span.end > out.end {
                out.end = span.end.clone();
            }
        }
        Ok(out)
    }

    /// Split the request list into parts that may be dispatched together,
    /// preserving order. Writes and reads are separated, as are forward and
    /// reverse requests; when `can_split_end_txn` is set, an EndTransaction
    /// is isolated into its own part.
    pub fn split(&self, can_split_end_txn: bool) -> Vec<Vec<Request>> {
        fn compatible(existing: u32, new: u32) -> bool {
            if existing & IS_ALONE != 0 || new & IS_ALONE != 0 {
                return false;
            }
            let mask = IS_WRITE | IS_REVERSE;
            existing & mask == new & mask
        }

        let mut parts = Vec::new();
        let mut rest = self.requests.as_slice();
        while !rest.is_empty() {
            let mut group_flags: Option<u32> = None;
            let mut cut = rest.len();
            for (i, req) in rest.iter().enumerate() {
                let mut flags = req.flags();
                if !can_split_end_txn && matches!(req, Request::EndTransaction { .. }) {
                    flags &= !IS_ALONE;
                }
                match group_flags {
                    None => group_flags = Some(flags),
                    Some(existing) => {
                        if !compatible(existing, flags) {
                            cut = i;
                            break;
                        }
                        group_flags = Some(existing | flags);
                    }
                }
            }
            parts.push(rest[..cut].to_vec());
            rest = &rest[cut..];
        }
        parts
    }

    /// Short human-readable summary for logging.
    pub fn summary(&self) -> String {
        let methods: Vec<&str> = self.requests.iter().map(|r| r.method()).collect();
        format!("[{}]", methods.join(" "))
    }
}

/// A combined response to a batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Updated transaction record, when the batch ran inside one.
    pub txn: Option<Transaction>,
    /// The responding node's clock reading, folded into the local clock.
    pub now: Timestamp,
    /// Trace annotations collected while serving the batch.
    pub collected_spans: Vec<String>,
    /// Application-level error. Scrubbed out of successful replies by the
    /// router before they are returned.
    pub error: Option<RoutingError>,
    pub responses: Vec<Response>,
}

impl BatchResponse {
    pub fn update_txn(&mut self, other: Option<&Transaction>) {
        match (self.txn.as_mut(), other) {
            (Some(txn), Some(other)) => txn.update(other),
            (None, Some(other)) => self.txn = Some(other.clone()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(key: &[u8]) -> Request {
        Request::Get {
            span: KeySpan::point(key.to_vec()),
        }
    }

    fn put(key: &[u8]) -> Request {
        Request::Put {
            span: KeySpan::point(key.to_vec()),
            value: b"v".to_vec(),
        }
    }

    fn scan(start: &[u8], end: &[u8]) -> Request {
        Request::Scan {
            span: KeySpan::new(start.to_vec(), end.to_vec()),
        }
    }

    fn end_txn(commit: bool) -> Request {
        Request::EndTransaction {
            span: KeySpan::point(b"a".to_vec()),
            commit,
        }
    }

    fn batch_of(requests: Vec<Request>) -> BatchRequest {
        BatchRequest {
            header: BatchHeader::default(),
            requests,
        }
    }

    #[test]
    fn split_separates_reads_from_writes() {
        let ba = batch_of(vec![get(b"a"), get(b"b"), put(b"c"), put(b"d"), get(b"e")]);
        let parts = ba.split(false);
        let sizes: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn split_keeps_end_txn_attached_unless_asked() {
        let ba = batch_of(vec![put(b"a"), end_txn(true)]);
        assert_eq!(ba.split(false).len(), 1);
        let parts = ba.split(true);
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[1][0], Request::EndTransaction { .. }));
    }

    #[test]
    fn split_separates_reverse_from_forward_scans() {
        let ba = batch_of(vec![
            scan(b"a", b"c"),
            Request::ReverseScan {
                span: KeySpan::new(b"c".to_vec(), b"e".to_vec()),
            },
        ]);
        assert_eq!(ba.split(false).len(), 2);
    }

    #[test]
    fn bounding_span_covers_all_requests() {
        let ba = batch_of(vec![scan(b"f", b"m"), get(b"b"), scan(b"k", b"q")]);
        let span = ba.span().expect("non-empty batch");
        assert_eq!(span.start, b"b".to_vec());
        assert_eq!(span.end, b"q".to_vec());
    }

    #[test]
    fn update_txn_threads_replies_forward() {
        let mut ba = batch_of(vec![put(b"a")]);
        ba.header.txn = Some(Transaction {
            timestamp: Timestamp {
                wall_time: 1,
                logical: 0,
            },
            ..Transaction::default()
        });
        let newer = Transaction {
            timestamp: Timestamp {
                wall_time: 9,
                logical: 0,
            },
            writing: true,
            ..Transaction::default()
        };
        ba.update_txn(Some(&newer));
        let txn = ba.header.txn.expect("txn present");
        assert_eq!(txn.timestamp.wall_time, 9);
        assert!(txn.writing);
    }

    #[test]
    fn scan_responses_combine_across_ranges() {
        let row = |key: &[u8]| KeyValue {
            key: key.to_vec(),
            value: b"v".to_vec(),
        };
        let mut left = Response::Scan {
            header: ResponseHeader {
                num_keys: 2,
                resume_span: None,
            },
            rows: vec![row(b"a"), row(b"b")],
        };
        let right = Response::Scan {
            header: ResponseHeader {
                num_keys: 1,
                resume_span: Some(KeySpan::new(b"n".to_vec(), b"z".to_vec())),
            },
            rows: vec![row(b"m")],
        };
        left.combine(right).expect("scans combine");
        let Response::Scan { header, rows } = left else {
            panic!("combine changed the response kind");
        };
        assert_eq!(header.num_keys, 3);
        assert_eq!(
            header.resume_span,
            Some(KeySpan::new(b"n".to_vec(), b"z".to_vec()))
        );
        let keys: Vec<&[u8]> = rows.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"m"]);
    }

    #[test]
    fn point_responses_refuse_to_combine() {
        let mut first = Response::Get {
            header: ResponseHeader::default(),
            value: None,
        };
        let second = Response::Get {
            header: ResponseHeader::default(),
            value: None,
        };
        assert!(first.combine(second).is_err());
    }

    #[test]
    fn sequence_bumps_once_per_address_attempt() {
        let mut ba = batch_of(vec![get(b"a")]);
        ba.set_new_request();
        ba.set_new_request();
        assert_eq!(ba.header.sequence, 2);
    }
}
