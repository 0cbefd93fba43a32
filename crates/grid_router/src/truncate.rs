//! Batch truncation against range boundaries.
//!
//! Before a batch is sent to one range it is clipped to that range's span:
//! request spans are intersected with the range and requests falling wholly
//! outside are dropped. The original position of each kept request is
//! recorded so the partial response can be folded back into the right slots
//! of the combined response.

use crate::batch::{BatchRequest, Response};
use crate::keys::{Key, KeySpan, KEY_MAX, KEY_MIN};

/// Clip `ba` to the span `rs`.
///
/// Returns the truncated batch plus, for each kept request, its index in the
/// original batch. The returned positions always index into the caller's
/// batch, no matter how deeply truncation nests.
pub fn truncate(ba: &BatchRequest, rs: &KeySpan) -> (BatchRequest, Vec<usize>) {
    let mut truncated = BatchRequest {
        header: ba.header.clone(),
        requests: Vec::with_capacity(ba.requests.len()),
    };
    let mut positions = Vec::with_capacity(ba.requests.len());
    for (pos, req) in ba.requests.iter().enumerate() {
        let Some(clipped) = req.span().intersect(rs) else {
            continue;
        };
        let mut kept = req.clone();
        kept.set_span(clipped);
        truncated.requests.push(kept);
        positions.push(pos);
    }
    (truncated, positions)
}

/// The smallest key >= `k` covered by any request in the batch, or the
/// maximum key when the batch has nothing at or above `k`. Accounts for
/// sparse batches: a span that straddles `k` keeps the frontier at `k`.
pub fn next_seek_key(ba: &BatchRequest, k: &[u8]) -> Key {
    let mut candidate: Option<Key> = None;
    for req in &ba.requests {
        let span = req.span();
        if span.start.as_slice() >= k {
            match &candidate {
                Some(best) if span.start >= *best => {}
                _ => candidate = Some(span.start.clone()),
            }
        } else if span.end.as_slice() > k {
            return k.to_vec();
        }
    }
    candidate.unwrap_or_else(|| KEY_MAX.to_vec())
}

/// The largest key <= `k` covered by any request in the batch, or the
/// minimum key when the batch has nothing at or below `k`.
pub fn prev_seek_key(ba: &BatchRequest, k: &[u8]) -> Key {
    let mut candidate: Option<Key> = None;
    for req in &ba.requests {
        let span = req.span();
        if span.end.as_slice() <= k {
            match &candidate {
                Some(best) if span.end <= *best => {}
                _ => candidate = Some(span.end.clone()),
            }
        } else if span.start.as_slice() < k {
            return k.to_vec();
        }
    }
    candidate.unwrap_or_else(|| KEY_MIN.to_vec())
}

/// Populate response slots the router never filled because a key limit was
/// exhausted, and stamp resume spans describing the unprocessed remainder.
///
/// `next_key` is the frontier the router had reached when it stopped:
/// everything at or beyond it (in the direction of travel) is unprocessed.
/// Resume spans produced by a server are also clipped back to the original
/// request's boundaries, which the server only saw in truncated form.
pub fn fill_skipped_responses(
    ba: &BatchRequest,
    slots: &mut [Option<Response>],
    next_key: &[u8],
    is_reverse: bool,
) {
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(Response::empty_for(&ba.requests[i]));
        }
    }

    for (req, slot) in ba.requests.iter().zip(slots.iter_mut()) {
        if !req.is_range() {
            continue;
        }
        let Some(resp) = slot.as_mut() else { continue };
        let header = resp.header_mut();
        let orig = req.span();
        if is_reverse {
            match &mut header.resume_span {
                Some(resume) => {
                    // The server may have clamped the resume start to its
                    // range boundary; restore the request's own start.
                    resume.start = orig.start.clone();
                }
                None if orig.start.as_slice() < next_key => {
                    let mut resume = orig.clone();
                    if next_key < orig.end.as_slice() {
                        resume.end = next_key.to_vec();
                    }
                    header.resume_span = Some(resume);
                }
                None => {}
            }
        } else {
            match &mut header.resume_span {
                Some(resume) => {
                    resume.end = orig.end.clone();
                }
                None if next_key < orig.end.as_slice() => {
                    let mut resume = orig.clone();
                    if orig.start.as_slice() < next_key {
                        resume.start = next_key.to_vec();
                    }
                    header.resume_span = Some(resume);
                }
                None => {}
            }
        }
    }
}
