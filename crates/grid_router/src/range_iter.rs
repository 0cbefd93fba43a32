//! Cursor over the ranges covering a key span.

use tokio_util::sync::CancellationToken;

use crate::descriptor::RangeDescriptor;
use crate::error::RoutingError;
use crate::keys::{Key, KeySpan};
use crate::range_cache::EvictionToken;
use crate::retry::Retry;
use crate::sender::DistSender;

/// Direction a span is traversed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Ascending,
    Descending,
}

/// Stateful cursor walking the ranges that cover a key span, in either
/// direction. Lookup failures are sticky: once `valid` turns false the
/// cause is available from `error`.
pub struct RangeIterator<'a> {
    ds: &'a DistSender,
    scan_dir: ScanDirection,
    key: Key,
    desc: Option<RangeDescriptor>,
    token: Option<EvictionToken>,
    err: Option<RoutingError>,
}

impl<'a> RangeIterator<'a> {
    pub fn new(ds: &'a DistSender) -> Self {
        Self {
            ds,
            scan_dir: ScanDirection::Ascending,
            key: Key::new(),
            desc: None,
            token: None,
            err: None,
        }
    }

    /// True while the cursor is positioned on a range.
    pub fn valid(&self) -> bool {
        self.err.is_none() && self.desc.is_some()
    }

    /// The sticky error that invalidated the cursor, if any.
    pub fn error(&self) -> Option<&RoutingError> {
        self.err.as_ref()
    }

    /// The descriptor the cursor is positioned on.
    ///
    /// Only meaningful while `valid()`; an invalid cursor has none.
    pub fn desc(&self) -> Option<&RangeDescriptor> {
        self.desc.as_ref()
    }

    /// Eviction token for the current descriptor.
    pub fn token(&self) -> Option<&EvictionToken> {
        self.token.as_ref()
    }

    /// The key the cursor last sought to.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// True when the current range does not already cover the rest of
    /// `span` in the direction of travel.
    pub fn need_another(&self, span: &KeySpan) -> bool {
        let Some(desc) = &self.desc else {
            return false;
        };
        match self.scan_dir {
            ScanDirection::Ascending => desc.span.end < span.end,
            ScanDirection::Descending => span.start < desc.span.start,
        }
    }

    /// Advance to the adjacent range in the direction of travel.
    pub async fn next(&mut self, ctx: &CancellationToken) {
        let Some(desc) = &self.desc else {
            self.err = Some(RoutingError::from_msg(
                "cannot advance an unpositioned range iterator",
            ));
            return;
        };
        let key = match self.scan_dir {
            ScanDirection::Ascending => desc.span.end.clone(),
            ScanDirection::Descending => desc.span.start.clone(),
        };
        let dir = self.scan_dir;
        self.seek(ctx, &key, dir).await;
    }

    /// Position the cursor on the range containing `key` (ascending) or the
    /// range whose span ends at `key` (descending).
    pub async fn seek(&mut self, ctx: &CancellationToken, key: &[u8], scan_dir: ScanDirection) {
        self.scan_dir = scan_dir;
        self.key = key.to_vec();
        self.desc = None;
        self.err = None;

        let use_reverse_scan = scan_dir == ScanDirection::Descending;
        let mut retry = Retry::new(self.ds.retry_options());
        while retry.next(ctx).await {
            let lookup = self
                .ds
                .range_cache()
                .lookup(ctx, key, self.token.as_ref(), use_reverse_scan)
                .await;
            let (desc, token) = match lookup {
                Ok(found) => found,
                Err(err) => {
                    tracing::debug!(error = %err, "range descriptor lookup failed");
                    self.err = Some(err);
                    return;
                }
            };

            // An inconsistently-read meta entry can lag behind a merge and
            // miss keys it claims to cover; evict it and look again.
            let covers = match scan_dir {
                ScanDirection::Ascending => desc.contains_key(key),
                ScanDirection::Descending => desc.contains_exclusive_end(key),
            };
            if !covers {
                tracing::debug!(%desc, key = ?String::from_utf8_lossy(key),
                    "discarding descriptor that does not cover seek key");
                token.evict();
                self.token = None;
                continue;
            }

            self.desc = Some(desc);
            self.token = Some(token);
            return;
        }

        self.err = Some(
            self.ds
                .retry_early_exit_error(ctx)
                .unwrap_or_else(|| RoutingError::from_msg(format!(
                    "range iterator failed to seek to {:?}",
                    String::from_utf8_lossy(key)
                ))),
        );
    }
}
