//! RPC transport abstraction.
//!
//! A [`Transport`] is constructed per range-addressed send over an ordered
//! set of candidate replicas and fires one RPC at a time; results arrive on
//! the channel handed to `send_next`. The concrete RPC stack lives behind
//! [`ReplicaClient`], which [`ClientTransportFactory`] adapts into the
//! transport contract. A transport is driven by a single task and must be
//! closable at any point of partial progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchRequest, BatchResponse};
use crate::descriptor::{ReplicaDescriptor, ReplicaSet};

/// Per-send options threaded into the transport.
#[derive(Clone, Copy, Debug)]
pub struct SendOptions {
    /// How long an RPC may be pending before the slow-request gauge trips.
    pub slow_request_threshold: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            slow_request_threshold: Duration::from_secs(60),
        }
    }
}

/// Transport-level failure for one RPC attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The request failed fast and was never sent; there is no ambiguity
    /// about whether the server executed it.
    Unavailable(String),
    /// The connection failed after the request may have reached the server.
    Network(String),
}

impl TransportError {
    /// True when the request is guaranteed not to have reached the server.
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            TransportError::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Outcome of one RPC attempt against one replica.
#[derive(Debug)]
pub struct BatchCall {
    pub replica: ReplicaDescriptor,
    pub reply: Option<BatchResponse>,
    pub err: Option<TransportError>,
}

/// Ordered set of candidate replicas for one send.
pub trait Transport: Send {
    /// True once every candidate has been tried.
    fn is_exhausted(&self) -> bool;

    /// The replica the next `send_next` will target.
    fn next_replica(&self) -> Option<ReplicaDescriptor>;

    /// Fire one RPC at the next replica; the result is delivered on `done`.
    /// Cancelling `ctx` aborts the attempt.
    fn send_next(&mut self, ctx: &CancellationToken, done: mpsc::Sender<BatchCall>);

    /// Move `replica` to the front of the untried queue.
    fn move_to_front(&mut self, replica: &ReplicaDescriptor);

    /// Release transport resources; safe under arbitrary partial progress.
    fn close(&mut self);
}

/// Builds a transport per range-addressed send.
pub trait TransportFactory: Send + Sync {
    fn transport(
        &self,
        opts: SendOptions,
        replicas: &ReplicaSet,
        batch: &BatchRequest,
    ) -> anyhow::Result<Box<dyn Transport>>;
}

/// One-RPC client seam over the concrete wire stack.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn send_batch(
        &self,
        replica: &ReplicaDescriptor,
        batch: BatchRequest,
    ) -> Result<BatchResponse, TransportError>;
}

/// Transport over a [`ReplicaClient`], trying replicas in order.
pub struct ClientTransport {
    client: Arc<dyn ReplicaClient>,
    batch: BatchRequest,
    replicas: Vec<ReplicaDescriptor>,
    next: usize,
    closed: CancellationToken,
}

impl Transport for ClientTransport {
    fn is_exhausted(&self) -> bool {
        self.next >= self.replicas.len()
    }

    fn next_replica(&self) -> Option<ReplicaDescriptor> {
        self.replicas.get(self.next).cloned()
    }

    fn send_next(&mut self, ctx: &CancellationToken, done: mpsc::Sender<BatchCall>) {
        let Some(replica) = self.replicas.get(self.next).cloned() else {
            return;
        };
        self.next += 1;
        let client = self.client.clone();
        let batch = self.batch.clone();
        let ctx = ctx.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let call = tokio::select! {
                result = client.send_batch(&replica, batch) => match result {
                    Ok(reply) => BatchCall {
                        replica,
                        reply: Some(reply),
                        err: None,
                    },
                    Err(err) => BatchCall {
                        replica,
                        reply: None,
                        err: Some(err),
                    },
                },
                _ = ctx.cancelled() => BatchCall {
                    replica,
                    reply: None,
                    err: Some(TransportError::Network("rpc canceled".to_string())),
                },
                _ = closed.cancelled() => return,
            };
            let _ = done.send(call).await;
        });
    }

    fn move_to_front(&mut self, replica: &ReplicaDescriptor) {
        let Some(pos) = self
            .replicas
            .iter()
            .position(|r| r.store_id == replica.store_id)
        else {
            return;
        };
        // If the replica was already tried, pull it back into the untried
        // portion of the queue.
        if pos < self.next {
            self.next -= 1;
        }
        let moved = self.replicas.remove(pos);
        self.replicas.insert(self.next, moved);
    }

    fn close(&mut self) {
        self.closed.cancel();
    }
}

/// Factory producing [`ClientTransport`]s.
pub struct ClientTransportFactory {
    client: Arc<dyn ReplicaClient>,
}

impl ClientTransportFactory {
    pub fn new(client: Arc<dyn ReplicaClient>) -> Self {
        Self { client }
    }
}

impl TransportFactory for ClientTransportFactory {
    fn transport(
        &self,
        _opts: SendOptions,
        replicas: &ReplicaSet,
        batch: &BatchRequest,
    ) -> anyhow::Result<Box<dyn Transport>> {
        Ok(Box::new(ClientTransport {
            client: self.client.clone(),
            batch: batch.clone(),
            replicas: replicas.descriptors(),
            next: 0,
            closed: CancellationToken::new(),
        }))
    }
}
