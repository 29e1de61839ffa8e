//! Delivery of asynchronous fetch results to the consuming context.
//!
//! Workers send; one consumer receives. Every delivery carries the tag the
//! lookup was issued with. The router never filters: a consumer that has
//! moved on compares the tag with what it currently wants and drops
//! mismatches itself.

use std::sync::Arc;

use pixcache_core::Error;
use tokio::sync::mpsc;

/// One completed fetch.
#[derive(Debug)]
pub struct Delivery<V> {
    /// Opaque correlation value supplied with the lookup.
    pub tag: String,
    /// Identifier that was fetched.
    pub identifier: String,
    pub result: Result<Arc<V>, Error>,
}

impl<V> Delivery<V> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sending half, cloned into every worker.
#[derive(Debug)]
pub struct Router<V> {
    tx: mpsc::UnboundedSender<Delivery<V>>,
}

impl<V> Clone for Router<V> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// Receiving half, owned by the consumer.
#[derive(Debug)]
pub struct Deliveries<V> {
    rx: mpsc::UnboundedReceiver<Delivery<V>>,
}

/// Create a connected router and receiver.
pub fn channel<V>() -> (Router<V>, Deliveries<V>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Router { tx }, Deliveries { rx })
}

impl<V> Router<V> {
    /// Hand a result to the consumer. A consumer that has gone away is not
    /// an error for the worker; the result is dropped.
    pub fn deliver(&self, tag: String, identifier: String, result: Result<Arc<V>, Error>) {
        if let Err(mpsc::error::SendError(dropped)) = self.tx.send(Delivery { tag, identifier, result }) {
            tracing::warn!(tag = %dropped.tag, identifier = %dropped.identifier, "consumer gone; dropping delivery");
        }
    }
}

impl<V> Deliveries<V> {
    /// Wait for the next delivery. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Delivery<V>> {
        self.rx.recv().await
    }

    /// Next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery<V>> {
        self.rx.try_recv().ok()
    }
}
