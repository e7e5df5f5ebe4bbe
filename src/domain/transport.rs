// src/domain/transport.rs

//! Broker transport abstractions.
//!
//! This module defines the interface the messaging core uses to talk to a
//! message broker. It intentionally avoids any reference to concrete brokers
//! or client libraries; implementations live under `src/transport/`.
//!
//! The transport is responsible only for moving opaque payload bytes between
//! named queues and for acknowledging deliveries. Envelope encoding,
//! correlation and dispatch are handled by higher layers.
//!
//! ## Read and write paths
//!
//! Consuming and publishing use independent handles:
//!
//! - [`Transport::consume`] starts a pump that pushes [`Delivery`] values into
//!   a caller-owned bounded queue.
//! - [`Transport::open_publisher`] hands out a [`PublishChannel`]. Publishing
//!   takes `&mut self`, so whoever owns the channel is its only writer. The
//!   messaging core gives it to exactly one worker.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// A destination queue name.
///
/// Cheap to clone and safe to share across threads. Serialized as a bare
/// string, which is how `reply_to` appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declaration parameters for a broker queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Usable only by the declaring connection.
    pub exclusive: bool,
    /// Deleted by the broker once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// The shared request queue: durable, non-exclusive, never auto-deleted.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A per-instance reply queue: transient and removed with its consumer.
    pub fn reply(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }
}

/// Acknowledgement handle for a single delivery.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery. With `requeue` the broker puts it back on its
    /// queue for redelivery, otherwise it is discarded.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A raw message taken off a broker queue.
///
/// Deliveries are consumed in manual-ack mode: until [`Delivery::ack`] or
/// [`Delivery::nack`] is called the broker considers the message in flight.
/// Dropping a delivery does not settle it; only the in-memory transport
/// requeues on drop, a real broker keeps it in flight until the connection
/// closes.
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: Arc<str>,
    /// Raw message body.
    pub payload: Bytes,
    /// Set by the broker when this is not the first delivery attempt.
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        queue: Arc<str>,
        payload: Bytes,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            queue,
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge the delivery, consuming it.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the delivery, consuming it. `requeue` asks the broker to
    /// deliver it again.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("bytes", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Write side of a broker connection.
///
/// Implementations are not required to tolerate concurrent writers; the
/// `&mut self` receiver makes the owner the single writer.
#[async_trait::async_trait]
pub trait PublishChannel: Send {
    /// Publish `payload` to the queue named by `destination`.
    async fn publish(&mut self, destination: &Address, payload: Bytes) -> Result<()>;
}

pub type PublisherPtr = Box<dyn PublishChannel>;

/// Broker transport.
///
/// Implementations must ensure that:
/// - Queues are declared idempotently; redeclaring with the same parameters
///   succeeds.
/// - Once `consume()` returns, messages on that queue are pushed into `inbox`
///   until the transport is closed or the connection is lost. When the pump
///   stops, it drops its clone of `inbox`.
/// - Messages on one queue with several consumers are distributed among them
///   (competing consumers), not duplicated.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Identifier of this transport instance, used in logs.
    fn transport_id(&self) -> &str;

    /// Declare a queue on the broker.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Start consuming `queue` in manual-ack mode.
    ///
    /// `prefetch` bounds the number of unacknowledged deliveries the broker
    /// hands to this consumer.
    async fn consume(&self, queue: &str, prefetch: u16, inbox: mpsc::Sender<Delivery>)
        -> Result<()>;

    /// Open the write handle used by the outbound publisher.
    async fn open_publisher(&self) -> Result<PublisherPtr>;

    /// Stop all consumer pumps and release broker resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only bumps a reference count; clones share one connection.
pub type TransportPtr = Arc<dyn Transport>;
