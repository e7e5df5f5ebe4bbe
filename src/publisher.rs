//! Outbound publisher.
//!
//! A single worker owns the transport's [`PublishChannel`] and is therefore
//! the only task that ever writes to the broker. Producers hand it work
//! through two bounded queues:
//!
//! - **requests**, fed by RPC callers;
//! - **replies**, fed by the consumer's dispatch tasks.
//!
//! Each queue has its own capacity and the worker prefers replies, so a burst
//! of outgoing requests cannot hold back answers owed to other participants.
//! Enqueueing blocks while a queue is full. That backpressure reaches the
//! consumer through its dispatch tasks: with the reply queue full, dispatch
//! permits are not released and, once all are taken, the consumer stops
//! pulling deliveries.

use tokio::sync::{mpsc, oneshot, watch};

use crate::envelope::{self, Envelope};
use crate::{Address, Error, PublisherPtr, RequestEnvelope, ResponseEnvelope, Result};

/// One envelope waiting to be written.
pub(crate) struct Outbound {
    pub destination: Address,
    pub envelope: Envelope,
    /// Completed with the outcome of the transport write.
    pub confirm: Option<oneshot::Sender<Result<()>>>,
}

/// Producer handle for the publisher's queues. Cheap to clone.
#[derive(Clone)]
pub(crate) struct OutboundQueue {
    requests: mpsc::Sender<Outbound>,
    replies: mpsc::Sender<Outbound>,
}

impl OutboundQueue {
    /// Queue a request, waiting while the request queue is full.
    pub(crate) async fn publish_request(
        &self,
        destination: Address,
        request: RequestEnvelope,
        confirm: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let item = Outbound {
            destination,
            envelope: Envelope::Request(request),
            confirm,
        };
        self.requests.send(item).await.map_err(|_| Error::Shutdown)
    }

    /// Queue a reply, waiting while the reply queue is full.
    pub(crate) async fn publish_reply(
        &self,
        destination: Address,
        response: ResponseEnvelope,
        confirm: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let item = Outbound {
            destination,
            envelope: Envelope::Response(response),
            confirm,
        };
        self.replies.send(item).await.map_err(|_| Error::Shutdown)
    }
}

/// The publishing worker. Run it with [`OutboundPublisher::run`].
pub(crate) struct OutboundPublisher {
    transport_id: String,
    channel: PublisherPtr,
    requests: mpsc::Receiver<Outbound>,
    replies: mpsc::Receiver<Outbound>,
}

/// Create the publisher and its producer handle.
pub(crate) fn outbound_queue(
    transport_id: impl Into<String>,
    channel: PublisherPtr,
    request_capacity: usize,
    reply_capacity: usize,
) -> (OutboundQueue, OutboundPublisher) {
    let (requests_tx, requests_rx) = mpsc::channel(request_capacity);
    let (replies_tx, replies_rx) = mpsc::channel(reply_capacity);

    let queue = OutboundQueue {
        requests: requests_tx,
        replies: replies_tx,
    };
    let publisher = OutboundPublisher {
        transport_id: transport_id.into(),
        channel,
        requests: requests_rx,
        replies: replies_rx,
    };
    (queue, publisher)
}

impl OutboundPublisher {
    /// Publish until `stop` turns true, then flush whatever is still queued.
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) {
        log_debug!("[{}] outbound publisher started", self.transport_id);

        loop {
            let item = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                Some(item) = self.replies.recv() => item,
                Some(item) = self.requests.recv() => item,
            };
            self.write(item).await;
        }

        self.drain().await;
        log_debug!("[{}] outbound publisher stopped", self.transport_id);
    }

    async fn drain(&mut self) {
        self.replies.close();
        self.requests.close();

        let mut flushed = 0usize;
        while let Ok(item) = self.replies.try_recv() {
            self.write(item).await;
            flushed += 1;
        }
        while let Ok(item) = self.requests.try_recv() {
            self.write(item).await;
            flushed += 1;
        }

        if flushed > 0 {
            log_info!("[{}] flushed {flushed} queued envelopes", self.transport_id);
        }
    }

    async fn write(&mut self, item: Outbound) {
        let id = item.envelope.id().clone();

        let result = match envelope::encode(&item.envelope) {
            Ok(bytes) => self.channel.publish(&item.destination, bytes).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => log_debug!(
                "[{}] published {:?} {id} to {}",
                self.transport_id,
                item.envelope.kind(),
                item.destination
            ),
            Err(err) => log_error!(
                "[{}] failed to publish {id} to {}: {err}",
                self.transport_id,
                item.destination
            ),
        }

        if let Some(confirm) = item.confirm {
            let _ = confirm.send(result);
        }
    }
}
