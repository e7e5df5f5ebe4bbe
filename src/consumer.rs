//! Inbound consumer.
//!
//! A single worker owns the bounded inbound queue that the transport's
//! consumer pumps feed. Every delivery is decoded once and then branched on:
//!
//! - **undecodable**: logged, acknowledged and dropped, so a poison message
//!   is never redelivered in a loop;
//! - **response**: acknowledged, then handed to the correlation registry; a
//!   reply nobody here waits for is dropped;
//! - **request**: run through the dispatcher on its own task and answered on
//!   `reply_to` through the outbound publisher.
//!
//! Dispatch tasks are bounded by a semaphore. The consumer loop waits for a
//! permit before taking on another request, which is where publisher
//! backpressure eventually stops consumption.
//!
//! When a request is acknowledged depends on the configured [`AckPolicy`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};

use crate::envelope::{self, Envelope};
use crate::publisher::OutboundQueue;
use crate::{
    //
    AckPolicy,
    CorrelationRegistry,
    Delivery,
    Dispatcher,
    RequestEnvelope,
};

pub(crate) struct InboundConsumer {
    pub transport_id: String,
    pub inbox: mpsc::Receiver<Delivery>,
    pub registry: Arc<CorrelationRegistry>,
    /// `None` for a core that only issues requests.
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub outbound: OutboundQueue,
    pub ack_policy: AckPolicy,
    pub dispatch_concurrency: usize,
}

impl InboundConsumer {
    /// Consume until `stop` turns true or every transport pump has ended.
    ///
    /// Before returning, waits for in-flight dispatch tasks so their replies
    /// reach the publisher. Returns `true` if the inbound stream ended on its
    /// own (broker connection lost) rather than by request.
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) -> bool {
        log_debug!("[{}] inbound consumer started", self.transport_id);

        let permits = Arc::new(Semaphore::new(self.dispatch_concurrency));

        let lost = loop {
            let delivery = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break false,
                delivery = self.inbox.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break true,
                },
            };
            self.process(delivery, &permits).await;
        };

        if lost {
            log_error!(
                "[{}] inbound stream closed; broker connection lost",
                self.transport_id
            );
        }

        // Wait for running dispatch tasks to hand over their replies.
        let all = u32::try_from(self.dispatch_concurrency).unwrap_or(u32::MAX);
        if let Ok(drained) = permits.acquire_many(all).await {
            drained.forget();
        }

        log_debug!("[{}] inbound consumer stopped", self.transport_id);
        lost
    }

    async fn process(&self, delivery: Delivery, permits: &Arc<Semaphore>) {
        match envelope::decode(&delivery.payload) {
            Err(err) => {
                log_error!(
                    "[{}] dropping undecodable message from {} ({} bytes): {err}",
                    self.transport_id,
                    delivery.queue,
                    delivery.payload.len()
                );
                self.ack(delivery).await;
            }
            Ok(Envelope::Response(response)) => {
                self.ack(delivery).await;

                let id = response.id.clone();
                if self.registry.resolve(&id, response) {
                    log_debug!("[{}] resolved {id}", self.transport_id);
                } else {
                    log_debug!("[{}] no local waiter for {id}; reply dropped", self.transport_id);
                }
            }
            Ok(Envelope::Request(request)) => match &self.dispatcher {
                Some(dispatcher) => {
                    self.dispatch(request, delivery, dispatcher.clone(), permits)
                        .await;
                }
                None => {
                    log_warn!(
                        "[{}] request {} arrived on {} but this node does not serve requests",
                        self.transport_id,
                        request.id,
                        delivery.queue
                    );
                    self.ack(delivery).await;
                }
            },
        }
    }

    async fn dispatch(
        &self,
        request: RequestEnvelope,
        delivery: Delivery,
        dispatcher: Arc<Dispatcher>,
        permits: &Arc<Semaphore>,
    ) {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };

        if delivery.redelivered {
            log_info!(
                "[{}] request {} is a redelivery",
                self.transport_id,
                request.id
            );
        }

        let pending_ack = match self.ack_policy {
            AckPolicy::BeforeDispatch => {
                self.ack(delivery).await;
                None
            }
            AckPolicy::AfterReply => Some(delivery),
        };

        let outbound = self.outbound.clone();
        let transport_id = self.transport_id.clone();

        tokio::spawn(async move {
            let _permit = permit;

            let response = dispatcher.handle(&request).await;
            let reply_to = request.reply_to;

            let Some(delivery) = pending_ack else {
                if let Err(err) = outbound.publish_reply(reply_to, response, None).await {
                    log_error!("[{transport_id}] reply to {} lost: {err}", request.id);
                }
                return;
            };

            let (confirm_tx, confirm_rx) = oneshot::channel();
            let queued = outbound
                .publish_reply(reply_to, response, Some(confirm_tx))
                .await;

            let written = match queued {
                Ok(()) => matches!(confirm_rx.await, Ok(Ok(()))),
                Err(_) => false,
            };

            if written {
                if let Err(err) = delivery.ack().await {
                    log_error!("[{transport_id}] failed to ack {}: {err}", request.id);
                }
            } else {
                log_warn!(
                    "[{transport_id}] reply to {} not published; requeueing request",
                    request.id
                );
                if let Err(err) = delivery.nack(true).await {
                    log_error!("[{transport_id}] failed to requeue {}: {err}", request.id);
                }
            }
        });
    }

    async fn ack(&self, delivery: Delivery) {
        if let Err(err) = delivery.ack().await {
            log_error!("[{}] failed to ack message: {err}", self.transport_id);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::publisher::outbound_queue;
    use crate::{Acknowledge, Address, Command, Error, LogMailer, Mail, PublishChannel, Result};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts settlements; like a real broker client it does nothing on drop.
    #[derive(Default)]
    struct Settled {
        acks: AtomicUsize,
        requeues: AtomicUsize,
        discards: AtomicUsize,
    }

    struct CountingAck(Arc<Settled>);

    #[async_trait::async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(&self) -> Result<()> {
            self.0.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<()> {
            let counter = if requeue { &self.0.requeues } else { &self.0.discards };
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Channel {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl PublishChannel for Channel {
        async fn publish(&mut self, _destination: &Address, _payload: Bytes) -> Result<()> {
            if self.fail {
                return Err(Error::Transport("broker unavailable".into()));
            }
            Ok(())
        }
    }

    fn request_delivery(settled: &Arc<Settled>) -> Delivery {
        let mail = Mail {
            to: "user@example.com".into(),
            from: "noreply@example.com".into(),
            subject: "Hi".into(),
            body: "Hello".into(),
            email: "user@example.com".into(),
        };
        let command = Command::SendMail(mail);
        let request = RequestEnvelope {
            id: crate::CorrelationId::generate(),
            message_type: command.message_type().to_string(),
            message_data: command.into_data(),
            reply_to: Address::from("caller"),
        };
        let payload = envelope::encode(&Envelope::Request(request)).unwrap();
        Delivery::new(
            Arc::from("requests"),
            payload,
            false,
            Box::new(CountingAck(settled.clone())),
        )
    }

    /// Run one request through a consumer whose publisher writes with
    /// `channel`, and return how the delivery was settled.
    async fn settle_one(ack_policy: AckPolicy, channel: Channel) -> Arc<Settled> {
        let settled = Arc::new(Settled::default());

        let (outbound, publisher) = outbound_queue("test", Box::new(channel), 4, 4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let writer = tokio::spawn(publisher.run(stop_rx.clone()));

        let (inbox_tx, inbox) = mpsc::channel(4);
        let consumer = InboundConsumer {
            transport_id: "test".into(),
            inbox,
            registry: Arc::new(CorrelationRegistry::new()),
            dispatcher: Some(Arc::new(Dispatcher::new(Arc::new(LogMailer)))),
            outbound,
            ack_policy,
            dispatch_concurrency: 2,
        };
        let worker = tokio::spawn(consumer.run(stop_rx));

        inbox_tx.send(request_delivery(&settled)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let total = settled.acks.load(Ordering::SeqCst)
                + settled.requeues.load(Ordering::SeqCst)
                + settled.discards.load(Ordering::SeqCst);
            if total > 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "delivery never settled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(inbox_tx);
        assert!(worker.await.unwrap(), "closed inbox reads as connection lost");
        stop_tx.send(true).unwrap();
        writer.await.unwrap();
        settled
    }

    #[tokio::test]
    async fn failed_reply_requeues_the_request() {
        // ---
        let settled = settle_one(AckPolicy::AfterReply, Channel { fail: true }).await;

        assert_eq!(settled.requeues.load(Ordering::SeqCst), 1);
        assert_eq!(settled.acks.load(Ordering::SeqCst), 0);
        assert_eq!(settled.discards.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn written_reply_acks_the_request() {
        // ---
        let settled = settle_one(AckPolicy::AfterReply, Channel { fail: false }).await;

        assert_eq!(settled.acks.load(Ordering::SeqCst), 1);
        assert_eq!(settled.requeues.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ack_before_dispatch_ignores_reply_failure() {
        // ---
        let settled = settle_one(AckPolicy::BeforeDispatch, Channel { fail: true }).await;

        assert_eq!(settled.acks.load(Ordering::SeqCst), 1);
        assert_eq!(settled.requeues.load(Ordering::SeqCst), 0);
    }
}
