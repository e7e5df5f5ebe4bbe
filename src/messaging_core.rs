//! Messaging core lifecycle.
//!
//! A [`MessagingCore`] owns the long-lived workers of one node:
//!
//! - the **outbound publisher**, sole writer to the broker;
//! - the **inbound consumer**, fed by one transport pump per consumed queue;
//! - the **correlation registry** shared with every [`RpcClient`] handed out.
//!
//! Build it once with [`MessagingCoreBuilder`](crate::MessagingCoreBuilder)
//! and pass clones around; all clones drive the same workers.
//!
//! ## Shutdown order
//!
//! 1. stop the consumer and wait for in-flight dispatches to queue replies;
//! 2. stop the publisher, which flushes what is queued;
//! 3. drain the registry, waking waiting callers with [`Error::Shutdown`];
//! 4. close the transport.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::consumer::InboundConsumer;
use crate::publisher::{outbound_queue, OutboundPublisher};
use crate::{
    //
    Address,
    CoreConfig,
    CoreMode,
    CorrelationRegistry,
    Dispatcher,
    Error,
    MailerPtr,
    QueueSpec,
    ReplyRouting,
    Result,
    RpcClient,
    TransportPtr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreState {
    Running,
    Stopped,
    /// Every consumer pump ended without a shutdown request.
    ConnectionLost,
}

struct Workers {
    consumer: JoinHandle<()>,
    publisher: JoinHandle<()>,
}

struct Inner {
    config: CoreConfig,
    transport: TransportPtr,
    registry: Arc<CorrelationRegistry>,
    client: Option<RpcClient>,
    reply_address: Option<Address>,
    consumer_stop: watch::Sender<bool>,
    publisher_stop: watch::Sender<bool>,
    state: Arc<watch::Sender<CoreState>>,
    workers: Mutex<Option<Workers>>,
}

/// A running messaging core. Cheap to clone.
#[derive(Clone)]
pub struct MessagingCore {
    inner: Arc<Inner>,
}

impl MessagingCore {
    /// Declare queues, attach consumers and spawn the workers.
    pub(crate) async fn start(
        transport: TransportPtr,
        config: CoreConfig,
        mailer: Option<MailerPtr>,
    ) -> Result<Self> {
        config.validate()?;

        let dispatcher = match (config.mode.serves(), mailer) {
            (true, Some(mailer)) => Some(Arc::new(Dispatcher::new(mailer))),
            (true, None) => {
                return Err(Error::MissingConfig(format!(
                    "mailer (required in {:?} mode)",
                    config.mode
                )))
            }
            (false, Some(_)) => {
                return Err(Error::ConfigConflict(
                    "a mailer was supplied but client mode does not serve requests".into(),
                ))
            }
            (false, None) => None,
        };

        match Self::attach(transport.clone(), config, dispatcher).await {
            Ok(core) => Ok(core),
            Err(err) => {
                log_error!("[{}] messaging core failed to start: {err}", transport.transport_id());
                let _ = transport.close().await;
                Err(err)
            }
        }
    }

    async fn attach(
        transport: TransportPtr,
        config: CoreConfig,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Result<Self> {
        let transport_id = transport.transport_id().to_string();
        let request_queue = config.request_queue.clone();
        let reply_queue = config.reply_queue();
        let dedicated_replies =
            config.mode.calls() && config.reply_routing == ReplyRouting::Dedicated;

        // Declared in every mode so requests published before any server
        // attaches are kept.
        transport
            .declare_queue(&QueueSpec::shared(&request_queue))
            .await?;
        if dedicated_replies {
            transport
                .declare_queue(&QueueSpec::reply(&reply_queue))
                .await?;
        }

        let channel = transport.open_publisher().await?;
        let (outbound, publisher) = outbound_queue(
            transport_id.as_str(),
            channel,
            config.outbound_request_capacity,
            config.outbound_reply_capacity,
        );

        let (inbox_tx, inbox_rx) = tokio::sync::mpsc::channel(config.inbound_capacity);
        let prefetch = config.prefetch();

        if config.mode.serves() {
            transport
                .consume(&request_queue, prefetch, inbox_tx.clone())
                .await?;
        }
        if dedicated_replies {
            transport
                .consume(&reply_queue, prefetch, inbox_tx.clone())
                .await?;
        }
        // Only the pumps hold senders now; the inbox closes when they all end.
        drop(inbox_tx);

        let registry = Arc::new(CorrelationRegistry::new());
        let reply_address = config.mode.calls().then(|| Address::from(reply_queue));
        let client = reply_address.as_ref().map(|reply_to| {
            RpcClient::new(
                registry.clone(),
                outbound.clone(),
                Address::from(request_queue.as_str()),
                reply_to.clone(),
                config.request_timeout,
            )
        });

        let consumer = InboundConsumer {
            transport_id: transport_id.clone(),
            inbox: inbox_rx,
            registry: registry.clone(),
            dispatcher,
            outbound,
            ack_policy: config.ack_policy,
            dispatch_concurrency: config.dispatch_concurrency,
        };

        let (consumer_stop, consumer_stop_rx) = watch::channel(false);
        let (publisher_stop, publisher_stop_rx) = watch::channel(false);
        let state = Arc::new(watch::channel(CoreState::Running).0);

        let workers = Workers {
            consumer: spawn_consumer(consumer, consumer_stop_rx, state.clone()),
            publisher: spawn_publisher(publisher, publisher_stop_rx),
        };

        log_info!(
            "[{transport_id}] messaging core started: mode={:?} queue={request_queue} replies={}",
            config.mode,
            reply_address
                .as_ref()
                .map_or("-", |address| address.as_str())
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry,
                client,
                reply_address,
                consumer_stop,
                publisher_stop,
                state,
                workers: Mutex::new(Some(workers)),
            }),
        })
    }

    /// Handle for issuing requests.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMode`] in server mode.
    pub fn client(&self) -> Result<RpcClient> {
        self.inner.client.clone().ok_or_else(|| {
            Error::InvalidMode("client() is not available in server mode".into())
        })
    }

    pub fn mode(&self) -> CoreMode {
        self.inner.config.mode
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    /// Queue named in `reply_to` of this node's requests; `None` in server mode.
    pub fn reply_address(&self) -> Option<&Address> {
        self.inner.reply_address.as_ref()
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Wait until the core stops.
    ///
    /// Returns `Ok(())` after [`shutdown`](Self::shutdown) and
    /// [`Error::Transport`] if the broker connection was lost. There is no
    /// reconnect; after a loss call `shutdown` to release what is left.
    pub async fn run(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let result = state
            .wait_for(|state| *state != CoreState::Running)
            .await
            .map(|state| *state);

        match result {
            Ok(CoreState::ConnectionLost) => Err(Error::Transport(format!(
                "[{}] broker connection lost",
                self.inner.transport.transport_id()
            ))),
            _ => Ok(()),
        }
    }

    /// Stop the workers and close the transport. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(workers) = self.inner.workers.lock().await.take() else {
            return Ok(());
        };
        let transport_id = self.inner.transport.transport_id();
        log_info!("[{transport_id}] messaging core shutting down");

        self.inner.consumer_stop.send_replace(true);
        if let Err(err) = workers.consumer.await {
            log_error!("[{transport_id}] consumer task failed: {err}");
        }

        self.inner.publisher_stop.send_replace(true);
        if let Err(err) = workers.publisher.await {
            log_error!("[{transport_id}] publisher task failed: {err}");
        }

        let abandoned = self.inner.registry.drain();
        if abandoned > 0 {
            log_info!("[{transport_id}] {abandoned} pending requests abandoned");
        }

        let closed = self.inner.transport.close().await;

        self.inner.state.send_if_modified(|state| {
            if *state == CoreState::Running {
                *state = CoreState::Stopped;
                true
            } else {
                false
            }
        });

        log_info!("[{transport_id}] messaging core stopped");
        closed
    }
}

fn spawn_consumer(
    consumer: InboundConsumer,
    stop: watch::Receiver<bool>,
    state: Arc<watch::Sender<CoreState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if consumer.run(stop).await {
            state.send_replace(CoreState::ConnectionLost);
        }
    })
}

fn spawn_publisher(publisher: OutboundPublisher, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(publisher.run(stop))
}
