//! In-memory broker transport.
//!
//! A pure in-process implementation of the domain-level [`Transport`] trait,
//! used by the test suite, the single-process demo and as the reference for
//! the queue semantics the AMQP transport provides:
//!
//! - Queues must be declared before they are consumed. Redeclaring with the
//!   same parameters is a no-op; different parameters are rejected.
//! - Publishing to a queue nobody declared drops the message, as the AMQP
//!   default exchange does for an unknown routing key.
//! - Messages published while no consumer is attached stay queued.
//! - Several consumers on one queue compete: each message goes to one of them.
//! - Deliveries are manual-ack. A nack with requeue, or a delivery dropped
//!   without being settled, goes back on its queue flagged as redelivered.
//! - `prefetch` bounds the unacknowledged deliveries held by one consumer
//!   (0 means unbounded).
//!
//! Not modelled: persistence, connection failures, message ordering guarantees
//! across requeues. Publish failures can be injected per queue with
//! [`MemoryHub::fail_next_publishes`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::registry::lock_ignore_poison;
use crate::{
    //
    Acknowledge,
    Address,
    Delivery,
    Error,
    PublishChannel,
    PublisherPtr,
    QueueSpec,
    Result,
    Transport,
    TransportPtr,
};

/// A queued message body and whether it was delivered before.
type Message = (Bytes, bool);

struct HubQueue {
    name: Arc<str>,
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<Message>,
    /// Shared by every consumer pump on this queue.
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    ready: AtomicUsize,
    consumers: AtomicUsize,
    /// Publishes to this queue that are still to be rejected.
    failing_publishes: AtomicUsize,
}

impl HubQueue {
    fn push(&self, payload: Bytes, redelivered: bool) {
        self.ready.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send((payload, redelivered));
    }
}

/// Shared broker state for the in-memory transport.
///
/// All transports created on the same hub see the same queues, exactly as
/// processes connected to one broker would.
///
/// # Testing Only - Subject to Change
///
/// The inspection methods (`publish_raw`, `message_count`, `unacked_count`,
/// ...) exist for this crate's integration tests and may change without a
/// deprecation cycle. Production code should build transports with
/// [`TransportBuilder`](crate::TransportBuilder).
///
/// ```
/// # async fn example() -> mailbus::Result<()> {
/// use mailbus::{create_memory_transport_with_hub, MemoryHub};
///
/// let hub = MemoryHub::new();
/// let api = create_memory_transport_with_hub("api", hub.clone()).await?;
/// let worker = create_memory_transport_with_hub("worker", hub.clone()).await?;
/// # let _ = (api, worker);
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    queues: Mutex<HashMap<String, Arc<HubQueue>>>,
    unacked: Arc<AtomicUsize>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put `payload` on `queue` as if a broker client had published it.
    ///
    /// Returns `false` (and drops the message) if the queue is not declared.
    pub fn publish_raw(&self, queue: &str, payload: impl Into<Bytes>) -> bool {
        match self.queue(queue) {
            Some(q) => {
                q.push(payload.into(), false);
                true
            }
            None => {
                log_debug!("memory hub: no queue '{queue}'; message dropped");
                false
            }
        }
    }

    /// Messages waiting on `queue`, or `None` if it is not declared.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.queue(queue).map(|q| q.ready.load(Ordering::SeqCst))
    }

    /// Consumers attached to `queue`, or `None` if it is not declared.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.queue(queue).map(|q| q.consumers.load(Ordering::SeqCst))
    }

    /// Deliveries handed to consumers and not yet acknowledged, hub-wide.
    pub fn unacked_count(&self) -> usize {
        self.unacked.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queue(queue).is_some()
    }

    /// Make the next `count` transport publishes to `queue` fail with
    /// [`Error::Transport`], as a broker refusing the message would.
    ///
    /// Returns `false` if the queue is not declared.
    pub fn fail_next_publishes(&self, queue: &str, count: usize) -> bool {
        match self.queue(queue) {
            Some(q) => {
                q.failing_publishes.store(count, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn take_publish_failure(&self, queue: &str) -> bool {
        self.queue(queue).is_some_and(|q| {
            q.failing_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        })
    }

    fn queue(&self, name: &str) -> Option<Arc<HubQueue>> {
        lock_ignore_poison(&self.queues).get(name).cloned()
    }

    fn declare(&self, transport_id: &str, spec: &QueueSpec) -> Result<()> {
        let mut queues = lock_ignore_poison(&self.queues);

        if let Some(existing) = queues.get(&spec.name) {
            if existing.spec != *spec {
                return Err(Error::Transport(format!(
                    "queue '{}' already declared with different parameters",
                    spec.name
                )));
            }
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = HubQueue {
            name: Arc::from(spec.name.as_str()),
            spec: spec.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            ready: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            failing_publishes: AtomicUsize::new(0),
        };
        queues.insert(spec.name.clone(), Arc::new(queue));

        log_debug!("[{transport_id}] declared queue {}", spec.name);
        Ok(())
    }

    /// Remove a consumer; an auto-delete queue goes away with its last one.
    fn detach(&self, queue: &Arc<HubQueue>) {
        let remaining = queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 || !queue.spec.auto_delete {
            return;
        }

        let mut queues = lock_ignore_poison(&self.queues);
        if queues
            .get(queue.name.as_ref())
            .is_some_and(|current| Arc::ptr_eq(current, queue))
        {
            queues.remove(queue.name.as_ref());
            log_debug!("memory hub: auto-deleted queue {}", queue.name);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            unacked: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// Ack handle for one in-memory delivery. Dropping it unacknowledged puts the
/// message back on its queue.
struct MemoryAck {
    queue: Arc<HubQueue>,
    payload: Bytes,
    acked: AtomicBool,
    unacked: Arc<AtomicUsize>,
    _credit: Option<OwnedSemaphorePermit>,
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<()> {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.unacked.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.unacked.fetch_sub(1, Ordering::SeqCst);
            if requeue {
                self.queue.push(self.payload.clone(), true);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        if !self.acked.load(Ordering::SeqCst) {
            self.unacked.fetch_sub(1, Ordering::SeqCst);
            self.queue.push(self.payload.clone(), true);
        }
    }
}

struct MemoryPublisher {
    transport_id: String,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl PublishChannel for MemoryPublisher {
    async fn publish(&mut self, destination: &Address, payload: Bytes) -> Result<()> {
        if self.hub.take_publish_failure(destination.as_str()) {
            return Err(Error::Transport(format!(
                "memory hub: publish to {destination} rejected"
            )));
        }
        if !self.hub.publish_raw(destination.as_str(), payload) {
            log_debug!(
                "[{}] published to undeclared queue {destination}",
                self.transport_id
            );
        }
        Ok(())
    }
}

/// In-memory transport bound to a [`MemoryHub`].
struct MemoryTransport {
    transport_id: String,
    hub: Arc<MemoryHub>,
    pumps: Mutex<Vec<(Arc<HubQueue>, JoinHandle<()>)>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.hub.declare(&self.transport_id, queue)
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        inbox: mpsc::Sender<Delivery>,
    ) -> Result<()> {
        let queue = self
            .hub
            .queue(queue)
            .ok_or_else(|| Error::Transport(format!("cannot consume undeclared queue '{queue}'")))?;

        queue.consumers.fetch_add(1, Ordering::SeqCst);

        let credit = (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch))));
        let handle = tokio::spawn(pump(
            self.transport_id.clone(),
            queue.clone(),
            credit,
            self.hub.unacked.clone(),
            inbox,
        ));

        log_debug!("[{}] consuming {}", self.transport_id, queue.name);
        lock_ignore_poison(&self.pumps).push((queue, handle));
        Ok(())
    }

    async fn open_publisher(&self) -> Result<PublisherPtr> {
        Ok(Box::new(MemoryPublisher {
            transport_id: self.transport_id.clone(),
            hub: self.hub.clone(),
        }))
    }

    /// Stop this transport's consumer pumps. Queues and their messages stay
    /// on the hub unless they are auto-delete and lost their last consumer.
    async fn close(&self) -> Result<()> {
        let pumps: Vec<_> = lock_ignore_poison(&self.pumps).drain(..).collect();

        for (queue, handle) in pumps {
            handle.abort();
            self.hub.detach(&queue);
        }

        log_debug!("[{}] memory transport closed", self.transport_id);
        Ok(())
    }
}

/// Move messages from a hub queue into a consumer's inbox.
///
/// A message is only taken off the queue once there is room for it in the
/// inbox and prefetch credit for it, so nothing is lost when the consumer
/// goes away.
async fn pump(
    transport_id: String,
    queue: Arc<HubQueue>,
    credit: Option<Arc<Semaphore>>,
    unacked: Arc<AtomicUsize>,
    inbox: mpsc::Sender<Delivery>,
) {
    loop {
        let permit = match &credit {
            Some(credit) => match credit.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };

        let Ok(slot) = inbox.reserve().await else {
            break;
        };

        let next = tokio::select! {
            _ = inbox.closed() => None,
            message = async { queue.rx.lock().await.recv().await } => message,
        };
        let Some((payload, redelivered)) = next else {
            break;
        };

        queue.ready.fetch_sub(1, Ordering::SeqCst);
        unacked.fetch_add(1, Ordering::SeqCst);

        let acker = MemoryAck {
            queue: queue.clone(),
            payload: payload.clone(),
            acked: AtomicBool::new(false),
            unacked: unacked.clone(),
            _credit: permit,
        };
        slot.send(Delivery::new(
            queue.name.clone(),
            payload,
            redelivered,
            Box::new(acker),
        ));
    }

    log_debug!("[{transport_id}] consumer pump for {} ended", queue.name);
}

/// Create an in-memory transport on the process-global hub.
///
/// All transports created this way share one set of queues, like clients of
/// a single broker. Tests that run in parallel should use
/// [`create_memory_transport_with_hub`] with a hub of their own.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport(transport_id: &str) -> Result<TransportPtr> {
    create_memory_transport_with_hub(transport_id, global_hub()).await
}

/// Create an in-memory transport on the given hub.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport_with_hub(
    transport_id: &str,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    log_debug!("[{transport_id}] create memory transport");

    Ok(Arc::new(MemoryTransport {
        transport_id: transport_id.to_string(),
        hub,
        pumps: Mutex::new(Vec::new()),
    }))
}
