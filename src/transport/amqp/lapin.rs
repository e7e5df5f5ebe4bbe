//! AMQP transport implementation using `lapin`.
//!
//! ## Connection layout
//!
//! - One broker connection per transport.
//! - A **consume channel** for queue declarations and consumers. Each call to
//!   `consume()` sets the channel's per-consumer prefetch with `basic_qos`
//!   and starts one pump task that forwards deliveries into the caller's
//!   inbox.
//! - A separate **publish channel** per `open_publisher()` call, in publisher
//!   confirm mode, so a publish only succeeds once the broker has taken
//!   responsibility for the message.
//!
//! Publishing goes through the default exchange with the queue name as
//! routing key. Messages are marked persistent.
//!
//! ## Failure behavior
//!
//! Connection failures at startup map to `TransportRetryable` so the
//! transport builder can retry them. There is no reconnect afterwards: when
//! the broker closes a consumer stream its pump ends, and once every pump has
//! ended the messaging core reports the connection as lost.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lapin::{
    //
    message::Delivery as AmqpDelivery,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};
use tokio::sync::mpsc;
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

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

struct AmqpTransport {
    transport_id: String,
    connection: Connection,
    consume_channel: Channel,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

/// Settles one lapin delivery. lapin does nothing when this is dropped
/// unsettled, so callers must ack or nack explicitly.
struct AmqpAck {
    delivery: Mutex<Option<AmqpDelivery>>,
}

#[async_trait::async_trait]
impl Acknowledge for AmqpAck {
    async fn ack(&self) -> Result<()> {
        let Some(delivery) = lock_ignore_poison(&self.delivery).take() else {
            return Ok(());
        };

        delivery
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::Transport(format!("amqp: ack failed: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let Some(delivery) = lock_ignore_poison(&self.delivery).take() else {
            return Ok(());
        };

        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        delivery
            .nack(options)
            .await
            .map(|_| ())
            .map_err(|e| Error::Transport(format!("amqp: nack failed: {e}")))
    }
}

struct AmqpPublisher {
    transport_id: String,
    channel: Channel,
}

#[async_trait::async_trait]
impl PublishChannel for AmqpPublisher {
    async fn publish(&mut self, destination: &Address, payload: Bytes) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .channel
            .basic_publish(
                "".into(),                   // default exchange
                destination.as_str().into(), // routing key = queue name
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: publish failed: {e}")))?;

        let confirmation = confirm
            .await
            .map_err(|e| Error::Transport(format!("amqp: publish confirm failed: {e}")))?;

        if confirmation.is_nack() {
            return Err(Error::Transport(format!(
                "amqp: broker rejected message for {destination}"
            )));
        }

        log_debug!("[{}] published to queue {destination}", self.transport_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            nowait: false,
        };

        self.consume_channel
            .queue_declare(queue.name.as_str().into(), options, FieldTable::default())
            .await
            .map_err(|e| {
                Error::Transport(format!("amqp: declare of '{}' failed: {e}", queue.name))
            })?;

        log_info!("[{}] declared queue {}", self.transport_id, queue.name);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        inbox: mpsc::Sender<Delivery>,
    ) -> Result<()> {
        self.consume_channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Transport(format!("amqp: basic_qos failed: {e}")))?;

        let consumer = self
            .consume_channel
            .basic_consume(
                queue.into(),
                format!("{}-{queue}", self.transport_id).as_str().into(),
                BasicConsumeOptions::default(), // manual ack
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: consume of '{queue}' failed: {e}")))?;

        log_info!("[{}] consuming queue {queue}", self.transport_id);

        let handle = tokio::spawn(pump(
            self.transport_id.clone(),
            Arc::from(queue),
            consumer,
            inbox,
        ));
        lock_ignore_poison(&self.pumps).push(handle);
        Ok(())
    }

    async fn open_publisher(&self) -> Result<PublisherPtr> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| Error::Transport(format!("amqp: publish channel failed: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Transport(format!("amqp: confirm_select failed: {e}")))?;

        Ok(Box::new(AmqpPublisher {
            transport_id: self.transport_id.clone(),
            channel,
        }))
    }

    async fn close(&self) -> Result<()> {
        let pumps: Vec<_> = lock_ignore_poison(&self.pumps).drain(..).collect();
        for handle in pumps {
            handle.abort();
        }

        // Unacked deliveries return to their queues when the channel closes.
        let _ = self.consume_channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP transport closed", self.transport_id);
        Ok(())
    }
}

/// Forward deliveries from a lapin consumer into the core's inbox.
async fn pump(
    transport_id: String,
    queue: Arc<str>,
    mut consumer: Consumer,
    inbox: mpsc::Sender<Delivery>,
) {
    use futures_lite::stream::StreamExt;

    while let Some(next) = consumer.next().await {
        let mut delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                log_error!("[{transport_id}] consumer error on {queue}: {e}");
                break;
            }
        };

        let payload = Bytes::from(std::mem::take(&mut delivery.data));
        let redelivered = delivery.redelivered;
        let acker = AmqpAck {
            delivery: Mutex::new(Some(delivery)),
        };

        let forwarded = inbox
            .send(Delivery::new(
                queue.clone(),
                payload,
                redelivered,
                Box::new(acker),
            ))
            .await;
        if forwarded.is_err() {
            log_debug!("[{transport_id}] inbox closed; consumer pump for {queue} stopping");
            return;
        }
    }

    log_info!("[{transport_id}] consumer stream for {queue} ended");
}

/// Connect to an AMQP broker and open the consume channel.
///
/// # Errors
///
/// [`Error::TransportRetryable`] if the broker cannot be reached or the
/// channel cannot be opened.
pub async fn create_transport(transport_id: &str, uri: &str) -> Result<TransportPtr> {
    log_info!("[{transport_id}] connecting to AMQP broker");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("[{transport_id}] {msg}");
            Error::TransportRetryable(msg)
        })?;

    let consume_channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("[{transport_id}] {msg}");
        Error::TransportRetryable(msg)
    })?;

    log_info!("[{transport_id}] connected to AMQP broker");

    Ok(Arc::new(AmqpTransport {
        transport_id: transport_id.to_string(),
        connection,
        consume_channel,
        pumps: Mutex::new(Vec::new()),
    }))
}
