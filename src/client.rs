//! RPC client.
//!
//! Issues requests through the outbound publisher and waits for the
//! correlated reply. Obtain one from
//! [`MessagingCore::client`](crate::MessagingCore::client).
//!
//! Each call registers its correlation ID before the request is queued, so a
//! reply that races ahead of the caller is never lost. The entry is removed
//! by whoever finishes first: the consumer on resolve, the caller on timeout,
//! or the guard if the caller's future is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};

use crate::publisher::OutboundQueue;
use crate::registry::PendingGuard;
use crate::{
    //
    Address,
    Command,
    CorrelationId,
    CorrelationRegistry,
    Error,
    Mail,
    MessageData,
    RequestEnvelope,
    Result,
};

/// Handle for issuing requests. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    registry: Arc<CorrelationRegistry>,
    outbound: OutboundQueue,
    request_destination: Address,
    reply_to: Address,
    default_timeout: Duration,
}

impl RpcClient {
    pub(crate) fn new(
        registry: Arc<CorrelationRegistry>,
        outbound: OutboundQueue,
        request_destination: Address,
        reply_to: Address,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            outbound,
            request_destination,
            reply_to,
            default_timeout,
        }
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// The deadline covers queueing behind a full publisher, the broker's
    /// publish confirmation and the wait for the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no reply arrived in time; the pending entry is
    ///   removed, so a late reply is dropped.
    /// - [`Error::Remote`] if the reply carries an `error` key.
    /// - [`Error::Transport`] if the broker refused the request.
    /// - [`Error::Shutdown`] if the core stopped while the call was pending.
    pub async fn call(
        &self,
        message_type: &str,
        message_data: MessageData,
        timeout: Duration,
    ) -> Result<MessageData> {
        let deadline = Instant::now() + timeout;
        let id = CorrelationId::generate();

        let reply = self.registry.register(id.clone())?;
        let _guard = PendingGuard::new(self.registry.clone(), id.clone());

        let request = RequestEnvelope {
            id: id.clone(),
            message_type: message_type.to_string(),
            message_data,
            reply_to: self.reply_to.clone(),
        };

        let (confirm_tx, confirm_rx) = oneshot::channel();
        let queued = timeout_at(
            deadline,
            self.outbound.publish_request(
                self.request_destination.clone(),
                request,
                Some(confirm_tx),
            ),
        );
        match queued.await {
            Ok(result) => result?,
            Err(_) => return Err(self.timed_out(&id, timeout)),
        }

        match timeout_at(deadline, confirm_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                log_warn!("request {id} ({message_type}) not published: {err}");
                return Err(err);
            }
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => return Err(self.timed_out(&id, timeout)),
        }
        log_debug!("request {id} ({message_type}) published; reply on {}", self.reply_to);

        let response = match timeout_at(deadline, reply).await {
            Ok(Ok(response)) => response,
            // Sender dropped without a reply: the registry was drained.
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => return Err(self.timed_out(&id, timeout)),
        };

        match response.error() {
            Some(text) => Err(Error::Remote(text.to_string())),
            None => Ok(response.message_data),
        }
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default(
        &self,
        message_type: &str,
        message_data: MessageData,
    ) -> Result<MessageData> {
        self.call(message_type, message_data, self.default_timeout)
            .await
    }

    /// Ask a serving node to send `mail` and wait for the outcome.
    pub async fn send_mail(&self, mail: &Mail) -> Result<()> {
        let command = Command::SendMail(mail.clone());
        let message_type = command.message_type();
        self.call_default(message_type, command.into_data()).await?;
        Ok(())
    }

    /// Requests currently waiting for a reply, across all clients of the core.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    fn timed_out(&self, id: &CorrelationId, timeout: Duration) -> Error {
        self.registry.expire(id);
        log_warn!("request {id} timed out after {timeout:?}");
        Error::Timeout
    }
}
