//! Messaging core builder.
//!
//! Fluent configuration for a [`MessagingCore`] on top of a transport.

use std::time::Duration;

use crate::{
    //
    AckPolicy,
    CoreConfig,
    CoreMode,
    Error,
    MailerPtr,
    MessagingCore,
    ReplyRouting,
    Result,
    TransportPtr,
};

/// Builder for [`MessagingCore`].
///
/// Settings start from [`CoreConfig::default`] with the node id taken from
/// the transport, or from a complete [`CoreConfig`] passed to
/// [`config`](Self::config). Individual setters override either.
///
/// # Examples
///
/// ## Mail worker
/// ```no_run
/// use std::sync::Arc;
/// use mailbus::{LogMailer, MessagingCoreBuilder, TransportBuilder};
///
/// # async fn example() -> mailbus::Result<()> {
/// let transport = TransportBuilder::new()
///     .uri("amqp://localhost:5672/%2f")
///     .transport_id("mail-worker")
///     .build()
///     .await?;
///
/// let core = MessagingCoreBuilder::new(transport)
///     .server_mode()
///     .mailer(Arc::new(LogMailer))
///     .start()
///     .await?;
///
/// core.run().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Caller
/// ```no_run
/// use std::time::Duration;
/// use mailbus::{Mail, MessagingCoreBuilder, TransportBuilder};
///
/// # async fn example() -> mailbus::Result<()> {
/// let transport = TransportBuilder::new()
///     .uri("amqp://localhost:5672/%2f")
///     .transport_id("api")
///     .build()
///     .await?;
///
/// let core = MessagingCoreBuilder::new(transport)
///     .client_mode()
///     .request_timeout(Duration::from_secs(5))
///     .start()
///     .await?;
///
/// let mail = Mail {
///     to: "user@example.com".into(),
///     from: "noreply@example.com".into(),
///     subject: "Welcome".into(),
///     body: "Hello".into(),
///     email: "user@example.com".into(),
/// };
/// core.client()?.send_mail(&mail).await?;
/// core.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct MessagingCoreBuilder {
    transport: TransportPtr,
    config: Option<CoreConfig>,
    mailer: Option<MailerPtr>,

    node_id: Option<String>,
    request_queue: Option<String>,
    reply_routing: Option<ReplyRouting>,
    ack_policy: Option<AckPolicy>,
    request_timeout: Option<Duration>,
    outbound_capacity: Option<(usize, usize)>,
    inbound_capacity: Option<usize>,
    dispatch_concurrency: Option<usize>,

    // Conflicts between mode methods are reported by start()
    modes: Vec<CoreMode>,
}

impl MessagingCoreBuilder {
    pub fn new(transport: TransportPtr) -> Self {
        Self {
            transport,
            config: None,
            mailer: None,
            node_id: None,
            request_queue: None,
            reply_routing: None,
            ack_policy: None,
            request_timeout: None,
            outbound_capacity: None,
            inbound_capacity: None,
            dispatch_concurrency: None,
            modes: Vec::new(),
        }
    }

    /// Use `config` as the base instead of the defaults.
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Mail collaborator; required in server and full-duplex mode.
    pub fn mailer(mut self, mailer: MailerPtr) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Override the node id (default: the transport id).
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Issue requests only.
    pub fn client_mode(mut self) -> Self {
        self.modes.push(CoreMode::Client);
        self
    }

    /// Serve requests only.
    pub fn server_mode(mut self) -> Self {
        self.modes.push(CoreMode::Server);
        self
    }

    /// Issue and serve requests.
    pub fn full_duplex(mut self) -> Self {
        self.modes.push(CoreMode::FullDuplex);
        self
    }

    pub fn request_queue(mut self, queue: impl Into<String>) -> Self {
        self.request_queue = Some(queue.into());
        self
    }

    pub fn reply_routing(mut self, routing: ReplyRouting) -> Self {
        self.reply_routing = Some(routing);
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = Some(policy);
        self
    }

    /// Default timeout for `RpcClient::call_default` and `send_mail`.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Capacities of the publisher's request and reply queues.
    pub fn outbound_capacity(mut self, requests: usize, replies: usize) -> Self {
        self.outbound_capacity = Some((requests, replies));
        self
    }

    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = Some(capacity);
        self
    }

    pub fn dispatch_concurrency(mut self, limit: usize) -> Self {
        self.dispatch_concurrency = Some(limit);
        self
    }

    /// Resolve the final configuration without starting anything.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigConflict`] if more than one mode method was called, plus
    /// everything [`CoreConfig::validate`] reports.
    pub fn build_config(&self) -> Result<CoreConfig> {
        let mut config = self.config.clone().unwrap_or_else(|| CoreConfig {
            node_id: self.transport.transport_id().to_string(),
            ..CoreConfig::default()
        });

        match self.modes.as_slice() {
            [] => {}
            [mode] => config.mode = *mode,
            _ => {
                return Err(Error::ConfigConflict(
                    "only one of client_mode, server_mode, full_duplex may be called".into(),
                ))
            }
        }

        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(queue) = &self.request_queue {
            config.request_queue = queue.clone();
        }
        if let Some(routing) = self.reply_routing {
            config.reply_routing = routing;
        }
        if let Some(policy) = self.ack_policy {
            config.ack_policy = policy;
        }
        if let Some(timeout) = self.request_timeout {
            config.request_timeout = timeout;
        }
        if let Some((requests, replies)) = self.outbound_capacity {
            config.outbound_request_capacity = requests;
            config.outbound_reply_capacity = replies;
        }
        if let Some(capacity) = self.inbound_capacity {
            config.inbound_capacity = capacity;
        }
        if let Some(limit) = self.dispatch_concurrency {
            config.dispatch_concurrency = limit;
        }

        config.validate()?;
        Ok(config)
    }

    /// Start the core (consumes self).
    ///
    /// # Errors
    ///
    /// - configuration errors from [`build_config`](Self::build_config);
    /// - [`Error::MissingConfig`] if the mode serves requests and no mailer
    ///   was given, [`Error::ConfigConflict`] if a mailer was given in
    ///   client mode;
    /// - transport errors while declaring or consuming queues.
    pub async fn start(self) -> Result<MessagingCore> {
        let config = self.build_config()?;
        MessagingCore::start(self.transport, config, self.mailer).await
    }
}
