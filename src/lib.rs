//! Request/reply messaging over a message broker.
//!
//! `mailbus` moves side-effecting work, sending email in particular, off the
//! request path and onto a broker queue. Callers publish a request tagged
//! with a correlation id and may wait for the matching reply; worker nodes
//! consume requests, dispatch them by `message_type` and publish the reply
//! to the queue named in `reply_to`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mailbus::{LogMailer, Mail, MessagingCoreBuilder, TransportBuilder};
//!
//! # async fn example() -> mailbus::Result<()> {
//! let transport = TransportBuilder::new()
//!     .uri("memory://")
//!     .transport_id("node-1")
//!     .build()
//!     .await?;
//!
//! let core = MessagingCoreBuilder::new(transport)
//!     .full_duplex()
//!     .mailer(Arc::new(LogMailer))
//!     .start()
//!     .await?;
//!
//! let mail = Mail {
//!     to: "user@example.com".into(),
//!     from: "noreply@example.com".into(),
//!     subject: "Reset your password".into(),
//!     body: "Follow the link to continue.".into(),
//!     email: "user@example.com".into(),
//! };
//! core.client()?.send_mail(&mail).await?;
//! core.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

mod client;
mod command;
mod config;
mod consumer;
mod core_builder;
mod core_mode;
mod correlation;
mod dispatcher;
mod domain;
mod envelope;
mod error;
mod mailer;
mod messaging_core;
mod publisher;
mod registry;
mod retry;
mod transport;
mod transport_builder;

pub use client::RpcClient;
pub use command::{error_data, success_data, Command, DispatchError, Mail, SEND_MAIL};
pub use config::{AckPolicy, BrokerConfig, CoreConfig, ReplyRouting};
pub use core_builder::MessagingCoreBuilder;
pub use core_mode::CoreMode;
pub use correlation::CorrelationId;
pub use dispatcher::Dispatcher;
pub use envelope::{
    //
    decode,
    encode,
    Envelope,
    EnvelopeKind,
    MessageData,
    RequestEnvelope,
    ResponseEnvelope,
};
pub use error::{Error, Result};
pub use mailer::{LogMailer, MailError, Mailer, MailerPtr};
pub use messaging_core::MessagingCore;
pub use registry::CorrelationRegistry;
pub use retry::RetryConfig;
pub use transport_builder::TransportBuilder;

pub use transport::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Acknowledge,
    Address,
    Delivery,
    PublishChannel,
    PublisherPtr,
    QueueSpec,
    Transport,
    TransportPtr,
};
