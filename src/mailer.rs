//! Mail-sending collaborator.
//!
//! The dispatcher hands validated mails to a [`Mailer`]. Actual delivery
//! (SMTP, a provider API, ...) lives outside this crate; [`LogMailer`] only
//! records the mail in the log and is what the demo worker runs with.

use std::sync::Arc;

use thiserror::Error;

use crate::Mail;

/// Delivery failure reported by a [`Mailer`]. The text is forwarded to the
/// caller verbatim in the reply's `error` key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MailError(pub String);

impl From<String> for MailError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MailError {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Capability to deliver a mail.
///
/// Called from the dispatcher's worker tasks; implementations should return
/// once the mail has been handed off and are not cancelled midway.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

pub type MailerPtr = Arc<dyn Mailer>;

/// Mailer that logs every mail and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        log_info!(
            to = %mail.to,
            from = %mail.from,
            subject = %mail.subject,
            "mail accepted for delivery ({} bytes)",
            mail.body.len()
        );
        Ok(())
    }
}
