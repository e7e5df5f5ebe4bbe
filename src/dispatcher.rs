//! Request dispatcher.
//!
//! Routes a decoded request by `message_type` to its handler and builds the
//! reply. Failures never escape: validation errors, unknown types and handler
//! errors all end up as `{"error": "..."}` in the reply payload.

use crate::command::{error_data, success_data, Command, DispatchError};
use crate::{MailerPtr, MessageData, RequestEnvelope, ResponseEnvelope};

pub struct Dispatcher {
    mailer: MailerPtr,
}

impl Dispatcher {
    pub fn new(mailer: MailerPtr) -> Self {
        Self { mailer }
    }

    /// Handle one request. The reply keeps the request's `id` and
    /// `message_type`.
    pub async fn handle(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let message_data = match self.execute(request).await {
            Ok(data) => data,
            Err(err) => {
                log_warn!(
                    "request {} ({}) failed: {err}",
                    request.id,
                    request.message_type
                );
                error_data(err.to_string())
            }
        };

        ResponseEnvelope {
            id: request.id.clone(),
            message_type: request.message_type.clone(),
            message_data,
        }
    }

    async fn execute(&self, request: &RequestEnvelope) -> Result<MessageData, DispatchError> {
        match Command::parse(&request.message_type, &request.message_data)? {
            Command::SendMail(mail) => {
                self.mailer
                    .send(&mail)
                    .await
                    .map_err(|err| DispatchError::Handler(err.0))?;

                log_debug!("request {}: mail to {} sent", request.id, mail.to);
                Ok(success_data())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Address, CorrelationId, Mail, MailError, Mailer};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Mail>>,
        fail_with: Option<String>,
    }

    #[async_trait::async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, mail: &Mail) -> Result<(), MailError> {
            if let Some(reason) = &self.fail_with {
                return Err(MailError(reason.clone()));
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    fn request(message_type: &str, data: Value) -> RequestEnvelope {
        let Value::Object(message_data) = data else {
            panic!("payload must be an object");
        };
        RequestEnvelope {
            id: CorrelationId::generate(),
            message_type: message_type.into(),
            message_data,
            reply_to: Address::from("replies"),
        }
    }

    fn full_mail() -> Value {
        json!({
            "to": "user@example.com",
            "from": "noreply@example.com",
            "subject": "Reset password",
            "body": "Click the link",
            "email": "ops@example.com"
        })
    }

    #[tokio::test]
    async fn send_mail_success() {
        // ---
        let mailer = Arc::new(RecordingMailer::default());
        let dispatcher = Dispatcher::new(mailer.clone());
        let req = request("send_mail", full_mail());

        let resp = dispatcher.handle(&req).await;

        assert_eq!(resp.id, req.id);
        assert_eq!(resp.message_type, "send_mail");
        assert_eq!(Value::Object(resp.message_data), json!({ "message": "success" }));

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Reset password");
    }

    #[tokio::test]
    async fn send_mail_missing_email() {
        // ---
        let mailer = Arc::new(RecordingMailer::default());
        let dispatcher = Dispatcher::new(mailer.clone());
        let mut data = full_mail();
        data.as_object_mut().unwrap().remove("email");

        let resp = dispatcher.handle(&request("send_mail", data)).await;

        assert_eq!(
            Value::Object(resp.message_data),
            json!({ "error": "missing 'email'" })
        );
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_message_type() {
        // ---
        let dispatcher = Dispatcher::new(Arc::new(RecordingMailer::default()));
        let req = request("unknown", json!({}));

        let resp = dispatcher.handle(&req).await;

        assert_eq!(resp.id, req.id);
        assert_eq!(resp.message_type, "unknown");
        assert_eq!(
            Value::Object(resp.message_data),
            json!({ "error": "unknown message type" })
        );
    }

    #[tokio::test]
    async fn mailer_failure_text_is_forwarded() {
        // ---
        let mailer = RecordingMailer {
            fail_with: Some("smtp: connection refused".into()),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(mailer));

        let resp = dispatcher.handle(&request("send_mail", full_mail())).await;

        assert_eq!(
            Value::Object(resp.message_data),
            json!({ "error": "smtp: connection refused" })
        );
    }
}
