//! Typed view of `message_data`.
//!
//! The wire payload is an open JSON object. It is validated once here and
//! turned into a [`Command`], so handlers receive typed arguments.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::MessageData;

/// `message_type` tag for mail delivery.
pub const SEND_MAIL: &str = "send_mail";

/// A mail to deliver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    /// Address of the account the mail is sent on behalf of.
    pub email: String,
}

/// Failure while routing or executing a request.
///
/// The `Display` text is exactly what goes into the reply's `error` key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("missing '{0}'")]
    MissingField(&'static str),

    #[error("unknown message type")]
    UnknownMessageType(String),

    #[error("{0}")]
    Handler(String),
}

/// A validated request payload, one variant per supported `message_type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SendMail(Mail),
}

impl Command {
    /// Validate `data` against the schema of `message_type`.
    ///
    /// For `send_mail` the fields are checked in the order
    /// `to, subject, body, from, email`; the first one that is absent or not
    /// a string is reported.
    pub fn parse(message_type: &str, data: &MessageData) -> Result<Self, DispatchError> {
        match message_type {
            SEND_MAIL => {
                let to = required_str(data, "to")?;
                let subject = required_str(data, "subject")?;
                let body = required_str(data, "body")?;
                let from = required_str(data, "from")?;
                let email = required_str(data, "email")?;

                Ok(Command::SendMail(Mail {
                    to,
                    from,
                    subject,
                    body,
                    email,
                }))
            }
            other => Err(DispatchError::UnknownMessageType(other.to_owned())),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Command::SendMail(_) => SEND_MAIL,
        }
    }

    /// Render the command back into an open payload for the wire.
    pub fn into_data(self) -> MessageData {
        match self {
            Command::SendMail(mail) => {
                let mut data = MessageData::new();
                data.insert("to".into(), Value::String(mail.to));
                data.insert("from".into(), Value::String(mail.from));
                data.insert("subject".into(), Value::String(mail.subject));
                data.insert("body".into(), Value::String(mail.body));
                data.insert("email".into(), Value::String(mail.email));
                data
            }
        }
    }
}

fn required_str(data: &MessageData, field: &'static str) -> Result<String, DispatchError> {
    match data.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(DispatchError::MissingField(field)),
    }
}

/// Reply payload for a handler that completed.
pub fn success_data() -> MessageData {
    object(json!({ "message": "success" }))
}

/// Reply payload carrying a single `error` key.
pub fn error_data(message: impl Into<String>) -> MessageData {
    object(json!({ "error": message.into() }))
}

fn object(value: Value) -> MessageData {
    match value {
        Value::Object(map) => map,
        _ => MessageData::new(),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn mail() -> Mail {
        Mail {
            to: "user@example.com".into(),
            from: "noreply@example.com".into(),
            subject: "Welcome".into(),
            body: "Hello".into(),
            email: "ops@example.com".into(),
        }
    }

    #[test]
    fn send_mail_parses_into_typed_command() {
        // ---
        let data = Command::SendMail(mail()).into_data();

        assert_eq!(
            Command::parse(SEND_MAIL, &data),
            Ok(Command::SendMail(mail()))
        );
    }

    #[test]
    fn first_missing_field_wins_in_fixed_order() {
        // ---
        let mut data = Command::SendMail(mail()).into_data();
        data.remove("email");
        data.remove("body");

        assert_eq!(
            Command::parse(SEND_MAIL, &data),
            Err(DispatchError::MissingField("body"))
        );

        data.remove("to");
        assert_eq!(
            Command::parse(SEND_MAIL, &data).unwrap_err().to_string(),
            "missing 'to'"
        );
    }

    #[test]
    fn non_string_field_counts_as_missing() {
        // ---
        let mut data = Command::SendMail(mail()).into_data();
        data.insert("subject".into(), Value::from(7));

        assert_eq!(
            Command::parse(SEND_MAIL, &data),
            Err(DispatchError::MissingField("subject"))
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        // ---
        let err = Command::parse("reindex", &MessageData::new()).unwrap_err();

        assert_eq!(err, DispatchError::UnknownMessageType("reindex".into()));
        assert_eq!(err.to_string(), "unknown message type");
    }

    #[test]
    fn reply_payload_shapes() {
        // ---
        assert_eq!(Value::Object(success_data()), json!({ "message": "success" }));
        assert_eq!(Value::Object(error_data("boom")), json!({ "error": "boom" }));
    }
}
