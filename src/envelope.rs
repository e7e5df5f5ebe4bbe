//! Envelope codec.
//!
//! Two envelope shapes travel over the broker:
//!
//! ```text
//! Request:  { "kind": "request",  "id", "message_type", "message_data", "reply_to" }
//! Response: { "kind": "response", "id", "message_type", "message_data" }
//! ```
//!
//! `kind` is written by every encoder in this crate and decides the shape on
//! decode. Payloads from participants that do not send `kind` are still
//! accepted: a non-empty `reply_to` marks a request, anything else a response.
//! Each payload is decoded exactly once.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Address, CorrelationId, Error, Result};

/// Open key/value payload carried in `message_data`.
pub type MessageData = Map<String, Value>;

/// A request for work, answered on `reply_to`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: CorrelationId,
    pub message_type: String,
    pub message_data: MessageData,
    pub reply_to: Address,
}

/// The reply to a [`RequestEnvelope`], carrying the same `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: CorrelationId,
    pub message_type: String,
    pub message_data: MessageData,
}

impl ResponseEnvelope {
    /// Text of the `error` key, if the handler reported a failure.
    pub fn error(&self) -> Option<&str> {
        match self.message_data.get("error") {
            Some(Value::String(text)) => Some(text),
            Some(_) => Some("malformed error reply"),
            None => None,
        }
    }
}

/// Either envelope shape, tagged on the wire by `kind`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Envelope {
    pub fn id(&self) -> &CorrelationId {
        match self {
            Envelope::Request(req) => &req.id,
            Envelope::Response(resp) => &resp.id,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Request(_) => EnvelopeKind::Request,
            Envelope::Response(_) => EnvelopeKind::Response,
        }
    }
}

impl From<RequestEnvelope> for Envelope {
    fn from(value: RequestEnvelope) -> Self {
        Envelope::Request(value)
    }
}

impl From<ResponseEnvelope> for Envelope {
    fn from(value: ResponseEnvelope) -> Self {
        Envelope::Response(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// Everything either shape may carry. Unknown fields are ignored.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    kind: Option<EnvelopeKind>,
    id: CorrelationId,
    message_type: String,
    message_data: MessageData,
    #[serde(default)]
    reply_to: Option<Address>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        // ---
        if wire.id.is_empty() {
            return Err(Error::InvalidEnvelope("empty id".into()));
        }

        let reply_to = wire.reply_to.filter(|addr| !addr.is_empty());

        let inferred = if reply_to.is_some() {
            EnvelopeKind::Request
        } else {
            EnvelopeKind::Response
        };
        let kind = wire.kind.unwrap_or(inferred);

        match kind {
            EnvelopeKind::Request => {
                let reply_to = reply_to.ok_or_else(|| {
                    Error::InvalidEnvelope(format!("request {} has no reply_to", wire.id))
                })?;
                Ok(Envelope::Request(RequestEnvelope {
                    id: wire.id,
                    message_type: wire.message_type,
                    message_data: wire.message_data,
                    reply_to,
                }))
            }
            EnvelopeKind::Response => Ok(Envelope::Response(ResponseEnvelope {
                id: wire.id,
                message_type: wire.message_type,
                message_data: wire.message_data,
            })),
        }
    }
}

/// Encode an envelope as a JSON object.
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let bytes = serde_json::to_vec(envelope)?;
    Ok(Bytes::from(bytes))
}

/// Decode a raw broker payload into an envelope.
///
/// # Errors
///
/// - [`Error::Serialization`] if the payload is not a JSON object holding
///   `id`, `message_type` and `message_data`.
/// - [`Error::InvalidEnvelope`] if `id` is empty or a request lacks `reply_to`.
pub fn decode(payload: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope = serde_json::from_slice(payload)?;
    Envelope::try_from(wire)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> MessageData {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope {
            id: CorrelationId::generate(),
            message_type: "send_mail".into(),
            message_data: data(json!({ "to": "a@example.com", "attempt": 2, "tags": ["x"] })),
            reply_to: Address::from("mail.reply.node-1"),
        }
    }

    #[test]
    fn request_survives_encode_decode() {
        // ---
        let req = sample_request();
        let bytes = encode(&Envelope::from(req.clone())).unwrap();

        assert_eq!(decode(&bytes).unwrap(), Envelope::Request(req));
    }

    #[test]
    fn response_survives_encode_decode() {
        // ---
        let resp = ResponseEnvelope {
            id: CorrelationId::generate(),
            message_type: "send_mail".into(),
            message_data: data(json!({ "message": "success" })),
        };
        let bytes = encode(&Envelope::from(resp.clone())).unwrap();

        assert_eq!(decode(&bytes).unwrap(), Envelope::Response(resp));
    }

    #[test]
    fn wire_field_names_are_exact() {
        // ---
        let req = RequestEnvelope {
            id: "42".into(),
            message_type: "send_mail".into(),
            message_data: MessageData::new(),
            reply_to: Address::from("q"),
        };
        let value: Value = serde_json::from_slice(&encode(&req.into()).unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "kind": "request",
                "id": "42",
                "message_type": "send_mail",
                "message_data": {},
                "reply_to": "q",
            })
        );
    }

    #[test]
    fn untagged_payload_with_reply_to_is_a_request() {
        // ---
        let raw = br#"{"id":"1","message_type":"send_mail","message_data":{},"reply_to":"q"}"#;

        match decode(raw).unwrap() {
            Envelope::Request(req) => assert_eq!(req.reply_to.as_str(), "q"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn untagged_payload_without_reply_to_is_a_response() {
        // ---
        let raw = br#"{"id":"1","message_type":"send_mail","message_data":{"message":"success"},"extra":true}"#;

        assert_eq!(decode(raw).unwrap().kind(), EnvelopeKind::Response);
    }

    #[test]
    fn untagged_payload_with_empty_reply_to_is_a_response() {
        // ---
        let raw = br#"{"id":"1","message_type":"t","message_data":{},"reply_to":""}"#;

        assert_eq!(decode(raw).unwrap().kind(), EnvelopeKind::Response);
    }

    #[test]
    fn tagged_request_without_reply_to_is_rejected() {
        // ---
        let raw = br#"{"kind":"request","id":"1","message_type":"t","message_data":{}}"#;

        assert!(matches!(decode(raw), Err(Error::InvalidEnvelope(_))));
    }

    #[test]
    fn tagged_response_ignores_reply_to() {
        // ---
        let raw = br#"{"kind":"response","id":"1","message_type":"t","message_data":{},"reply_to":"q"}"#;

        assert_eq!(decode(raw).unwrap().kind(), EnvelopeKind::Response);
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        // ---
        let no_id = br#"{"message_type":"t","message_data":{}}"#;
        let no_type = br#"{"id":"1","message_data":{}}"#;
        let no_data = br#"{"id":"1","message_type":"t"}"#;

        assert!(matches!(decode(no_id), Err(Error::Serialization(_))));
        assert!(matches!(decode(no_type), Err(Error::Serialization(_))));
        assert!(matches!(decode(no_data), Err(Error::Serialization(_))));
    }

    #[test]
    fn empty_id_is_rejected() {
        // ---
        let raw = br#"{"id":"","message_type":"t","message_data":{}}"#;

        assert!(matches!(decode(raw), Err(Error::InvalidEnvelope(_))));
    }

    #[test]
    fn partial_json_is_rejected() {
        // ---
        let raw = br#"{"id":"1","message_type":"t","message_data":{"#;

        assert!(decode(raw).is_err());
        assert!(decode(b"").is_err());
        assert!(decode(b"[1,2,3]").is_err());
    }

    #[test]
    fn error_reply_text_is_exposed() {
        // ---
        let resp = ResponseEnvelope {
            id: "1".into(),
            message_type: "t".into(),
            message_data: data(json!({ "error": "missing 'to'" })),
        };

        assert_eq!(resp.error(), Some("missing 'to'"));
    }
}
