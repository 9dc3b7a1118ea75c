use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the payload media type
pub const CONTENT_TYPE: &str = "contentType";
/// Header linking split fragments to the record they came from
pub const CORRELATION_ID: &str = "correlationId";
/// 1-based position of a fragment within its split
pub const SEQUENCE_NUMBER: &str = "sequenceNumber";
/// Number of fragments produced by a split
pub const SEQUENCE_SIZE: &str = "sequenceSize";
/// Per-record delivery mode override for broker stages
pub const DELIVERY_MODE: &str = "amqp_deliveryMode";

/// Content type assumed when a byte payload carries no `contentType` header
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Record metadata, ordered so that serialized output is stable
pub type Headers = BTreeMap<String, Value>;

pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Opaque record payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Structured(Value),
}

impl Payload {
    /// Size of the payload in bytes as it would go over the wire
    pub fn size(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Text(s) => s.len(),
            Payload::Structured(v) => serde_json::to_vec(v).map(|v| v.len()).unwrap_or(0),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Payload::Bytes(_))
    }

    /// Wire representation of the payload
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Bytes(b) => b.clone(),
            Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Payload::Structured(v) => Bytes::from(serde_json::to_vec(v).unwrap_or_default()),
        }
    }

    /// View of the payload used by expressions. Undecoded bytes are read as lossy UTF-8.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            Payload::Text(s) => Value::String(s.clone()),
            Payload::Structured(v) => v.clone(),
        }
    }

    /// Inverse of [`Payload::to_value`]: strings become text, anything else stays structured
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Payload::Text(s),
            other => Payload::Structured(other),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Structured(v)
    }
}

/// One unit of message data: payload plus headers.
///
/// Records are immutable. Every `with_*` helper returns a new record with a
/// fresh id; the original is left untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RecordEnvelope")]
pub struct Record {
    id: Uuid,
    timestamp_ns: u64,
    payload: Payload,
    headers: Headers,
}

impl Record {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::from_parts(payload.into(), Headers::new())
    }

    pub fn builder(payload: impl Into<Payload>) -> RecordBuilder {
        RecordBuilder {
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    fn from_parts(payload: Payload, headers: Headers) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_ns: current_timestamp_ns(),
            payload,
            headers,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Header rendered as a string; non-string scalars use their JSON text
    pub fn header_str(&self, name: &str) -> Option<String> {
        match self.headers.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn content_type(&self) -> String {
        self.header_str(CONTENT_TYPE)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }

    /// New record with the same headers and a different payload
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Record {
        Self::from_parts(payload.into(), self.headers.clone())
    }

    /// New record with one header added or replaced
    pub fn with_header(&self, name: impl Into<String>, value: impl Into<Value>) -> Record {
        let mut headers = self.headers.clone();
        headers.insert(name.into(), value.into());
        Self::from_parts(self.payload.clone(), headers)
    }

    /// Decode a byte payload into text when the content type is textual.
    ///
    /// Decoding changes the representation, not the message, so id and
    /// timestamp are kept.
    pub fn decode_text(self) -> Record {
        let Payload::Bytes(bytes) = &self.payload else {
            return self;
        };
        let content_type = self.content_type();
        if !is_textual(&content_type) {
            return self;
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        Record {
            payload: Payload::Text(text),
            ..self
        }
    }
}

fn is_textual(content_type: &str) -> bool {
    content_type.contains("text")
        || content_type.contains("json")
        || content_type.contains("x-spring-tuple")
}

#[derive(Debug)]
pub struct RecordBuilder {
    payload: Payload,
    headers: Headers,
}

impl RecordBuilder {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        self.header(CONTENT_TYPE, content_type.into())
    }

    pub fn build(self) -> Record {
        Record::from_parts(self.payload, self.headers)
    }
}

/// Why a JSON line could not be read as a record
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("record may carry 'payload' or 'payload_base64', not both")]
    AmbiguousPayload,

    #[error("invalid payload_base64: {0}")]
    InvalidBase64(String),
}

/// Wire shape used by the runner: `{"payload": ..., "headers": {...}}`
#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    payload_base64: Option<String>,
    #[serde(default)]
    headers: Headers,
}

impl TryFrom<RecordEnvelope> for Record {
    type Error = EnvelopeError;

    fn try_from(envelope: RecordEnvelope) -> Result<Self, Self::Error> {
        let payload = match (envelope.payload, envelope.payload_base64) {
            (Some(_), Some(_)) => return Err(EnvelopeError::AmbiguousPayload),
            (Some(value), None) => Payload::from_value(value),
            (None, Some(encoded)) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| EnvelopeError::InvalidBase64(e.to_string()))?;
                Payload::Bytes(Bytes::from(decoded))
            }
            (None, None) => Payload::Structured(Value::Null),
        };
        Ok(Record::from_parts(payload, envelope.headers))
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct View<'a> {
            id: String,
            timestamp_ns: u64,
            #[serde(skip_serializing_if = "Option::is_none")]
            payload: Option<Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            payload_base64: Option<String>,
            headers: &'a Headers,
        }

        let (payload, payload_base64) = match &self.payload {
            Payload::Bytes(b) => (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(b)),
            ),
            other => (Some(other.to_value()), None),
        };

        View {
            id: self.id.to_string(),
            timestamp_ns: self.timestamp_ns,
            payload,
            payload_base64,
            headers: &self.headers,
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_payload_copies_headers() {
        let original = Record::builder("hello").header("dest", "Q2").build();
        let derived = original.with_payload(json!({"n": 1}));

        assert_eq!(derived.header_str("dest").as_deref(), Some("Q2"));
        assert_eq!(derived.payload(), &Payload::Structured(json!({"n": 1})));
        assert_ne!(derived.id(), original.id());
        // Original untouched
        assert_eq!(original.payload(), &Payload::Text("hello".to_string()));
    }

    #[test]
    fn test_decode_text_defaults_to_json_content_type() {
        let record = Record::new(b"{\"a\":1}".to_vec());
        let id = record.id();
        let decoded = record.decode_text();

        assert_eq!(decoded.payload(), &Payload::Text("{\"a\":1}".to_string()));
        assert_eq!(decoded.id(), id);
    }

    #[test]
    fn test_decode_text_skips_binary_content() {
        let record = Record::builder(vec![0xde, 0xad])
            .content_type("application/octet-stream")
            .build();
        let decoded = record.decode_text();
        assert!(decoded.payload().is_bytes());
    }

    #[test]
    fn test_decode_text_accepts_text_and_tuple_types() {
        for ct in ["text/plain", "application/x-spring-tuple", "application/json;charset=UTF-8"] {
            let record = Record::builder(b"abc".to_vec()).content_type(ct).build();
            assert_eq!(record.decode_text().payload().as_text(), Some("abc"), "{}", ct);
        }
    }

    #[test]
    fn test_header_str_renders_scalars() {
        let record = Record::builder("x")
            .header("n", 7)
            .header("flag", true)
            .header("nothing", Value::Null)
            .build();
        assert_eq!(record.header_str("n").as_deref(), Some("7"));
        assert_eq!(record.header_str("flag").as_deref(), Some("true"));
        assert_eq!(record.header_str("nothing"), None);
        assert_eq!(record.header_str("missing"), None);
    }

    #[test]
    fn test_deserialize_envelope() {
        let record: Record =
            serde_json::from_str(r#"{"payload":"hello","headers":{"dest":"Q2"}}"#).unwrap();
        assert_eq!(record.payload().as_text(), Some("hello"));
        assert_eq!(record.header_str("dest").as_deref(), Some("Q2"));

        let structured: Record = serde_json::from_str(r#"{"payload":{"id":3}}"#).unwrap();
        assert_eq!(structured.payload(), &Payload::Structured(json!({"id": 3})));

        let raw: Record = serde_json::from_str(r#"{"payload_base64":"aGk="}"#).unwrap();
        assert_eq!(raw.payload(), &Payload::Bytes(Bytes::from_static(b"hi")));
    }

    #[test]
    fn test_deserialize_rejects_ambiguous_payload() {
        let err = serde_json::from_str::<Record>(r#"{"payload":"a","payload_base64":"aGk="}"#)
            .unwrap_err();
        assert!(err.is_data());
        assert!(err
            .to_string()
            .contains(&EnvelopeError::AmbiguousPayload.to_string()));

        let err = serde_json::from_str::<Record>(r#"{"payload_base64":"not base64!"}"#).unwrap_err();
        assert!(err.to_string().starts_with("invalid payload_base64"));
    }

    #[test]
    fn test_serialize_bytes_as_base64() {
        let record = Record::new(b"hi".to_vec());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["payload_base64"], "aGk=");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_payload_size() {
        assert_eq!(Payload::from("abc").size(), 3);
        assert_eq!(Payload::from(vec![1u8, 2]).size(), 2);
        assert_eq!(Payload::from(json!([1, 2])).size(), 5);
    }
}
