//! Envelope codec.
//!
//! Every message on the broker is a JSON object carrying a small set of
//! header fields next to an arbitrary payload:
//!
//! ```text
//! { "uuid": "<peer>", "time": 1700000000.123, "checksum": "<sha256 hex>",
//!   "command"?: "...", "requested_checksum"?: "...", "attempt"?: 0,
//!   ...payload }
//! ```
//!
//! The checksum is a SHA-256 digest of the canonical encoding (keys sorted
//! recursively) of every field except `checksum` itself. Peers reuse it as a
//! correlation token: a reply names the message it answers by echoing its
//! checksum in `requested_checksum`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Content type advertised on every published envelope.
pub const CONTENT_TYPE: &str = "application/json";

pub const UUID_FIELD: &str = "uuid";
pub const TIME_FIELD: &str = "time";
pub const CHECKSUM_FIELD: &str = "checksum";
pub const COMMAND_FIELD: &str = "command";
pub const REQUESTED_CHECKSUM_FIELD: &str = "requested_checksum";
pub const ATTEMPT_FIELD: &str = "attempt";

/// Fields owned by the envelope rather than the payload.
pub const HEADER_FIELDS: [&str; 6] = [
    UUID_FIELD,
    TIME_FIELD,
    CHECKSUM_FIELD,
    COMMAND_FIELD,
    REQUESTED_CHECKSUM_FIELD,
    ATTEMPT_FIELD,
];

/// Arbitrary key/value payload of an envelope.
pub type Payload = Map<String, Value>;

/// Errors produced by the codec.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Payload field '{0}' is reserved for envelope headers")]
    ReservedField(String),
}

/// Hex digest identifying an envelope's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of a peer (agent or api) on the broker.
///
/// Constructed once at startup and handed to the components that publish
/// or listen on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional header fields set by the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// Command kind, set on command queue messages.
    pub command: Option<String>,
    /// Checksum of the message this one replies to.
    pub requested_checksum: Option<Checksum>,
    /// Attempt number of a retried request.
    pub attempt: Option<u32>,
}

impl Headers {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn reply_to(checksum: &Checksum) -> Self {
        Self {
            requested_checksum: Some(checksum.clone()),
            ..Default::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Payload,
}

impl Envelope {
    /// Identity of the sender.
    pub fn uuid(&self) -> PeerId {
        PeerId::new(self.str_field(UUID_FIELD).unwrap_or_default())
    }

    pub fn time(&self) -> Option<f64> {
        self.fields.get(TIME_FIELD).and_then(Value::as_f64)
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::new(self.str_field(CHECKSUM_FIELD).unwrap_or_default())
    }

    pub fn command(&self) -> Option<&str> {
        self.str_field(COMMAND_FIELD)
    }

    pub fn requested_checksum(&self) -> Option<Checksum> {
        self.str_field(REQUESTED_CHECKSUM_FIELD).map(Checksum::new)
    }

    pub fn attempt(&self) -> Option<u32> {
        self.fields
            .get(ATTEMPT_FIELD)
            .and_then(Value::as_u64)
            .and_then(|a| u32::try_from(a).ok())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All fields, headers included.
    pub fn fields(&self) -> &Payload {
        &self.fields
    }

    /// The payload with every header field removed.
    pub fn payload(&self) -> Payload {
        self.fields
            .iter()
            .filter(|(k, _)| !HEADER_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether the stored checksum matches the content.
    pub fn verify(&self) -> bool {
        let mut fields = self.fields.clone();
        fields.remove(CHECKSUM_FIELD);
        checksum(&fields) == self.checksum()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Recursively rebuild a value with object keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

fn canonical_bytes(fields: &Payload) -> Vec<u8> {
    // Serializing a Value tree cannot fail: every key is a string.
    serde_json::to_vec(&canonical(&Value::Object(fields.clone()))).unwrap_or_default()
}

/// Checksum of a field set. Pure: key order does not matter.
pub fn checksum(fields: &Payload) -> Checksum {
    let digest = Sha256::digest(canonical_bytes(fields));
    Checksum(hex::encode(digest))
}

/// Compute the checksum of `fields`, append it, and serialize.
///
/// Any `checksum` already present in `fields` is replaced.
pub fn encode(mut fields: Payload) -> Result<(Checksum, Vec<u8>), EnvelopeError> {
    fields.remove(CHECKSUM_FIELD);
    let sum = checksum(&fields);
    fields.insert(CHECKSUM_FIELD.to_string(), Value::String(sum.0.clone()));
    let bytes = serde_json::to_vec(&canonical(&Value::Object(fields)))?;
    Ok((sum, bytes))
}

/// Parse bytes received from the broker.
///
/// Fails with [`EnvelopeError::Malformed`] when the bytes are not a JSON
/// object carrying string `uuid` and `checksum` fields.
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    let Value::Object(fields) = value else {
        return Err(EnvelopeError::Malformed(
            "envelope is not a JSON object".to_string(),
        ));
    };

    for required in [UUID_FIELD, CHECKSUM_FIELD] {
        if !fields.get(required).is_some_and(Value::is_string) {
            return Err(EnvelopeError::Malformed(format!(
                "missing string field '{}'",
                required
            )));
        }
    }

    Ok(Envelope { fields })
}

/// Build and encode an envelope stamped with an explicit time.
///
/// Fails with [`EnvelopeError::ReservedField`] when the payload uses a
/// header field name; the receiver could not tell the two apart.
pub fn seal_at(
    sender: &PeerId,
    headers: &Headers,
    payload: Payload,
    time: f64,
) -> Result<(Checksum, Vec<u8>), EnvelopeError> {
    if let Some(reserved) = payload.keys().find(|k| HEADER_FIELDS.contains(&k.as_str())) {
        return Err(EnvelopeError::ReservedField(reserved.clone()));
    }

    let mut fields = payload;
    fields.insert(UUID_FIELD.to_string(), Value::from(sender.as_str()));
    fields.insert(TIME_FIELD.to_string(), Value::from(time));
    if let Some(command) = &headers.command {
        fields.insert(COMMAND_FIELD.to_string(), Value::from(command.as_str()));
    }
    if let Some(requested) = &headers.requested_checksum {
        fields.insert(
            REQUESTED_CHECKSUM_FIELD.to_string(),
            Value::from(requested.as_str()),
        );
    }
    if let Some(attempt) = headers.attempt {
        fields.insert(ATTEMPT_FIELD.to_string(), Value::from(attempt));
    }
    encode(fields)
}

/// Build and encode an envelope stamped with the current time.
pub fn seal(
    sender: &PeerId,
    headers: &Headers,
    payload: Payload,
) -> Result<(Checksum, Vec<u8>), EnvelopeError> {
    seal_at(sender, headers, payload, now())
}

/// Seconds since the Unix epoch.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = payload(json!({"name": "vm1", "cpu": 1, "mem": 512}));
        let mut b = Payload::new();
        b.insert("mem".into(), json!(512));
        b.insert("cpu".into(), json!(1));
        b.insert("name".into(), json!("vm1"));

        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn test_checksum_ignores_nested_key_order() {
        let a = payload(json!({"disk": {"size": 128, "kind": "ssd"}}));
        let b = payload(json!({"disk": {"kind": "ssd", "size": 128}}));
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn test_checksum_changes_with_any_field() {
        let base = payload(json!({"name": "vm1", "cpu": 1, "mem": 512}));
        let changed = payload(json!({"name": "vm1", "cpu": 1, "mem": 513}));
        let renamed = payload(json!({"name": "vm2", "cpu": 1, "mem": 512}));

        assert_ne!(checksum(&base), checksum(&changed));
        assert_ne!(checksum(&base), checksum(&renamed));
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        let sum = checksum(&Payload::new());
        assert_eq!(sum.as_str().len(), 64);
        assert!(sum.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_encode_appends_checksum() {
        let fields = payload(json!({"uuid": "peer", "time": 1.5, "name": "vm1"}));
        let (sum, bytes) = encode(fields.clone()).unwrap();

        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.checksum(), sum);
        assert_eq!(sum, checksum(&fields));
        assert!(envelope.verify());
    }

    #[test]
    fn test_encode_replaces_stale_checksum() {
        let mut fields = payload(json!({"uuid": "peer", "name": "vm1"}));
        let expected = checksum(&fields);
        fields.insert(CHECKSUM_FIELD.into(), json!("stale"));

        let (sum, _) = encode(fields).unwrap();
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_seal_at_is_deterministic() {
        let peer = PeerId::new("peer-1");
        let headers = Headers::command("machine-requested").with_attempt(0);
        let body = payload(json!({"name": "vm1"}));

        let (a, bytes_a) = seal_at(&peer, &headers, body.clone(), 10.0).unwrap();
        let (b, bytes_b) = seal_at(&peer, &headers, body, 10.0).unwrap();
        assert_eq!(a, b);
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_seal_headers_round_trip() {
        let peer = PeerId::new("peer-1");
        let request = Checksum::new("abc");
        let headers = Headers::reply_to(&request).with_attempt(3);
        let (_, bytes) =
            seal_at(&peer, &headers, payload(json!({"host": "10.0.0.5"})), 2.0).unwrap();

        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.uuid(), peer);
        assert_eq!(envelope.time(), Some(2.0));
        assert_eq!(envelope.requested_checksum(), Some(request));
        assert_eq!(envelope.attempt(), Some(3));
        assert_eq!(envelope.command(), None);
        assert_eq!(envelope.payload(), payload(json!({"host": "10.0.0.5"})));
    }

    #[test]
    fn test_seal_rejects_reserved_payload_fields() {
        let peer = PeerId::new("peer-1");
        for field in ["time", "command", "attempt", "uuid"] {
            let mut body = payload(json!({"host": "10.0.0.5"}));
            body.insert(field.to_string(), json!(1));

            match seal_at(&peer, &Headers::default(), body, 1.0) {
                Err(EnvelopeError::ReservedField(name)) => assert_eq!(name, field),
                other => panic!("expected {} to be rejected, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let result = decode(b"\x00\x01not json");
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let result = decode(b"[1, 2, 3]");
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_decode_requires_identity_fields() {
        let result = decode(br#"{"uuid": "peer"}"#);
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }
}
