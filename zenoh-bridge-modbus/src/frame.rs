//! Two-part frame codec.
//!
//! A frame on the bus is a mode tag plus a JSON body:
//!
//! ```text
//! part 1: tcp | rtu | ascii
//! part 2: {"tid": 42, "data": <any>, "status": "ok" | "error"}
//! ```
//!
//! Binary payloads travel inside `data` as `{"$bytes": "<base64>"}`. A
//! structured value that would read back as a tag (an object whose only key
//! is `$bytes` or `$value`) is wrapped as `{"$value": <value>}` on encode.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Key used to tag base64-encoded binary payloads.
const BYTES_TAG: &str = "$bytes";
/// Key used to wrap a structured value that looks like a tag.
const VALUE_TAG: &str = "$value";

/// Transaction id chosen by the caller to correlate a response with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(pub i64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Tid {
    fn from(value: i64) -> Self {
        Tid(value)
    }
}

/// How unrecognized mode tags are treated on decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModePolicy {
    /// Only `tcp`, `rtu` and `ascii` are accepted.
    #[default]
    Strict,
    /// Any key-safe tag is accepted and carried as [`Mode::Other`].
    Permissive,
}

/// Physical Modbus transport a frame pertains to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    Tcp,
    Rtu,
    Ascii,
    /// Bridge-specific extension, only produced under [`ModePolicy::Permissive`].
    Other(String),
}

impl Mode {
    /// Wire tag for this mode.
    pub fn as_str(&self) -> &str {
        match self {
            Mode::Tcp => "tcp",
            Mode::Rtu => "rtu",
            Mode::Ascii => "ascii",
            Mode::Other(tag) => tag,
        }
    }

    /// Parse a wire tag. Tags are case-sensitive.
    pub fn parse(tag: &str, policy: ModePolicy) -> Option<Mode> {
        match tag {
            "tcp" => Some(Mode::Tcp),
            "rtu" => Some(Mode::Rtu),
            "ascii" => Some(Mode::Ascii),
            other if policy == ModePolicy::Permissive && is_key_safe(other) => {
                Some(Mode::Other(other.to_string()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension tags become a key-expression chunk on the way out.
pub(crate) fn is_key_safe(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Outcome carried by a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// Opaque frame payload. The bridge never looks inside.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Value(Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// JSON representation used on the wire.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Value(value) if sole_key(value).is_some() => {
                tagged(VALUE_TAG, value.clone())
            }
            Payload::Value(value) => value.clone(),
            Payload::Bytes(bytes) => tagged(BYTES_TAG, Value::String(BASE64.encode(bytes))),
        }
    }

    /// Inverse of [`to_json`](Self::to_json).
    pub fn from_json(value: Value) -> Result<Payload, String> {
        let Value::Object(mut map) = value else {
            return Ok(Payload::Value(value));
        };

        match sole_key_of(&map) {
            Some(VALUE_TAG) => Ok(Payload::Value(map.remove(VALUE_TAG).unwrap_or_default())),
            Some(BYTES_TAG) => match map.remove(BYTES_TAG) {
                Some(Value::String(encoded)) => BASE64
                    .decode(&encoded)
                    .map(Payload::Bytes)
                    .map_err(|e| format!("invalid {} payload: {}", BYTES_TAG, e)),
                other => Err(format!(
                    "invalid {} payload: expected a base64 string, got {}",
                    BYTES_TAG,
                    other.unwrap_or_default()
                )),
            },
            _ => Ok(Payload::Value(Value::Object(map))),
        }
    }
}

fn tagged(tag: &str, inner: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(tag.to_string(), inner);
    Value::Object(map)
}

/// The tag an object would be read back as, if any.
fn sole_key(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) => sole_key_of(map),
        _ => None,
    }
}

fn sole_key_of(map: &Map<String, Value>) -> Option<&'static str> {
    if map.len() != 1 {
        return None;
    }
    [BYTES_TAG, VALUE_TAG]
        .into_iter()
        .find(|tag| map.contains_key(*tag))
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Value(Value::Null)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

/// One correlated request or response unit. Never mutated once built;
/// a response is a new frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub mode: Mode,
    pub tid: Tid,
    pub data: Payload,
    pub status: Status,
}

impl Frame {
    /// A request (or successful response) frame.
    pub fn ok(mode: Mode, tid: Tid, data: impl Into<Payload>) -> Self {
        Self {
            mode,
            tid,
            data: data.into(),
            status: Status::Ok,
        }
    }

    /// An error response frame with a `{kind, message}` payload.
    pub fn error(mode: Mode, tid: Tid, kind: &str, message: impl Into<String>) -> Self {
        Self {
            mode,
            tid,
            data: Payload::Value(serde_json::json!({
                "kind": kind,
                "message": message.into(),
            })),
            status: Status::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// The two wire parts of a frame, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub mode: String,
    pub body: Vec<u8>,
}

impl RawFrame {
    pub fn new(mode: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            mode: mode.into(),
            body: body.into(),
        }
    }
}

/// Decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Body is not valid JSON, not an object, or a field has the wrong shape.
    /// `tid` is set when it could still be recovered.
    #[error("malformed frame body: {reason}")]
    MalformedBody { tid: Option<Tid>, reason: String },

    /// Mode tag is not recognized under the active policy.
    #[error("unknown mode tag '{mode}'")]
    UnknownMode { mode: String, tid: Tid },
}

impl FrameError {
    /// Transaction id, if it survived decoding.
    pub fn tid(&self) -> Option<Tid> {
        match self {
            FrameError::MalformedBody { tid, .. } => *tid,
            FrameError::UnknownMode { tid, .. } => Some(*tid),
        }
    }

    /// Stable snake_case name used in error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameError::MalformedBody { .. } => "malformed_body",
            FrameError::UnknownMode { .. } => "unknown_mode",
        }
    }
}

/// Everything in the body but `tid`, which is read first on its own.
#[derive(Deserialize)]
struct Body {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    status: Status,
}

/// Pure transform between [`RawFrame`] and [`Frame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    policy: ModePolicy,
}

impl FrameCodec {
    pub fn new(policy: ModePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ModePolicy {
        self.policy
    }

    /// Decode a raw frame.
    pub fn decode(&self, raw: &RawFrame) -> Result<Frame, FrameError> {
        self.decode_parts(&raw.mode, &raw.body)
    }

    /// Decode the two wire parts. The body is checked first so that a bad
    /// mode tag still reports the transaction id.
    pub fn decode_parts(&self, mode: &str, body: &[u8]) -> Result<Frame, FrameError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| FrameError::MalformedBody {
            tid: None,
            reason: e.to_string(),
        })?;

        let Some(tid) = value.get("tid").and_then(Value::as_i64).map(Tid) else {
            return Err(FrameError::MalformedBody {
                tid: None,
                reason: "missing or non-integer 'tid'".to_string(),
            });
        };

        let body: Body = serde_json::from_value(value).map_err(|e| FrameError::MalformedBody {
            tid: Some(tid),
            reason: e.to_string(),
        })?;

        let data = Payload::from_json(body.data).map_err(|reason| FrameError::MalformedBody {
            tid: Some(tid),
            reason,
        })?;

        let mode = Mode::parse(mode, self.policy).ok_or_else(|| FrameError::UnknownMode {
            mode: mode.to_string(),
            tid,
        })?;

        Ok(Frame {
            mode,
            tid,
            data,
            status: body.status,
        })
    }

    /// Encode a frame. Total: every frame has a wire form.
    pub fn encode(frame: &Frame) -> RawFrame {
        let body = serde_json::json!({
            "tid": frame.tid,
            "data": frame.data.to_json(),
            "status": frame.status,
        });

        RawFrame {
            mode: frame.mode.as_str().to_string(),
            body: body.to_string().into_bytes(),
        }
    }
}
