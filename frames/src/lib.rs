//! Replication envelope and protobuf codec for the canvas relay.
//!
//! This crate owns the wire representation shared by the relay server and
//! every participant. Payloads stay flexible (`serde_json::Value`) while the
//! envelope is encoded over protobuf for compact binary transport.
//!
//! Numbers inside `data` travel as protobuf doubles. On decode, a whole
//! number within the exactly representable range (below 2^53) comes back as a
//! JSON integer, so `3` survives the wire as `3`, not `3.0`. A whole number
//! sent as a float (`3.0`) therefore also decodes as `3`. Anything that must
//! stay integral beyond that range (timestamps, sequence numbers) lives in a
//! dedicated envelope field instead.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `kind` integer on the wire does not map to a known [`Kind`] variant.
    #[error("invalid frame kind: {0}")]
    InvalidKind(i32),
}

/// Message kind carried by an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Kind {
    Create,
    Update,
    Delete,
    ReorderRequest,
    ReorderConfirm,
    Lock,
    Unlock,
    LockStateRequest,
    LockStateResponse,
}

impl Kind {
    /// Convert kind into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Create => WireKind::Create as i32,
            Self::Update => WireKind::Update as i32,
            Self::Delete => WireKind::Delete as i32,
            Self::ReorderRequest => WireKind::ReorderRequest as i32,
            Self::ReorderConfirm => WireKind::ReorderConfirm as i32,
            Self::Lock => WireKind::Lock as i32,
            Self::Unlock => WireKind::Unlock as i32,
            Self::LockStateRequest => WireKind::LockStateRequest as i32,
            Self::LockStateResponse => WireKind::LockStateResponse as i32,
        }
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireKind::try_from(value) {
            Ok(WireKind::Create) => Ok(Self::Create),
            Ok(WireKind::Update) => Ok(Self::Update),
            Ok(WireKind::Delete) => Ok(Self::Delete),
            Ok(WireKind::ReorderRequest) => Ok(Self::ReorderRequest),
            Ok(WireKind::ReorderConfirm) => Ok(Self::ReorderConfirm),
            Ok(WireKind::Lock) => Ok(Self::Lock),
            Ok(WireKind::Unlock) => Ok(Self::Unlock),
            Ok(WireKind::LockStateRequest) => Ok(Self::LockStateRequest),
            Ok(WireKind::LockStateResponse) => Ok(Self::LockStateResponse),
            Err(_) => Err(CodecError::InvalidKind(value)),
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ReorderRequest => "reorderRequest",
            Self::ReorderConfirm => "reorderConfirm",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::LockStateRequest => "lockStateRequest",
            Self::LockStateResponse => "lockStateResponse",
        }
    }
}

/// A single replication message on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique identifier for this frame (UUID string).
    pub id: String,
    /// Sender's logical timestamp in milliseconds.
    pub ts: i64,
    /// Room the frame belongs to, stamped by the relay.
    pub room: Option<String>,
    /// Participant that produced the frame (UUID string).
    pub sender: String,
    /// What the frame asks receivers to do.
    pub kind: Kind,
    /// Target object, for object-scoped kinds.
    pub object_id: Option<String>,
    /// Authority-assigned sequence number (`reorderConfirm` only).
    pub sequence: Option<u64>,
    /// Arbitrary JSON payload.
    pub data: Value,
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec<u8> cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidKind`] for out-of-range kind values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    wire_to_frame(wire)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        id: frame.id.clone(),
        ts: frame.ts,
        room: frame.room.clone(),
        sender: frame.sender.clone(),
        kind: frame.kind.as_i32(),
        object_id: frame.object_id.clone(),
        sequence: frame.sequence,
        data: Some(json_to_proto_value(&frame.data)),
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, CodecError> {
    Ok(Frame {
        id: wire.id,
        ts: wire.ts,
        room: wire.room,
        sender: wire.sender,
        kind: Kind::from_i32(wire.kind)?,
        object_id: wire.object_id,
        sequence: wire.sequence,
        data: wire
            .data
            .map_or(Value::Object(Map::new()), |v| proto_to_json_value(&v)),
    })
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    use prost_types::value::Kind as ProtoKind;

    let kind = match value {
        Value::Null => ProtoKind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(v) => ProtoKind::BoolValue(*v),
        Value::Number(v) => ProtoKind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => ProtoKind::StringValue(v.clone()),
        Value::Array(v) => ProtoKind::ListValue(prost_types::ListValue { values: v.iter().map(json_to_proto_value).collect() }),
        Value::Object(v) => ProtoKind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    use prost_types::value::Kind as ProtoKind;

    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        ProtoKind::NullValue(_) => Value::Null,
        ProtoKind::NumberValue(v) => number_from_wire(*v),
        ProtoKind::StringValue(v) => Value::String(v.clone()),
        ProtoKind::BoolValue(v) => Value::Bool(*v),
        ProtoKind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        ProtoKind::ListValue(v) => Value::Array(v.values.iter().map(proto_to_json_value).collect()),
    }
}

/// Largest magnitude at which every whole `f64` is exactly an integer.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[allow(clippy::cast_possible_truncation)]
fn number_from_wire(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < MAX_SAFE_INTEGER {
        return Value::Number((v as i64).into());
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(int64, tag = "2")]
    ts: i64,
    #[prost(string, optional, tag = "3")]
    room: Option<String>,
    #[prost(string, tag = "4")]
    sender: String,
    #[prost(enumeration = "WireKind", tag = "5")]
    kind: i32,
    #[prost(string, optional, tag = "6")]
    object_id: Option<String>,
    #[prost(uint64, optional, tag = "7")]
    sequence: Option<u64>,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireKind {
    Create = 0,
    Update = 1,
    Delete = 2,
    ReorderRequest = 3,
    ReorderConfirm = 4,
    Lock = 5,
    Unlock = 6,
    LockStateRequest = 7,
    LockStateResponse = 8,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
