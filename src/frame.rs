//! Typed replication messages over the `frames` wire envelope.
//!
//! ARCHITECTURE
//! ============
//! The relay only ever sees [`frames::Frame`]. Participants convert to and
//! from [`Envelope`], which pairs the sender and logical timestamp with one
//! strongly typed [`Message`].
//!
//! DESIGN
//! ======
//! - `ts` is the modification timestamp used for update arbitration.
//! - `object_id` is carried in the envelope for every per-object kind.
//! - Create payloads omit the modification stamp; the envelope `ts` is the
//!   stamp. Integral values never travel inside `data`.

use std::time::{SystemTime, UNIX_EPOCH};

use frames::{Frame, Kind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::board::lock::Lock;
use crate::board::object::{CanvasObject, Data, ObjectId, Origin, ParticipantId, Position};
use crate::board::rank::Rank;

const FIELD_PROPOSED_RANK: &str = "proposedRank";
const FIELD_RANK: &str = "rank";
const FIELD_LOCKS: &str = "locks";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] frames::CodecError),
    #[error("invalid uuid in {field}: {value}")]
    InvalidId { field: &'static str, value: String },
    #[error("{0} frame is missing object_id")]
    MissingObjectId(&'static str),
    #[error("reorderConfirm frame is missing sequence")]
    MissingSequence,
    #[error("malformed {kind} payload: {source}")]
    Payload { kind: &'static str, source: serde_json::Error },
}

/// One replicated action.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Create { object: CanvasObject },
    Update { object_id: ObjectId, patch: Data },
    Delete { object_id: ObjectId },
    ReorderRequest { object_id: ObjectId, proposed_rank: Rank },
    ReorderConfirm { object_id: ObjectId, rank: Rank, sequence: u64 },
    Lock { lock: Lock },
    Unlock { lock: Lock },
    LockStateRequest,
    LockStateResponse { locks: Vec<Lock> },
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Create { .. } => Kind::Create,
            Self::Update { .. } => Kind::Update,
            Self::Delete { .. } => Kind::Delete,
            Self::ReorderRequest { .. } => Kind::ReorderRequest,
            Self::ReorderConfirm { .. } => Kind::ReorderConfirm,
            Self::Lock { .. } => Kind::Lock,
            Self::Unlock { .. } => Kind::Unlock,
            Self::LockStateRequest => Kind::LockStateRequest,
            Self::LockStateResponse { .. } => Kind::LockStateResponse,
        }
    }

    #[must_use]
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Create { object } => Some(object.id),
            Self::Update { object_id, .. }
            | Self::Delete { object_id }
            | Self::ReorderRequest { object_id, .. }
            | Self::ReorderConfirm { object_id, .. } => Some(*object_id),
            Self::Lock { lock } | Self::Unlock { lock } => Some(lock.object_id),
            Self::LockStateRequest | Self::LockStateResponse { .. } => None,
        }
    }
}

/// A message plus who sent it and when.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub sender: ParticipantId,
    pub ts: i64,
    pub message: Message,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: ParticipantId, ts: i64, message: Message) -> Self {
        Self { id: Uuid::new_v4(), sender, ts, message }
    }
}

/// Create payload. The stamp is the envelope timestamp.
#[derive(Serialize, Deserialize)]
struct ObjectPayload {
    id: ObjectId,
    kind: String,
    position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rank: Option<Rank>,
    #[serde(default)]
    attributes: Data,
}

// =============================================================================
// ENCODE
// =============================================================================

impl From<&Envelope> for Frame {
    fn from(envelope: &Envelope) -> Self {
        let message = &envelope.message;
        let (data, sequence) = match message {
            Message::Create { object } => (
                serde_json::to_value(ObjectPayload {
                    id: object.id,
                    kind: object.kind.clone(),
                    position: object.position,
                    rank: object.rank.clone(),
                    attributes: object.attributes.clone(),
                })
                .unwrap_or(Value::Null),
                None,
            ),
            Message::Update { patch, .. } => (Value::Object(patch.clone()), None),
            Message::Delete { .. } | Message::LockStateRequest => (json!({}), None),
            Message::ReorderRequest { proposed_rank, .. } => (json!({ FIELD_PROPOSED_RANK: proposed_rank }), None),
            Message::ReorderConfirm { rank, sequence, .. } => (json!({ FIELD_RANK: rank }), Some(*sequence)),
            Message::Lock { lock } | Message::Unlock { lock } => (serde_json::to_value(lock).unwrap_or(Value::Null), None),
            Message::LockStateResponse { locks } => (json!({ FIELD_LOCKS: locks }), None),
        };

        Frame {
            id: envelope.id.to_string(),
            ts: envelope.ts,
            room: None,
            sender: envelope.sender.to_string(),
            kind: message.kind(),
            object_id: message.object_id().map(|id| id.to_string()),
            sequence,
            data,
        }
    }
}

/// Encode straight to protobuf bytes.
#[must_use]
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    frames::encode_frame(&Frame::from(envelope))
}

// =============================================================================
// DECODE
// =============================================================================

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, ProtocolError> {
    Uuid::parse_str(value).map_err(|_| ProtocolError::InvalidId { field, value: value.to_owned() })
}

fn payload<T: for<'de> Deserialize<'de>>(kind: Kind, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::Payload { kind: kind.as_str(), source })
}

fn field<T: for<'de> Deserialize<'de>>(kind: Kind, data: &mut Value, key: &str) -> Result<T, ProtocolError> {
    let value = data.get_mut(key).map(Value::take).unwrap_or(Value::Null);
    payload(kind, value)
}

impl TryFrom<Frame> for Envelope {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let id = parse_uuid("id", &frame.id)?;
        let sender = parse_uuid("sender", &frame.sender)?;
        let kind = frame.kind;
        let object_id = frame
            .object_id
            .as_deref()
            .map(|raw| parse_uuid("object_id", raw))
            .transpose()?;
        let require_id = || object_id.ok_or(ProtocolError::MissingObjectId(kind.as_str()));
        let mut data = frame.data;

        let message = match kind {
            Kind::Create => {
                let body: ObjectPayload = payload(kind, data)?;
                Message::Create {
                    object: CanvasObject {
                        id: body.id,
                        kind: body.kind,
                        position: body.position,
                        rank: body.rank,
                        attributes: body.attributes,
                        last_modified: frame.ts,
                        last_modified_by: Origin::Remote,
                    },
                }
            }
            Kind::Update => Message::Update { object_id: require_id()?, patch: payload(kind, data)? },
            Kind::Delete => Message::Delete { object_id: require_id()? },
            Kind::ReorderRequest => Message::ReorderRequest {
                object_id: require_id()?,
                proposed_rank: field(kind, &mut data, FIELD_PROPOSED_RANK)?,
            },
            Kind::ReorderConfirm => Message::ReorderConfirm {
                object_id: require_id()?,
                rank: field(kind, &mut data, FIELD_RANK)?,
                sequence: frame.sequence.ok_or(ProtocolError::MissingSequence)?,
            },
            Kind::Lock => Message::Lock { lock: payload(kind, data)? },
            Kind::Unlock => Message::Unlock { lock: payload(kind, data)? },
            Kind::LockStateRequest => Message::LockStateRequest,
            Kind::LockStateResponse => Message::LockStateResponse { locks: field(kind, &mut data, FIELD_LOCKS)? },
        };

        Ok(Self { id, sender, ts: frame.ts, message })
    }
}

/// Decode protobuf bytes into a typed envelope.
///
/// # Errors
///
/// Returns [`ProtocolError`] for codec failures or malformed payloads.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    Envelope::try_from(frames::decode_frame(bytes)?)
}

// =============================================================================
// CLOCK
// =============================================================================

/// Current time as milliseconds since Unix epoch.
fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Logical clock for modification stamps: wall time, but never behind
/// anything already issued or observed.
#[derive(Debug, Default)]
pub struct Clock {
    last: i64,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp, strictly greater than every previous one.
    pub fn tick(&mut self) -> i64 {
        let next = now_ms().max(self.last + 1);
        self.last = next;
        next
    }

    /// Fold in a remote stamp so later local edits sort after it.
    pub fn observe(&mut self, ts: i64) {
        self.last = self.last.max(ts);
    }

    #[must_use]
    pub fn last(&self) -> i64 {
        self.last
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
