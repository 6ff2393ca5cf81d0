//! Canvas objects and the object-type registry.
//!
//! DESIGN
//! ======
//! An object is a positioned, typed bag of attributes. The core only cares
//! about identity, type, position, rank and the modification stamp; the
//! attribute payload is opaque beyond being JSON-serializable.
//!
//! Object types are registered explicitly at startup through
//! [`TypeRegistry::register`]. The registry supplies default attributes and
//! validates payloads whenever an object enters the store, whether created
//! locally, replicated from a peer, or loaded from durable storage.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::board::rank::Rank;

// =============================================================================
// TYPES
// =============================================================================

/// Globally unique object identifier, generated by the creating client.
pub type ObjectId = Uuid;

/// Identifier of one connected participant session.
pub type ParticipantId = Uuid;

/// Flat attribute payload. Alias to reduce noise in signatures.
pub type Data = serde_json::Map<String, Value>;

/// Patch keys that address the position rather than the attribute payload.
pub const FIELD_X: &str = "x";
pub const FIELD_Y: &str = "y";

/// Keys a patch may never touch. Rank changes go through the order model.
const RESERVED_FIELDS: &[&str] = &["id", "kind", "rank"];

/// Where the most recent modification of an object came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    #[default]
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The unit of shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: ObjectId,
    pub kind: String,
    pub position: Position,
    /// Draw-order key. `None` until the order model assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<Rank>,
    #[serde(default)]
    pub attributes: Data,
    /// Logical timestamp of the last applied modification.
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub last_modified_by: Origin,
}

impl CanvasObject {
    /// Build a fresh, unranked object with a new id.
    #[must_use]
    pub fn new(kind: impl Into<String>, position: Position, attributes: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            position,
            rank: None,
            attributes,
            last_modified: 0,
            last_modified_by: Origin::Local,
        }
    }

    /// Apply a flat patch. `x`/`y` move the object, `null` removes an
    /// attribute, any other key sets one. Returns the fields that actually
    /// changed, in patch iteration order.
    pub fn apply_patch(&mut self, patch: &Data) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in patch {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            let did_change = match key.as_str() {
                FIELD_X => set_coordinate(&mut self.position.x, value),
                FIELD_Y => set_coordinate(&mut self.position.y, value),
                _ if value.is_null() => self.attributes.remove(key).is_some(),
                _ => {
                    let unchanged = self.attributes.get(key).is_some_and(|current| same_value(current, value));
                    if !unchanged {
                        self.attributes.insert(key.clone(), value.clone());
                    }
                    !unchanged
                }
            };
            if did_change {
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Restrict a patch to the given keys.
    #[must_use]
    pub fn filter_patch(patch: &Data, allowed: &[&str]) -> Data {
        patch
            .iter()
            .filter(|(key, _)| allowed.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Equality that treats `3` and `3.0` as the same number, since the wire
/// cannot tell them apart.
fn same_value(current: &Value, next: &Value) -> bool {
    match (current, next) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => a == b,
        },
        _ => current == next,
    }
}

fn set_coordinate(target: &mut f64, value: &Value) -> bool {
    let Some(next) = value.as_f64() else {
        return false;
    };
    if (*target - next).abs() < f64::EPSILON {
        return false;
    }
    *target = next;
    true
}

// =============================================================================
// TYPE REGISTRY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KindError {
    #[error("object type not registered: {0}")]
    Unknown(String),
    #[error("invalid {kind} attributes: {reason}")]
    Invalid { kind: String, reason: String },
}

/// Behaviour attached to one object type.
pub trait ObjectKind: Send + Sync {
    /// Attributes a freshly created object of this type starts with.
    fn default_attributes(&self) -> Data {
        Data::new()
    }

    /// Reject payloads this type cannot render.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason.
    fn validate(&self, _attributes: &Data) -> Result<(), String> {
        Ok(())
    }
}

/// Free-flowing text block.
pub struct TextKind;

impl ObjectKind for TextKind {
    fn default_attributes(&self) -> Data {
        let mut data = Data::new();
        data.insert("text".into(), Value::String(String::new()));
        data.insert("fontSize".into(), serde_json::json!(16));
        data
    }

    fn validate(&self, attributes: &Data) -> Result<(), String> {
        match attributes.get("text") {
            None | Some(Value::String(_)) => Ok(()),
            Some(_) => Err("text must be a string".into()),
        }
    }
}

/// Image referenced by source URL.
pub struct ImageKind;

impl ObjectKind for ImageKind {
    fn validate(&self, attributes: &Data) -> Result<(), String> {
        match attributes.get("src") {
            Some(Value::String(src)) if !src.is_empty() => Ok(()),
            _ => Err("src is required".into()),
        }
    }
}

/// Card-like widget with a title and free-form body.
pub struct CardKind;

impl ObjectKind for CardKind {
    fn default_attributes(&self) -> Data {
        let mut data = Data::new();
        data.insert("title".into(), Value::String(String::new()));
        data
    }
}

/// Registered object types, keyed by type name.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    kinds: HashMap<String, Arc<dyn ObjectKind>>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `text`, `image` and `card`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("text", Arc::new(TextKind));
        registry.register("image", Arc::new(ImageKind));
        registry.register("card", Arc::new(CardKind));
        registry
    }

    pub fn register(&mut self, key: impl Into<String>, kind: Arc<dyn ObjectKind>) {
        self.kinds.insert(key.into(), kind);
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.kinds.contains_key(key)
    }

    /// Merge type defaults under `attributes` and validate the result.
    ///
    /// # Errors
    ///
    /// Returns [`KindError::Unknown`] for unregistered types and
    /// [`KindError::Invalid`] when validation fails.
    pub fn build(&self, key: &str, attributes: Data) -> Result<Data, KindError> {
        let kind = self.kinds.get(key).ok_or_else(|| KindError::Unknown(key.to_owned()))?;
        let mut merged = kind.default_attributes();
        merged.extend(attributes);
        kind.validate(&merged)
            .map_err(|reason| KindError::Invalid { kind: key.to_owned(), reason })?;
        Ok(merged)
    }

    /// Validate an object that arrived fully formed (replicated or loaded).
    ///
    /// # Errors
    ///
    /// Same as [`TypeRegistry::build`].
    pub fn check(&self, object: &CanvasObject) -> Result<(), KindError> {
        let kind = self
            .kinds
            .get(&object.kind)
            .ok_or_else(|| KindError::Unknown(object.kind.clone()))?;
        kind.validate(&object.attributes)
            .map_err(|reason| KindError::Invalid { kind: object.kind.clone(), reason })
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.kinds.keys().collect();
        keys.sort();
        f.debug_struct("TypeRegistry").field("kinds", &keys).finish()
    }
}

#[cfg(test)]
#[path = "object_test.rs"]
mod tests;
