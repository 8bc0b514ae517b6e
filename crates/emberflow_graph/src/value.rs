// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tagged port values and the conversion table between them.
//!
//! Every input port owns one [`PortValue`]: the payload, the declared
//! tag (stable once the node's configuration has been read), a
//! "written since last delivery" flag and an optional lock. Writes go
//! through [`PortValue::set`], which converts to the declared tag or
//! rejects the write.
//!
//! ## Conversion table
//!
//! | from \ to | Void | Int | Float | Bool | Vec3 | String | Entity | Ptr | Blob |
//! |-----------|------|-----|-------|------|------|--------|--------|-----|------|
//! | Int       | yes  | =   | cast  | !=0  | no   | format | no     | no  | no   |
//! | Float     | yes  | cast| =     | no   | no   | format | no     | no  | no   |
//! | Bool      | yes  | 0/1 | 0.0/1.0| =   | no   | format | no     | no  | no   |
//! | Vec3      | yes  | no  | no    | no   | =    | "x,y,z"| no     | no  | no   |
//! | String    | yes  | parse|parse | parse| parse| =      | no     | no  | no   |
//! | Entity    | yes  | no  | no    | no   | no   | no     | =      | no  | no   |
//! | Ptr/Blob  | yes  | no  | no    | no   | no   | no     | no     | =   | =    |
//!
//! `Any`-tagged ports adopt incoming values unchanged. Converting to
//! `Void` always succeeds and discards the payload (the activation
//! still counts). Entity references deliberately never convert to or
//! from numbers.

use crate::entity::EntityId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The declared type of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueTag {
    /// Accepts any value unchanged.
    Any,
    /// Valueless trigger port.
    Void,
    /// 32-bit signed integer.
    Int,
    /// 32-bit float.
    Float,
    /// Boolean.
    Bool,
    /// 3-component vector.
    Vec3,
    /// UTF-8 string.
    String,
    /// Entity reference.
    Entity,
    /// Opaque pointer-sized handle.
    Ptr,
    /// Custom binary payload.
    Blob,
}

/// A value flowing through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No payload (trigger).
    Void,
    /// Integer.
    Int(i32),
    /// Float.
    Float(f32),
    /// Boolean.
    Bool(bool),
    /// 3-component vector.
    Vec3([f32; 3]),
    /// String.
    String(String),
    /// Entity reference.
    Entity(EntityId),
    /// Opaque handle.
    Ptr(u64),
    /// Custom binary payload.
    Blob(Vec<u8>),
}

/// Error produced when a value cannot be represented under a tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// No conversion exists between the two tags.
    #[error("no conversion from {from:?} to {to:?}")]
    Incompatible {
        /// Tag of the incoming value.
        from: ValueTag,
        /// Declared tag of the port.
        to: ValueTag,
    },
    /// A string payload failed to parse as the target type.
    #[error("cannot parse {text:?} as {to:?}")]
    Parse {
        /// The offending text.
        text: String,
        /// Declared tag of the port.
        to: ValueTag,
    },
}

impl Value {
    /// The tag describing this value's variant.
    pub fn tag(&self) -> ValueTag {
        match self {
            Self::Void => ValueTag::Void,
            Self::Int(_) => ValueTag::Int,
            Self::Float(_) => ValueTag::Float,
            Self::Bool(_) => ValueTag::Bool,
            Self::Vec3(_) => ValueTag::Vec3,
            Self::String(_) => ValueTag::String,
            Self::Entity(_) => ValueTag::Entity,
            Self::Ptr(_) => ValueTag::Ptr,
            Self::Blob(_) => ValueTag::Blob,
        }
    }

    /// The default value for a declared tag.
    pub fn default_for(tag: ValueTag) -> Self {
        match tag {
            ValueTag::Any | ValueTag::Void => Self::Void,
            ValueTag::Int => Self::Int(0),
            ValueTag::Float => Self::Float(0.0),
            ValueTag::Bool => Self::Bool(false),
            ValueTag::Vec3 => Self::Vec3([0.0; 3]),
            ValueTag::String => Self::String(String::new()),
            ValueTag::Entity => Self::Entity(EntityId::NONE),
            ValueTag::Ptr => Self::Ptr(0),
            ValueTag::Blob => Self::Blob(Vec::new()),
        }
    }

    /// Convert this value to the given tag, per the module-level table.
    pub fn convert_to(&self, to: ValueTag) -> Result<Value, ConversionError> {
        if to == ValueTag::Any || self.tag() == to {
            return Ok(self.clone());
        }
        if to == ValueTag::Void {
            return Ok(Value::Void);
        }
        let incompatible = || ConversionError::Incompatible { from: self.tag(), to };
        match (self, to) {
            (Self::Int(i), ValueTag::Float) => Ok(Value::Float(*i as f32)),
            (Self::Int(i), ValueTag::Bool) => Ok(Value::Bool(*i != 0)),
            (Self::Int(i), ValueTag::String) => Ok(Value::String(i.to_string())),
            (Self::Float(f), ValueTag::Int) => Ok(Value::Int(*f as i32)),
            (Self::Float(f), ValueTag::String) => Ok(Value::String(f.to_string())),
            (Self::Bool(b), ValueTag::Int) => Ok(Value::Int(i32::from(*b))),
            (Self::Bool(b), ValueTag::Float) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            (Self::Bool(b), ValueTag::String) => Ok(Value::String(b.to_string())),
            (Self::Vec3(v), ValueTag::String) => {
                Ok(Value::String(format!("{},{},{}", v[0], v[1], v[2])))
            }
            (Self::String(s), _) => Self::parse_as(s, to),
            _ => Err(incompatible()),
        }
    }

    fn parse_as(text: &str, to: ValueTag) -> Result<Value, ConversionError> {
        let parse_err = || ConversionError::Parse { text: text.to_owned(), to };
        match to {
            ValueTag::Int => text.trim().parse::<i32>().map(Value::Int).map_err(|_| parse_err()),
            ValueTag::Float => {
                text.trim().parse::<f32>().map(Value::Float).map_err(|_| parse_err())
            }
            ValueTag::Bool => match text.trim() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(parse_err()),
            },
            ValueTag::Vec3 => {
                let mut parts = text.split(',');
                let mut v = [0.0f32; 3];
                for slot in &mut v {
                    let part = parts.next().ok_or_else(parse_err)?;
                    *slot = part.trim().parse().map_err(|_| parse_err())?;
                }
                if parts.next().is_some() {
                    return Err(parse_err());
                }
                Ok(Value::Vec3(v))
            }
            _ => Err(ConversionError::Incompatible { from: ValueTag::String, to }),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Void
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<[f32; 3]> for Value {
    fn from(v: [f32; 3]) -> Self {
        Self::Vec3(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<EntityId> for Value {
    fn from(v: EntityId) -> Self {
        Self::Entity(v)
    }
}

/// One input port's storage: payload plus delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortValue {
    tag: ValueTag,
    value: Value,
    written: bool,
    locked: bool,
}

impl PortValue {
    /// Create a port value with the declared tag and default payload.
    ///
    /// A default of the wrong type is converted where possible,
    /// otherwise the tag's own default is used.
    pub fn new(tag: ValueTag, default: Option<&Value>) -> Self {
        let value = default
            .and_then(|d| d.convert_to(tag).ok())
            .unwrap_or_else(|| Value::default_for(tag));
        Self { tag, value, written: false, locked: false }
    }

    /// The declared tag. Stable for the lifetime of the allocation.
    pub fn tag(&self) -> ValueTag {
        self.tag
    }

    /// The current payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Store a value, converting to the declared tag.
    ///
    /// Returns `false` (payload unchanged) if the port is locked or no
    /// conversion exists. Does not touch the written flag; callers
    /// decide whether the write counts as an activation.
    pub fn set(&mut self, value: &Value) -> bool {
        if self.locked {
            return false;
        }
        match value.convert_to(self.tag) {
            Ok(converted) => {
                self.value = converted;
                true
            }
            Err(_) => false,
        }
    }

    /// Store a value ignoring the lock. Used only for the implicit
    /// entity port while forwarding state is being rebound.
    pub(crate) fn set_ignoring_lock(&mut self, value: &Value) -> bool {
        let was_locked = self.locked;
        self.locked = false;
        let ok = self.set(value);
        self.locked = was_locked;
        ok
    }

    /// Whether a write is pending delivery.
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Flag a pending write.
    pub fn mark_written(&mut self) {
        self.written = true;
    }

    /// Consume the pending-write flag.
    pub fn clear_written(&mut self) {
        self.written = false;
    }

    /// Whether ordinary writes are currently rejected.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Reject ordinary writes until [`PortValue::unlock`].
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Accept ordinary writes again.
    pub fn unlock(&mut self) {
        self.locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(Value::Int(3).convert_to(ValueTag::Float), Ok(Value::Float(3.0)));
        assert_eq!(Value::Float(2.7).convert_to(ValueTag::Int), Ok(Value::Int(2)));
        assert_eq!(Value::Int(5).convert_to(ValueTag::Bool), Ok(Value::Bool(true)));
        assert_eq!(Value::Bool(true).convert_to(ValueTag::Int), Ok(Value::Int(1)));
    }

    #[test]
    fn test_string_round_trips() {
        let v = Value::Vec3([1.0, 2.5, -3.0]);
        let s = v.convert_to(ValueTag::String).unwrap();
        assert_eq!(s, Value::String("1,2.5,-3".to_string()));
        assert_eq!(s.convert_to(ValueTag::Vec3).unwrap(), v);

        let f = Value::Float(0.125);
        let s = f.convert_to(ValueTag::String).unwrap();
        assert_eq!(s.convert_to(ValueTag::Float).unwrap(), f);
    }

    #[test]
    fn test_string_parse_failure() {
        assert!(Value::String("abc".into()).convert_to(ValueTag::Int).is_err());
        assert!(Value::String("1,2".into()).convert_to(ValueTag::Vec3).is_err());
        assert!(Value::String("yes".into()).convert_to(ValueTag::Bool).is_err());
    }

    #[test]
    fn test_entity_never_converts_to_numbers() {
        let e = Value::Entity(EntityId(42));
        assert!(e.convert_to(ValueTag::Int).is_err());
        assert!(e.convert_to(ValueTag::Float).is_err());
        assert!(Value::Int(42).convert_to(ValueTag::Entity).is_err());
        // Void always accepts.
        assert_eq!(e.convert_to(ValueTag::Void), Ok(Value::Void));
    }

    #[test]
    fn test_any_port_adopts_value() {
        let mut port = PortValue::new(ValueTag::Any, None);
        assert!(port.set(&Value::Int(7)));
        assert_eq!(port.value(), &Value::Int(7));
        assert!(port.set(&Value::String("x".into())));
        assert_eq!(port.value(), &Value::String("x".into()));
    }

    #[test]
    fn test_locked_port_rejects_writes() {
        let mut port = PortValue::new(ValueTag::Int, Some(&Value::Int(1)));
        port.lock();
        assert!(!port.set(&Value::Int(2)));
        assert_eq!(port.value(), &Value::Int(1));
        port.unlock();
        assert!(port.set(&Value::Int(2)));
        assert_eq!(port.value(), &Value::Int(2));
    }

    #[test]
    fn test_written_flag() {
        let mut port = PortValue::new(ValueTag::Float, None);
        assert!(!port.is_written());
        port.mark_written();
        assert!(port.is_written());
        port.clear_written();
        assert!(!port.is_written());
    }

    #[test]
    fn test_default_from_config() {
        let port = PortValue::new(ValueTag::Float, Some(&Value::Int(4)));
        assert_eq!(port.value(), &Value::Float(4.0));
        // Unconvertible default falls back to the tag default.
        let port = PortValue::new(ValueTag::Entity, Some(&Value::Int(4)));
        assert_eq!(port.value(), &Value::Entity(EntityId::NONE));
    }
}
