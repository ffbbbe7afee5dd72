//! Runtime values.
//!
//! One stack or object slot holds exactly one [`Value`]. Reference kinds
//! (`Handle`, `Delegate`) participate in the heap's reference counting; a value
//! stored in a slot owns one count, which the owning frame, scope, or object
//! releases during cleanup.

use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::handle::Handle;
use crate::library::Function;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(Arc<str>),
    Handle(Handle),
    Delegate(Delegate),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Real(_) => "real",
            Value::Str(_) => "str",
            Value::Handle(_) => "handle",
            Value::Delegate(_) => "delegate",
        }
    }

    /// Whether this value behaves as a reference to a heap or stack object.
    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Handle(_) | Value::Delegate(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Value::Int(i) => f.write_str(itoa::Buffer::new().format(*i)),
            Value::Real(r) => f.write_str(ryu::Buffer::new().format(*r)),
            Value::Str(s) => f.write_str(s),
            Value::Handle(h) => write!(f, "{h}"),
            Value::Delegate(d) => write!(f, "{d}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Real(r) => serializer.serialize_f64(*r),
            Value::Str(s) => serializer.serialize_str(s),
            // References serialize as their display form; object graphs are
            // not walked.
            Value::Handle(h) => serializer.serialize_str(&h.to_string()),
            Value::Delegate(d) => serializer.serialize_str(&d.to_string()),
        }
    }
}

/// A function bound together with its receiver. For static functions the
/// receiver is the null handle.
#[derive(Debug, Clone)]
pub struct Delegate {
    pub function: Arc<Function>,
    pub receiver: Handle,
}

impl Delegate {
    pub fn new(function: Arc<Function>, receiver: Handle) -> Self {
        Self { function, receiver }
    }

    pub fn bound(function: Arc<Function>) -> Self {
        Self {
            function,
            receiver: Handle::null(),
        }
    }
}

impl PartialEq for Delegate {
    fn eq(&self, other: &Self) -> bool {
        self.function.id == other.function.id && self.receiver == other.receiver
    }
}

impl fmt::Display for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delegate {}", self.function)
    }
}

impl Serialize for Delegate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Delegate", 2)?;
        s.serialize_field("function", &self.function.to_string())?;
        s.serialize_field("receiver", &self.receiver.to_string())?;
        s.end()
    }
}
