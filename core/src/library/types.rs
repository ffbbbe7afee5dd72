use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::val::Value;

use super::function::{Function, Signature};

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_FIELD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a type definition. Patch maps are keyed by these ids,
/// so two definitions with the same name are still distinguishable.
pub fn next_type_id() -> u64 {
    NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed)
}

fn next_field_id() -> u64 {
    NEXT_FIELD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reference to a type, as it appears in signatures and field declarations.
///
/// Class and function references are compared structurally (by name and by
/// parameter/return types) so that a re-compiled library can describe "the same
/// type" without sharing definition objects with the original.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Void,
    Bool,
    Int,
    Real,
    Str,
    /// Any value; slots of this type accept every kind.
    Dynamic,
    Class(Arc<str>),
    Fn(Arc<Signature>),
}

/// What representation a slot of a given type holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Value,
    Handle,
    Delegate,
    Dynamic,
}

impl TypeRef {
    pub fn class(name: &str) -> Self {
        TypeRef::Class(Arc::from(name))
    }

    pub fn kind(&self) -> SlotKind {
        match self {
            TypeRef::Class(_) => SlotKind::Handle,
            TypeRef::Fn(_) => SlotKind::Delegate,
            TypeRef::Dynamic => SlotKind::Dynamic,
            _ => SlotKind::Value,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    /// The value a slot of this type starts out as: zero for numbers, empty
    /// for strings, null for references.
    pub fn default_value(&self) -> Value {
        match self {
            TypeRef::Void => Value::Null,
            TypeRef::Bool => Value::Bool(false),
            TypeRef::Int => Value::Int(0),
            TypeRef::Real => Value::Real(0.0),
            TypeRef::Str => Value::Str(Arc::from("")),
            TypeRef::Dynamic | TypeRef::Class(_) | TypeRef::Fn(_) => Value::Null,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => f.write_str("Void"),
            TypeRef::Bool => f.write_str("Bool"),
            TypeRef::Int => f.write_str("Int"),
            TypeRef::Real => f.write_str("Real"),
            TypeRef::Str => f.write_str("Str"),
            TypeRef::Dynamic => f.write_str("Dynamic"),
            TypeRef::Class(name) => f.write_str(name),
            TypeRef::Fn(sig) => write!(f, "Fn({} params)", sig.params.len()),
        }
    }
}

/// A field declaration. Instance fields occupy one object slot each, in
/// declaration order; static fields live in per-state storage keyed by `id`.
#[derive(Debug)]
pub struct FieldDef {
    pub id: u64,
    pub name: Arc<str>,
    pub ty: TypeRef,
    pub is_static: bool,
    /// Run lazily on first static read; the returned value becomes the
    /// field's content. Ignored for instance fields.
    pub initializer: Option<Arc<Function>>,
}

impl FieldDef {
    pub fn new(name: &str, ty: TypeRef) -> Self {
        Self {
            id: next_field_id(),
            name: Arc::from(name),
            ty,
            is_static: false,
            initializer: None,
        }
    }

    pub fn new_static(name: &str, ty: TypeRef, initializer: Option<Arc<Function>>) -> Self {
        Self {
            id: next_field_id(),
            name: Arc::from(name),
            ty,
            is_static: true,
            initializer,
        }
    }
}

/// A class definition: instance layout plus the functions compiled against it.
#[derive(Debug)]
pub struct TypeDef {
    pub id: u64,
    pub name: Arc<str>,
    pub base: Option<Arc<TypeDef>>,
    /// Instance fields in slot order. Does not include base-class fields;
    /// the base chain is walked separately.
    pub fields: Vec<Arc<FieldDef>>,
    pub constructors: Vec<Arc<Function>>,
    /// Field-initialization pass, run before any constructor, base-most last.
    pub pre_constructor: Option<Arc<Function>>,
    pub functions: Vec<Arc<Function>>,
    /// Native types require an explicit constructor; scripted types can be
    /// allocated with every field defaulted even without one.
    pub native: bool,
}

impl TypeDef {
    pub fn new(name: &str) -> Self {
        Self {
            id: next_type_id(),
            name: Arc::from(name),
            base: None,
            fields: Vec::new(),
            constructors: Vec::new(),
            pre_constructor: None,
            functions: Vec::new(),
            native: false,
        }
    }

    /// Number of object slots an instance occupies.
    pub fn size(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name.as_ref() == name)
    }

    pub fn derives_from_or_is(&self, name: &str) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty.name.as_ref() == name {
                return true;
            }
            current = ty.base.as_deref();
        }
        false
    }

    pub fn default_constructor(&self) -> Option<&Arc<Function>> {
        self.constructors.iter().find(|c| c.signature.params.is_empty())
    }

    /// A constructor taking exactly one parameter of this same class.
    pub fn copy_constructor(&self) -> Option<&Arc<Function>> {
        self.constructors.iter().find(|c| {
            c.signature.params.len() == 1
                && matches!(&c.signature.params[0].ty, TypeRef::Class(n) if n == &self.name)
        })
    }

    pub fn find_function(&self, name: &str, signature: &Signature, is_static: bool) -> Option<&Arc<Function>> {
        self.functions
            .iter()
            .find(|f| f.name.as_ref() == name && f.is_static == is_static && f.signature == *signature)
    }
}
