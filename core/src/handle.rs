//! Object references.
//!
//! A [`Handle`] names an object without owning Rust memory directly: heap
//! handles carry a generational arena id, stack handles carry the frame-relative
//! location plus the unique id of the scope that owns the slots, and raw handles
//! key into storage that is guaranteed to outlive the state (static fields).
//! Validity is always re-checked at dereference time, so a stale handle reads as
//! null instead of touching recycled memory.

use std::fmt;
use std::sync::Arc;

use crate::library::TypeDef;

/// Generational index of an object slot in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId {
    pub(crate) index: u32,
    pub(crate) generation: u64,
}

/// Index of a scope record in the scope arena. A `ScopeId` alone is not proof
/// of liveness; pair it with the scope's unique id (see [`HandleKind::Stack`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(pub(crate) u32);

#[derive(Debug, Clone, PartialEq)]
pub enum HandleKind {
    Null,
    Heap(HeapId),
    /// An object whose fields live directly in stack slots. `base` is the
    /// absolute index of the first slot; the handle is valid only while the
    /// owning scope still carries `scope_unique_id`.
    Stack {
        base: usize,
        scope: ScopeId,
        scope_unique_id: u64,
    },
    /// Storage owned outside the heap, keyed by a stable id.
    Raw { key: u64 },
}

#[derive(Debug, Clone)]
pub struct Handle {
    kind: HandleKind,
    stored_type: Option<Arc<TypeDef>>,
}

impl Handle {
    pub const fn null() -> Self {
        Self {
            kind: HandleKind::Null,
            stored_type: None,
        }
    }

    pub(crate) fn heap(id: HeapId, ty: Arc<TypeDef>) -> Self {
        Self {
            kind: HandleKind::Heap(id),
            stored_type: Some(ty),
        }
    }

    pub(crate) fn stack(base: usize, scope: ScopeId, scope_unique_id: u64, ty: Arc<TypeDef>) -> Self {
        Self {
            kind: HandleKind::Stack {
                base,
                scope,
                scope_unique_id,
            },
            stored_type: Some(ty),
        }
    }

    pub(crate) fn raw(key: u64, ty: Arc<TypeDef>) -> Self {
        Self {
            kind: HandleKind::Raw { key },
            stored_type: Some(ty),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, HandleKind::Null)
    }

    pub fn kind(&self) -> &HandleKind {
        &self.kind
    }

    /// The type recorded when the handle was created. After a live patch the
    /// object itself may carry a newer definition with the same name.
    pub fn stored_type(&self) -> Option<&Arc<TypeDef>> {
        self.stored_type.as_ref()
    }

    pub fn heap_id(&self) -> Option<HeapId> {
        match self.kind {
            HandleKind::Heap(id) => Some(id),
            _ => None,
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::null()
    }
}

/// Two handles are the same reference when they name the same location; the
/// recorded type is deliberately ignored so that references held across a live
/// patch still compare equal.
impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.stored_type) {
            (HandleKind::Null, _) => f.write_str("null"),
            (_, Some(ty)) => write!(f, "<{}>", ty.name),
            (_, None) => f.write_str("<object>"),
        }
    }
}
