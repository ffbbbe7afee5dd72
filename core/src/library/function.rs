use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::exception::ExceptionReport;
use crate::state::Call;

use super::types::TypeRef;

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a function; the patch map is keyed by these.
pub fn next_function_id() -> u64 {
    NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Body of a native function. Receives the call frame it runs inside and the
/// report it may record exceptions into.
pub type NativeFn = Arc<dyn Fn(&mut Call<'_>, &mut ExceptionReport) + Send + Sync>;

#[derive(Clone)]
pub enum FnBody {
    Native(NativeFn),
    /// Executed by the installed [`crate::state::Interpreter`], if any.
    Interpreted,
}

impl fmt::Debug for FnBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FnBody::Native(_) => f.write_str("native"),
            FnBody::Interpreted => f.write_str("interpreted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Arc<str>,
    pub ty: TypeRef,
}

impl Param {
    pub fn new(name: &str, ty: TypeRef) -> Self {
        Self {
            name: Arc::from(name),
            ty,
        }
    }
}

/// Parameter and return types plus the optional receiver.
///
/// The signature fixes the frame layout: slot 0 holds the return value, slots
/// `1..=n` the parameters in order, and the receiver (when present) sits after
/// the last parameter.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Param>,
    pub returns: TypeRef,
    pub receiver: Option<TypeRef>,
}

impl Signature {
    pub fn new(params: Vec<Param>, returns: TypeRef) -> Self {
        Self {
            params,
            returns,
            receiver: None,
        }
    }

    pub fn method(params: Vec<Param>, returns: TypeRef, receiver: TypeRef) -> Self {
        Self {
            params,
            returns,
            receiver: Some(receiver),
        }
    }

    /// Slots the signature itself requires (return, parameters, receiver).
    pub fn frame_slots(&self) -> usize {
        1 + self.params.len() + usize::from(self.receiver.is_some())
    }

    pub fn return_slot(&self) -> usize {
        0
    }

    pub fn param_slot(&self, index: usize) -> usize {
        1 + index
    }

    /// Only meaningful when `receiver` is present.
    pub fn this_slot(&self) -> usize {
        1 + self.params.len()
    }
}

/// Signatures match structurally; parameter names carry no meaning here, so a
/// rename in a patched library still counts as the same function.
impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.returns == other.returns
            && self.receiver == other.receiver
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty == b.ty)
    }
}

/// Where a function came from, for stack traces and logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceLoc {
    pub origin: Arc<str>,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(origin: &str, line: u32) -> Self {
        Self {
            origin: Arc::from(origin),
            line,
        }
    }
}

#[derive(Debug)]
pub struct Function {
    pub id: u64,
    pub name: Arc<str>,
    /// Name of the owning type; empty for free functions.
    pub owner: Arc<str>,
    pub signature: Signature,
    pub body: FnBody,
    /// Total frame slots, including locals beyond the signature's own.
    pub required_slots: usize,
    pub location: SourceLoc,
    pub is_static: bool,
}

impl Function {
    pub fn native(
        name: &str,
        owner: &str,
        signature: Signature,
        body: impl Fn(&mut Call<'_>, &mut ExceptionReport) + Send + Sync + 'static,
    ) -> Self {
        let required_slots = signature.frame_slots();
        Self {
            id: next_function_id(),
            name: Arc::from(name),
            owner: Arc::from(owner),
            signature,
            body: FnBody::Native(Arc::new(body)),
            required_slots,
            location: SourceLoc::default(),
            is_static: false,
        }
    }

    pub fn interpreted(name: &str, owner: &str, signature: Signature, locals: usize) -> Self {
        let required_slots = signature.frame_slots() + locals;
        Self {
            id: next_function_id(),
            name: Arc::from(name),
            owner: Arc::from(owner),
            signature,
            body: FnBody::Interpreted,
            required_slots,
            location: SourceLoc::default(),
            is_static: false,
        }
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_location(mut self, location: SourceLoc) -> Self {
        self.location = location;
        self
    }

    pub fn is_instance(&self) -> bool {
        self.signature.receiver.is_some()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}.{}", self.owner, self.name)
        }
    }
}
