//! Frame and scope records.
//!
//! Both live in generational arenas owned by the execution state, so popped
//! records are recycled without their ids ever becoming ambiguous: a stale
//! [`FrameId`] simply fails its generation check, and a recycled scope gets a
//! fresh unique id that no outstanding stack handle carries.

use std::sync::Arc;

use crate::handle::ScopeId;
use crate::library::Function;

/// Program counter of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pc {
    /// The frame is set up but nothing is executing in it yet; stack traces
    /// skip it.
    NotActive,
    /// Native code is running in this frame; it has no meaningful position.
    Native,
    /// Interpreted code at the given position.
    At(usize),
}

/// Stack condition recorded on the frame whose push caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    Normal,
    /// Frame depth passed the recursion limit.
    MaxRecursionReached,
    /// Slot usage ran into the reserve region.
    Overflowed,
}

/// Generational reference to a frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId {
    pub(crate) index: u32,
    pub(crate) generation: u64,
}

/// Per-frame bookkeeping for the call contract: which inputs were provided,
/// whether the call ran, and which cleanup steps are suppressed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CallFlags {
    /// Bit `i` set means parameter `i` was written.
    pub params_set: u32,
    pub this_set: bool,
    pub return_set: bool,
    pub invoked: bool,
    pub no_param_checks: bool,
    pub no_this_checks: bool,
    pub no_return_checks: bool,
    pub no_param_destruction: bool,
    pub no_this_destruction: bool,
    pub no_return_destruction: bool,
}

impl CallFlags {
    /// Parameters past this count skip the was-it-set debug bookkeeping.
    pub const MAX_TRACKED_PARAMS: usize = 32;

    pub fn mark_param(&mut self, index: usize) {
        if index < Self::MAX_TRACKED_PARAMS {
            self.params_set |= 1 << index;
        }
    }

    pub fn param_set(&self, index: usize) -> bool {
        index >= Self::MAX_TRACKED_PARAMS || self.params_set & (1 << index) != 0
    }
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub function: Arc<Function>,
    /// Absolute index of the frame's first stack slot.
    pub base: usize,
    /// One past the frame's last slot; the next frame starts here.
    pub next: usize,
    pub pc: Pc,
    /// Scopes opened in this frame, innermost last. A fresh frame always has
    /// one.
    pub scopes: Vec<ScopeId>,
    /// Timeout budgets this frame pushed and must pop.
    pub timeouts: usize,
    pub error_state: StackError,
    pub flags: CallFlags,
}

#[derive(Debug)]
struct FrameSlot {
    generation: u64,
    frame: Frame,
}

#[derive(Debug, Default)]
pub(crate) struct FrameArena {
    slots: Vec<FrameSlot>,
    free: Vec<u32>,
}

impl FrameArena {
    /// Creates (or recycles) a frame record, fully re-initialized.
    pub fn allocate(&mut self, function: Arc<Function>, base: usize, next: usize) -> FrameId {
        let frame = Frame {
            function,
            base,
            next,
            pc: Pc::NotActive,
            scopes: Vec::new(),
            timeouts: 0,
            error_state: StackError::Normal,
            flags: CallFlags::default(),
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.frame = frame;
                FrameId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(FrameSlot {
                    generation: 0,
                    frame,
                });
                FrameId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn retire(&mut self, id: FrameId) {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "retiring a stale frame id");
        slot.generation += 1;
        slot.frame.scopes.clear();
        self.free.push(id.index);
    }

    pub fn get(&self, id: FrameId) -> &Frame {
        let slot = &self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale frame id");
        &slot.frame
    }

    pub fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale frame id");
        &mut slot.frame
    }
}

/// A scope record: the cleanup lists for one lexical scope, partitioned by
/// what kind of slot needs releasing.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    /// Current unique id, or 0 while retired. Stack handles compare against
    /// this to detect that their scope ended.
    pub unique_id: u64,
    /// Absolute stack slot indices, by slot kind.
    pub handles: Vec<usize>,
    pub delegates: Vec<usize>,
    pub values: Vec<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct ScopeArena {
    slots: Vec<Scope>,
    free: Vec<u32>,
}

impl ScopeArena {
    /// Recycles or creates a scope record and stamps it with `unique_id`.
    /// Unique ids come from a monotonic counter and are never reused.
    pub fn allocate(&mut self, unique_id: u64) -> ScopeId {
        match self.free.pop() {
            Some(index) => {
                let scope = &mut self.slots[index as usize];
                debug_assert!(
                    scope.handles.is_empty() && scope.delegates.is_empty() && scope.values.is_empty(),
                    "recycled scope still has cleanup entries"
                );
                scope.unique_id = unique_id;
                ScopeId(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Scope {
                    unique_id,
                    ..Scope::default()
                });
                ScopeId(index)
            }
        }
    }

    pub fn retire(&mut self, id: ScopeId) {
        let scope = &mut self.slots[id.0 as usize];
        scope.unique_id = 0;
        scope.handles.clear();
        scope.delegates.clear();
        scope.values.clear();
        self.free.push(id.0);
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.slots[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.slots[id.0 as usize]
    }
}
