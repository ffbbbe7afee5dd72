//! Notification hooks for embedders: function enter/exit, thrown exceptions,
//! fatal errors, and leaked objects at teardown. All methods default to no-ops
//! so a sink implements only what it cares about.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::exception::StackTrace;

/// Unrecoverable conditions. The state reports these to the sink and then
/// aborts the process; returning is not an option because the execution stack
/// is no longer trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// A call ran past even the reserve region of the stack.
    StackReserveOverflow,
    /// Frame depth reached twice the recursion limit; the recursion exception
    /// raised at the limit was swallowed and execution kept digging.
    RunawayRecursion,
}

#[derive(Debug, Clone)]
pub struct FunctionEvent {
    pub function: Arc<str>,
    pub owner: Arc<str>,
    pub frame_base: usize,
}

#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub message: Arc<str>,
    pub trace: StackTrace,
}

#[derive(Debug, Clone)]
pub struct MemoryLeakEvent {
    pub type_name: Arc<str>,
    /// References still outstanding when the state was dropped.
    pub refs: u32,
}

pub trait EventSink: Send + Sync {
    fn enter_function(&self, _event: &FunctionEvent) {}
    fn exit_function(&self, _event: &FunctionEvent) {}
    fn exception_thrown(&self, _event: &ExceptionEvent) {}
    fn fatal_error(&self, _error: FatalError) {}
    fn memory_leak(&self, _event: &MemoryLeakEvent) {}
}

/// Sink that forwards every notification to `tracing`. This is the default
/// sink on a fresh state.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn enter_function(&self, event: &FunctionEvent) {
        debug!(function = %event.function, owner = %event.owner, base = event.frame_base, "enter");
    }

    fn exit_function(&self, event: &FunctionEvent) {
        debug!(function = %event.function, owner = %event.owner, base = event.frame_base, "exit");
    }

    fn exception_thrown(&self, event: &ExceptionEvent) {
        warn!(message = %event.message, "exception thrown\n{}", event.trace);
    }

    fn fatal_error(&self, error: FatalError) {
        error!(?error, "fatal execution error");
    }

    fn memory_leak(&self, event: &MemoryLeakEvent) {
        warn!(type_name = %event.type_name, refs = event.refs, "object leaked at state teardown");
    }
}
