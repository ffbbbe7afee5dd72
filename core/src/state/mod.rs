//! The execution state: stack, frames, scopes, heap, timeouts, patching.
//!
//! One `ExecutionState` is one independent script world. Nothing here is
//! global or thread-local; calls borrow the state they run against, so two
//! states never observe each other.

mod alloc;
mod call;
mod exec;
mod frame;
mod patch;
mod throw;
mod timeout;

pub use call::{Call, CallIndex, Interpreter};
pub use exec::{SNIPPET_ENTRY, SNIPPET_PROGRAM_TYPE, SnippetCompiler};
pub use frame::{FrameId, Pc, StackError};

use std::mem;
use std::sync::Arc;

use anyhow::{Result, bail, ensure};
use tracing::{debug, error, warn};

use crate::config::StateConfig;
use crate::events::{EventSink, FatalError, MemoryLeakEvent, TracingSink};
use crate::exception::ExceptionReport;
use crate::handle::{Handle, HandleKind, ScopeId};
use crate::heap::Heap;
use crate::library::{
    FnBody, Function, Library, Signature, TypeDef, TypeRef, core_library, next_function_id,
};
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::Value;

use frame::{Frame, FrameArena, ScopeArena};
use timeout::{TickSource, Timeout};

pub struct ExecutionState {
    config: StateConfig,
    /// Normal region plus reserve; every slot starts and is recycled as null.
    stack: Vec<Value>,
    /// Active frames, sentinel first. Never empty.
    frames: Vec<FrameId>,
    frame_arena: FrameArena,
    scope_arena: ScopeArena,
    /// Monotonic source for scope unique ids; never reused, 0 means retired.
    next_scope_unique_id: u64,
    pub(crate) heap: Heap,
    /// Libraries this state executes against, `Core` always included.
    dependencies: Vec<Arc<Library>>,
    /// Replacement function per original function id, across all patches.
    patched_functions: FastHashMap<u64, Arc<Function>>,
    /// Replacement type per original type id.
    patched_types: FastHashMap<u64, Arc<TypeDef>>,
    /// Patched libraries, kept so their definitions outlive the patch call.
    patched_libraries: Vec<Arc<Library>>,
    patch_id: u64,
    /// Static field storage, keyed by field id, populated lazily.
    statics: FastHashMap<u64, Value>,
    /// Active timeout budgets, innermost last.
    timeouts: Vec<Timeout>,
    ticks: TickSource,
    timeout_seconds: u64,
    /// Latched when a stack exception is raised; pushes keep failing fast
    /// until enough frames have popped to leave the bad region.
    hit_stack_error: bool,
    /// Receives exceptions raised where no caller report is on hand, e.g.
    /// timeout pops during frame teardown.
    default_report: ExceptionReport,
    events: Arc<dyn EventSink>,
    compiler: Option<Arc<dyn SnippetCompiler>>,
    interpreter: Option<Arc<dyn Interpreter>>,
    /// The `Core.Exception` type, resolved once at construction.
    exception_type: Arc<TypeDef>,
}

impl ExecutionState {
    pub fn new(config: StateConfig) -> Self {
        let core = core_library();
        let exception_type = core
            .get_type(crate::library::EXCEPTION_TYPE)
            .cloned()
            .unwrap_or_else(|| Arc::new(TypeDef::new(crate::library::EXCEPTION_TYPE)));

        let stack = vec![Value::Null; config.stack_slots + config.reserve_slots];
        let mut frame_arena = FrameArena::default();

        // The sentinel frame anchors the stack; it owns no slots, is never
        // executed, and is never popped.
        let sentinel = Arc::new(Function {
            id: next_function_id(),
            name: Arc::from("<stack root>"),
            owner: Arc::from(""),
            signature: Signature::new(Vec::new(), TypeRef::Void),
            body: FnBody::Interpreted,
            required_slots: 0,
            location: Default::default(),
            is_static: true,
        });
        let root = frame_arena.allocate(sentinel, 0, 0);

        let timeout_seconds = config.timeout_seconds;
        Self {
            heap: Heap::new(config.heap_capacity),
            config,
            stack,
            frames: vec![root],
            frame_arena,
            scope_arena: ScopeArena::default(),
            next_scope_unique_id: 0,
            dependencies: vec![core],
            patched_functions: fast_hash_map_new(),
            patched_types: fast_hash_map_new(),
            patched_libraries: Vec::new(),
            patch_id: 0,
            statics: fast_hash_map_new(),
            timeouts: Vec::new(),
            ticks: TickSource::monotonic(),
            timeout_seconds,
            hit_stack_error: false,
            default_report: ExceptionReport::new(),
            events: Arc::new(TracingSink),
            compiler: None,
            interpreter: None,
            exception_type,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn add_dependency(&mut self, library: Arc<Library>) {
        self.dependencies.push(library);
    }

    pub fn dependencies(&self) -> &[Arc<Library>] {
        &self.dependencies
    }

    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.events = sink;
    }

    pub fn set_snippet_compiler(&mut self, compiler: Arc<dyn SnippetCompiler>) {
        self.compiler = Some(compiler);
    }

    pub fn set_interpreter(&mut self, interpreter: Arc<dyn Interpreter>) {
        self.interpreter = Some(interpreter);
    }

    /// Bumped once per applied patch; cached lookups keyed on this can tell
    /// whether they are stale.
    pub fn patch_id(&self) -> u64 {
        self.patch_id
    }

    /// Frames above the sentinel.
    pub fn frame_depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn is_in_call_stack(&self) -> bool {
        self.frames.len() > 1
    }

    pub fn current_frame(&self) -> FrameId {
        *self
            .frames
            .last()
            .unwrap_or_else(|| unreachable!("the sentinel frame is never popped"))
    }

    pub fn frame_error_state(&self, id: FrameId) -> StackError {
        self.frame_arena.get(id).error_state
    }

    pub fn frame_function(&self, id: FrameId) -> Arc<Function> {
        self.frame_arena.get(id).function.clone()
    }

    pub fn frame_base(&self, id: FrameId) -> usize {
        self.frame_arena.get(id).base
    }

    /// Position marker used in stack traces; an interpreter updates this as
    /// it walks a function body.
    pub fn set_frame_pc(&mut self, id: FrameId, pc: Pc) {
        self.frame_arena.get_mut(id).pc = pc;
    }

    /// Exceptions recorded outside any caller-supplied report, e.g. a budget
    /// that expired while its frame was being torn down. Released and reset
    /// when the outermost frame pops.
    pub fn default_report(&self) -> &ExceptionReport {
        &self.default_report
    }

    pub(crate) fn sink(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    pub(crate) fn get_frame(&self, id: FrameId) -> &Frame {
        self.frame_arena.get(id)
    }

    pub(crate) fn get_frame_mut(&mut self, id: FrameId) -> &mut Frame {
        self.frame_arena.get_mut(id)
    }

    pub(crate) fn slot(&self, index: usize) -> &Value {
        &self.stack[index]
    }

    /// Replaces a slot, releasing whatever reference the old value carried.
    /// Ownership of `value` (including its reference count) moves into the
    /// slot.
    pub(crate) fn replace_slot(&mut self, index: usize, value: Value) {
        let old = mem::replace(&mut self.stack[index], value);
        self.heap.release_value(old);
    }

    /// Moves a slot's content out, leaving null. The caller takes ownership
    /// of any reference the value carries.
    pub(crate) fn take_slot(&mut self, index: usize) -> Value {
        mem::take(&mut self.stack[index])
    }

    /// Pushes a frame for `function`, resolving it through the patch map
    /// first. The frame's slots are cleared, one scope is opened, and on the
    /// outermost call the configured timeout budget is pushed.
    ///
    /// Stack conditions are recorded on the frame rather than failing the
    /// push: the caller raises them at invoke time so an exception can unwind
    /// cleanly. Running past the reserve region, or recursing beyond twice
    /// the limit, is fatal; at the limit itself the condition is still a
    /// recoverable exception.
    pub fn push_frame(&mut self, function: &Arc<Function>) -> FrameId {
        let function = self
            .patched_functions
            .get(&function.id)
            .cloned()
            .unwrap_or_else(|| function.clone());

        let caller = self.current_frame();
        let base = self.frame_arena.get(caller).next;
        let next = base + function.required_slots;

        if next > self.stack.len() {
            self.fatal(FatalError::StackReserveOverflow);
        }
        if self.frame_depth() > self.config.max_recursion_depth * 2 {
            self.fatal(FatalError::RunawayRecursion);
        }

        let error_state = if self.frame_depth() >= self.config.max_recursion_depth {
            StackError::MaxRecursionReached
        } else if next > self.config.stack_slots {
            StackError::Overflowed
        } else {
            StackError::Normal
        };

        for slot in &mut self.stack[base..next] {
            *slot = Value::Null;
        }

        let id = self.frame_arena.allocate(function, base, next);
        self.frame_arena.get_mut(id).error_state = error_state;
        self.frames.push(id);

        self.open_scope(id);

        if self.frames.len() == 2 && self.timeout_seconds > 0 {
            let seconds = self.timeout_seconds;
            self.push_timeout_unchecked(id, seconds);
        }

        id
    }

    /// Pops the current frame: its timeout budgets first (so an expired
    /// budget is charged before any destructor runs), then its scopes from
    /// outermost to innermost. Returns the popped frame's id.
    pub fn pop_frame(&mut self) -> FrameId {
        debug_assert!(
            self.frames.len() > 1,
            "pop_frame with no active frame above the sentinel"
        );
        let id = match self.frames.pop() {
            Some(id) => id,
            None => unreachable!("the frame stack is never empty"),
        };

        let pending_timeouts = self.frame_arena.get(id).timeouts;
        if pending_timeouts > 0 {
            let mut report = mem::take(&mut self.default_report);
            for _ in 0..pending_timeouts {
                self.pop_timeout(id, &mut report);
            }
            if report.has_thrown() {
                warn!(
                    message = %report.concatenated_messages(),
                    "timeout expired during frame teardown"
                );
            }
            self.default_report = report;
        }

        let scopes = mem::take(&mut self.frame_arena.get_mut(id).scopes);
        for scope in scopes {
            self.cleanup_scope(scope);
            self.scope_arena.retire(scope);
        }

        let next = self.frame_arena.get(id).next;
        self.frame_arena.retire(id);

        // Recovery: once we are back inside the normal region and under the
        // recursion limit, new pushes may proceed.
        if self.hit_stack_error
            && next <= self.config.stack_slots
            && self.frame_depth() < self.config.max_recursion_depth
        {
            self.hit_stack_error = false;
        }

        // A teardown expiry has already been reported through the sink and
        // the log; once the last frame is gone nothing else can clear its
        // report, so release the exception objects here.
        if !self.is_in_call_stack() && self.default_report.has_thrown() {
            let mut report = mem::take(&mut self.default_report);
            self.clear_report(&mut report);
            self.default_report = report;
        }

        id
    }

    /// Opens a nested scope on `frame`. Interpreters call this per lexical
    /// block; `pop_frame` closes anything left open.
    pub fn open_scope(&mut self, frame: FrameId) -> ScopeId {
        self.next_scope_unique_id += 1;
        let scope = self.scope_arena.allocate(self.next_scope_unique_id);
        self.frame_arena.get_mut(frame).scopes.push(scope);
        scope
    }

    /// Closes the innermost scope of `frame`, releasing everything it
    /// registered. The frame's first scope can only be closed by `pop_frame`.
    pub fn close_scope(&mut self, frame: FrameId) {
        let scopes = &mut self.frame_arena.get_mut(frame).scopes;
        debug_assert!(scopes.len() > 1, "closing a frame's root scope");
        if let Some(scope) = scopes.pop() {
            self.cleanup_scope(scope);
            self.scope_arena.retire(scope);
        }
    }

    pub(crate) fn current_scope(&self, frame: FrameId) -> ScopeId {
        match self.frame_arena.get(frame).scopes.last() {
            Some(scope) => *scope,
            None => unreachable!("a live frame always has a scope"),
        }
    }

    pub(crate) fn scope_unique_id(&self, scope: ScopeId) -> u64 {
        self.scope_arena.get(scope).unique_id
    }

    /// Registers a stack slot holding a handle for release when the frame's
    /// current scope ends.
    pub fn queue_handle_cleanup(&mut self, frame: FrameId, slot: usize) {
        let scope = self.current_scope(frame);
        self.scope_arena.get_mut(scope).handles.push(slot);
    }

    pub fn queue_delegate_cleanup(&mut self, frame: FrameId, slot: usize) {
        let scope = self.current_scope(frame);
        self.scope_arena.get_mut(scope).delegates.push(slot);
    }

    pub fn queue_value_cleanup(&mut self, frame: FrameId, slot: usize) {
        let scope = self.current_scope(frame);
        self.scope_arena.get_mut(scope).values.push(slot);
    }

    /// Each registered slot is released exactly once: the drain empties the
    /// lists, and the slot itself is nulled so later cleanup passes see
    /// nothing. Allocation is disabled for the duration; nothing created
    /// mid-teardown could be rooted.
    fn cleanup_scope(&mut self, scope: ScopeId) {
        let record = self.scope_arena.get_mut(scope);
        let slots: Vec<usize> = record
            .handles
            .drain(..)
            .chain(record.delegates.drain(..))
            .chain(record.values.drain(..))
            .collect();
        if slots.is_empty() {
            return;
        }
        self.heap.disable_allocation();
        for index in slots {
            let value = mem::take(&mut self.stack[index]);
            self.heap.release_value(value);
        }
        self.heap.enable_allocation();
    }

    /// Whether dereferencing the handle would reach a live object.
    pub fn handle_valid(&self, handle: &Handle) -> bool {
        match handle.kind() {
            HandleKind::Null => false,
            HandleKind::Heap(id) => self.heap.get(*id).is_some(),
            HandleKind::Stack {
                scope,
                scope_unique_id,
                ..
            } => self.scope_unique_id(*scope) == *scope_unique_id,
            HandleKind::Raw { key } => self.statics.contains_key(key),
        }
    }

    /// Reads a field by name. The returned value is a plain snapshot; to hold
    /// a contained reference beyond this statement, retain it.
    pub fn get_field(&self, handle: &Handle, name: &str) -> Result<Value> {
        match handle.kind() {
            HandleKind::Null => bail!("attempted to read field `{name}` of a null reference"),
            HandleKind::Heap(id) => {
                let object = self
                    .heap
                    .get(*id)
                    .ok_or_else(|| anyhow::anyhow!("the object behind this handle was freed"))?;
                let index = object
                    .ty
                    .field_index(name)
                    .ok_or_else(|| anyhow::anyhow!("type `{}` has no field `{name}`", object.ty.name))?;
                Ok(object.fields[index].clone())
            }
            HandleKind::Stack {
                base,
                scope,
                scope_unique_id,
            } => {
                ensure!(
                    self.scope_unique_id(*scope) == *scope_unique_id,
                    "the scope owning this stack object has ended"
                );
                let ty = handle
                    .stored_type()
                    .ok_or_else(|| anyhow::anyhow!("stack handle carries no type"))?;
                let index = ty
                    .field_index(name)
                    .ok_or_else(|| anyhow::anyhow!("type `{}` has no field `{name}`", ty.name))?;
                Ok(self.stack[base + index].clone())
            }
            HandleKind::Raw { key } => self
                .statics
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("raw handle points at missing storage")),
        }
    }

    /// Writes a field by name. The old content's reference is released; the
    /// incoming value is retained, so the caller keeps whatever it held.
    pub fn set_field(&mut self, handle: &Handle, name: &str, value: Value) -> Result<()> {
        self.heap.retain_value(&value);
        match handle.kind() {
            HandleKind::Null => {
                self.heap.release_value(value);
                bail!("attempted to write field `{name}` of a null reference")
            }
            HandleKind::Heap(id) => {
                let Some(object) = self.heap.get(*id) else {
                    self.heap.release_value(value);
                    bail!("the object behind this handle was freed");
                };
                let Some(index) = object.ty.field_index(name) else {
                    let ty = object.ty.name.clone();
                    self.heap.release_value(value);
                    bail!("type `{ty}` has no field `{name}`");
                };
                let object = self
                    .heap
                    .get_mut(*id)
                    .unwrap_or_else(|| unreachable!("object checked above"));
                let old = mem::replace(&mut object.fields[index], value);
                self.heap.release_value(old);
                Ok(())
            }
            HandleKind::Stack {
                base,
                scope,
                scope_unique_id,
            } => {
                if self.scope_unique_id(*scope) != *scope_unique_id {
                    self.heap.release_value(value);
                    bail!("the scope owning this stack object has ended");
                }
                let Some(index) = handle.stored_type().and_then(|ty| ty.field_index(name)) else {
                    self.heap.release_value(value);
                    bail!("stack object has no field `{name}`");
                };
                self.replace_slot(base + index, value);
                Ok(())
            }
            HandleKind::Raw { key } => {
                let Some(storage) = self.statics.get_mut(key) else {
                    self.heap.release_value(value);
                    bail!("raw handle points at missing storage");
                };
                let old = mem::replace(storage, value);
                self.heap.release_value(old);
                Ok(())
            }
        }
    }

    /// Adds one reference to whatever the handle names, so a clone can be
    /// stored independently.
    pub fn retain_handle(&mut self, handle: &Handle) {
        if let Some(id) = handle.heap_id() {
            self.heap.retain(id);
        }
    }

    /// Drops one reference. Call this for every root handle received from an
    /// allocation once it is no longer needed.
    pub fn release_handle(&mut self, handle: &Handle) {
        if let Some(id) = handle.heap_id() {
            self.heap.release(id);
        }
    }

    pub fn heap_live_count(&self) -> usize {
        self.heap.live_count()
    }

    /// Releases the report's references to its exception objects and resets
    /// it for reuse.
    pub fn clear_report(&mut self, report: &mut ExceptionReport) {
        for thrown in mem::take(&mut report.thrown) {
            self.release_handle(&thrown.exception);
        }
        report.force_thrown = false;
    }

    pub(crate) fn exception_type(&self) -> Arc<TypeDef> {
        self.exception_type.clone()
    }

    pub(crate) fn interpreter(&self) -> Option<Arc<dyn Interpreter>> {
        self.interpreter.clone()
    }

    pub(crate) fn hit_stack_error(&self) -> bool {
        self.hit_stack_error
    }

    pub(crate) fn set_hit_stack_error(&mut self) {
        self.hit_stack_error = true;
    }

    fn fatal(&mut self, fatal: FatalError) -> ! {
        error!(?fatal, "unrecoverable execution error, aborting");
        self.sink().fatal_error(fatal);
        std::process::abort()
    }
}

impl Drop for ExecutionState {
    fn drop(&mut self) {
        debug_assert!(
            !self.is_in_call_stack(),
            "state dropped while calls were still active"
        );
        if self.heap.live_count() == 0 {
            return;
        }
        let sink = self.sink();
        for (_, object) in self.heap.live_objects() {
            sink.memory_leak(&MemoryLeakEvent {
                type_name: object.ty.name.clone(),
                refs: object.refs,
            });
        }
        debug!(live = self.heap.live_count(), "state dropped with live objects");
    }
}

#[cfg(test)]
mod testing;

#[cfg(test)]
mod call_test;
#[cfg(test)]
mod frame_test;
