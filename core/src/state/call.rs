//! The calling convention.
//!
//! A [`Call`] owns one frame from push to pop. The caller writes the
//! parameters (and receiver), invokes exactly once, reads the return value,
//! and lets the `Call` drop; the drop releases the signature slots and pops
//! the frame even if an exception unwound nested calls above it.
//!
//! Contract violations (wrong slot kind, a parameter set twice, a forgotten
//! return value) are programming errors, checked hard in debug builds and
//! skippable per slot for trusted callers.

use std::sync::Arc;

use crate::events::FunctionEvent;
use crate::exception::ExceptionReport;
use crate::handle::Handle;
use crate::library::{FnBody, Function, SlotKind, TypeRef};
use crate::val::{Delegate, Value};

use super::frame::{CallFlags, FrameId, Pc};
use super::ExecutionState;

/// Executes interpreted function bodies. The core does not interpret
/// anything itself; an embedder installs one of these on the state.
pub trait Interpreter: Send + Sync {
    /// Runs the current frame's function to completion, setting the return
    /// slot or recording an exception.
    fn execute(&self, call: &mut Call<'_>, report: &mut ExceptionReport);
}

/// Names one signature slot of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIndex {
    Param(usize),
    This,
    Return,
}

pub struct Call<'a> {
    state: &'a mut ExecutionState,
    frame: FrameId,
}

impl<'a> Call<'a> {
    /// Pushes a frame for `function` (resolved through the patch map) and
    /// takes responsibility for popping it on drop.
    pub fn new(state: &'a mut ExecutionState, function: &Arc<Function>) -> Self {
        let frame = state.push_frame(function);
        Self { state, frame }
    }

    /// A call with the delegate's receiver already bound.
    pub fn from_delegate(state: &'a mut ExecutionState, delegate: &Delegate) -> Self {
        let mut call = Call::new(state, &delegate.function);
        if call.function().is_instance() {
            call.set_handle(CallIndex::This, delegate.receiver.clone());
        }
        call
    }

    /// The state this call runs against; native bodies use it for nested
    /// calls, allocation, and field access.
    pub fn state(&mut self) -> &mut ExecutionState {
        self.state
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame
    }

    pub fn function(&self) -> Arc<Function> {
        self.state.get_frame(self.frame).function.clone()
    }

    /// Writes a primitive (non-reference) slot. Ownership moves into the
    /// slot; primitives carry no reference counts.
    pub fn set_value(&mut self, index: CallIndex, value: Value) {
        debug_assert!(
            !value.is_reference(),
            "set_value with a reference; use set_handle or set_delegate"
        );
        self.check_set(index, SlotKind::Value);
        self.mark(index);
        let slot = self.slot_index(index);
        self.state.replace_slot(slot, value);
    }

    /// Writes a handle slot. The slot takes a reference of its own; the
    /// caller keeps the one it holds.
    pub fn set_handle(&mut self, index: CallIndex, handle: Handle) {
        self.check_set(index, SlotKind::Handle);
        self.check_handle_type(index, &handle);
        self.mark(index);
        self.state.retain_handle(&handle);
        let slot = self.slot_index(index);
        self.state.replace_slot(slot, Value::Handle(handle));
    }

    pub fn set_delegate(&mut self, index: CallIndex, delegate: Delegate) {
        self.check_set(index, SlotKind::Delegate);
        self.check_delegate_signature(index, &delegate);
        self.mark(index);
        self.state.retain_handle(&delegate.receiver);
        let slot = self.slot_index(index);
        self.state.replace_slot(slot, Value::Delegate(delegate));
    }

    /// Kind-dispatching convenience for callers holding a generic [`Value`].
    pub fn set(&mut self, index: CallIndex, value: Value) {
        match value {
            Value::Handle(handle) => self.set_handle(index, handle),
            Value::Delegate(delegate) => self.set_delegate(index, delegate),
            value => self.set_value(index, value),
        }
    }

    /// Reads a slot as a plain snapshot. To keep a contained reference beyond
    /// the call's lifetime, retain it through the state.
    pub fn get(&self, index: CallIndex) -> Value {
        self.check_get(index);
        self.state.slot(self.slot_index(index)).clone()
    }

    pub fn get_handle(&self, index: CallIndex) -> Handle {
        match self.get(index) {
            Value::Handle(handle) => {
                self.check_handle_type(index, &handle);
                handle
            }
            _ => Handle::null(),
        }
    }

    /// Moves the return value out, leaving the slot null (so frame cleanup
    /// has nothing left to release). Ownership, including the value's
    /// reference count, transfers to the caller.
    pub fn take_return(&mut self) -> Value {
        self.check_get(CallIndex::Return);
        let slot = self.slot_index(CallIndex::Return);
        self.state.take_slot(slot)
    }

    /// Marks a slot as provided without writing it, for callers that fill
    /// slots through other means.
    pub fn mark_set(&mut self, index: CallIndex) {
        self.mark(index);
    }

    pub fn disable_param_checks(&mut self) {
        self.flags_mut().no_param_checks = true;
    }

    pub fn disable_this_checks(&mut self) {
        self.flags_mut().no_this_checks = true;
    }

    pub fn disable_return_checks(&mut self) {
        self.flags_mut().no_return_checks = true;
    }

    pub fn disable_param_destruction(&mut self) {
        self.flags_mut().no_param_destruction = true;
    }

    pub fn disable_this_destruction(&mut self) {
        self.flags_mut().no_this_destruction = true;
    }

    pub fn disable_return_destruction(&mut self) {
        self.flags_mut().no_return_destruction = true;
    }

    /// Runs the function. Returns `true` on clean completion, `false` when an
    /// exception was recorded on `report` (including the stack conditions and
    /// null-receiver checks performed here, before the body runs).
    pub fn invoke(&mut self, report: &mut ExceptionReport) -> bool {
        debug_assert!(
            self.frame == self.state.current_frame(),
            "only the innermost call can be invoked"
        );
        debug_assert!(
            !report.has_thrown(),
            "invoked with an exception already in flight"
        );

        if self.state.attempt_throw_stack_exceptions(self.frame, report) {
            self.disable_return_destruction();
            return false;
        }

        let function = self.function();
        let signature = &function.signature;
        {
            let flags = self.state.get_frame(self.frame).flags;
            debug_assert!(!flags.invoked, "a call can only be invoked once");
            if !flags.no_param_checks {
                for index in 0..signature.params.len() {
                    debug_assert!(
                        flags.param_set(index),
                        "parameter {index} of `{function}` was never set"
                    );
                }
            }
            if function.is_instance() && !flags.no_this_checks {
                debug_assert!(flags.this_set, "receiver of `{function}` was never set");
            }
        }

        if function.is_instance() {
            let this_slot = self.slot_index(CallIndex::This);
            let valid = match self.state.slot(this_slot) {
                Value::Handle(handle) => self.state.handle_valid(handle),
                _ => false,
            };
            if !valid {
                self.disable_return_destruction();
                let context = format!("cannot call `{function}` on a null receiver");
                self.state.throw_null_reference(report, &context);
                return false;
            }
        }

        self.flags_mut().invoked = true;
        let base = self.state.get_frame(self.frame).base;
        self.state.sink().enter_function(&FunctionEvent {
            function: function.name.clone(),
            owner: function.owner.clone(),
            frame_base: base,
        });

        match &function.body {
            FnBody::Native(body) => {
                self.state.set_frame_pc(self.frame, Pc::Native);
                let body = body.clone();
                body(self, report);
            }
            FnBody::Interpreted => match self.state.interpreter() {
                Some(interpreter) => interpreter.execute(self, report),
                None => self.state.throw_not_implemented(report),
            },
        }

        let flags = self.state.get_frame(self.frame).flags;
        if report.has_thrown() && !flags.return_set {
            // The return slot was never produced; there is nothing to
            // destruct, and reading it would see the cleared null.
            self.disable_return_destruction();
        }
        debug_assert!(
            flags.no_return_checks
                || signature.returns.is_void()
                || flags.return_set
                || report.has_thrown(),
            "`{function}` returned without setting its return value"
        );

        !report.has_thrown()
    }

    /// Writes the return slot with no kind checks and no retain. Used by
    /// patch dummies, whose defaulted values never carry references.
    pub(crate) fn set_return_raw(&mut self, value: Value) {
        self.flags_mut().return_set = true;
        let slot = self.slot_index(CallIndex::Return);
        self.state.replace_slot(slot, value);
    }

    fn flags_mut(&mut self) -> &mut CallFlags {
        &mut self.state.get_frame_mut(self.frame).flags
    }

    fn slot_index(&self, index: CallIndex) -> usize {
        let frame = self.state.get_frame(self.frame);
        let signature = &frame.function.signature;
        let offset = match index {
            CallIndex::Return => signature.return_slot(),
            CallIndex::Param(i) => {
                debug_assert!(i < signature.params.len(), "parameter index out of range");
                signature.param_slot(i)
            }
            CallIndex::This => {
                debug_assert!(
                    signature.receiver.is_some(),
                    "the function takes no receiver"
                );
                signature.this_slot()
            }
        };
        frame.base + offset
    }

    fn declared_type(&self, index: CallIndex) -> TypeRef {
        let frame = self.state.get_frame(self.frame);
        let signature = &frame.function.signature;
        match index {
            CallIndex::Return => signature.returns.clone(),
            CallIndex::Param(i) => signature.params[i].ty.clone(),
            CallIndex::This => signature
                .receiver
                .clone()
                .unwrap_or(TypeRef::Dynamic),
        }
    }

    fn checks_disabled(&self, index: CallIndex) -> bool {
        let flags = self.state.get_frame(self.frame).flags;
        match index {
            CallIndex::Param(_) => flags.no_param_checks,
            CallIndex::This => flags.no_this_checks,
            CallIndex::Return => flags.no_return_checks,
        }
    }

    fn check_set(&self, index: CallIndex, kind: SlotKind) {
        if cfg!(debug_assertions) && !self.checks_disabled(index) {
            let flags = self.state.get_frame(self.frame).flags;
            // The running body produces the return value itself; only the
            // input slots are frozen once the call has been invoked.
            if index != CallIndex::Return {
                debug_assert!(!flags.invoked, "writing call inputs after invoke");
            }
            let declared = self.declared_type(index).kind();
            debug_assert!(
                declared == kind || declared == SlotKind::Dynamic,
                "slot {index:?} holds {declared:?}, not {kind:?}"
            );
        }
    }

    fn check_handle_type(&self, index: CallIndex, handle: &Handle) {
        if cfg!(debug_assertions) && !self.checks_disabled(index) {
            if let (TypeRef::Class(declared), Some(ty)) =
                (self.declared_type(index), handle.stored_type())
            {
                debug_assert!(
                    ty.derives_from_or_is(&declared),
                    "a `{}` reference does not fit slot {index:?}, declared `{declared}`",
                    ty.name
                );
            }
        }
    }

    fn check_delegate_signature(&self, index: CallIndex, delegate: &Delegate) {
        if cfg!(debug_assertions) && !self.checks_disabled(index) {
            if let TypeRef::Fn(declared) = self.declared_type(index) {
                debug_assert!(
                    delegate.function.signature == *declared,
                    "delegate `{}` does not match the signature declared for slot {index:?}",
                    delegate.function
                );
            }
        }
    }

    fn check_get(&self, index: CallIndex) {
        if cfg!(debug_assertions) && !self.checks_disabled(index) && index == CallIndex::Return {
            let flags = self.state.get_frame(self.frame).flags;
            debug_assert!(
                flags.invoked || flags.return_set,
                "reading the return value before invoke"
            );
        }
    }

    fn mark(&mut self, index: CallIndex) {
        let flags = self.flags_mut();
        match index {
            CallIndex::Return => {
                debug_assert!(!flags.return_set, "return value set twice");
                flags.return_set = true;
            }
            CallIndex::Param(i) => {
                debug_assert!(
                    i >= CallFlags::MAX_TRACKED_PARAMS || !flags.param_set(i),
                    "parameter {i} set twice"
                );
                flags.mark_param(i);
            }
            CallIndex::This => {
                debug_assert!(!flags.this_set, "receiver set twice");
                flags.this_set = true;
            }
        }
    }
}

/// Destructs the signature slots this call owns (honoring the per-slot
/// disables) and pops frames until this call's own frame is off the stack.
/// Popping in a loop covers callees that pushed frames and then unwound
/// without popping them.
impl Drop for Call<'_> {
    fn drop(&mut self) {
        let frame = self.state.get_frame(self.frame);
        let function = frame.function.clone();
        let base = frame.base;
        let flags = frame.flags;
        let signature = &function.signature;

        if !flags.no_param_destruction {
            for index in 0..signature.params.len() {
                let slot = base + signature.param_slot(index);
                let value = self.state.take_slot(slot);
                self.state.heap.release_value(value);
            }
        }
        if !flags.no_this_destruction && signature.receiver.is_some() {
            let value = self.state.take_slot(base + signature.this_slot());
            self.state.heap.release_value(value);
        }
        if !flags.no_return_destruction && !signature.returns.is_void() {
            let value = self.state.take_slot(base + signature.return_slot());
            self.state.heap.release_value(value);
        }

        if flags.invoked {
            self.state.sink().exit_function(&FunctionEvent {
                function: function.name.clone(),
                owner: function.owner.clone(),
                frame_base: base,
            });
        }

        loop {
            let popped = self.state.pop_frame();
            if popped == self.frame {
                break;
            }
        }
    }
}
