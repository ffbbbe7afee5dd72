//! Raising exceptions and capturing stack traces.

use std::sync::Arc;

use tracing::warn;

use crate::events::ExceptionEvent;
use crate::exception::{ExceptionReport, StackEntry, StackTrace, ThrownException};
use crate::handle::Handle;
use crate::library::EXCEPTION_MESSAGE_FIELD;
use crate::val::Value;

use super::frame::{FrameId, Pc, StackError};
use super::ExecutionState;

/// Message recorded when an exception occurred but no exception object could
/// be built, e.g. the heap was at capacity.
pub(crate) const EXCEPTION_UNALLOCATABLE: &str =
    "an exception occurred, but the exception object could not be allocated";

impl ExecutionState {
    /// Raises an exception carrying `message`. An `Exception` object is
    /// allocated and recorded on the report (the report owns one reference to
    /// it); if allocation fails the report is force-marked as thrown instead,
    /// so the condition is never lost.
    pub fn throw_exception(&mut self, report: &mut ExceptionReport, message: &str) {
        let trace = self.capture_stack_trace();
        let exception_type = self.exception_type();
        let message: Arc<str> = Arc::from(message);

        match self.heap.allocate(&exception_type) {
            Some(id) => {
                if let Some(object) = self.heap.get_mut(id) {
                    // Slot 0 is the message field; see the core library.
                    if let Some(index) = object.ty.field_index(EXCEPTION_MESSAGE_FIELD) {
                        object.fields[index] = Value::Str(message.clone());
                    }
                }
                let handle = Handle::heap(id, exception_type);
                self.notify_thrown(&message, &trace);
                report.thrown.push(ThrownException {
                    exception: handle,
                    message,
                    trace,
                });
            }
            None => {
                warn!(original = %message, "exception object could not be allocated");
                let placeholder: Arc<str> = Arc::from(EXCEPTION_UNALLOCATABLE);
                self.notify_thrown(&placeholder, &trace);
                report.force_thrown = true;
            }
        }
    }

    /// Records an exception object the caller already built. The report takes
    /// one reference of its own; the caller keeps whatever it held.
    pub fn throw_exception_object(&mut self, report: &mut ExceptionReport, exception: Handle) {
        let trace = self.capture_stack_trace();
        let message: Arc<str> = match self.get_field(&exception, EXCEPTION_MESSAGE_FIELD) {
            Ok(Value::Str(s)) => s,
            _ => Arc::from(""),
        };
        self.retain_handle(&exception);
        self.notify_thrown(&message, &trace);
        report.thrown.push(ThrownException {
            exception,
            message,
            trace,
        });
    }

    pub fn throw_null_reference(&mut self, report: &mut ExceptionReport, context: &str) {
        self.throw_exception(report, &format!("attempted to access a null object: {context}"));
    }

    pub fn throw_not_implemented(&mut self, report: &mut ExceptionReport) {
        self.throw_exception(
            report,
            "the function is not implemented on this state (no interpreter is installed)",
        );
    }

    /// Walks the active frames, outermost first. Frames that were pushed but
    /// never started executing are skipped, except the innermost one, which is
    /// reported so the function being entered still shows up.
    pub fn capture_stack_trace(&self) -> StackTrace {
        let mut trace = StackTrace::default();
        let active: Vec<FrameId> = self.frames.iter().skip(1).copied().collect();
        for (position, id) in active.iter().enumerate() {
            let frame = self.get_frame(*id);
            let innermost = position + 1 == active.len();
            let pc = match frame.pc {
                Pc::At(pc) => Some(pc),
                Pc::Native => None,
                Pc::NotActive if innermost => None,
                Pc::NotActive => continue,
            };
            trace.entries.push(StackEntry {
                function: frame.function.name.clone(),
                owner: frame.function.owner.clone(),
                location: frame.function.location.clone(),
                pc,
            });
        }
        trace
    }

    /// Converts a pending stack condition on `frame` into a thrown exception.
    /// Only the first frame to trip a condition throws; deeper frames see the
    /// latched flag and fail fast without a second exception.
    pub(crate) fn attempt_throw_stack_exceptions(
        &mut self,
        frame: FrameId,
        report: &mut ExceptionReport,
    ) -> bool {
        let error_state = self.get_frame(frame).error_state;
        if error_state == StackError::Normal {
            return false;
        }
        if self.hit_stack_error() {
            // Already thrown by an inner frame; keep failing fast while the
            // stack unwinds, without raising a second exception.
            report.force_thrown = true;
            return true;
        }
        self.set_hit_stack_error();
        match error_state {
            StackError::MaxRecursionReached => self.throw_exception(
                report,
                "the maximum recursion depth was reached (too many nested calls)",
            ),
            StackError::Overflowed => self.throw_exception(
                report,
                "the stack ran out of space (calls or locals use too many slots)",
            ),
            StackError::Normal => unreachable!("checked above"),
        }
        true
    }

    fn notify_thrown(&self, message: &Arc<str>, trace: &StackTrace) {
        self.sink().exception_thrown(&ExceptionEvent {
            message: message.clone(),
            trace: trace.clone(),
        });
    }
}
