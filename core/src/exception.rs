//! Exception reports and stack traces.
//!
//! A report is owned by whoever starts a call chain and is threaded down
//! through every nested call, so an exception raised deep inside surfaces at
//! the outermost caller. The report owns one heap reference per recorded
//! exception object; release them through
//! [`crate::state::ExecutionState::clear_report`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::handle::Handle;
use crate::library::SourceLoc;

#[derive(Debug, Clone, Serialize)]
pub struct StackEntry {
    pub function: Arc<str>,
    pub owner: Arc<str>,
    pub location: SourceLoc,
    /// Position within the function for interpreted frames; `None` for native
    /// code.
    pub pc: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StackTrace {
    /// Outermost call first.
    pub entries: Vec<StackEntry>,
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries.iter().rev() {
            if entry.owner.is_empty() {
                write!(f, "  at {}", entry.function)?;
            } else {
                write!(f, "  at {}.{}", entry.owner, entry.function)?;
            }
            if !entry.location.origin.is_empty() {
                write!(f, " ({}:{})", entry.location.origin, entry.location.line)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ThrownException {
    /// The exception object. The report owns one reference to it.
    pub exception: Handle,
    pub message: Arc<str>,
    pub trace: StackTrace,
}

#[derive(Debug, Default)]
pub struct ExceptionReport {
    pub(crate) thrown: Vec<ThrownException>,
    /// Set when an exception occurred but no exception object could be
    /// recorded, e.g. the heap was full. The report still counts as thrown.
    pub(crate) force_thrown: bool,
}

impl ExceptionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_thrown(&self) -> bool {
        self.force_thrown || !self.thrown.is_empty()
    }

    pub fn thrown(&self) -> &[ThrownException] {
        &self.thrown
    }

    pub fn force_thrown(&self) -> bool {
        self.force_thrown
    }

    /// All exception messages joined into one line, for embedders that want a
    /// single diagnostic string.
    pub fn concatenated_messages(&self) -> String {
        self.thrown
            .iter()
            .map(|t| t.message.as_ref())
            .collect::<Vec<_>>()
            .join(" / ")
    }
}
