//! One-shot statement execution, the REPL/debugger entry point.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::exception::ExceptionReport;
use crate::library::Library;
use crate::val::Value;

use super::call::Call;
use super::ExecutionState;

/// The type a compiled snippet wraps its code in, and the static entry point
/// on it.
pub const SNIPPET_PROGRAM_TYPE: &str = "__Snippet";
pub const SNIPPET_ENTRY: &str = "Main";

/// Compiles a source snippet against a set of dependencies. The produced
/// library must contain a [`SNIPPET_PROGRAM_TYPE`] type with a static,
/// zero-parameter [`SNIPPET_ENTRY`] function whose return value is the
/// statement's result.
pub trait SnippetCompiler: Send + Sync {
    fn compile(&self, source: &str, dependencies: &[Arc<Library>]) -> Result<Arc<Library>>;
}

impl ExecutionState {
    /// Compiles and runs one statement, as a debugger console would.
    ///
    /// Failure to compile and script exceptions are expected in this setting,
    /// so both come back as `Ok` carrying the diagnostic text as the result
    /// value; `Err` is reserved for misuse, such as no compiler being
    /// installed.
    pub fn execute_statement(&mut self, source: &str) -> Result<Value> {
        let compiler = self
            .compiler
            .clone()
            .ok_or_else(|| anyhow!("no snippet compiler is installed on this state"))?;

        let library = match compiler.compile(source, &self.dependencies) {
            Ok(library) => library,
            Err(error) => return Ok(Value::str(error.to_string())),
        };

        // A snippet may shadow a dependency to redefine code on the fly; when
        // it does not, the patch is a no-op.
        self.force_patch_library(library.clone());

        let Some(program) = library.get_type(SNIPPET_PROGRAM_TYPE).cloned() else {
            return Ok(Value::str(format!(
                "the compiled snippet has no `{SNIPPET_PROGRAM_TYPE}` type"
            )));
        };
        let Some(entry) = program
            .functions
            .iter()
            .find(|f| f.name.as_ref() == SNIPPET_ENTRY && f.is_static && f.signature.params.is_empty())
            .cloned()
        else {
            return Ok(Value::str(format!(
                "the compiled snippet has no static `{SNIPPET_ENTRY}` entry point"
            )));
        };

        debug!(source, "executing snippet");
        let mut report = ExceptionReport::new();
        let mut call = Call::new(self, &entry);
        let completed = call.invoke(&mut report);
        let result = if completed {
            call.take_return()
        } else {
            Value::Null
        };
        drop(call);

        if report.has_thrown() {
            let mut message = report.concatenated_messages();
            if message.is_empty() {
                message = "an exception occurred".to_string();
            }
            self.clear_report(&mut report);
            return Ok(Value::str(message));
        }
        Ok(result)
    }
}
