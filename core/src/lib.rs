pub mod config;
pub mod events;
pub mod exception;
pub mod handle;
pub mod heap;
pub mod library;
pub mod state;
pub mod util;
pub mod val;

pub use config::StateConfig;
pub use events::{EventSink, ExceptionEvent, FatalError, FunctionEvent, MemoryLeakEvent, TracingSink};
pub use exception::{ExceptionReport, StackEntry, StackTrace, ThrownException};
pub use handle::{Handle, HandleKind, HeapId, ScopeId};
pub use library::{
    FieldDef, FnBody, Function, Library, Param, Signature, SlotKind, SourceLoc, TypeDef, TypeRef,
    core_library,
};
pub use state::{
    Call, CallIndex, ExecutionState, FrameId, Interpreter, Pc, SNIPPET_ENTRY,
    SNIPPET_PROGRAM_TYPE, SnippetCompiler, StackError,
};
pub use val::{Delegate, Value};
