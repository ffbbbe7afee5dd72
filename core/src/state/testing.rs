//! Shared builders and fixtures for the state tests.

use std::sync::{Arc, Mutex};

use crate::config::StateConfig;
use crate::events::{EventSink, ExceptionEvent, FunctionEvent, MemoryLeakEvent};
use crate::library::{FieldDef, Function, Library, Param, Signature, TypeDef, TypeRef};
use crate::val::Value;

use super::{CallIndex, ExecutionState};

pub fn new_state() -> ExecutionState {
    ExecutionState::new(StateConfig::default())
}

/// A native function that takes nothing, returns nothing, does nothing.
pub fn void_fn(name: &str) -> Arc<Function> {
    Arc::new(
        Function::native(name, "", Signature::new(Vec::new(), TypeRef::Void), |_, _| {})
            .with_static(true),
    )
}

/// `add(a: Int, b: Int) -> Int`, natively.
pub fn add_fn() -> Arc<Function> {
    Arc::new(
        Function::native(
            "add",
            "",
            Signature::new(
                vec![Param::new("a", TypeRef::Int), Param::new("b", TypeRef::Int)],
                TypeRef::Int,
            ),
            |call, _report| {
                let a = as_int(call.get(CallIndex::Param(0)));
                let b = as_int(call.get(CallIndex::Param(1)));
                call.set_value(CallIndex::Return, Value::Int(a + b));
            },
        )
        .with_static(true),
    )
}

pub fn as_int(value: Value) -> i64 {
    match value {
        Value::Int(i) => i,
        other => panic!("expected an int, got {other:?}"),
    }
}

pub fn class_type(name: &str, fields: &[(&str, TypeRef)]) -> TypeDef {
    let mut ty = TypeDef::new(name);
    for (field_name, field_ty) in fields {
        ty.fields
            .push(Arc::new(FieldDef::new(field_name, field_ty.clone())));
    }
    ty
}

pub fn library_with(name: &str, types: Vec<TypeDef>) -> Arc<Library> {
    let mut library = Library::new(name);
    for ty in types {
        library.add_type(Arc::new(ty));
    }
    Arc::new(library)
}

/// Event sink that records everything as strings for assertion.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn contains(&self, needle: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|event| event.contains(needle))
    }
}

impl EventSink for RecordingSink {
    fn enter_function(&self, event: &FunctionEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("enter {}", event.function));
    }

    fn exit_function(&self, event: &FunctionEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("exit {}", event.function));
    }

    fn exception_thrown(&self, event: &ExceptionEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("throw {}", event.message));
    }

    fn memory_leak(&self, event: &MemoryLeakEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("leak {}", event.type_name));
    }
}
