use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::StateConfig;
use crate::exception::ExceptionReport;
use crate::handle::Handle;
use crate::library::{Function, Param, Signature, TypeRef};
use crate::val::{Delegate, Value};

use super::testing::*;
use super::{Call, CallIndex, ExecutionState};

#[test]
fn test_native_call_round_trip() {
    let mut state = new_state();
    let add = add_fn();
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &add);
    call.set_value(CallIndex::Param(0), Value::Int(1));
    call.set_value(CallIndex::Param(1), Value::Int(2));
    assert!(call.invoke(&mut report));
    assert_eq!(call.take_return(), Value::Int(3));
    drop(call);

    assert!(!state.is_in_call_stack());
    assert!(!report.has_thrown());
}

#[test]
fn test_null_receiver_throws_without_running_the_body() {
    let mut state = new_state();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_body = ran.clone();
    let method = Arc::new(Function::native(
        "poke",
        "Point",
        Signature::method(Vec::new(), TypeRef::Void, TypeRef::class("Point")),
        move |_, _| {
            ran_in_body.store(true, Ordering::SeqCst);
        },
    ));
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &method);
    call.set_handle(CallIndex::This, Handle::null());
    assert!(!call.invoke(&mut report));
    drop(call);

    assert!(report.has_thrown());
    assert!(report.thrown()[0].message.contains("null"));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!state.is_in_call_stack());
    state.clear_report(&mut report);
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_instance_call_reads_its_receiver() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Counter", &[("count", TypeRef::Int)]));
    let method = Arc::new(Function::native(
        "get",
        "Counter",
        Signature::method(Vec::new(), TypeRef::Int, TypeRef::class("Counter")),
        |call, _report| {
            let this = call.get_handle(CallIndex::This);
            let count = call.state().get_field(&this, "count").unwrap();
            call.set_value(CallIndex::Return, count);
        },
    ));
    let mut report = ExceptionReport::new();

    let object = state.allocate_object(&ty, &mut report);
    state.set_field(&object, "count", Value::Int(41)).unwrap();

    let mut call = Call::from_delegate(&mut state, &Delegate::new(method, object.clone()));
    assert!(call.invoke(&mut report));
    assert_eq!(call.take_return(), Value::Int(41));
    drop(call);

    state.release_handle(&object);
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_returned_reference_ownership_transfers_to_the_caller() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Box", &[("v", TypeRef::Int)]));
    let body_ty = ty.clone();
    let make = Arc::new(
        Function::native(
            "make",
            "",
            Signature::new(Vec::new(), TypeRef::class("Box")),
            move |call, report| {
                let handle = call.state().allocate_object(&body_ty, report);
                call.set_handle(CallIndex::Return, handle.clone());
                // The return slot holds its own reference now.
                call.state().release_handle(&handle);
            },
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &make);
    assert!(call.invoke(&mut report));
    let result = call.take_return();
    drop(call);

    let Value::Handle(handle) = result else {
        panic!("expected a handle, got {result:?}");
    };
    assert_eq!(state.heap_live_count(), 1);
    state.release_handle(&handle);
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_unconsumed_return_is_destructed_by_the_call() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Box", &[("v", TypeRef::Int)]));
    let body_ty = ty.clone();
    let make = Arc::new(
        Function::native(
            "make",
            "",
            Signature::new(Vec::new(), TypeRef::class("Box")),
            move |call, report| {
                let handle = call.state().allocate_object(&body_ty, report);
                call.set_handle(CallIndex::Return, handle.clone());
                call.state().release_handle(&handle);
            },
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &make);
    assert!(call.invoke(&mut report));
    drop(call); // return value never taken

    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_parameters_are_destructed_even_when_the_body_throws() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Box", &[("v", TypeRef::Int)]));
    let thrower = Arc::new(
        Function::native(
            "explode",
            "",
            Signature::new(vec![Param::new("victim", TypeRef::class("Box"))], TypeRef::Void),
            |call, report| {
                let message = "deliberate failure".to_string();
                call.state().throw_exception(report, &message);
            },
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let object = state.allocate_object(&ty, &mut report);

    let mut call = Call::new(&mut state, &thrower);
    call.set_handle(CallIndex::Param(0), object.clone());
    assert!(!call.invoke(&mut report));
    drop(call);

    assert!(report.has_thrown());
    state.clear_report(&mut report);
    state.release_handle(&object);
    // The parameter slot's reference was released by the call's teardown;
    // only the exception object is gone too once the report is cleared.
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_call_drop_pops_frames_left_by_an_unwound_callee() {
    let mut state = new_state();
    let inner = void_fn("inner");
    let inner_fn = inner.clone();
    let outer = Arc::new(
        Function::native(
            "outer",
            "",
            Signature::new(Vec::new(), TypeRef::Void),
            move |call, _report| {
                // Push a frame and leave it on the stack, as an unwinding
                // callee would.
                call.state().push_frame(&inner_fn);
            },
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &outer);
    assert!(call.invoke(&mut report));
    drop(call);

    assert!(!state.is_in_call_stack());
}

#[test]
fn test_invoke_on_a_recursion_limited_frame_throws() {
    let mut state = ExecutionState::new(StateConfig {
        max_recursion_depth: 0,
        ..StateConfig::default()
    });
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &void_fn("too_deep"));
    assert!(!call.invoke(&mut report));
    drop(call);

    assert!(report.has_thrown());
    assert!(report.thrown()[0].message.contains("recursion"));
    state.clear_report(&mut report);
}

#[test]
fn test_exception_trace_spans_the_active_frames() {
    let mut state = new_state();
    let inner = Arc::new(
        Function::native(
            "inner",
            "",
            Signature::new(Vec::new(), TypeRef::Void),
            |call, report| {
                call.state().throw_exception(report, "boom");
            },
        )
        .with_static(true),
    );
    let inner_fn = inner.clone();
    let outer = Arc::new(
        Function::native(
            "outer",
            "",
            Signature::new(Vec::new(), TypeRef::Void),
            move |call, report| {
                let mut nested = Call::new(call.state(), &inner_fn);
                nested.invoke(report);
            },
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &outer);
    assert!(!call.invoke(&mut report));
    drop(call);

    let trace = &report.thrown()[0].trace;
    let names: Vec<_> = trace.entries.iter().map(|e| e.function.as_ref()).collect();
    assert_eq!(names, ["outer", "inner"]);
    state.clear_report(&mut report);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "writing call inputs after invoke")]
fn test_parameter_writes_are_rejected_after_invoke() {
    let mut state = new_state();
    let add = add_fn();
    let mut report = ExceptionReport::new();

    let mut call = Call::new(&mut state, &add);
    call.set_value(CallIndex::Param(0), Value::Int(1));
    call.set_value(CallIndex::Param(1), Value::Int(2));
    assert!(call.invoke(&mut report));
    // The inputs are frozen now; only the body may keep writing its slots.
    call.set_value(CallIndex::Param(0), Value::Int(9));
}

#[test]
fn test_derived_reference_fits_a_base_declared_parameter() {
    let mut state = new_state();
    let animal = Arc::new(class_type("Animal", &[("legs", TypeRef::Int)]));
    let mut dog = class_type("Dog", &[("name", TypeRef::Str)]);
    dog.base = Some(animal.clone());
    let dog = Arc::new(dog);
    let pet = Arc::new(
        Function::native(
            "pet",
            "",
            Signature::new(
                vec![Param::new("animal", TypeRef::class("Animal"))],
                TypeRef::Void,
            ),
            |_, _| {},
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let object = state.allocate_object(&dog, &mut report);

    let mut call = Call::new(&mut state, &pet);
    call.set_handle(CallIndex::Param(0), object.clone());
    assert!(call.invoke(&mut report));
    drop(call);

    state.release_handle(&object);
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "does not fit")]
fn test_unrelated_reference_is_rejected_for_a_class_parameter() {
    let mut state = new_state();
    let rock = Arc::new(class_type("Rock", &[("mass", TypeRef::Int)]));
    let pet = Arc::new(
        Function::native(
            "pet",
            "",
            Signature::new(
                vec![Param::new("animal", TypeRef::class("Animal"))],
                TypeRef::Void,
            ),
            |_, _| {},
        )
        .with_static(true),
    );
    let mut report = ExceptionReport::new();

    let object = state.allocate_object(&rock, &mut report);
    let mut call = Call::new(&mut state, &pet);
    call.set_handle(CallIndex::Param(0), object);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "does not match the signature")]
fn test_delegate_parameter_signature_is_checked() {
    let mut state = new_state();
    let callback = Arc::new(Signature::new(Vec::new(), TypeRef::Void));
    let on_done = Arc::new(
        Function::native(
            "on_done",
            "",
            Signature::new(vec![Param::new("cb", TypeRef::Fn(callback))], TypeRef::Void),
            |_, _| {},
        )
        .with_static(true),
    );

    let mut call = Call::new(&mut state, &on_done);
    // `add` takes two ints; the slot demands a parameterless void callback.
    call.set_delegate(CallIndex::Param(0), Delegate::new(add_fn(), Handle::null()));
}
