use std::sync::Arc;

use crate::config::StateConfig;
use crate::exception::ExceptionReport;
use crate::library::{Function, Signature, TypeRef};
use crate::val::Value;

use super::testing::*;
use super::{ExecutionState, StackError};

#[test]
fn test_frames_pop_in_lifo_order() {
    let mut state = new_state();
    let f = void_fn("noop");

    let a = state.push_frame(&f);
    let b = state.push_frame(&f);
    let c = state.push_frame(&f);
    assert_eq!(state.frame_depth(), 3);

    assert_eq!(state.pop_frame(), c);
    assert_eq!(state.pop_frame(), b);
    assert_eq!(state.pop_frame(), a);
    assert_eq!(state.frame_depth(), 0);
    assert!(!state.is_in_call_stack());
}

#[test]
fn test_fresh_frame_has_exactly_one_scope() {
    let mut state = new_state();
    let id = state.push_frame(&void_fn("noop"));
    assert_eq!(state.get_frame(id).scopes.len(), 1);
    state.pop_frame();
}

#[test]
fn test_scope_unique_ids_are_never_reused() {
    let mut state = new_state();

    let a = state.push_frame(&void_fn("noop"));
    let first = state.scope_unique_id(state.current_scope(a));
    state.pop_frame();

    // The second frame recycles the scope record but must get a fresh id.
    let b = state.push_frame(&void_fn("noop"));
    let second = state.scope_unique_id(state.current_scope(b));
    state.pop_frame();

    assert!(second > first);
}

#[test]
fn test_scope_cleanup_releases_registered_slots_exactly_once() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Node", &[("next", TypeRef::class("Node"))]));
    let mut report = ExceptionReport::new();

    let frame = state.push_frame(&Arc::new(Function::interpreted(
        "locals",
        "",
        Signature::new(Vec::new(), TypeRef::Void),
        2,
    )));
    let local = state.get_frame(frame).base + 1;

    let object = state.allocate_object(&ty, &mut report);
    assert!(!report.has_thrown());
    state.retain_handle(&object);
    state.replace_slot(local, Value::Handle(object.clone()));
    state.queue_handle_cleanup(frame, local);
    state.release_handle(&object);
    assert_eq!(state.heap_live_count(), 1);

    state.pop_frame();
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_closing_an_inner_scope_runs_its_cleanup_early() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Node", &[("next", TypeRef::class("Node"))]));
    let mut report = ExceptionReport::new();

    let frame = state.push_frame(&Arc::new(Function::interpreted(
        "locals",
        "",
        Signature::new(Vec::new(), TypeRef::Void),
        2,
    )));
    let local = state.get_frame(frame).base + 1;

    state.open_scope(frame);
    let object = state.allocate_object(&ty, &mut report);
    state.retain_handle(&object);
    state.replace_slot(local, Value::Handle(object.clone()));
    state.queue_handle_cleanup(frame, local);
    state.release_handle(&object);

    state.close_scope(frame);
    assert_eq!(state.heap_live_count(), 0);
    assert!(state.slot(local).is_null());

    // The frame's own cleanup must not touch the already-drained scope.
    state.pop_frame();
    assert_eq!(state.heap_live_count(), 0);
}

#[test]
fn test_stack_handles_go_stale_when_their_scope_ends() {
    let mut state = new_state();
    let ty = Arc::new(class_type("Pair", &[("a", TypeRef::Int), ("b", TypeRef::Int)]));
    let mut report = ExceptionReport::new();

    let frame = state.push_frame(&Arc::new(Function::interpreted(
        "locals",
        "",
        Signature::new(Vec::new(), TypeRef::Void),
        4,
    )));
    let handle = state.allocate_stack_object(frame, 1, &ty, &mut report);
    assert!(state.handle_valid(&handle));
    assert_eq!(state.get_field(&handle, "a").unwrap(), Value::Int(0));

    state.pop_frame();
    assert!(!state.handle_valid(&handle));
    assert!(state.get_field(&handle, "a").is_err());
}

#[test]
fn test_recursion_limit_marks_the_offending_frame() {
    let mut state = ExecutionState::new(StateConfig {
        max_recursion_depth: 4,
        ..StateConfig::default()
    });
    let f = void_fn("noop");

    let mut frames = Vec::new();
    for _ in 0..5 {
        frames.push(state.push_frame(&f));
    }
    assert_eq!(state.frame_error_state(frames[3]), StackError::Normal);
    assert_eq!(
        state.frame_error_state(frames[4]),
        StackError::MaxRecursionReached
    );
    while state.is_in_call_stack() {
        state.pop_frame();
    }
}

#[test]
fn test_overflow_is_recoverable_after_popping() {
    let mut state = ExecutionState::new(StateConfig {
        stack_slots: 8,
        reserve_slots: 64,
        max_recursion_depth: 1024,
        ..StateConfig::default()
    });
    let f = void_fn("noop"); // one slot per frame

    let mut frames = Vec::new();
    loop {
        let id = state.push_frame(&f);
        frames.push(id);
        if state.frame_error_state(id) == StackError::Overflowed {
            break;
        }
    }

    // The overflow surfaces as an exception and latches the state.
    let mut report = ExceptionReport::new();
    let overflowed = *frames.last().unwrap();
    assert!(state.attempt_throw_stack_exceptions(overflowed, &mut report));
    assert!(report.has_thrown());
    assert!(state.hit_stack_error());
    state.clear_report(&mut report);

    // Popping back below the limit clears the latch and pushes work again.
    while state.is_in_call_stack() {
        state.pop_frame();
    }
    assert!(!state.hit_stack_error());

    let id = state.push_frame(&f);
    assert_eq!(state.frame_error_state(id), StackError::Normal);
    state.pop_frame();
}

#[test]
fn test_depth_at_twice_the_limit_is_still_recoverable() {
    let mut state = ExecutionState::new(StateConfig {
        max_recursion_depth: 2,
        ..StateConfig::default()
    });
    let f = void_fn("noop");

    // Five pushes reach a depth of exactly twice the limit; only going past
    // that is unrecoverable, everything up to it throws like any other
    // recursion error.
    let mut frames = Vec::new();
    for _ in 0..5 {
        frames.push(state.push_frame(&f));
    }
    assert_eq!(state.frame_error_state(frames[1]), StackError::Normal);
    assert_eq!(
        state.frame_error_state(frames[4]),
        StackError::MaxRecursionReached
    );

    let mut report = ExceptionReport::new();
    assert!(state.attempt_throw_stack_exceptions(frames[4], &mut report));
    assert!(report.has_thrown());
    state.clear_report(&mut report);

    while state.is_in_call_stack() {
        state.pop_frame();
    }
    assert!(!state.hit_stack_error());
}
