use std::sync::Arc;

use crate::handle::Handle;
use crate::library::{FieldDef, TypeDef, TypeRef};
use crate::val::Value;

use super::Heap;

fn node_type() -> Arc<TypeDef> {
    let mut ty = TypeDef::new("Node");
    ty.fields
        .push(Arc::new(FieldDef::new("next", TypeRef::class("Node"))));
    Arc::new(ty)
}

#[test]
fn test_allocate_get_release() {
    let mut heap = Heap::new(16);
    let ty = node_type();

    let id = heap.allocate(&ty).unwrap();
    assert_eq!(heap.live_count(), 1);
    assert_eq!(heap.get(id).unwrap().fields.len(), 1);

    heap.release(id);
    assert_eq!(heap.live_count(), 0);
    assert!(heap.get(id).is_none());
}

#[test]
fn test_stale_ids_miss_after_slot_reuse() {
    let mut heap = Heap::new(16);
    let ty = node_type();

    let first = heap.allocate(&ty).unwrap();
    heap.release(first);

    // The slot is recycled under a new generation.
    let second = heap.allocate(&ty).unwrap();
    assert!(heap.get(first).is_none());
    assert!(heap.get(second).is_some());
    heap.release(second);
}

#[test]
fn test_retain_keeps_an_object_alive() {
    let mut heap = Heap::new(16);
    let ty = node_type();

    let id = heap.allocate(&ty).unwrap();
    heap.retain(id);
    heap.release(id);
    assert_eq!(heap.live_count(), 1);
    heap.release(id);
    assert_eq!(heap.live_count(), 0);
}

#[test]
fn test_release_cascades_through_reference_fields() {
    let mut heap = Heap::new(16);
    let ty = node_type();

    // head -> middle -> tail, each held only by its predecessor.
    let tail = heap.allocate(&ty).unwrap();
    let middle = heap.allocate(&ty).unwrap();
    let head = heap.allocate(&ty).unwrap();
    heap.get_mut(middle).unwrap().fields[0] = Value::Handle(Handle::heap(tail, ty.clone()));
    heap.get_mut(head).unwrap().fields[0] = Value::Handle(Handle::heap(middle, ty.clone()));

    assert_eq!(heap.live_count(), 3);
    heap.release(head);
    assert_eq!(heap.live_count(), 0);
}

#[test]
fn test_capacity_limit_stops_allocation() {
    let mut heap = Heap::new(2);
    let ty = node_type();

    let a = heap.allocate(&ty).unwrap();
    let _b = heap.allocate(&ty).unwrap();
    assert!(heap.allocate(&ty).is_none());

    heap.release(a);
    assert!(heap.allocate(&ty).is_some());
}

#[test]
fn test_disable_allocation_nests() {
    let mut heap = Heap::new(16);
    let ty = node_type();

    heap.disable_allocation();
    heap.disable_allocation();
    assert!(heap.allocate(&ty).is_none());
    heap.enable_allocation();
    assert!(heap.allocate(&ty).is_none());
    heap.enable_allocation();
    assert!(heap.allocate(&ty).is_some());
}
