//! The object heap: a generational arena with explicit reference counts.
//!
//! Objects never move; a live patch swaps a slot's type and field vector in
//! place so every outstanding [`HeapId`] stays valid. Freeing bumps the slot's
//! generation, which turns stale handles into observable nulls instead of
//! dangling references.

use std::sync::Arc;

use tracing::trace;

use crate::handle::HeapId;
use crate::library::TypeDef;
use crate::val::Value;

#[derive(Debug)]
pub(crate) struct HeapObject {
    pub ty: Arc<TypeDef>,
    pub fields: Vec<Value>,
    pub refs: u32,
}

#[derive(Debug)]
struct HeapSlot {
    generation: u64,
    object: Option<HeapObject>,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
    /// Non-zero while allocation is forbidden (e.g. during scope cleanup,
    /// where a fresh allocation could never be rooted).
    allocation_disabled: usize,
}

impl Heap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
            allocation_disabled: 0,
        }
    }

    /// Allocates an object with every field set to null. Returns `None` when
    /// the heap is at capacity or allocation is currently disabled; the new
    /// object starts with one reference, owned by the caller.
    pub(crate) fn allocate(&mut self, ty: &Arc<TypeDef>) -> Option<HeapId> {
        if self.allocation_disabled > 0 || self.live >= self.capacity {
            return None;
        }
        let object = HeapObject {
            ty: ty.clone(),
            fields: vec![Value::Null; ty.size()],
            refs: 1,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].object = Some(object);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(HeapSlot {
                    generation: 0,
                    object: Some(object),
                });
                index
            }
        };
        self.live += 1;
        let id = HeapId {
            index,
            generation: self.slots[index as usize].generation,
        };
        trace!(type_name = %ty.name, index = id.index, "heap allocate");
        Some(id)
    }

    pub(crate) fn get(&self, id: HeapId) -> Option<&HeapObject> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_mut()
    }

    pub(crate) fn retain(&mut self, id: HeapId) {
        if let Some(object) = self.get_mut(id) {
            object.refs += 1;
        }
    }

    /// Drops one reference. When the count reaches zero the object's fields
    /// are released too, iteratively, so deep ownership chains cannot blow the
    /// Rust call stack.
    pub(crate) fn release(&mut self, id: HeapId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(slot) = self.slots.get_mut(id.index as usize) else {
                continue;
            };
            if slot.generation != id.generation {
                continue;
            }
            let Some(object) = slot.object.as_mut() else {
                continue;
            };
            object.refs = object.refs.saturating_sub(1);
            if object.refs > 0 {
                continue;
            }
            let Some(object) = slot.object.take() else {
                continue;
            };
            slot.generation += 1;
            self.free.push(id.index);
            self.live -= 1;
            trace!(type_name = %object.ty.name, index = id.index, "heap free");
            for value in &object.fields {
                collect_references(value, &mut work);
            }
        }
    }

    pub(crate) fn retain_value(&mut self, value: &Value) {
        let mut ids = Vec::new();
        collect_references(value, &mut ids);
        for id in ids {
            self.retain(id);
        }
    }

    /// Releases whatever reference the value carries and drops the value.
    pub(crate) fn release_value(&mut self, value: Value) {
        let mut ids = Vec::new();
        collect_references(&value, &mut ids);
        for id in ids {
            self.release(id);
        }
    }

    pub(crate) fn disable_allocation(&mut self) {
        self.allocation_disabled += 1;
    }

    pub(crate) fn enable_allocation(&mut self) {
        debug_assert!(self.allocation_disabled > 0, "allocation was not disabled");
        self.allocation_disabled = self.allocation_disabled.saturating_sub(1);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }

    pub(crate) fn live_objects(&self) -> impl Iterator<Item = (HeapId, &HeapObject)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.object.as_ref().map(|object| {
                (
                    HeapId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    object,
                )
            })
        })
    }

    /// Detaches an object's type and fields for field migration during a live
    /// patch. Must be paired with [`Heap::install_migrated`] on the same id.
    pub(crate) fn take_for_migration(&mut self, id: HeapId) -> Option<(Arc<TypeDef>, Vec<Value>)> {
        let object = self.get_mut(id)?;
        let ty = object.ty.clone();
        let fields = std::mem::take(&mut object.fields);
        Some((ty, fields))
    }

    pub(crate) fn install_migrated(&mut self, id: HeapId, ty: Arc<TypeDef>, fields: Vec<Value>) {
        if let Some(object) = self.get_mut(id) {
            object.ty = ty;
            object.fields = fields;
        }
    }
}

fn collect_references(value: &Value, out: &mut Vec<HeapId>) {
    match value {
        Value::Handle(handle) => {
            if let Some(id) = handle.heap_id() {
                out.push(id);
            }
        }
        Value::Delegate(delegate) => {
            if let Some(id) = delegate.receiver.heap_id() {
                out.push(id);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod heap_test;
