//! Object construction and static field storage.
//!
//! Construction is two-phase: allocation writes every field's declared
//! default, then the pre-constructor chain runs base-most first, then (for the
//! convenience entry points) a constructor. A throw at any phase releases the
//! partial object and yields the null handle.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::trace;

use crate::exception::ExceptionReport;
use crate::handle::Handle;
use crate::library::{FieldDef, Function, TypeDef, TypeRef};
use crate::val::Value;

use super::call::{Call, CallIndex};
use super::frame::FrameId;
use super::ExecutionState;

impl ExecutionState {
    /// Resolves a type by name across the state's dependencies, honoring live
    /// patches.
    pub fn find_type(&self, name: &str) -> Option<Arc<TypeDef>> {
        for library in &self.dependencies {
            if let Some(ty) = library.get_type(name) {
                return Some(self.resolve_patched_type(ty));
            }
        }
        None
    }

    pub(crate) fn resolve_patched_type(&self, ty: &Arc<TypeDef>) -> Arc<TypeDef> {
        self.patched_types
            .get(&ty.id)
            .cloned()
            .unwrap_or_else(|| ty.clone())
    }

    /// Allocates an object of `ty` and runs its pre-constructor chain, but no
    /// constructor. Returns the null handle (with an exception on `report`)
    /// when the heap is exhausted or a pre-constructor throws. The returned
    /// handle owns one reference; release it when done.
    pub fn allocate_object(&mut self, ty: &Arc<TypeDef>, report: &mut ExceptionReport) -> Handle {
        let ty = self.resolve_patched_type(ty);
        let Some(id) = self.heap.allocate(&ty) else {
            self.throw_exception(
                report,
                &format!("unable to allocate a new `{}`: the heap is exhausted", ty.name),
            );
            return Handle::null();
        };
        if let Some(object) = self.heap.get_mut(id) {
            for (index, field) in ty.fields.iter().enumerate() {
                object.fields[index] = field.ty.default_value();
            }
        }
        let handle = Handle::heap(id, ty);
        if !self.invoke_pre_constructors(&handle, report) {
            self.release_handle(&handle);
            return Handle::null();
        }
        handle
    }

    /// Allocates an object and runs its default constructor. Scripted types
    /// with no constructors at all are allowed and come out field-defaulted;
    /// a native type without a default constructor is an embedder error.
    pub fn allocate_default_constructed(
        &mut self,
        ty: &Arc<TypeDef>,
        report: &mut ExceptionReport,
    ) -> Result<Handle> {
        let ty = self.resolve_patched_type(ty);
        let constructor = match ty.default_constructor() {
            Some(ctor) => Some(ctor.clone()),
            None if ty.constructors.is_empty() && !ty.native => None,
            None => bail!(
                "type `{}` cannot be default constructed: no zero-parameter constructor",
                ty.name
            ),
        };

        let handle = self.allocate_object(&ty, report);
        if handle.is_null() {
            return Ok(handle);
        }
        if let Some(constructor) = constructor {
            if !self.invoke_constructor(&constructor, &handle, None, report) {
                self.release_handle(&handle);
                return Ok(Handle::null());
            }
        }
        Ok(handle)
    }

    /// Allocates an object initialized from `source` through the type's copy
    /// constructor (a one-parameter constructor taking the same class).
    pub fn allocate_copy_constructed(
        &mut self,
        ty: &Arc<TypeDef>,
        source: &Handle,
        report: &mut ExceptionReport,
    ) -> Result<Handle> {
        let ty = self.resolve_patched_type(ty);
        let Some(constructor) = ty.copy_constructor().cloned() else {
            bail!("type `{}` has no copy constructor", ty.name);
        };

        let handle = self.allocate_object(&ty, report);
        if handle.is_null() {
            return Ok(handle);
        }
        if !self.invoke_constructor(&constructor, &handle, Some(source), report) {
            self.release_handle(&handle);
            return Ok(Handle::null());
        }
        Ok(handle)
    }

    /// Builds an object directly in `frame`'s slots, starting at the
    /// frame-relative `base_slot`. The handle is tied to the frame's current
    /// scope and goes stale when that scope ends; the object's reference
    /// slots should be queued for scope cleanup by whoever populates them.
    pub fn allocate_stack_object(
        &mut self,
        frame: FrameId,
        base_slot: usize,
        ty: &Arc<TypeDef>,
        report: &mut ExceptionReport,
    ) -> Handle {
        let ty = self.resolve_patched_type(ty);
        let record = self.get_frame(frame);
        let base = record.base + base_slot;
        debug_assert!(
            base + ty.size() <= record.next,
            "stack object does not fit inside its frame"
        );

        for (index, field) in ty.fields.iter().enumerate() {
            self.replace_slot(base + index, field.ty.default_value());
        }

        let scope = self.current_scope(frame);
        let handle = Handle::stack(base, scope, self.scope_unique_id(scope), ty);
        if !self.invoke_pre_constructors(&handle, report) {
            return Handle::null();
        }
        handle
    }

    /// Reads a static field, running its initializer on first access. The
    /// initializer runs at most once, even if it throws; the field then keeps
    /// its declared default.
    pub fn get_static_field(
        &mut self,
        field: &Arc<FieldDef>,
        report: &mut ExceptionReport,
    ) -> Value {
        debug_assert!(field.is_static, "get_static_field on an instance field");
        if !self.statics.contains_key(&field.id) {
            self.statics.insert(field.id, field.ty.default_value());
            if let Some(initializer) = field.initializer.clone() {
                trace!(field = %field.name, "running static initializer");
                let mut call = Call::new(self, &initializer);
                let value = if call.invoke(report) {
                    Some(call.take_return())
                } else {
                    None
                };
                drop(call);
                if let Some(value) = value {
                    self.statics.insert(field.id, value);
                }
            }
        }
        self.statics.get(&field.id).cloned().unwrap_or(Value::Null)
    }

    pub fn set_static_field(&mut self, field: &Arc<FieldDef>, value: Value) {
        debug_assert!(field.is_static, "set_static_field on an instance field");
        self.heap.retain_value(&value);
        let old = self.statics.insert(field.id, value);
        if let Some(old) = old {
            self.heap.release_value(old);
        }
    }

    /// A raw handle onto a class-typed static field's storage cell. Statics
    /// outlive every frame, so the handle never goes stale.
    pub fn static_field_handle(
        &mut self,
        field: &Arc<FieldDef>,
        report: &mut ExceptionReport,
    ) -> Handle {
        let TypeRef::Class(type_name) = &field.ty else {
            return Handle::null();
        };
        let Some(ty) = self.find_type(type_name) else {
            return Handle::null();
        };
        // Force initialization so the cell exists.
        self.get_static_field(field, report);
        Handle::raw(field.id, ty)
    }

    /// Runs pre-constructors base-most first. Returns `false` (with the
    /// exception on `report`) as soon as one throws.
    fn invoke_pre_constructors(&mut self, handle: &Handle, report: &mut ExceptionReport) -> bool {
        let Some(ty) = handle.stored_type().cloned() else {
            return true;
        };
        let mut chain = Vec::new();
        let mut current = Some(ty);
        while let Some(level) = current {
            if let Some(pre) = &level.pre_constructor {
                chain.push(pre.clone());
            }
            current = level.base.clone();
        }
        for pre in chain.iter().rev() {
            if !self.invoke_constructor(pre, handle, None, report) {
                return false;
            }
        }
        true
    }

    fn invoke_constructor(
        &mut self,
        constructor: &Arc<Function>,
        this: &Handle,
        source: Option<&Handle>,
        report: &mut ExceptionReport,
    ) -> bool {
        let mut call = Call::new(self, constructor);
        if let Some(source) = source {
            call.set_handle(CallIndex::Param(0), source.clone());
        }
        call.set_handle(CallIndex::This, this.clone());
        call.invoke(report)
    }
}
