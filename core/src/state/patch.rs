//! Live library patching.
//!
//! A patch never rewrites old definitions. The new library is laid alongside
//! the old one and two indirection maps are updated: original type id to new
//! type, original function id to new function. Frame pushes and allocations
//! resolve through these maps, so code compiled against the old library keeps
//! running and transparently lands in the new one. Live heap objects have
//! their fields migrated in place, preserving identity: every outstanding
//! handle still points at the same object.

use std::sync::Arc;

use anyhow::{Result, ensure};
use tracing::{debug, info, warn};

use crate::library::{FnBody, Function, Library, TypeDef, next_function_id};
use crate::val::Value;

use super::ExecutionState;

impl ExecutionState {
    /// Patches `new_library` over the dependency with the same name. Rejected
    /// while any call is active; a frame running an old function body must
    /// not see the world change under it.
    pub fn patch_library(&mut self, new_library: Arc<Library>) -> Result<()> {
        ensure!(
            !self.is_in_call_stack(),
            "cannot patch library `{}` while a call is executing",
            new_library.name
        );
        self.force_patch_library(new_library);
        Ok(())
    }

    /// Applies a patch unconditionally. If no dependency carries the new
    /// library's name there is nothing to patch and this is a no-op.
    pub fn force_patch_library(&mut self, new_library: Arc<Library>) {
        let Some(old_library) = self
            .dependencies
            .iter()
            .find(|library| library.name == new_library.name)
            .cloned()
        else {
            debug!(library = %new_library.name, "patch skipped: not a dependency");
            return;
        };

        self.patch_id += 1;
        info!(library = %new_library.name, patch_id = self.patch_id, "patching library");

        for old_type in old_library.types() {
            let new_type = new_library.get_type(&old_type.name).cloned();

            if let Some(new_type) = &new_type {
                self.patched_types.insert(old_type.id, new_type.clone());
                self.migrate_live_objects(new_type);
            }

            for old_function in old_type.constructors.iter() {
                let replacement = new_type.as_ref().and_then(|ty| {
                    ty.constructors
                        .iter()
                        .find(|ctor| ctor.signature == old_function.signature)
                        .cloned()
                });
                self.map_patched_function(old_function, replacement);
            }
            if let Some(old_pre) = &old_type.pre_constructor {
                let replacement = new_type.as_ref().and_then(|ty| ty.pre_constructor.clone());
                self.map_patched_function(old_pre, replacement);
            }
            for old_function in old_type.functions.iter() {
                let replacement = new_type.as_ref().and_then(|ty| {
                    ty.find_function(&old_function.name, &old_function.signature, old_function.is_static)
                        .cloned()
                });
                self.map_patched_function(old_function, replacement);
            }
        }

        for old_function in old_library.free_functions() {
            let replacement = new_library
                .find_free_function(&old_function.name, &old_function.signature)
                .cloned();
            self.map_patched_function(old_function, replacement);
        }

        self.patched_libraries.push(new_library);
    }

    fn map_patched_function(&mut self, old: &Arc<Function>, replacement: Option<Arc<Function>>) {
        let mapped = match replacement {
            Some(function) => function,
            None => {
                warn!(
                    function = %old,
                    "no counterpart in the patched library; calls become no-ops"
                );
                make_patch_dummy(old)
            }
        };
        self.patched_functions.insert(old.id, mapped);
    }

    /// Rewrites the fields of every live object of the patched type to the
    /// new layout, in the object's own heap slot. Fields that kept their name
    /// and type carry their value over; changed or removed fields release
    /// what they held; added fields come out defaulted.
    fn migrate_live_objects(&mut self, new_type: &Arc<TypeDef>) {
        let ids: Vec<_> = self
            .heap
            .live_objects()
            .filter(|(_, object)| object.ty.name == new_type.name)
            .map(|(id, _)| id)
            .collect();

        for id in ids {
            let Some((old_type, old_fields)) = self.heap.take_for_migration(id) else {
                continue;
            };
            let mut new_fields: Vec<Value> = new_type
                .fields
                .iter()
                .map(|field| field.ty.default_value())
                .collect();
            // Each old value is consumed exactly once: carried over or
            // released, never both.
            for (index, value) in old_fields.into_iter().enumerate() {
                let carried = old_type.fields.get(index).and_then(|old_field| {
                    new_type
                        .field_index(&old_field.name)
                        .filter(|&new_index| new_type.fields[new_index].ty == old_field.ty)
                });
                match carried {
                    Some(new_index) => new_fields[new_index] = value,
                    None => self.heap.release_value(value),
                }
            }
            self.heap.install_migrated(id, new_type.clone(), new_fields);
        }
    }
}

/// Stand-in for a function the patch removed: does nothing and returns the
/// declared return type's default.
fn make_patch_dummy(old: &Arc<Function>) -> Arc<Function> {
    let returns = old.signature.returns.clone();
    Arc::new(Function {
        id: next_function_id(),
        name: old.name.clone(),
        owner: old.owner.clone(),
        signature: old.signature.clone(),
        body: FnBody::Native(Arc::new(move |call, _report| {
            if !returns.is_void() {
                call.set_return_raw(returns.default_value());
            }
        })),
        required_slots: old.signature.frame_slots(),
        location: old.location.clone(),
        is_static: old.is_static,
    })
}
