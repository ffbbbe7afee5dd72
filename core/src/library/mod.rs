//! Compiled code descriptions: libraries, types, fields, and functions.
//!
//! Everything here is immutable once built and shared through `Arc`. The
//! execution state never mutates a library; live patching layers id-keyed
//! replacement maps on top instead (see `state::patch`).

mod core_lib;
mod function;
mod types;

pub use core_lib::{CORE_LIBRARY, EXCEPTION_MESSAGE_FIELD, EXCEPTION_TYPE, core_library};
pub use function::{FnBody, Function, NativeFn, Param, Signature, SourceLoc, next_function_id};
pub use types::{FieldDef, SlotKind, TypeDef, TypeRef, next_type_id};

use std::sync::Arc;

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};

/// A named collection of type definitions. Libraries are the unit of
/// dependency and of live patching.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: Arc<str>,
    types: FastHashMap<Arc<str>, Arc<TypeDef>>,
    free_functions: Vec<Arc<Function>>,
}

impl Library {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            types: fast_hash_map_new(),
            free_functions: Vec::new(),
        }
    }

    pub fn add_type(&mut self, ty: Arc<TypeDef>) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn get_type(&self, name: &str) -> Option<&Arc<TypeDef>> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<TypeDef>> {
        self.types.values()
    }

    pub fn add_function(&mut self, function: Arc<Function>) {
        self.free_functions.push(function);
    }

    pub fn free_functions(&self) -> &[Arc<Function>] {
        &self.free_functions
    }

    pub fn find_free_function(&self, name: &str, signature: &Signature) -> Option<&Arc<Function>> {
        self.free_functions
            .iter()
            .find(|f| f.name.as_ref() == name && f.signature == *signature)
    }
}

#[cfg(test)]
mod library_test;
