//! The built-in `Core` library. Every execution state depends on it; it
//! provides the `Exception` type that thrown errors are instances of.

use std::sync::Arc;

use once_cell::sync::Lazy;

use super::types::{FieldDef, TypeDef, TypeRef};
use super::Library;

pub const CORE_LIBRARY: &str = "Core";
pub const EXCEPTION_TYPE: &str = "Exception";
pub const EXCEPTION_MESSAGE_FIELD: &str = "message";

static CORE: Lazy<Arc<Library>> = Lazy::new(build_core_library);

pub fn core_library() -> Arc<Library> {
    CORE.clone()
}

fn build_core_library() -> Arc<Library> {
    let mut lib = Library::new(CORE_LIBRARY);

    let mut exception = TypeDef::new(EXCEPTION_TYPE);
    exception
        .fields
        .push(Arc::new(FieldDef::new(EXCEPTION_MESSAGE_FIELD, TypeRef::Str)));
    lib.add_type(Arc::new(exception));

    Arc::new(lib)
}
