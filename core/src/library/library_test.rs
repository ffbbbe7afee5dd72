use std::sync::Arc;

use super::*;

fn int_param(name: &str) -> Param {
    Param::new(name, TypeRef::Int)
}

#[test]
fn test_derives_from_or_is_walks_the_base_chain() {
    let animal = Arc::new(TypeDef::new("Animal"));
    let mut dog = TypeDef::new("Dog");
    dog.base = Some(animal);
    let dog = Arc::new(dog);

    assert!(dog.derives_from_or_is("Dog"));
    assert!(dog.derives_from_or_is("Animal"));
    assert!(!dog.derives_from_or_is("Cat"));
}

#[test]
fn test_field_index_follows_declaration_order() {
    let mut ty = TypeDef::new("Point");
    ty.fields.push(Arc::new(FieldDef::new("x", TypeRef::Int)));
    ty.fields.push(Arc::new(FieldDef::new("y", TypeRef::Int)));

    assert_eq!(ty.field_index("x"), Some(0));
    assert_eq!(ty.field_index("y"), Some(1));
    assert_eq!(ty.field_index("z"), None);
    assert_eq!(ty.size(), 2);
}

#[test]
fn test_copy_constructor_requires_the_same_class() {
    let mut ty = TypeDef::new("Vec2");
    ty.constructors.push(Arc::new(Function::native(
        "new",
        "Vec2",
        Signature::method(
            vec![Param::new("other", TypeRef::class("Vec2"))],
            TypeRef::Void,
            TypeRef::class("Vec2"),
        ),
        |_, _| {},
    )));
    ty.constructors.push(Arc::new(Function::native(
        "new",
        "Vec2",
        Signature::method(vec![int_param("x")], TypeRef::Void, TypeRef::class("Vec2")),
        |_, _| {},
    )));

    let copy = ty.copy_constructor().unwrap();
    assert_eq!(copy.signature.params.len(), 1);
    assert!(matches!(&copy.signature.params[0].ty, TypeRef::Class(n) if n.as_ref() == "Vec2"));
    assert!(ty.default_constructor().is_none());
}

#[test]
fn test_signature_equality_ignores_parameter_names() {
    let a = Signature::new(vec![int_param("x"), int_param("y")], TypeRef::Int);
    let b = Signature::new(vec![int_param("first"), int_param("second")], TypeRef::Int);
    let c = Signature::new(vec![int_param("x")], TypeRef::Int);

    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_signature_slot_layout() {
    let free = Signature::new(vec![int_param("a"), int_param("b")], TypeRef::Int);
    assert_eq!(free.return_slot(), 0);
    assert_eq!(free.param_slot(0), 1);
    assert_eq!(free.param_slot(1), 2);
    assert_eq!(free.frame_slots(), 3);

    let method = Signature::method(vec![int_param("a")], TypeRef::Void, TypeRef::class("T"));
    assert_eq!(method.this_slot(), 2);
    assert_eq!(method.frame_slots(), 3);
}

#[test]
fn test_type_ref_defaults_and_kinds() {
    assert_eq!(TypeRef::Int.default_value(), crate::val::Value::Int(0));
    assert_eq!(TypeRef::Bool.default_value(), crate::val::Value::Bool(false));
    assert!(TypeRef::class("T").default_value().is_null());

    assert_eq!(TypeRef::Int.kind(), SlotKind::Value);
    assert_eq!(TypeRef::class("T").kind(), SlotKind::Handle);
    assert_eq!(TypeRef::Dynamic.kind(), SlotKind::Dynamic);
    let sig = Arc::new(Signature::new(Vec::new(), TypeRef::Void));
    assert_eq!(TypeRef::Fn(sig).kind(), SlotKind::Delegate);
}

#[test]
fn test_core_library_has_the_exception_type() {
    let core = core_library();
    let exception = core.get_type(EXCEPTION_TYPE).unwrap();
    assert!(exception.field_index(EXCEPTION_MESSAGE_FIELD).is_some());
    assert_eq!(core.name.as_ref(), CORE_LIBRARY);
}

#[test]
fn test_function_ids_are_unique() {
    let a = Function::native("a", "", Signature::new(Vec::new(), TypeRef::Void), |_, _| {});
    let b = Function::native("b", "", Signature::new(Vec::new(), TypeRef::Void), |_, _| {});
    assert_ne!(a.id, b.id);
}
