//! Nested struct and dynamic array kinds

use std::sync::Arc;

use super::dynarray::ArrayHeader;
use super::{ops, read_element, value_mismatch, KindOps, Slot, Value};
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::object::TypeRef;
use crate::types::{Property, PropertyKind};
use crate::views::{ArrayView, StructView};

pub(super) static STRUCT: KindOps = KindOps {
    get: struct_get,
    validate: struct_validate,
    set: struct_set,
    copy: struct_copy,
    destroy: Some(struct_destroy),
};

pub(super) static ARRAY: KindOps = KindOps {
    get: array_get,
    validate: array_validate,
    set: array_set,
    copy: array_copy,
    destroy: Some(array_destroy),
};

/// Alignment used when allocating storage for elements of `prop`
pub(crate) fn element_align(host: &Host, prop: &Property) -> usize {
    match prop.struct_type() {
        Some(ty) => host.min_alignment(ty),
        None => prop
            .element_size
            .max(1)
            .next_power_of_two()
            .min(host.profile().pointer_width),
    }
}

/// Properties of `ty` and its parents that own host memory
fn owning_properties(host: &Host, ty: TypeRef) -> ReflectResult<Vec<Property>> {
    let mut props = Vec::new();
    for owner in host.super_chain(ty) {
        for field in host.own_fields(owner) {
            match host.field_kind(field) {
                Some(kind) if kind.owns_memory() => {
                    props.push(host.decode_property(field, Some(host.properties_size(owner)))?);
                }
                Some(_) => {}
                None => log::debug!(
                    "field {:?} of unsupported kind is copied shallowly",
                    field
                ),
            }
        }
    }
    Ok(props)
}

/// Copy a struct into zeroed memory, deep-copying owned buffers
///
/// On failure `dst` holds only buffers it owns, so destroying it is safe.
pub(crate) fn copy_struct(host: &Host, ty: TypeRef, dst: usize, src: usize) -> ReflectResult<()> {
    let props = owning_properties(host, ty)?;
    unsafe {
        memory::copy(dst, src, host.properties_size(ty));
        for prop in &props {
            memory::zero(dst + prop.offset, prop.total_size());
        }
    }
    for prop in &props {
        let copy = ops(prop.kind).copy;
        for index in 0..prop.array_dim {
            let at = prop.offset + index * prop.element_size;
            copy(host, prop, dst + at, src + at)?;
        }
    }
    Ok(())
}

/// Release every buffer owned by a struct's fields
pub(crate) fn destroy_struct(host: &Host, ty: TypeRef, base: usize) {
    match owning_properties(host, ty) {
        Ok(props) => {
            for prop in &props {
                super::destroy_property(host, prop, base);
            }
        }
        Err(e) => log::warn!("cannot destroy struct at {:#x}: {}", base, e),
    }
}

/// Struct assignment through a staging buffer
///
/// The source is fully copied before the destination is touched, so a
/// failure leaves the destination unchanged and the source may alias it.
pub(crate) fn assign_struct(host: &Host, ty: TypeRef, dst: usize, src: usize) -> ReflectResult<()> {
    if dst == src {
        return Ok(());
    }
    let size = host.properties_size(ty);
    let allocator = host.allocator();
    let staging = allocator.alloc_zeroed(size.max(1), host.min_alignment(ty));
    if staging == 0 {
        return Err(ReflectError::Allocation { size });
    }

    if let Err(e) = copy_struct(host, ty, staging, src) {
        destroy_struct(host, ty, staging);
        allocator.free(staging);
        return Err(e);
    }

    destroy_struct(host, ty, dst);
    unsafe { memory::copy(dst, staging, size) };
    allocator.free(staging);
    Ok(())
}

// ============================================================================
// Struct
// ============================================================================

fn declared_struct(prop: &Property) -> ReflectResult<TypeRef> {
    prop.struct_type()
        .ok_or_else(|| ReflectError::resolution("struct property", "no struct type"))
}

fn struct_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    let ty = declared_struct(slot.prop)?;
    Ok(Value::Struct(StructView::child(
        slot.host.clone(),
        ty,
        slot.addr,
        slot.owner.clone(),
    )))
}

fn struct_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let expected = declared_struct(prop)?;
    let view = value.as_struct().ok_or_else(|| value_mismatch(prop, value))?;
    if view.ty() != expected {
        return Err(ReflectError::mismatch(
            host.type_label(Some(expected)),
            host.type_label(Some(view.ty())),
        ));
    }
    Ok(())
}

fn struct_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let ty = declared_struct(slot.prop)?;
    let view = value
        .as_struct()
        .ok_or_else(|| value_mismatch(slot.prop, value))?;
    assign_struct(slot.host, ty, slot.addr, view.base())
}

fn struct_copy(host: &Host, prop: &Property, dst: usize, src: usize) -> ReflectResult<()> {
    copy_struct(host, declared_struct(prop)?, dst, src)
}

fn struct_destroy(host: &Host, prop: &Property, addr: usize) {
    if let Some(ty) = prop.struct_type() {
        destroy_struct(host, ty, addr);
    }
}

// ============================================================================
// Array
// ============================================================================

fn inner_of(prop: &Property) -> ReflectResult<&Property> {
    prop.inner()
        .ok_or_else(|| ReflectError::resolution("array property", "no inner property"))
}

fn array_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    let inner = inner_of(slot.prop)?;
    Ok(Value::Array(ArrayView::from_parts(
        slot.host.clone(),
        Arc::new(inner.clone()),
        slot.addr,
        slot.owner.clone(),
    )))
}

/// Elements of an array assignment source
fn source_elements(value: &Value) -> Option<ReflectResult<Vec<Value>>> {
    match value {
        Value::Array(view) => Some(view.iter().collect()),
        Value::List(items) => Some(Ok(items.clone())),
        _ => None,
    }
}

fn array_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let inner = inner_of(prop)?;
    let items = source_elements(value).ok_or_else(|| value_mismatch(prop, value))??;
    let validate = ops(inner.kind).validate;
    for item in &items {
        validate(host, inner, item)?;
    }
    Ok(())
}

fn array_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    if let Value::Array(view) = value {
        if view.header_addr() == slot.addr {
            return Ok(());
        }
    }
    let items = source_elements(value).ok_or_else(|| value_mismatch(slot.prop, value))??;
    let inner = inner_of(slot.prop)?;
    let target = ArrayView::from_parts(
        slot.host.clone(),
        Arc::new(inner.clone()),
        slot.addr,
        slot.owner.clone(),
    );
    target.assign_from(&items)
}

fn array_copy(host: &Host, prop: &Property, dst: usize, src: usize) -> ReflectResult<()> {
    let inner = inner_of(prop)?;
    let from = ArrayHeader::new(host, src);
    let to = ArrayHeader::new(host, dst);
    let count = from.count();
    if count == 0 || from.data() == 0 {
        return Ok(());
    }

    to.reserve(host, count, inner.element_size, element_align(host, inner))?;
    let copy = ops(inner.kind).copy;
    let (src_data, dst_data) = (from.data(), to.data());
    for index in 0..count {
        let at = index * inner.element_size;
        if let Err(e) = copy(host, inner, dst_data + at, src_data + at) {
            to.set_count(index + 1);
            array_destroy(host, prop, dst);
            return Err(e);
        }
    }
    to.set_count(count);
    Ok(())
}

fn array_destroy(host: &Host, prop: &Property, addr: usize) {
    let header = ArrayHeader::new(host, addr);
    if let (Ok(inner), Some(destroy)) = (inner_of(prop), ops_destroy(prop)) {
        let data = header.data();
        if data != 0 {
            for index in 0..header.count() {
                destroy(host, inner, data + index * inner.element_size);
            }
        }
    }
    header.release(host);
}

fn ops_destroy(prop: &Property) -> Option<fn(&Host, &Property, usize)> {
    prop.inner().and_then(|inner| ops(inner.kind).destroy)
}

/// Read element `index` of the array whose header is at `header`
pub(crate) fn array_element(view: &ArrayView, index: usize) -> ReflectResult<Value> {
    let header = ArrayHeader::new(view.host(), view.header_addr());
    let size = header.count();
    if index >= size {
        return Err(ReflectError::OutOfBounds { index, size });
    }
    let inner = view.inner();
    let addr = header.data() + index * inner.element_size;
    read_element(&Slot {
        host: view.host(),
        prop: inner,
        addr,
        owner: view.owner(),
        container: addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FieldSpec};

    #[test]
    fn test_struct_get_is_a_borrowed_child() {
        let mut fake = FakeHost::new();
        let vector = fake
            .script_struct("Vector")
            .field("X", FieldSpec::Float32)
            .field("Y", FieldSpec::Float32)
            .finish();
        let actor = fake
            .class("Actor")
            .field("Location", FieldSpec::Struct(vector))
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let loc = host.get_field(obj, "Location").unwrap();
        let loc = loc.as_struct().unwrap();
        loc.set("X", &Value::Float(4.0)).unwrap();
        let offset = host.find_field(actor, "Location").unwrap().offset;
        assert_eq!(loc.base(), obj.addr() + offset);
        assert_eq!(unsafe { memory::read::<f32>(obj.addr() + offset) }, 4.0);
        assert!(!loc.is_owning());
    }

    #[test]
    fn test_struct_assignment_requires_same_type() {
        let mut fake = FakeHost::new();
        let vector = fake.script_struct("Vector").field("X", FieldSpec::Float32).finish();
        let rotator = fake.script_struct("Rotator").field("X", FieldSpec::Float32).finish();
        let actor = fake
            .class("Actor")
            .field("Location", FieldSpec::Struct(vector))
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let rot = StructView::new(host.clone(), rotator).unwrap();
        rot.set("X", &Value::Float(9.0)).unwrap();
        let err = host.set_field(obj, "Location", &Value::Struct(rot)).unwrap_err();
        assert_eq!(err, ReflectError::mismatch("Vector", "Rotator"));

        let vec = StructView::new(host.clone(), vector).unwrap();
        vec.set("X", &Value::Float(2.5)).unwrap();
        host.set_field(obj, "Location", &Value::Struct(vec)).unwrap();
        let loc = host.get_field(obj, "Location").unwrap();
        assert_eq!(loc.as_struct().unwrap().get("X").unwrap().as_f64(), Some(2.5));
    }

    #[test]
    fn test_struct_assignment_deep_copies_strings() {
        let mut fake = FakeHost::new();
        let tag = fake.script_struct("Tag").field("Text", FieldSpec::Str).finish();
        let actor = fake.class("Actor").field("Tag", FieldSpec::Struct(tag)).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let src = StructView::new(host.clone(), tag).unwrap();
        src.set("Text", &Value::from("first")).unwrap();
        host.set_field(obj, "Tag", &Value::Struct(src.clone())).unwrap();
        src.set("Text", &Value::from("changed")).unwrap();
        drop(src);

        let stored = host.get_field(obj, "Tag").unwrap();
        assert_eq!(
            stored.as_struct().unwrap().get("Text").unwrap().as_str(),
            Some("first")
        );
    }

    #[test]
    fn test_struct_self_assignment_is_noop() {
        let mut fake = FakeHost::new();
        let tag = fake.script_struct("Tag").field("Text", FieldSpec::Str).finish();
        let actor = fake.class("Actor").field("Tag", FieldSpec::Struct(tag)).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let current = host.get_field(obj, "Tag").unwrap();
        current.as_struct().unwrap().set("Text", &Value::from("kept")).unwrap();
        host.set_field(obj, "Tag", &current).unwrap();
        let again = host.get_field(obj, "Tag").unwrap();
        assert_eq!(again.as_struct().unwrap().get("Text").unwrap().as_str(), Some("kept"));
    }

    #[test]
    fn test_array_set_from_list_and_view() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("A", FieldSpec::Array(Box::new(FieldSpec::Int32)))
            .field("B", FieldSpec::Array(Box::new(FieldSpec::Int32)))
            .finish();
        let obj = fake.spawn(actor, "X", None);
        let host = fake.host();

        host.set_field(obj, "A", &Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
            .unwrap();
        let a = host.get_field(obj, "A").unwrap();
        host.set_field(obj, "B", &a).unwrap();

        let b = host.get_field(obj, "B").unwrap();
        let b = b.as_array().unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(b.get(2).unwrap().as_i64(), Some(3));
        assert_ne!(
            b.header_addr(),
            a.as_array().unwrap().header_addr()
        );
    }

    #[test]
    fn test_array_set_validates_every_element_first() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("A", FieldSpec::Array(Box::new(FieldSpec::UInt8)))
            .finish();
        let obj = fake.spawn(actor, "X", None);
        let host = fake.host();

        host.set_field(obj, "A", &Value::List(vec![Value::UInt(1)])).unwrap();
        let err = host
            .set_field(obj, "A", &Value::List(vec![Value::UInt(2), Value::UInt(300)]))
            .unwrap_err();
        assert!(matches!(err, ReflectError::OutOfRange { .. }));

        let a = host.get_field(obj, "A").unwrap();
        let a = a.as_array().unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a.get(0).unwrap().as_u64(), Some(1));
    }

    #[test]
    fn test_element_alignment() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("S", FieldSpec::Str)
            .field("B", FieldSpec::UInt8)
            .field("N", FieldSpec::Name)
            .finish();
        let host = fake.host();
        let align = |name| element_align(host, &host.find_field(actor, name).unwrap());
        assert_eq!(align("S"), 8);
        assert_eq!(align("B"), 1);
        assert_eq!(align("N"), 8);
        assert!(!PropertyKind::Name.owns_memory());
    }
}
