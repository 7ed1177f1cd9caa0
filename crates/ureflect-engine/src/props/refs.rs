//! Object, interface, class and function kinds

use super::scalar::pod_copy;
use super::{value_mismatch, KindOps, Slot, Value};
use crate::bound::BoundMethod;
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::object::{ObjectRef, TypeRef};
use crate::types::{Property, PropertyExtra};

pub(super) static OBJECT: KindOps = KindOps {
    get: object_get,
    validate: object_validate,
    set: object_set,
    copy: pod_copy,
    destroy: None,
};

pub(super) static INTERFACE: KindOps = KindOps {
    get: interface_get,
    validate: interface_validate,
    set: interface_set,
    copy: pod_copy,
    destroy: None,
};

pub(super) static CLASS: KindOps = KindOps {
    get: class_get,
    validate: class_validate,
    set: class_set,
    copy: pod_copy,
    destroy: None,
};

pub(super) static FUNCTION: KindOps = KindOps {
    get: function_get,
    validate: function_validate,
    set: function_set,
    copy: function_copy,
    destroy: None,
};

/// Object carried by a reference-like value; `Some(None)` is an explicit null
fn object_arg(value: &Value) -> Option<Option<ObjectRef>> {
    match value {
        Value::Object(o) | Value::Interface(o) => Some(*o),
        Value::Class(t) => Some(t.map(ObjectRef::from)),
        _ => None,
    }
}

fn read_object(addr: usize) -> Option<ObjectRef> {
    ObjectRef::from_host(unsafe { memory::read_ptr(addr) })
}

fn write_object(addr: usize, obj: Option<ObjectRef>) {
    unsafe { memory::write::<usize>(addr, obj.map_or(0, ObjectRef::addr)) }
}

// ============================================================================
// Object
// ============================================================================

fn object_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    Ok(Value::Object(read_object(slot.addr)))
}

fn object_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let obj = object_arg(value).ok_or_else(|| value_mismatch(prop, value))?;
    let (Some(obj), PropertyExtra::Object { class: Some(class) }) = (obj, &prop.extra) else {
        return Ok(());
    };
    if !host.is_a(obj, *class) {
        return Err(ReflectError::mismatch(
            host.type_label(Some(*class)),
            host.class_label(obj),
        ));
    }
    Ok(())
}

fn object_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let obj = object_arg(value).ok_or_else(|| value_mismatch(slot.prop, value))?;
    write_object(slot.addr, obj);
    Ok(())
}

// ============================================================================
// Interface
// ============================================================================

fn declared_interface(prop: &Property) -> ReflectResult<TypeRef> {
    match prop.extra {
        PropertyExtra::Interface {
            interface: Some(iface),
        } => Ok(iface),
        _ => Err(ReflectError::resolution(
            "interface property",
            format!("'{}' has no declared interface", prop.name),
        )),
    }
}

/// Offset of the interface vtable from the object base
///
/// Searches the implemented-interface records of the object's class and its
/// parents for an interface deriving from `iface`.
pub(crate) fn interface_offset(host: &Host, obj: ObjectRef, iface: TypeRef) -> ReflectResult<usize> {
    let layout = &host.profile().class;
    let ptr = host.profile().pointer_width;
    let class = host
        .class_of(obj)
        .ok_or_else(|| ReflectError::mismatch(host.type_label(Some(iface)), "None"))?;

    for owner in host.super_chain(class) {
        let header = owner.addr() + layout.interfaces;
        let (data, count) = unsafe {
            (
                memory::read_ptr(header),
                memory::read::<i32>(header + ptr).max(0) as usize,
            )
        };
        if data == 0 {
            continue;
        }
        for i in 0..count {
            let record = data + i * layout.interface.stride;
            let Some(implemented) = read_object(record + layout.interface.class) else {
                continue;
            };
            if !host.inherits(TypeRef::from_object_unchecked(implemented), iface) {
                continue;
            }
            let native =
                unsafe { memory::read::<i32>(record + layout.interface.implemented_natively) } != 0;
            if native {
                return Ok(0);
            }
            let offset = unsafe { memory::read::<i32>(record + layout.interface.pointer_offset) };
            return Ok(offset.max(0) as usize);
        }
    }

    Err(ReflectError::mismatch(
        host.type_label(Some(iface)),
        host.class_label(obj),
    ))
}

fn interface_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    Ok(Value::Interface(read_object(slot.addr)))
}

fn interface_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let obj = object_arg(value).ok_or_else(|| value_mismatch(prop, value))?;
    match obj {
        None => Ok(()),
        Some(obj) => interface_offset(host, obj, declared_interface(prop)?).map(|_| ()),
    }
}

fn interface_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let obj = object_arg(value).ok_or_else(|| value_mismatch(slot.prop, value))?;
    let ptr = slot.host.profile().pointer_width;
    match obj {
        None => {
            write_object(slot.addr, None);
            unsafe { memory::write::<usize>(slot.addr + ptr, 0) };
        }
        Some(obj) => {
            let iface = declared_interface(slot.prop)?;
            let offset = interface_offset(slot.host, obj, iface)?;
            write_object(slot.addr, Some(obj));
            unsafe { memory::write::<usize>(slot.addr + ptr, obj.addr() + offset) };
        }
    }
    Ok(())
}

// ============================================================================
// Class
// ============================================================================

fn class_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    Ok(Value::Class(
        read_object(slot.addr).map(TypeRef::from_object_unchecked),
    ))
}

fn class_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let obj = object_arg(value).ok_or_else(|| value_mismatch(prop, value))?;
    let Some(obj) = obj else {
        return Ok(());
    };
    let ty = host.as_type(obj)?;
    if let PropertyExtra::Class { meta: Some(meta) } = prop.extra {
        if !host.inherits(ty, meta) {
            return Err(ReflectError::mismatch(
                host.type_label(Some(meta)),
                host.type_label(Some(ty)),
            ));
        }
    }
    Ok(())
}

fn class_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let obj = object_arg(value).ok_or_else(|| value_mismatch(slot.prop, value))?;
    write_object(slot.addr, obj);
    Ok(())
}

// ============================================================================
// Function
// ============================================================================

fn function_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    let object = ObjectRef::from_host(slot.container)
        .ok_or_else(|| ReflectError::resolution("bound method", "containing object is null"))?;
    Ok(Value::Function(BoundMethod::new(
        slot.host.clone(),
        object,
        TypeRef::from_object_unchecked(slot.prop.field),
    )))
}

fn function_validate(_host: &Host, prop: &Property, _value: &Value) -> ReflectResult<()> {
    Err(ReflectError::Argument(format!(
        "function '{}' cannot be assigned",
        prop.name
    )))
}

fn function_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    function_validate(slot.host, slot.prop, value)
}

fn function_copy(_host: &Host, _prop: &Property, _dst: usize, _src: usize) -> ReflectResult<()> {
    Ok(())
}
