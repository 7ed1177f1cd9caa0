//! Bool, integer, float and name kinds

use super::{value_mismatch, KindOps, Slot, Value};
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::tables::FName;
use crate::types::{Property, PropertyExtra, PropertyKind};

pub(super) static BOOL: KindOps = KindOps {
    get: bool_get,
    validate: bool_validate,
    set: bool_set,
    copy: bool_copy,
    destroy: None,
};

pub(super) static INT: KindOps = KindOps {
    get: int_get,
    validate: int_validate,
    set: int_set,
    copy: pod_copy,
    destroy: None,
};

pub(super) static FLOAT: KindOps = KindOps {
    get: float_get,
    validate: float_validate,
    set: float_set,
    copy: pod_copy,
    destroy: None,
};

pub(super) static NAME: KindOps = KindOps {
    get: name_get,
    validate: name_validate,
    set: name_set,
    copy: pod_copy,
    destroy: None,
};

/// Raw element copy for kinds without owned memory
pub(super) fn pod_copy(_host: &Host, prop: &Property, dst: usize, src: usize) -> ReflectResult<()> {
    unsafe { memory::copy(dst, src, prop.element_size) };
    Ok(())
}

// ============================================================================
// Bool
// ============================================================================

fn bool_bit(prop: &Property) -> ReflectResult<(usize, u8)> {
    match prop.extra {
        PropertyExtra::Bool { byte_offset, mask } if mask != 0 => Ok((byte_offset, mask)),
        _ => Err(ReflectError::mismatch("bool bit mask", "none")),
    }
}

fn bool_read(prop: &Property, addr: usize) -> ReflectResult<bool> {
    let (byte_offset, mask) = bool_bit(prop)?;
    let byte = unsafe { memory::read::<u8>(addr + byte_offset) };
    Ok(byte & mask != 0)
}

fn bool_write(prop: &Property, addr: usize, value: bool) -> ReflectResult<()> {
    let (byte_offset, mask) = bool_bit(prop)?;
    let at = addr + byte_offset;
    unsafe {
        let byte = memory::read::<u8>(at);
        let byte = if value { byte | mask } else { byte & !mask };
        memory::write::<u8>(at, byte);
    }
    Ok(())
}

fn bool_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    bool_read(slot.prop, slot.addr).map(Value::Bool)
}

fn bool_validate(_host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    bool_bit(prop)?;
    match value {
        Value::Bool(_) => Ok(()),
        other => Err(value_mismatch(prop, other)),
    }
}

fn bool_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let value = value
        .as_bool()
        .ok_or_else(|| value_mismatch(slot.prop, value))?;
    bool_write(slot.prop, slot.addr, value)
}

fn bool_copy(_host: &Host, prop: &Property, dst: usize, src: usize) -> ReflectResult<()> {
    let value = bool_read(prop, src)?;
    bool_write(prop, dst, value)
}

// ============================================================================
// Integers
// ============================================================================

fn int_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    let a = slot.addr;
    let value = unsafe {
        match slot.prop.kind {
            PropertyKind::Int8 => Value::Int(memory::read::<i8>(a) as i64),
            PropertyKind::Int16 => Value::Int(memory::read::<i16>(a) as i64),
            PropertyKind::Int32 => Value::Int(memory::read::<i32>(a) as i64),
            PropertyKind::Int64 => Value::Int(memory::read::<i64>(a)),
            PropertyKind::UInt8 => Value::UInt(memory::read::<u8>(a) as u64),
            PropertyKind::UInt16 => Value::UInt(memory::read::<u16>(a) as u64),
            PropertyKind::UInt32 => Value::UInt(memory::read::<u32>(a) as u64),
            PropertyKind::UInt64 => Value::UInt(memory::read::<u64>(a)),
            other => return Err(ReflectError::mismatch("integer kind", other.to_string())),
        }
    };
    Ok(value)
}

fn int_value(prop: &Property, value: &Value) -> ReflectResult<i128> {
    match value {
        Value::Int(v) => Ok(*v as i128),
        Value::UInt(v) => Ok(*v as i128),
        other => Err(value_mismatch(prop, other)),
    }
}

fn int_validate(_host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let (lo, hi) = prop
        .kind
        .int_range()
        .ok_or_else(|| ReflectError::mismatch("integer kind", prop.kind.to_string()))?;
    let v = int_value(prop, value)?;
    if v < lo || v > hi {
        return Err(ReflectError::OutOfRange {
            kind: prop.kind.class_name(),
            value: v.to_string(),
        });
    }
    Ok(())
}

fn int_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let v = int_value(slot.prop, value)?;
    let a = slot.addr;
    unsafe {
        match slot.prop.kind {
            PropertyKind::Int8 => memory::write(a, v as i8),
            PropertyKind::Int16 => memory::write(a, v as i16),
            PropertyKind::Int32 => memory::write(a, v as i32),
            PropertyKind::Int64 => memory::write(a, v as i64),
            PropertyKind::UInt8 => memory::write(a, v as u8),
            PropertyKind::UInt16 => memory::write(a, v as u16),
            PropertyKind::UInt32 => memory::write(a, v as u32),
            PropertyKind::UInt64 => memory::write(a, v as u64),
            other => return Err(ReflectError::mismatch("integer kind", other.to_string())),
        }
    }
    Ok(())
}

// ============================================================================
// Floats
// ============================================================================

fn float_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    let value = unsafe {
        if slot.prop.kind == PropertyKind::Float32 {
            memory::read::<f32>(slot.addr) as f64
        } else {
            memory::read::<f64>(slot.addr)
        }
    };
    Ok(Value::Float(value))
}

fn float_validate(_host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    let v = value.as_f64().ok_or_else(|| value_mismatch(prop, value))?;
    if prop.kind == PropertyKind::Float32 && v.is_finite() && v.abs() > f32::MAX as f64 {
        return Err(ReflectError::OutOfRange {
            kind: prop.kind.class_name(),
            value: v.to_string(),
        });
    }
    Ok(())
}

fn float_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let v = value
        .as_f64()
        .ok_or_else(|| value_mismatch(slot.prop, value))?;
    unsafe {
        if slot.prop.kind == PropertyKind::Float32 {
            memory::write(slot.addr, v as f32);
        } else {
            memory::write(slot.addr, v);
        }
    }
    Ok(())
}

// ============================================================================
// Names
// ============================================================================

fn name_get(slot: &Slot<'_>) -> ReflectResult<Value> {
    let index = unsafe { memory::read::<i32>(slot.addr) };
    let number = if slot.prop.element_size >= 8 {
        unsafe { memory::read::<u32>(slot.addr + 4) }
    } else {
        0
    };
    Ok(Value::Name(FName::new(index, number)))
}

fn name_of(host: &Host, prop: &Property, value: &Value) -> ReflectResult<FName> {
    match value {
        Value::Name(name) => Ok(*name),
        Value::Str(text) => host
            .names()
            .find(text)
            .map(|index| FName::new(index as i32, 0))
            .ok_or_else(|| ReflectError::NotFound {
                what: "name",
                name: text.clone(),
            }),
        other => Err(value_mismatch(prop, other)),
    }
}

fn name_validate(host: &Host, prop: &Property, value: &Value) -> ReflectResult<()> {
    name_of(host, prop, value).map(|_| ())
}

fn name_set(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let name = name_of(slot.host, slot.prop, value)?;
    unsafe {
        memory::write(slot.addr, name.index);
        if slot.prop.element_size >= 8 {
            memory::write(slot.addr + 4, name.number);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::ReflectError;
    use crate::props::Value;
    use crate::tables::FName;
    use crate::testing::{FakeHost, FieldSpec};

    #[test]
    fn test_bool_preserves_neighbour_bits() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("bA", FieldSpec::Bool)
            .field("bB", FieldSpec::Bool)
            .field("bC", FieldSpec::Bool)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "bA", &Value::Bool(true)).unwrap();
        host.set_field(obj, "bC", &Value::Bool(true)).unwrap();
        host.set_field(obj, "bB", &Value::Bool(true)).unwrap();
        host.set_field(obj, "bB", &Value::Bool(false)).unwrap();

        assert_eq!(host.get_field(obj, "bA").unwrap().as_bool(), Some(true));
        assert_eq!(host.get_field(obj, "bB").unwrap().as_bool(), Some(false));
        assert_eq!(host.get_field(obj, "bC").unwrap().as_bool(), Some(true));

        let offset = host.find_field(actor, "bA").unwrap().offset;
        let byte = unsafe { crate::memory::read::<u8>(obj.addr() + offset) };
        assert_eq!(byte, 0b101);
    }

    #[test]
    fn test_bool_rejects_non_bool() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").field("bA", FieldSpec::Bool).finish();
        let obj = fake.spawn(actor, "A", None);
        let err = fake.host().set_field(obj, "bA", &Value::Int(1)).unwrap_err();
        assert_eq!(err, ReflectError::mismatch("BoolProperty", "int"));
    }

    #[test]
    fn test_integer_widths_and_ranges() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("I8", FieldSpec::Int8)
            .field("U8", FieldSpec::UInt8)
            .field("I64", FieldSpec::Int64)
            .field("U32", FieldSpec::UInt32)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "I8", &Value::Int(-128)).unwrap();
        assert_eq!(host.get_field(obj, "I8").unwrap().as_i64(), Some(-128));
        assert!(matches!(
            host.set_field(obj, "I8", &Value::Int(128)),
            Err(ReflectError::OutOfRange { .. })
        ));
        assert_eq!(host.get_field(obj, "I8").unwrap().as_i64(), Some(-128));

        host.set_field(obj, "U8", &Value::UInt(255)).unwrap();
        assert!(host.set_field(obj, "U8", &Value::Int(-1)).is_err());
        assert_eq!(host.get_field(obj, "U8").unwrap().as_u64(), Some(255));

        host.set_field(obj, "I64", &Value::Int(i64::MIN)).unwrap();
        assert_eq!(host.get_field(obj, "I64").unwrap().as_i64(), Some(i64::MIN));

        host.set_field(obj, "U32", &Value::Int(7)).unwrap();
        assert!(matches!(host.get_field(obj, "U32").unwrap(), Value::UInt(7)));
    }

    #[test]
    fn test_floats() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("F", FieldSpec::Float32)
            .field("D", FieldSpec::Float64)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "F", &Value::Float(1.5)).unwrap();
        host.set_field(obj, "D", &Value::Int(3)).unwrap();
        assert_eq!(host.get_field(obj, "F").unwrap().as_f64(), Some(1.5));
        assert_eq!(host.get_field(obj, "D").unwrap().as_f64(), Some(3.0));
        assert!(host.set_field(obj, "F", &Value::Float(1e300)).is_err());
        assert!(host.set_field(obj, "D", &Value::from("x")).is_err());
    }

    #[test]
    fn test_names_by_id_and_text() {
        let mut fake = FakeHost::new();
        let index = fake.intern("Idle");
        let actor = fake.class("Actor").field("State", FieldSpec::Name).finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        host.set_field(obj, "State", &Value::Name(FName::new(index, 2))).unwrap();
        match host.get_field(obj, "State").unwrap() {
            Value::Name(name) => {
                assert_eq!(name, FName::new(index, 2));
                assert_eq!(host.names().resolve(name).unwrap(), "Idle_1");
            }
            other => panic!("unexpected {:?}", other),
        }

        host.set_field(obj, "State", &Value::from("Idle")).unwrap();
        assert!(matches!(
            host.get_field(obj, "State").unwrap(),
            Value::Name(n) if n == FName::new(index, 0)
        ));
        assert!(matches!(
            host.set_field(obj, "State", &Value::from("NeverInterned")),
            Err(ReflectError::NotFound { .. })
        ));
    }
}
