//! Property access layer
//!
//! Converts between "address + field descriptor" and a host-independent
//! [`Value`]. The set of kinds is closed, so dispatch is a single table
//! ([`ops`]) keyed on [`PropertyKind`], with one entry per kind:
//!
//! - `get`: read one element
//! - `validate`: check a value against the descriptor without writing
//! - `set`: write one already validated element
//! - `copy`: duplicate one element into zeroed memory, deep-copying owned buffers
//! - `destroy`: release host allocations owned by one element
//!
//! Every write goes through [`write_element`] or [`set_property`], which
//! validate first, so a failed set never leaves partial data behind.

mod composite;
mod dynarray;
mod refs;
mod scalar;
mod string;
mod typed;

pub use typed::*;

pub(crate) use composite::{array_element, assign_struct, copy_struct, destroy_struct, element_align};
pub(crate) use dynarray::ArrayHeader;

use std::fmt;

use crate::bound::BoundMethod;
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::object::{ObjectRef, TypeRef};
use crate::tables::FName;
use crate::types::{Property, PropertyKind};
use crate::views::{ArrayView, Owner, StructView};

// ============================================================================
// Values
// ============================================================================

/// A host-independent property value
#[derive(Debug, Clone)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// Signed integer (any signed kind)
    Int(i64),
    /// Unsigned integer (any unsigned kind)
    UInt(u64),
    /// Floating point (either float kind)
    Float(f64),
    /// Interned name
    Name(FName),
    /// String contents
    Str(String),
    /// Object reference
    Object(Option<ObjectRef>),
    /// Interface reference (the implementing object)
    Interface(Option<ObjectRef>),
    /// Type reference
    Class(Option<TypeRef>),
    /// View over a struct
    Struct(StructView),
    /// View over a dynamic array
    Array(ArrayView),
    /// Detached sequence (static arrays, array assignment sources)
    List(Vec<Value>),
    /// Member function bound to an object
    Function(BoundMethod),
}

impl Value {
    /// Short name of the value's variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Name(_) => "name",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Interface(_) => "interface",
            Value::Class(_) => "class",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::List(_) => "list",
            Value::Function(_) => "function",
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload of either signedness, if it fits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned payload, if non-negative
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Float payload (integers convert)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Object payload of object and interface values
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(o) | Value::Interface(o) => *o,
            Value::Class(t) => t.map(ObjectRef::from),
            _ => None,
        }
    }

    /// Struct payload
    pub fn as_struct(&self) -> Option<&StructView> {
        match self {
            Value::Struct(v) => Some(v),
            _ => None,
        }
    }

    /// Array payload
    pub fn as_array(&self) -> Option<&ArrayView> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// List payload
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Bound method payload
    pub fn as_function(&self) -> Option<&BoundMethod> {
        match self {
            Value::Function(m) => Some(m),
            _ => None,
        }
    }

    /// Replace borrowed views with values that do not alias host memory
    ///
    /// Structs become owning copies; arrays become lists of detached elements.
    pub fn detach(&self) -> ReflectResult<Value> {
        match self {
            Value::Struct(view) => Ok(Value::Struct(view.to_owned_copy()?)),
            Value::Array(view) => Ok(Value::List(
                view.iter()
                    .map(|v| v.and_then(|v| v.detach()))
                    .collect::<ReflectResult<_>>()?,
            )),
            Value::List(items) => Ok(Value::List(
                items.iter().map(Value::detach).collect::<ReflectResult<_>>()?,
            )),
            other => Ok(other.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Name(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(Some(o)) | Value::Interface(Some(o)) => write!(f, "{:?}", o),
            Value::Class(Some(t)) => write!(f, "{:?}", t),
            Value::Object(None) | Value::Interface(None) | Value::Class(None) => f.write_str("None"),
            Value::Struct(v) => write!(f, "struct@{:#x}", v.base()),
            Value::Array(v) => write!(f, "array[{}]", v.len()),
            Value::List(items) => write!(f, "list[{}]", items.len()),
            Value::Function(m) => write!(f, "function@{:#x}", m.function().addr()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $conv)
                }
            }
        )*
    };
}

value_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<FName> for Value {
    fn from(v: FName) -> Self {
        Value::Name(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(Some(v))
    }
}

impl From<StructView> for Value {
    fn from(v: StructView) -> Self {
        Value::Struct(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

// ============================================================================
// Dispatch table
// ============================================================================

/// One element of one property, located in memory
pub(crate) struct Slot<'a> {
    pub host: &'a Host,
    pub prop: &'a Property,
    /// Element address
    pub addr: usize,
    /// Ownership token of the memory holding the element
    pub owner: &'a Owner,
    /// Base address of the struct or object containing the property
    pub container: usize,
}

/// Per-kind operations
pub(crate) struct KindOps {
    pub get: fn(&Slot<'_>) -> ReflectResult<Value>,
    pub validate: fn(&Host, &Property, &Value) -> ReflectResult<()>,
    pub set: fn(&Slot<'_>, &Value) -> ReflectResult<()>,
    pub copy: fn(&Host, &Property, usize, usize) -> ReflectResult<()>,
    pub destroy: Option<fn(&Host, &Property, usize)>,
}

/// Operations for a kind
pub(crate) fn ops(kind: PropertyKind) -> &'static KindOps {
    match kind {
        PropertyKind::Bool => &scalar::BOOL,
        PropertyKind::Int8
        | PropertyKind::Int16
        | PropertyKind::Int32
        | PropertyKind::Int64
        | PropertyKind::UInt8
        | PropertyKind::UInt16
        | PropertyKind::UInt32
        | PropertyKind::UInt64 => &scalar::INT,
        PropertyKind::Float32 | PropertyKind::Float64 => &scalar::FLOAT,
        PropertyKind::Name => &scalar::NAME,
        PropertyKind::Str => &string::STR,
        PropertyKind::Array => &composite::ARRAY,
        PropertyKind::Struct => &composite::STRUCT,
        PropertyKind::Object => &refs::OBJECT,
        PropertyKind::Interface => &refs::INTERFACE,
        PropertyKind::Class => &refs::CLASS,
        PropertyKind::Function => &refs::FUNCTION,
    }
}

/// Type mismatch between a descriptor and a value
pub(crate) fn value_mismatch(prop: &Property, value: &Value) -> ReflectError {
    ReflectError::mismatch(prop.kind.to_string(), value.type_name())
}

/// Validate then write one element
pub(crate) fn write_element(slot: &Slot<'_>, value: &Value) -> ReflectResult<()> {
    let ops = ops(slot.prop.kind);
    (ops.validate)(slot.host, slot.prop, value)?;
    (ops.set)(slot, value)
}

/// Read one element
pub(crate) fn read_element(slot: &Slot<'_>) -> ReflectResult<Value> {
    (ops(slot.prop.kind).get)(slot)
}

/// Release host allocations owned by every element of a property
pub(crate) fn destroy_property(host: &Host, prop: &Property, base: usize) {
    if let Some(destroy) = ops(prop.kind).destroy {
        for index in 0..prop.array_dim {
            destroy(host, prop, base + prop.offset + index * prop.element_size);
        }
    }
}

/// Read a property of the struct or object at `base`
///
/// With no index, a static array reads as a list of all its elements.
pub(crate) fn get_property(
    host: &Host,
    prop: &Property,
    base: usize,
    owner: &Owner,
    index: Option<usize>,
) -> ReflectResult<Value> {
    let slot = |index: usize| -> ReflectResult<Value> {
        read_element(&Slot {
            host,
            prop,
            addr: prop.element_addr(base, index)?,
            owner,
            container: base,
        })
    };

    match index {
        Some(i) => slot(i),
        None if prop.array_dim == 1 => slot(0),
        None => (0..prop.array_dim)
            .map(slot)
            .collect::<ReflectResult<Vec<_>>>()
            .map(Value::List),
    }
}

/// Write a property of the struct or object at `base`
///
/// With no index, a static array takes a list of exactly `array_dim` values,
/// all validated and staged before the old elements are released.
pub(crate) fn set_property(
    host: &Host,
    prop: &Property,
    base: usize,
    owner: &Owner,
    index: Option<usize>,
    value: &Value,
) -> ReflectResult<()> {
    let slot = |index: usize| {
        prop.element_addr(base, index).map(|addr| Slot {
            host,
            prop,
            addr,
            owner,
            container: base,
        })
    };

    match index {
        Some(i) => write_element(&slot(i)?, value),
        None if prop.array_dim == 1 => write_element(&slot(0)?, value),
        None => {
            let items = value
                .as_list()
                .ok_or_else(|| ReflectError::mismatch("list", value.type_name()))?;
            if items.len() != prop.array_dim {
                return Err(ReflectError::Argument(format!(
                    "'{}' has {} elements, got {}",
                    prop.name,
                    prop.array_dim,
                    items.len()
                )));
            }
            let ops = ops(prop.kind);
            for item in items {
                (ops.validate)(host, prop, item)?;
            }
            if !prop.kind.owns_memory() {
                // Validated writes of these kinds cannot fail
                for (i, item) in items.iter().enumerate() {
                    (ops.set)(&slot(i)?, item)?;
                }
                return Ok(());
            }
            let first = slot(0)?.addr;
            let staged = StagedElements::write(host, prop, items, element_align(host, prop))?;
            destroy_property(host, prop, base);
            staged.commit(first);
            Ok(())
        }
    }
}

/// Elements written into a fresh zeroed buffer that no container owns yet
///
/// Dropping it releases everything the elements own along with the buffer.
pub(crate) struct StagedElements<'a> {
    host: &'a Host,
    prop: &'a Property,
    data: usize,
    len: usize,
}

impl<'a> StagedElements<'a> {
    /// Write already validated `items` as elements of `prop`
    pub fn write(
        host: &'a Host,
        prop: &'a Property,
        items: &[Value],
        align: usize,
    ) -> ReflectResult<Self> {
        let mut staged = Self {
            host,
            prop,
            data: 0,
            len: 0,
        };
        if items.is_empty() {
            return Ok(staged);
        }
        let bytes = items
            .len()
            .checked_mul(prop.element_size)
            .ok_or(ReflectError::Length {
                requested: items.len(),
                max: dynarray::MAX_COUNT,
            })?;
        staged.data = host.allocator().alloc_zeroed(bytes.max(1), align);
        if staged.data == 0 {
            return Err(ReflectError::Allocation { size: bytes });
        }
        staged.len = items.len();

        let owner = Owner::host_backed();
        let set = ops(prop.kind).set;
        for (index, item) in items.iter().enumerate() {
            let addr = staged.data + index * prop.element_size;
            set(
                &Slot {
                    host,
                    prop,
                    addr,
                    owner: &owner,
                    container: addr,
                },
                item,
            )?;
        }
        Ok(staged)
    }

    /// Move the elements bitwise to `dst`, which must hold nothing it owns
    pub fn commit(mut self, dst: usize) {
        if self.data != 0 {
            unsafe { memory::copy(dst, self.data, self.len * self.prop.element_size) };
            self.host.allocator().free(self.data);
            self.data = 0;
        }
    }
}

impl Drop for StagedElements<'_> {
    fn drop(&mut self) {
        if self.data == 0 {
            return;
        }
        if let Some(destroy) = ops(self.prop.kind).destroy {
            for index in 0..self.len {
                destroy(self.host, self.prop, self.data + index * self.prop.element_size);
            }
        }
        self.host.allocator().free(self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_ops() {
        for kind in PropertyKind::ALL {
            let ops = ops(kind);
            assert_eq!(ops.destroy.is_some(), kind.owns_memory(), "{}", kind);
        }
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(-3i32).as_i64(), Some(-3));
        assert_eq!(Value::from(7u8).as_u64(), Some(7));
        assert_eq!(Value::from(-1i64).as_u64(), None);
        assert_eq!(Value::from(2i32).as_f64(), Some(2.0));
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::from(true).type_name(), "bool");
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
    }
}
