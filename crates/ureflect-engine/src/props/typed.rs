//! Typed property markers
//!
//! Each marker names a host property class and the Rust type its values
//! convert to, so lookups and reads can be checked at the call site:
//!
//! ```rust,ignore
//! let health: i32 = host.get_as::<IntProperty>(actor, "Health")?;
//! host.set_as::<StrProperty>(actor, "Label", "door".to_string())?;
//! ```

use super::Value;
use crate::bound::BoundMethod;
use crate::error::{ReflectError, ReflectResult};
use crate::object::{ObjectRef, TypeRef};
use crate::tables::FName;
use crate::types::PropertyKind;
use crate::views::{ArrayView, StructView};

/// A property kind with a statically known value type
pub trait PropertyType {
    /// Declared kind the field must have
    const KIND: PropertyKind;

    /// Rust representation of one element
    type Value;

    /// Extract the typed payload from a dynamic value
    fn from_value(value: Value) -> ReflectResult<Self::Value>;

    /// Wrap a typed payload into a dynamic value
    fn into_value(value: Self::Value) -> Value;
}

fn unexpected<T>(kind: PropertyKind, value: &Value) -> ReflectResult<T> {
    Err(ReflectError::mismatch(kind.to_string(), value.type_name()))
}

macro_rules! int_property {
    ($(#[$meta:meta])* $name:ident, $kind:ident, $ty:ty, $variant:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl PropertyType for $name {
            const KIND: PropertyKind = PropertyKind::$kind;
            type Value = $ty;

            fn from_value(value: Value) -> ReflectResult<$ty> {
                let wide = match &value {
                    Value::Int(v) => *v as i128,
                    Value::UInt(v) => *v as i128,
                    other => return unexpected(Self::KIND, other),
                };
                <$ty>::try_from(wide).map_err(|_| ReflectError::OutOfRange {
                    kind: Self::KIND.class_name(),
                    value: wide.to_string(),
                })
            }

            fn into_value(value: $ty) -> Value {
                Value::$variant(value as _)
            }
        }
    };
}

int_property!(
    /// Signed 8-bit integer
    Int8Property, Int8, i8, Int
);
int_property!(
    /// Signed 16-bit integer
    Int16Property, Int16, i16, Int
);
int_property!(
    /// Signed 32-bit integer
    IntProperty, Int32, i32, Int
);
int_property!(
    /// Signed 64-bit integer
    Int64Property, Int64, i64, Int
);
int_property!(
    /// Unsigned 8-bit integer
    ByteProperty, UInt8, u8, UInt
);
int_property!(
    /// Unsigned 16-bit integer
    UInt16Property, UInt16, u16, UInt
);
int_property!(
    /// Unsigned 32-bit integer
    UInt32Property, UInt32, u32, UInt
);
int_property!(
    /// Unsigned 64-bit integer
    UInt64Property, UInt64, u64, UInt
);

macro_rules! simple_property {
    ($(#[$meta:meta])* $name:ident, $kind:ident, $ty:ty, |$v:ident| $extract:expr, |$w:ident| $wrap:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl PropertyType for $name {
            const KIND: PropertyKind = PropertyKind::$kind;
            type Value = $ty;

            fn from_value($v: Value) -> ReflectResult<$ty> {
                $extract
            }

            fn into_value($w: $ty) -> Value {
                $wrap
            }
        }
    };
}

simple_property!(
    /// Boolean bit
    BoolProperty, Bool, bool,
    |v| match v { Value::Bool(b) => Ok(b), other => unexpected(Self::KIND, &other) },
    |w| Value::Bool(w)
);

simple_property!(
    /// 32-bit float
    FloatProperty, Float32, f32,
    |v| match v { Value::Float(f) => Ok(f as f32), other => unexpected(Self::KIND, &other) },
    |w| Value::Float(w as f64)
);

simple_property!(
    /// 64-bit float
    DoubleProperty, Float64, f64,
    |v| match v { Value::Float(f) => Ok(f), other => unexpected(Self::KIND, &other) },
    |w| Value::Float(w)
);

simple_property!(
    /// Interned name
    NameProperty, Name, FName,
    |v| match v { Value::Name(n) => Ok(n), other => unexpected(Self::KIND, &other) },
    |w| Value::Name(w)
);

simple_property!(
    /// Host string
    StrProperty, Str, String,
    |v| match v { Value::Str(s) => Ok(s), other => unexpected(Self::KIND, &other) },
    |w| Value::Str(w)
);

simple_property!(
    /// Dynamic array
    ArrayProperty, Array, ArrayView,
    |v| match v { Value::Array(a) => Ok(a), other => unexpected(Self::KIND, &other) },
    |w| Value::Array(w)
);

simple_property!(
    /// Nested struct
    StructProperty, Struct, StructView,
    |v| match v { Value::Struct(s) => Ok(s), other => unexpected(Self::KIND, &other) },
    |w| Value::Struct(w)
);

simple_property!(
    /// Object reference
    ObjectProperty, Object, Option<ObjectRef>,
    |v| match v { Value::Object(o) => Ok(o), other => unexpected(Self::KIND, &other) },
    |w| Value::Object(w)
);

simple_property!(
    /// Interface reference
    InterfaceProperty, Interface, Option<ObjectRef>,
    |v| match v { Value::Interface(o) => Ok(o), other => unexpected(Self::KIND, &other) },
    |w| Value::Interface(w)
);

simple_property!(
    /// Type reference
    ClassProperty, Class, Option<TypeRef>,
    |v| match v { Value::Class(t) => Ok(t), other => unexpected(Self::KIND, &other) },
    |w| Value::Class(w)
);

simple_property!(
    /// Member function
    FunctionProperty, Function, BoundMethod,
    |v| match v { Value::Function(m) => Ok(m), other => unexpected(Self::KIND, &other) },
    |w| Value::Function(w)
);
