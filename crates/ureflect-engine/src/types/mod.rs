//! Type descriptor model
//!
//! Type descriptors (structs, classes, functions) are host objects with a
//! parent link, an owned linked list of fields, an instance size and a
//! minimum alignment. This module reads them through the layout profile and
//! decides the [`PropertyKind`] of each field from the class of its
//! descriptor.

mod lookup;
mod property;

pub use property::{Property, PropertyExtra};

pub(crate) use lookup::TypeCache;

use std::fmt;

use crate::host::Host;
use crate::memory;
use crate::object::{ObjectRef, TypeRef};

/// Longest field list walked before assuming corruption
const MAX_FIELDS: usize = 1 << 16;

// ============================================================================
// Property kinds
// ============================================================================

/// Declared kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Bit in a shared byte
    Bool,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 8-bit integer
    UInt8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Unsigned 32-bit integer
    UInt32,
    /// Unsigned 64-bit integer
    UInt64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Interned name
    Name,
    /// Host dynamic string
    Str,
    /// Host dynamic array
    Array,
    /// Nested struct stored inline
    Struct,
    /// Object pointer
    Object,
    /// Object pointer plus interface vtable pointer
    Interface,
    /// Pointer to a type descriptor
    Class,
    /// Member function
    Function,
}

impl PropertyKind {
    /// Every kind, in declaration order
    pub const ALL: [PropertyKind; 19] = [
        PropertyKind::Bool,
        PropertyKind::Int8,
        PropertyKind::Int16,
        PropertyKind::Int32,
        PropertyKind::Int64,
        PropertyKind::UInt8,
        PropertyKind::UInt16,
        PropertyKind::UInt32,
        PropertyKind::UInt64,
        PropertyKind::Float32,
        PropertyKind::Float64,
        PropertyKind::Name,
        PropertyKind::Str,
        PropertyKind::Array,
        PropertyKind::Struct,
        PropertyKind::Object,
        PropertyKind::Interface,
        PropertyKind::Class,
        PropertyKind::Function,
    ];

    /// Host class name of descriptors of this kind
    pub fn class_name(self) -> &'static str {
        match self {
            PropertyKind::Bool => "BoolProperty",
            PropertyKind::Int8 => "Int8Property",
            PropertyKind::Int16 => "Int16Property",
            PropertyKind::Int32 => "IntProperty",
            PropertyKind::Int64 => "Int64Property",
            PropertyKind::UInt8 => "ByteProperty",
            PropertyKind::UInt16 => "UInt16Property",
            PropertyKind::UInt32 => "UInt32Property",
            PropertyKind::UInt64 => "UInt64Property",
            PropertyKind::Float32 => "FloatProperty",
            PropertyKind::Float64 => "DoubleProperty",
            PropertyKind::Name => "NameProperty",
            PropertyKind::Str => "StrProperty",
            PropertyKind::Array => "ArrayProperty",
            PropertyKind::Struct => "StructProperty",
            PropertyKind::Object => "ObjectProperty",
            PropertyKind::Interface => "InterfaceProperty",
            PropertyKind::Class => "ClassProperty",
            PropertyKind::Function => "Function",
        }
    }

    /// Kind whose descriptors have class `name`
    pub fn from_class_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.class_name() == name)
    }

    /// Inclusive range of an integer kind
    pub fn int_range(self) -> Option<(i128, i128)> {
        let range = match self {
            PropertyKind::Int8 => (i8::MIN as i128, i8::MAX as i128),
            PropertyKind::Int16 => (i16::MIN as i128, i16::MAX as i128),
            PropertyKind::Int32 => (i32::MIN as i128, i32::MAX as i128),
            PropertyKind::Int64 => (i64::MIN as i128, i64::MAX as i128),
            PropertyKind::UInt8 => (0, u8::MAX as i128),
            PropertyKind::UInt16 => (0, u16::MAX as i128),
            PropertyKind::UInt32 => (0, u32::MAX as i128),
            PropertyKind::UInt64 => (0, u64::MAX as i128),
            _ => return None,
        };
        Some(range)
    }

    /// Whether values of this kind own host allocations
    pub fn owns_memory(self) -> bool {
        matches!(
            self,
            PropertyKind::Str | PropertyKind::Array | PropertyKind::Struct
        )
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

// ============================================================================
// Descriptor reads
// ============================================================================

impl Host {
    /// Instance size of a type
    pub fn properties_size(&self, ty: TypeRef) -> usize {
        let off = self.profile().structure.properties_size;
        unsafe { memory::read::<i32>(ty.addr() + off) }.max(0) as usize
    }

    /// Minimum alignment of a type (at least 1)
    pub fn min_alignment(&self, ty: TypeRef) -> usize {
        let off = self.profile().structure.min_alignment;
        unsafe { memory::read::<i32>(ty.addr() + off) }.max(1) as usize
    }

    /// Function flags word of a function descriptor
    pub fn function_flags(&self, function: ObjectRef) -> u32 {
        let off = self.profile().function.function_flags;
        unsafe { memory::read::<u32>(function.addr() + off) }
    }

    /// Fields owned directly by `ty`, in declaration order
    pub fn own_fields(&self, ty: TypeRef) -> Vec<ObjectRef> {
        let children = self.profile().structure.children;
        let next = self.profile().field.next;
        let mut fields = Vec::new();
        let mut current = ObjectRef::from_host(unsafe { memory::read_ptr(ty.addr() + children) });
        while let Some(field) = current {
            if fields.len() >= MAX_FIELDS {
                log::warn!("field list of {:?} does not terminate", ty);
                break;
            }
            fields.push(field);
            current = ObjectRef::from_host(unsafe { memory::read_ptr(field.addr() + next) });
        }
        fields
    }

    /// Declared kind of a field descriptor, `None` for unsupported kinds
    ///
    /// The kind follows from the name of the descriptor's class, or of the
    /// nearest ancestor class with a known name. Results are cached per class.
    pub fn field_kind(&self, field: ObjectRef) -> Option<PropertyKind> {
        let class = self.class_of(field)?;
        if let Some(kind) = self.types().kinds.read().get(&class.addr()) {
            return *kind;
        }

        let kind = self.super_chain(class).into_iter().find_map(|c| {
            self.object_name(c.object())
                .ok()
                .and_then(|name| PropertyKind::from_class_name(&name))
        });
        self.types().kinds.write().insert(class.addr(), kind);
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FieldSpec};

    #[test]
    fn test_kind_from_class_name() {
        assert_eq!(PropertyKind::from_class_name("IntProperty"), Some(PropertyKind::Int32));
        assert_eq!(PropertyKind::from_class_name("ByteProperty"), Some(PropertyKind::UInt8));
        assert_eq!(PropertyKind::from_class_name("Function"), Some(PropertyKind::Function));
        assert_eq!(PropertyKind::from_class_name("MapProperty"), None);
    }

    #[test]
    fn test_int_ranges() {
        assert_eq!(PropertyKind::UInt8.int_range(), Some((0, 255)));
        assert_eq!(PropertyKind::Int16.int_range(), Some((-32768, 32767)));
        assert_eq!(PropertyKind::Float32.int_range(), None);
    }

    #[test]
    fn test_own_fields_in_order() {
        let mut fake = FakeHost::new();
        let actor = fake
            .class("Actor")
            .field("A", FieldSpec::Int32)
            .field("B", FieldSpec::Float32)
            .finish();
        let host = fake.host();

        let names: Vec<_> = host
            .own_fields(actor)
            .into_iter()
            .map(|f| host.object_name(f).unwrap())
            .collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn test_field_kind_of_derived_property_class() {
        let mut fake = FakeHost::new();
        let target = fake.class("Target").finish();
        let actor = fake
            .class("Actor")
            .field("Ref", FieldSpec::Class(target))
            .field("Count", FieldSpec::UInt16)
            .finish();
        let host = fake.host();
        let fields = host.own_fields(actor);

        assert_eq!(host.field_kind(fields[0]), Some(PropertyKind::Class));
        assert_eq!(host.field_kind(fields[1]), Some(PropertyKind::UInt16));
        // cached path
        assert_eq!(host.field_kind(fields[1]), Some(PropertyKind::UInt16));
    }
}
