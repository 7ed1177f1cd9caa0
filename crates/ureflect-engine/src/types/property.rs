//! Decoded field descriptors

use super::PropertyKind;
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::layout::BoolLayout;
use crate::memory;
use crate::object::{ObjectRef, TypeRef};

/// Kind-specific part of a field descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyExtra {
    /// Nothing beyond the common part
    None,
    /// Bit location relative to the field offset
    Bool {
        /// Byte holding the bit
        byte_offset: usize,
        /// Mask of the bit within that byte
        mask: u8,
    },
    /// Element descriptor of a dynamic array
    Array {
        /// Inner property (offset 0 within each element)
        inner: Box<Property>,
    },
    /// Struct type stored inline
    Struct {
        /// Nested struct descriptor
        ty: TypeRef,
    },
    /// Declared class of an object reference
    Object {
        /// Required class of assigned objects
        class: Option<TypeRef>,
    },
    /// Declared meta-class of a class reference
    Class {
        /// Required base class of assigned types
        meta: Option<TypeRef>,
    },
    /// Declared interface of an interface reference
    Interface {
        /// Interface class
        interface: Option<TypeRef>,
    },
}

/// A field descriptor decoded through the layout profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Descriptor object
    pub field: ObjectRef,
    /// Field name
    pub name: String,
    /// Declared kind
    pub kind: PropertyKind,
    /// Offset within the owner
    pub offset: usize,
    /// Size of one element
    pub element_size: usize,
    /// Static array dimension (1 for scalars)
    pub array_dim: usize,
    /// Property flag word
    pub flags: u64,
    /// Kind-specific data
    pub extra: PropertyExtra,
}

impl Property {
    /// Whether every bit of `mask` is set in the flag word
    pub fn has_flags(&self, mask: u64) -> bool {
        mask != 0 && self.flags & mask == mask
    }

    /// Total bytes occupied in the owner
    pub fn total_size(&self) -> usize {
        self.element_size * self.array_dim
    }

    /// Address of element `index` given the owner's base address
    pub fn element_addr(&self, base: usize, index: usize) -> ReflectResult<usize> {
        if index >= self.array_dim {
            return Err(ReflectError::OutOfBounds {
                index,
                size: self.array_dim,
            });
        }
        Ok(base + self.offset + index * self.element_size)
    }

    /// Struct type of a nested-struct property
    pub fn struct_type(&self) -> Option<TypeRef> {
        match &self.extra {
            PropertyExtra::Struct { ty } => Some(*ty),
            _ => None,
        }
    }

    /// Inner property of a dynamic array property
    pub fn inner(&self) -> Option<&Property> {
        match &self.extra {
            PropertyExtra::Array { inner } => Some(inner),
            _ => None,
        }
    }
}

impl Host {
    /// Decode a field descriptor
    ///
    /// `owner_size` is the instance size of the owning type; when given, the
    /// field must fit inside it.
    pub fn decode_property(
        &self,
        field: ObjectRef,
        owner_size: Option<usize>,
    ) -> ReflectResult<Property> {
        let name = self.object_name(field)?;
        let kind = self.field_kind(field).ok_or_else(|| {
            ReflectError::mismatch("supported property kind", self.class_label(field))
        })?;

        if kind == PropertyKind::Function {
            return Ok(Property {
                field,
                name,
                kind,
                offset: 0,
                element_size: 0,
                array_dim: 1,
                flags: 0,
                extra: PropertyExtra::None,
            });
        }

        let layout = &self.profile().property;
        let base = field.addr();
        let (array_dim, element_size, flags, offset) = unsafe {
            (
                memory::read::<i32>(base + layout.array_dim),
                memory::read::<i32>(base + layout.element_size),
                memory::read::<u64>(base + layout.property_flags),
                memory::read::<i32>(base + layout.offset),
            )
        };
        if array_dim < 1 || element_size < 0 || offset < 0 {
            return Err(ReflectError::InvalidEntry {
                index: self.internal_index(field).max(0) as usize,
                reason: format!(
                    "field '{}' has dim {} size {} offset {}",
                    name, array_dim, element_size, offset
                ),
            });
        }

        let property = Property {
            field,
            name,
            kind,
            offset: offset as usize,
            element_size: element_size as usize,
            array_dim: array_dim as usize,
            flags,
            extra: self.decode_extra(field, kind)?,
        };

        if let Some(owner_size) = owner_size {
            let end = property.offset + property.total_size();
            if end > owner_size {
                return Err(ReflectError::InvalidEntry {
                    index: self.internal_index(field).max(0) as usize,
                    reason: format!(
                        "field '{}' ends at {} past owner size {}",
                        property.name, end, owner_size
                    ),
                });
            }
        }

        Ok(property)
    }

    fn decode_extra(&self, field: ObjectRef, kind: PropertyKind) -> ReflectResult<PropertyExtra> {
        let layout = &self.profile().property;
        let base = field.addr();
        let type_at = |off: usize| {
            ObjectRef::from_host(unsafe { memory::read_ptr(base + off) })
                .map(TypeRef::from_object_unchecked)
        };

        let extra = match kind {
            PropertyKind::Bool => match layout.bool {
                BoolLayout::Byte {
                    byte_offset,
                    field_mask,
                } => PropertyExtra::Bool {
                    byte_offset: unsafe { memory::read::<u8>(base + byte_offset) } as usize,
                    mask: unsafe { memory::read::<u8>(base + field_mask) },
                },
                BoolLayout::Word { mask } => {
                    let word = unsafe { memory::read::<u32>(base + mask) };
                    if word == 0 {
                        return Err(ReflectError::mismatch("bool bit mask", "0"));
                    }
                    let byte = word.trailing_zeros() as usize / 8;
                    PropertyExtra::Bool {
                        byte_offset: byte,
                        mask: (word >> (byte * 8)) as u8,
                    }
                }
            },
            PropertyKind::Array => {
                let inner = ObjectRef::from_host(unsafe { memory::read_ptr(base + layout.inner) })
                    .ok_or_else(|| ReflectError::resolution("array inner property", "null"))?;
                PropertyExtra::Array {
                    inner: Box::new(self.decode_property(inner, None)?),
                }
            }
            PropertyKind::Struct => PropertyExtra::Struct {
                ty: type_at(layout.struct_type)
                    .ok_or_else(|| ReflectError::resolution("struct property type", "null"))?,
            },
            PropertyKind::Object => PropertyExtra::Object {
                class: type_at(layout.property_class),
            },
            PropertyKind::Class => PropertyExtra::Class {
                meta: type_at(layout.meta_class),
            },
            PropertyKind::Interface => PropertyExtra::Interface {
                interface: type_at(layout.interface_class),
            },
            _ => PropertyExtra::None,
        };
        Ok(extra)
    }
}
