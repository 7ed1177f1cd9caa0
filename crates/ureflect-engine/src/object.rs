//! Host object handles and object-model queries
//!
//! `ObjectRef` and `TypeRef` are plain addresses of host objects. The queries
//! here (class, outer, name, path, inheritance) only need the common object
//! header described by the layout profile.

use rustc_hash::FxHashSet;
use std::fmt;
use std::num::NonZeroUsize;

use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::tables::FName;

/// Longest outer chain followed before giving up
const MAX_OUTER_DEPTH: usize = 64;

/// Address of a live host object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wrap a raw object address (0 yields `None`)
    ///
    /// # Safety
    /// A non-zero `addr` must be the address of a host object that stays
    /// alive while the handle is used.
    pub unsafe fn from_raw(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(ObjectRef)
    }

    /// Address read out of host memory that the profile says holds an object pointer
    pub(crate) fn from_host(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(ObjectRef)
    }

    /// Raw address
    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// A host object known to be a type descriptor (struct, class, or function)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(ObjectRef);

impl TypeRef {
    /// Treat an object as a type descriptor
    ///
    /// Use [`Host::as_type`] for a checked conversion.
    pub fn from_object_unchecked(obj: ObjectRef) -> Self {
        TypeRef(obj)
    }

    /// The underlying object
    #[inline]
    pub fn object(self) -> ObjectRef {
        self.0
    }

    /// Raw address
    #[inline]
    pub fn addr(self) -> usize {
        self.0.addr()
    }
}

impl From<TypeRef> for ObjectRef {
    fn from(ty: TypeRef) -> Self {
        ty.0
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({:#x})", self.addr())
    }
}

impl Host {
    /// Class of an object
    pub fn class_of(&self, obj: ObjectRef) -> Option<TypeRef> {
        let off = self.profile().object.class;
        ObjectRef::from_host(unsafe { memory::read_ptr(obj.addr() + off) }).map(TypeRef)
    }

    /// Containing object (package, owning struct, ...)
    pub fn outer_of(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let off = self.profile().object.outer;
        ObjectRef::from_host(unsafe { memory::read_ptr(obj.addr() + off) })
    }

    /// Index of the object in the object table
    pub fn internal_index(&self, obj: ObjectRef) -> i32 {
        unsafe { memory::read::<i32>(obj.addr() + self.profile().object.internal_index) }
    }

    /// Object flags word
    pub fn object_flags(&self, obj: ObjectRef) -> u32 {
        unsafe { memory::read::<u32>(obj.addr() + self.profile().object.flags) }
    }

    /// Name identifier of an object
    pub fn fname_of(&self, obj: ObjectRef) -> FName {
        let layout = &self.profile().object;
        let index = unsafe { memory::read::<i32>(obj.addr() + layout.name) };
        let number = if layout.name_has_number {
            unsafe { memory::read::<u32>(obj.addr() + layout.name + 4) }
        } else {
            0
        };
        FName::new(index, number)
    }

    /// Base name of an object, without its instance number
    pub fn name_of(&self, obj: ObjectRef) -> ReflectResult<String> {
        let fname = self.fname_of(obj);
        self.names().text(fname.index)
    }

    /// Display name of an object (`Base_N` for numbered instances)
    pub fn object_name(&self, obj: ObjectRef) -> ReflectResult<String> {
        self.names().resolve(self.fname_of(obj))
    }

    /// Whether the object's name is exactly `name`
    pub(crate) fn name_is(&self, obj: ObjectRef, name: &str) -> bool {
        self.object_name(obj).map(|n| n == name).unwrap_or(false)
    }

    /// Fully-qualified path, e.g. `/Script/Engine.Actor:Tick`
    ///
    /// Components are separated by `.`, except that `:` follows an object
    /// which is not a package but whose own outer is a package.
    pub fn path_name(&self, obj: ObjectRef) -> ReflectResult<String> {
        let mut chain = vec![obj];
        let mut current = obj;
        while let Some(outer) = self.outer_of(current) {
            if chain.len() >= MAX_OUTER_DEPTH || chain.contains(&outer) {
                log::warn!("outer chain of {:?} does not terminate", obj);
                return Err(ReflectError::resolution(
                    "path name",
                    format!("outer chain of {:#x} does not terminate", obj.addr()),
                ));
            }
            chain.push(outer);
            current = outer;
        }

        let mut path = String::new();
        for (i, &item) in chain.iter().rev().enumerate() {
            if i > 0 {
                let parent = chain[chain.len() - i];
                path.push(self.path_separator(parent));
            }
            path.push_str(&self.object_name(item)?);
        }
        Ok(path)
    }

    fn path_separator(&self, parent: ObjectRef) -> char {
        let grand_is_package = self
            .outer_of(parent)
            .map(|g| self.is_package(g))
            .unwrap_or(false);
        if !self.is_package(parent) && grand_is_package {
            ':'
        } else {
            '.'
        }
    }

    /// Whether an object is a package
    pub fn is_package(&self, obj: ObjectRef) -> bool {
        let package = &self.profile().type_names.package;
        self.class_of(obj)
            .map(|class| self.name_is(class.object(), package))
            .unwrap_or(false)
    }

    /// Parent type of a type descriptor
    pub fn super_of(&self, ty: TypeRef) -> Option<TypeRef> {
        let off = self.profile().structure.super_struct;
        ObjectRef::from_host(unsafe { memory::read_ptr(ty.addr() + off) }).map(TypeRef)
    }

    /// `ty` followed by its parents, stopping at the first repeat
    pub fn super_chain(&self, ty: TypeRef) -> Vec<TypeRef> {
        let mut seen = FxHashSet::default();
        let mut chain = Vec::new();
        let mut current = Some(ty);
        while let Some(t) = current {
            if !seen.insert(t) {
                log::warn!("cycle in parent chain of {:?}", ty);
                break;
            }
            chain.push(t);
            current = self.super_of(t);
        }
        chain
    }

    /// Whether `ty` is `base` or derives from it
    pub fn inherits(&self, ty: TypeRef, base: TypeRef) -> bool {
        self.super_chain(ty).contains(&base)
    }

    /// Whether an object is an instance of `ty` or of a type derived from it
    pub fn is_a(&self, obj: ObjectRef, ty: TypeRef) -> bool {
        self.class_of(obj)
            .map(|class| self.inherits(class, ty))
            .unwrap_or(false)
    }

    /// Display name of a type for error messages
    pub(crate) fn type_label(&self, ty: Option<TypeRef>) -> String {
        match ty {
            Some(t) => self
                .object_name(t.object())
                .unwrap_or_else(|_| format!("<type {:#x}>", t.addr())),
            None => "None".to_string(),
        }
    }

    /// Class name of an object for error messages
    pub(crate) fn class_label(&self, obj: ObjectRef) -> String {
        self.type_label(self.class_of(obj))
    }
}
