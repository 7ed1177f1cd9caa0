//! Views over struct instances

use std::fmt;

use super::Owner;
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::object::{ObjectRef, TypeRef};
use crate::props::{self, assign_struct, copy_struct, PropertyType, Value};
use crate::types::Property;

/// A typed window onto one struct (or object) instance
///
/// Owning views come from [`StructView::new`] and release their memory when
/// the last view sharing the token drops. Borrowed views point into memory
/// someone else owns.
#[derive(Clone)]
pub struct StructView {
    host: Host,
    ty: TypeRef,
    base: usize,
    owner: Owner,
}

impl StructView {
    /// Allocate a zeroed instance of `ty` through the host allocator
    pub fn new(host: Host, ty: TypeRef) -> ReflectResult<Self> {
        let size = host.properties_size(ty);
        let addr = host
            .allocator()
            .alloc_zeroed(size.max(1), host.min_alignment(ty));
        if addr == 0 {
            return Err(ReflectError::Allocation { size });
        }
        let owner = Owner::owned(host.clone(), ty, addr);
        Ok(Self {
            host,
            ty,
            base: addr,
            owner,
        })
    }

    /// View memory the host owns
    ///
    /// # Safety
    /// `base` must hold a live instance of `ty` for as long as the view and
    /// any view derived from it are used.
    pub unsafe fn borrowed(host: Host, ty: TypeRef, base: usize) -> Self {
        Self {
            host,
            ty,
            base,
            owner: Owner::host_backed(),
        }
    }

    /// View nested inside memory guarded by `owner`
    pub(crate) fn child(host: Host, ty: TypeRef, base: usize, owner: Owner) -> Self {
        Self {
            host,
            ty,
            base,
            owner,
        }
    }

    /// Host context
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Type of the viewed instance
    pub fn ty(&self) -> TypeRef {
        self.ty
    }

    /// Address of the instance
    pub fn base(&self) -> usize {
        self.base
    }

    /// Ownership token
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Whether this view's token frees the memory
    pub fn is_owning(&self) -> bool {
        self.owner.is_owning()
    }

    /// The instance as an object handle, for object views
    pub fn as_object(&self) -> Option<ObjectRef> {
        ObjectRef::from_host(self.base)
    }

    /// Descriptor of field `name`
    pub fn field(&self, name: &str) -> ReflectResult<Property> {
        self.host.find_field(self.ty, name)
    }

    /// Names of every field, own fields first
    pub fn field_names(&self) -> Vec<String> {
        self.host
            .super_chain(self.ty)
            .into_iter()
            .flat_map(|owner| self.host.own_fields(owner))
            .filter_map(|field| self.host.object_name(field).ok())
            .collect()
    }

    /// Read a field; static arrays read as a list
    pub fn get(&self, name: &str) -> ReflectResult<Value> {
        let prop = self.field(name)?;
        props::get_property(&self.host, &prop, self.base, &self.owner, None)
    }

    /// Read one element of a static array field
    pub fn get_at(&self, name: &str, index: usize) -> ReflectResult<Value> {
        let prop = self.field(name)?;
        props::get_property(&self.host, &prop, self.base, &self.owner, Some(index))
    }

    /// Write a field
    pub fn set(&self, name: &str, value: &Value) -> ReflectResult<()> {
        let prop = self.field(name)?;
        props::set_property(&self.host, &prop, self.base, &self.owner, None, value)
    }

    /// Write one element of a static array field
    pub fn set_at(&self, name: &str, index: usize, value: &Value) -> ReflectResult<()> {
        let prop = self.field(name)?;
        props::set_property(&self.host, &prop, self.base, &self.owner, Some(index), value)
    }

    /// Read a field whose declared kind must match `P`
    pub fn get_as<P: PropertyType>(&self, name: &str) -> ReflectResult<P::Value> {
        let prop = self.host.find_and_validate_field::<P>(self.ty, name)?;
        P::from_value(props::get_property(
            &self.host,
            &prop,
            self.base,
            &self.owner,
            None,
        )?)
    }

    /// Write a field whose declared kind must match `P`
    pub fn set_as<P: PropertyType>(&self, name: &str, value: P::Value) -> ReflectResult<()> {
        let prop = self.host.find_and_validate_field::<P>(self.ty, name)?;
        props::set_property(
            &self.host,
            &prop,
            self.base,
            &self.owner,
            None,
            &P::into_value(value),
        )
    }

    /// Owning deep copy of this instance
    pub fn to_owned_copy(&self) -> ReflectResult<StructView> {
        let copy = StructView::new(self.host.clone(), self.ty)?;
        copy_struct(&self.host, self.ty, copy.base, self.base)?;
        Ok(copy)
    }

    /// Overwrite this instance with a copy of `other`
    pub fn assign_from(&self, other: &StructView) -> ReflectResult<()> {
        if other.ty != self.ty {
            return Err(ReflectError::mismatch(
                self.host.type_label(Some(self.ty)),
                self.host.type_label(Some(other.ty)),
            ));
        }
        assign_struct(&self.host, self.ty, self.base, other.base)
    }
}

impl fmt::Debug for StructView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructView")
            .field("ty", &self.host.type_label(Some(self.ty)))
            .field("base", &format_args!("{:#x}", self.base))
            .field("owner", &self.owner)
            .finish()
    }
}
