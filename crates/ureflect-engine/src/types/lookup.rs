//! Type and field lookup with a process-wide cache

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{Property, PropertyKind};
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::object::{ObjectRef, TypeRef};
use crate::props::PropertyType;
use crate::tables::FName;

/// Memoized lookups
///
/// Entries are inserted only when absent, so two threads resolving the same
/// name concurrently agree on the result. Nothing is evicted until
/// [`Host::clear_type_cache`].
#[derive(Debug, Default)]
pub(crate) struct TypeCache {
    bootstrap: Mutex<Option<TypeRef>>,
    structure: Mutex<Option<TypeRef>>,
    by_name: Mutex<FxHashMap<FName, TypeRef>>,
    by_path: Mutex<FxHashMap<String, TypeRef>>,
    pub(crate) kinds: RwLock<FxHashMap<usize, Option<PropertyKind>>>,
}

impl TypeCache {
    fn clear(&self) {
        *self.bootstrap.lock() = None;
        *self.structure.lock() = None;
        self.by_name.lock().clear();
        self.by_path.lock().clear();
        self.kinds.write().clear();
    }
}

impl Host {
    /// The type-of-types: the class that is its own class
    ///
    /// Found by following `class_of` from the first live object until it
    /// reaches a fixed point.
    pub fn bootstrap_class(&self) -> ReflectResult<TypeRef> {
        if let Some(ty) = *self.types().bootstrap.lock() {
            return Ok(ty);
        }

        let first = self
            .objects()
            .iter()
            .find_map(|record| record.object)
            .ok_or_else(|| ReflectError::resolution("bootstrap type", "object table is empty"))?;

        let mut seen = FxHashSet::default();
        let mut current = first;
        let found = loop {
            if !seen.insert(current) {
                return Err(ReflectError::resolution(
                    "bootstrap type",
                    "class chain cycles without a fixed point",
                ));
            }
            let class = self.class_of(current).ok_or_else(|| {
                ReflectError::resolution("bootstrap type", "object without a class")
            })?;
            if class.object() == current {
                break class;
            }
            current = class.object();
        };

        let name = self.object_name(found.object()).unwrap_or_default();
        if name != self.profile().type_names.class {
            log::warn!(
                "bootstrap type is named '{}', expected '{}'",
                name,
                self.profile().type_names.class
            );
        }
        log::info!("bootstrap type '{}' at {:#x}", name, found.addr());

        let mut slot = self.types().bootstrap.lock();
        Ok(*slot.get_or_insert(found))
    }

    /// Root of every type descriptor, found on the bootstrap type's parent chain
    pub fn struct_type(&self) -> ReflectResult<TypeRef> {
        if let Some(ty) = *self.types().structure.lock() {
            return Ok(ty);
        }

        let bootstrap = self.bootstrap_class()?;
        let wanted = &self.profile().type_names.structure;
        let found = self
            .super_chain(bootstrap)
            .into_iter()
            .find(|t| self.name_is(t.object(), wanted))
            .ok_or_else(|| {
                ReflectError::resolution(
                    "struct type",
                    format!("'{}' is not a parent of the bootstrap type", wanted),
                )
            })?;

        let mut slot = self.types().structure.lock();
        Ok(*slot.get_or_insert(found))
    }

    /// Whether an object is a struct, class or function descriptor
    pub fn is_type_descriptor(&self, obj: ObjectRef) -> bool {
        match self.struct_type() {
            Ok(structure) => self.is_a(obj, structure),
            Err(_) => false,
        }
    }

    /// Checked conversion to a type handle
    pub fn as_type(&self, obj: ObjectRef) -> ReflectResult<TypeRef> {
        if self.is_type_descriptor(obj) {
            Ok(TypeRef::from_object_unchecked(obj))
        } else {
            Err(ReflectError::mismatch("type descriptor", self.class_label(obj)))
        }
    }

    /// Type descriptor with the given name
    ///
    /// Names are not unique across modules. When several types share a name
    /// the one with the lowest object index wins, which is stable for a given
    /// object table but may not be the type the caller meant; prefer
    /// [`Host::find_type_by_path`] for such names.
    pub fn find_type(&self, name: &str) -> ReflectResult<TypeRef> {
        let not_found = || ReflectError::NotFound {
            what: "type",
            name: name.to_string(),
        };
        let index = self.names().find(name).ok_or_else(not_found)?;
        let key = FName::new(index as i32, 0);

        if let Some(ty) = self.types().by_name.lock().get(&key) {
            return Ok(*ty);
        }

        let found = self
            .objects()
            .iter()
            .filter_map(|record| record.object)
            .find(|&obj| self.fname_of(obj) == key && self.is_type_descriptor(obj))
            .map(TypeRef::from_object_unchecked)
            .ok_or_else(not_found)?;

        log::debug!("type '{}' resolved to {:#x}", name, found.addr());
        Ok(*self.types().by_name.lock().entry(key).or_insert(found))
    }

    /// Type descriptor with the given fully-qualified path
    pub fn find_type_by_path(&self, path: &str) -> ReflectResult<TypeRef> {
        if let Some(ty) = self.types().by_path.lock().get(path) {
            return Ok(*ty);
        }

        let leaf = path.rsplit(['.', ':']).next().unwrap_or(path);
        let found = self
            .objects()
            .iter()
            .filter_map(|record| record.object)
            .filter(|&obj| self.name_is(obj, leaf) && self.is_type_descriptor(obj))
            .find(|&obj| self.path_name(obj).map(|p| p == path).unwrap_or(false))
            .map(TypeRef::from_object_unchecked)
            .ok_or_else(|| ReflectError::NotFound {
                what: "type",
                name: path.to_string(),
            })?;

        log::debug!("type path '{}' resolved to {:#x}", path, found.addr());
        Ok(*self
            .types()
            .by_path
            .lock()
            .entry(path.to_string())
            .or_insert(found))
    }

    /// Field named `name` on `ty` or its parents; own fields shadow inherited ones
    pub fn find_field(&self, ty: TypeRef, name: &str) -> ReflectResult<Property> {
        for owner in self.super_chain(ty) {
            for field in self.own_fields(owner) {
                if self.name_is(field, name) {
                    return self.decode_property(field, Some(self.properties_size(owner)));
                }
            }
        }
        Err(ReflectError::NotFound {
            what: "field",
            name: format!("{}.{}", self.type_label(Some(ty)), name),
        })
    }

    /// Field lookup that also checks the declared kind
    pub fn find_field_of_kind(
        &self,
        ty: TypeRef,
        name: &str,
        kind: PropertyKind,
    ) -> ReflectResult<Property> {
        let prop = self.find_field(ty, name)?;
        if prop.kind != kind {
            return Err(ReflectError::mismatch(kind.to_string(), prop.kind.to_string()));
        }
        Ok(prop)
    }

    /// Field lookup checked against a typed property marker
    pub fn find_and_validate_field<P: PropertyType>(
        &self,
        ty: TypeRef,
        name: &str,
    ) -> ReflectResult<Property> {
        self.find_field_of_kind(ty, name, P::KIND)
    }

    /// Function named `name` on `ty` or its parents
    pub fn find_function(&self, ty: TypeRef, name: &str) -> ReflectResult<TypeRef> {
        let prop = self.find_field_of_kind(ty, name, PropertyKind::Function)?;
        Ok(TypeRef::from_object_unchecked(prop.field))
    }

    /// Drop every cached lookup
    pub fn clear_type_cache(&self) {
        log::debug!("clearing type cache");
        self.types().clear();
    }
}
