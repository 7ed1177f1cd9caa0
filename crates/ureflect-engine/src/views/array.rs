//! Views over host dynamic arrays

use std::fmt;
use std::sync::Arc;

use super::Owner;
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::props::{array_element, element_align, ops, ArrayHeader, Slot, StagedElements, Value};
use crate::types::Property;

/// A window onto a host dynamic array `{ data, count, capacity }`
///
/// Elements are described by the array property's inner property. Storage
/// grows through the host allocator; a failed allocation leaves the header
/// untouched.
#[derive(Clone)]
pub struct ArrayView {
    host: Host,
    inner: Arc<Property>,
    header: usize,
    owner: Owner,
}

impl ArrayView {
    pub(crate) fn from_parts(host: Host, inner: Arc<Property>, header: usize, owner: Owner) -> Self {
        Self {
            host,
            inner,
            header,
            owner,
        }
    }

    /// Host context
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Element descriptor
    pub fn inner(&self) -> &Property {
        &self.inner
    }

    /// Ownership token of the memory holding the header
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Address of the array header
    pub fn header_addr(&self) -> usize {
        self.header
    }

    fn raw(&self) -> ArrayHeader {
        ArrayHeader::new(&self.host, self.header)
    }

    fn align(&self) -> usize {
        element_align(&self.host, &self.inner)
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.raw().count()
    }

    /// Whether the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated element slots
    pub fn capacity(&self) -> usize {
        self.raw().capacity()
    }

    fn slot(&self, index: usize) -> Slot<'_> {
        let addr = self.raw().data() + index * self.inner.element_size;
        Slot {
            host: &self.host,
            prop: &self.inner,
            addr,
            owner: &self.owner,
            container: addr,
        }
    }

    fn check_index(&self, index: usize) -> ReflectResult<()> {
        let size = self.len();
        if index >= size {
            return Err(ReflectError::OutOfBounds { index, size });
        }
        Ok(())
    }

    /// Read element `index`
    ///
    /// Struct and array elements are views into this array's storage; they
    /// are invalidated by anything that reallocates it.
    pub fn get(&self, index: usize) -> ReflectResult<Value> {
        array_element(self, index)
    }

    /// Write element `index`
    pub fn set(&self, index: usize, value: &Value) -> ReflectResult<()> {
        self.check_index(index)?;
        let ops = ops(self.inner.kind);
        (ops.validate)(&self.host, &self.inner, value)?;
        (ops.set)(&self.slot(index), value)
    }

    /// Make room for at least `capacity` elements
    pub fn reserve(&self, capacity: usize) -> ReflectResult<()> {
        self.raw()
            .reserve(&self.host, capacity, self.inner.element_size, self.align())
    }

    fn destroy_range(&self, from: usize, to: usize) {
        let data = self.raw().data();
        let size = self.inner.element_size;
        if let Some(destroy) = ops(self.inner.kind).destroy {
            for index in from..to {
                destroy(&self.host, &self.inner, data + index * size);
            }
        }
        unsafe { memory::zero(data + from * size, (to - from) * size) };
    }

    /// Grow with zeroed elements or shrink, releasing removed elements
    pub fn resize(&self, len: usize) -> ReflectResult<()> {
        let header = self.raw();
        let count = header.count();
        if len < count {
            self.destroy_range(len, count);
        } else if len > count {
            header.reserve(&self.host, len, self.inner.element_size, self.align())?;
            let size = self.inner.element_size;
            unsafe { memory::zero(header.data() + count * size, (len - count) * size) };
        }
        header.set_count(len);
        Ok(())
    }

    /// Remove every element, keeping the storage
    pub fn clear(&self) -> ReflectResult<()> {
        self.resize(0)
    }

    /// Append one element
    pub fn push(&self, value: &Value) -> ReflectResult<()> {
        let ops = ops(self.inner.kind);
        (ops.validate)(&self.host, &self.inner, value)?;

        let header = self.raw();
        let count = header.count();
        // The source may live in this array's storage
        let value = if count == header.capacity() {
            value.detach()?
        } else {
            value.clone()
        };
        header.grow_for(&self.host, count + 1, self.inner.element_size, self.align())?;

        let slot = self.slot(count);
        unsafe { memory::zero(slot.addr, self.inner.element_size) };
        if let Err(e) = (ops.set)(&slot, &value) {
            self.destroy_range(count, count + 1);
            return Err(e);
        }
        header.set_count(count + 1);
        Ok(())
    }

    /// Remove and return the last element as a detached value
    pub fn pop(&self) -> ReflectResult<Option<Value>> {
        let count = self.len();
        if count == 0 {
            return Ok(None);
        }
        let value = self.get(count - 1)?.detach()?;
        self.destroy_range(count - 1, count);
        self.raw().set_count(count - 1);
        Ok(Some(value))
    }

    /// Replace the contents
    ///
    /// Every item is validated before anything is written. Elements that own
    /// host memory are built in a staging buffer first, so a failed
    /// allocation leaves the old contents in place. The storage stays with
    /// this array; it may grow but is never swapped.
    pub fn assign_from(&self, items: &[Value]) -> ReflectResult<()> {
        let ops = ops(self.inner.kind);
        for item in items {
            (ops.validate)(&self.host, &self.inner, item)?;
        }
        let items = items
            .iter()
            .map(Value::detach)
            .collect::<ReflectResult<Vec<_>>>()?;

        if !self.inner.kind.owns_memory() {
            self.resize(items.len())?;
            for (index, item) in items.iter().enumerate() {
                (ops.set)(&self.slot(index), item)?;
            }
            return Ok(());
        }

        let header = self.raw();
        header.reserve(&self.host, items.len(), self.inner.element_size, self.align())?;
        let staged = StagedElements::write(&self.host, &self.inner, &items, self.align())?;
        let count = header.count();
        if count > 0 {
            self.destroy_range(0, count);
        }
        if !items.is_empty() {
            staged.commit(header.data());
        }
        header.set_count(items.len());
        Ok(())
    }

    /// Lazy iteration; the length is re-read at every step
    pub fn iter(&self) -> ArrayIter<'_> {
        ArrayIter {
            view: self,
            next: 0,
        }
    }

    /// Detached copies of every element
    pub fn to_vec(&self) -> ReflectResult<Vec<Value>> {
        self.iter().map(|v| v.and_then(|v| v.detach())).collect()
    }
}

impl fmt::Debug for ArrayView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayView")
            .field("inner", &self.inner.kind)
            .field("header", &format_args!("{:#x}", self.header))
            .field("len", &self.len())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Iterator over array elements
#[derive(Debug)]
pub struct ArrayIter<'a> {
    view: &'a ArrayView,
    next: usize,
}

impl Iterator for ArrayIter<'_> {
    type Item = ReflectResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.view.len() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.view.get(index))
    }
}
