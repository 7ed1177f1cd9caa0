//! Global object table

use super::TableView;
use crate::error::ReflectResult;
use crate::layout::{ObjectItemLayout, ObjectTableLayout};
use crate::memory;
use crate::object::ObjectRef;

/// One object table slot, copied out of host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Slot index
    pub index: usize,
    /// Object in the slot, `None` for a free slot
    pub object: Option<ObjectRef>,
    /// Slot flags (0 when the layout has none)
    pub flags: u32,
    dead_mask: u32,
}

impl ObjectRecord {
    /// Whether the slot holds an object that is not being destroyed
    pub fn is_live(&self) -> bool {
        self.object.is_some() && self.flags & self.dead_mask == 0
    }
}

/// View over the host's global object table
#[derive(Debug, Clone)]
pub struct ObjectTable {
    table: TableView,
    item: ObjectItemLayout,
}

impl ObjectTable {
    /// Create a view over the object table at `base`
    pub fn new(
        base: usize,
        layout: &ObjectTableLayout,
        pointer_width: usize,
    ) -> ReflectResult<Self> {
        Ok(Self {
            table: TableView::new(base, layout.table.clone(), pointer_width)?,
            item: layout.item.clone(),
        })
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Slot at `index`
    pub fn at(&self, index: usize) -> ReflectResult<ObjectRecord> {
        let slot = self.table.element_addr(index)?;
        let object = ObjectRef::from_host(unsafe { memory::read_ptr(slot + self.item.object_offset) });
        let flags = match self.item.flags_offset {
            Some(off) => unsafe { memory::read::<u32>(slot + off) },
            None => 0,
        };
        Ok(ObjectRecord {
            index,
            object,
            flags,
            dead_mask: self.item.dead_mask,
        })
    }

    /// Lazy sequence of live records
    ///
    /// The count is re-read at every step, so objects created during
    /// iteration are visited and a shrinking table ends the sequence early.
    /// Calling `iter` again restarts from slot 0.
    pub fn iter(&self) -> ObjectIter<'_> {
        ObjectIter {
            table: self,
            next: 0,
        }
    }
}

/// Iterator over live object records
#[derive(Debug, Clone)]
pub struct ObjectIter<'a> {
    table: &'a ObjectTable,
    next: usize,
}

impl Iterator for ObjectIter<'_> {
    type Item = ObjectRecord;

    fn next(&mut self) -> Option<ObjectRecord> {
        while self.next < self.table.size() {
            let index = self.next;
            self.next += 1;
            match self.table.at(index) {
                Ok(record) if record.is_live() => return Some(record),
                Ok(_) => {}
                Err(e) => log::debug!("skipping object slot {}: {}", index, e),
            }
        }
        None
    }
}
