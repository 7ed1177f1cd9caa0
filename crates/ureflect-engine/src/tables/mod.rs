//! Views over the host's global tables
//!
//! The name table and the object table share the same addressing scheme,
//! implemented once by [`TableView`]:
//!
//! - flat: `element = data + index * stride`
//! - chunked: `element = chunks[index / chunk_size] + (index % chunk_size) * stride`
//!
//! The 32-bit count bounds every lookup, including the last, partially filled
//! chunk. Nothing is copied; each access re-reads host memory.

mod names;
mod objects;

pub use names::{FName, NameEntry, NameTable};
pub use objects::{ObjectIter, ObjectRecord, ObjectTable};

use crate::error::{ReflectError, ReflectResult};
use crate::layout::TableLayout;
use crate::memory;

/// Addressing over one table in host memory
#[derive(Debug, Clone)]
pub struct TableView {
    base: usize,
    layout: TableLayout,
    pointer_width: usize,
}

impl TableView {
    /// Create a view over a table at `base`
    pub fn new(base: usize, layout: TableLayout, pointer_width: usize) -> ReflectResult<Self> {
        if base == 0 {
            return Err(ReflectError::resolution("table", "base address is null"));
        }
        Ok(Self {
            base,
            layout,
            pointer_width,
        })
    }

    /// Base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Current element count (a negative host count reads as empty)
    pub fn len(&self) -> usize {
        let count = unsafe { memory::read::<i32>(self.base + self.layout.count_offset) };
        count.max(0) as usize
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> usize {
        let addr = self.base + self.layout.data_offset;
        if self.layout.data_is_pointer {
            unsafe { memory::read_ptr(addr) }
        } else {
            addr
        }
    }

    /// Address of element `index`
    pub fn element_addr(&self, index: usize) -> ReflectResult<usize> {
        let size = self.len();
        if index >= size {
            return Err(ReflectError::OutOfBounds { index, size });
        }

        let data = self.data();
        if data == 0 {
            return Err(ReflectError::InvalidEntry {
                index,
                reason: "table storage is null".to_string(),
            });
        }

        match self.layout.chunk_size {
            None => Ok(data + index * self.layout.stride),
            Some(chunk_size) => {
                let chunk_index = index / chunk_size;
                let chunk = unsafe { memory::read_ptr(data + chunk_index * self.pointer_width) };
                if chunk == 0 {
                    log::warn!("null chunk {} inside table at {:#x}", chunk_index, self.base);
                    return Err(ReflectError::InvalidEntry {
                        index,
                        reason: format!("chunk {} is null", chunk_index),
                    });
                }
                Ok(chunk + (index % chunk_size) * self.layout.stride)
            }
        }
    }
}
