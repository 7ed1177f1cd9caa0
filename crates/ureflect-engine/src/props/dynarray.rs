//! Host dynamic array header `{ data, count: i32, capacity: i32 }`
//!
//! Shared by strings (arrays of characters) and array properties. Counts are
//! 32-bit on the host side; anything larger is a length error, never a
//! silent truncation.

use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;

/// Largest count the host's 32-bit fields can hold
pub(crate) const MAX_COUNT: usize = i32::MAX as usize;

/// Header of one host dynamic array
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArrayHeader {
    addr: usize,
    pointer_width: usize,
}

impl ArrayHeader {
    pub fn new(host: &Host, addr: usize) -> Self {
        Self {
            addr,
            pointer_width: host.profile().pointer_width,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn data(&self) -> usize {
        unsafe { memory::read_ptr(self.addr) }
    }

    pub fn count(&self) -> usize {
        unsafe { memory::read::<i32>(self.addr + self.pointer_width) }.max(0) as usize
    }

    pub fn capacity(&self) -> usize {
        unsafe { memory::read::<i32>(self.addr + self.pointer_width + 4) }.max(0) as usize
    }

    /// Caller guarantees `count <= capacity`
    pub fn set_count(&self, count: usize) {
        unsafe { memory::write::<i32>(self.addr + self.pointer_width, count as i32) }
    }

    fn set_storage(&self, data: usize, capacity: usize) {
        unsafe {
            memory::write::<usize>(self.addr, data);
            memory::write::<i32>(self.addr + self.pointer_width + 4, capacity as i32);
        }
    }

    /// Make room for at least `needed` elements
    ///
    /// New storage past the old capacity is zeroed. On failure the header is
    /// left exactly as it was.
    pub fn reserve(&self, host: &Host, needed: usize, elem_size: usize, align: usize) -> ReflectResult<()> {
        let capacity = self.capacity();
        if needed <= capacity {
            return Ok(());
        }
        if needed > MAX_COUNT {
            return Err(ReflectError::Length {
                requested: needed,
                max: MAX_COUNT,
            });
        }
        let bytes = needed.checked_mul(elem_size).ok_or(ReflectError::Length {
            requested: needed,
            max: MAX_COUNT,
        })?;

        let data = self.data();
        let allocator = host.allocator();
        let new_data = if data == 0 {
            allocator.alloc_zeroed(bytes.max(1), align)
        } else {
            allocator.realloc(data, bytes.max(1), align)
        };
        if new_data == 0 {
            return Err(ReflectError::Allocation { size: bytes });
        }

        if data != 0 {
            let old_bytes = capacity * elem_size;
            unsafe { memory::zero(new_data + old_bytes, bytes - old_bytes) };
        }
        self.set_storage(new_data, needed);
        Ok(())
    }

    /// Like [`ArrayHeader::reserve`] but grows geometrically
    pub fn grow_for(&self, host: &Host, needed: usize, elem_size: usize, align: usize) -> ReflectResult<()> {
        let capacity = self.capacity();
        if needed <= capacity {
            return Ok(());
        }
        let target = capacity.saturating_mul(2).max(4).min(MAX_COUNT).max(needed);
        self.reserve(host, target, elem_size, align)
    }

    /// Free the storage and reset the header to empty
    pub fn release(&self, host: &Host) {
        let data = self.data();
        if data != 0 {
            host.allocator().free(data);
        }
        self.set_storage(0, 0);
        self.set_count(0);
    }
}
