//! Raw host memory access and allocation
//!
//! Everything the runtime knows about the host is an address plus an offset
//! from the layout profile. The helpers here are the only place raw reads and
//! writes happen; all of them tolerate unaligned addresses.

use crate::layout::AllocatorLayout;

// ============================================================================
// Raw access
// ============================================================================

/// Read a `T` at `addr`
///
/// # Safety
/// `addr..addr + size_of::<T>()` must be readable and hold a valid `T`.
#[inline]
pub unsafe fn read<T: Copy>(addr: usize) -> T {
    std::ptr::read_unaligned(addr as *const T)
}

/// Write a `T` at `addr`
///
/// # Safety
/// `addr..addr + size_of::<T>()` must be writable.
#[inline]
pub unsafe fn write<T: Copy>(addr: usize, value: T) {
    std::ptr::write_unaligned(addr as *mut T, value)
}

/// Read a pointer-sized value at `addr`
///
/// # Safety
/// See [`read`].
#[inline]
pub unsafe fn read_ptr(addr: usize) -> usize {
    read::<usize>(addr)
}

/// Copy `len` bytes; the ranges may overlap
///
/// # Safety
/// Both ranges must be valid for `len` bytes.
#[inline]
pub unsafe fn copy(dst: usize, src: usize, len: usize) {
    std::ptr::copy(src as *const u8, dst as *mut u8, len)
}

/// Zero `len` bytes
///
/// # Safety
/// The range must be writable.
#[inline]
pub unsafe fn zero(addr: usize, len: usize) {
    std::ptr::write_bytes(addr as *mut u8, 0, len)
}

/// Read a null-terminated host string of `char_width` 1 or 2
///
/// Reading stops at the terminator or after `max_chars` characters.
///
/// # Safety
/// The characters up to the terminator (or the limit) must be readable.
pub unsafe fn read_c_string(addr: usize, char_width: usize, max_chars: usize) -> String {
    if char_width == 2 {
        let mut units = Vec::new();
        for i in 0..max_chars {
            let unit: u16 = read(addr + i * 2);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16_lossy(&units)
    } else {
        let mut bytes = Vec::new();
        for i in 0..max_chars {
            let byte: u8 = read(addr + i);
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        // Narrow host names are Latin-1
        bytes.into_iter().map(char::from).collect()
    }
}

/// Read exactly `len` host characters
///
/// # Safety
/// `addr..addr + len * char_width` must be readable.
pub unsafe fn read_chars(addr: usize, char_width: usize, len: usize) -> String {
    if char_width == 2 {
        let units: Vec<u16> = (0..len).map(|i| read::<u16>(addr + i * 2)).collect();
        String::from_utf16_lossy(&units)
    } else {
        (0..len).map(|i| char::from(read::<u8>(addr + i))).collect()
    }
}

// ============================================================================
// Host entry point signatures
// ============================================================================

macro_rules! host_fn {
    ($(#[$meta:meta])* $name:ident = fn($($arg:ty),*) $(-> $ret:ty)?) => {
        $(#[$meta])*
        #[cfg(all(windows, target_arch = "x86"))]
        pub type $name = unsafe extern "thiscall" fn($($arg),*) $(-> $ret)?;

        $(#[$meta])*
        #[cfg(not(all(windows, target_arch = "x86")))]
        pub type $name = unsafe extern "C" fn($($arg),*) $(-> $ret)?;
    };
}

/// Define a function callable through one of the entry point types above
macro_rules! host_entry {
    ($(#[$meta:meta])* $vis:vis fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block) => {
        $(#[$meta])*
        #[cfg(all(windows, target_arch = "x86"))]
        $vis unsafe extern "thiscall" fn $name($($arg: $ty),*) $(-> $ret)? $body

        $(#[$meta])*
        #[cfg(not(all(windows, target_arch = "x86")))]
        $vis unsafe extern "C" fn $name($($arg: $ty),*) $(-> $ret)? $body
    };
}

pub(crate) use host_entry;

host_fn! {
    /// Object dispatch: `(object, function, params)`
    ProcessEventFn = fn(*mut u8, *mut u8, *mut u8)
}

host_fn! {
    /// Native dispatch: `(object, frame, result, function)`
    CallFunctionFn = fn(*mut u8, *mut u8, *mut u8, *mut u8)
}

host_fn! {
    /// Bytecode step: `(frame, context, result)`
    FrameStepFn = fn(*mut u8, *mut u8, *mut u8)
}

host_fn! {
    /// Allocator `Malloc(this, size, alignment)`
    MallocFn = fn(*mut u8, usize, u32) -> *mut u8
}

host_fn! {
    /// Allocator `Realloc(this, ptr, size, alignment)`
    ReallocFn = fn(*mut u8, *mut u8, usize, u32) -> *mut u8
}

host_fn! {
    /// Allocator `Free(this, ptr)`
    FreeFn = fn(*mut u8, *mut u8)
}

// ============================================================================
// Allocators
// ============================================================================

/// Memory that the host may later free or grow itself
///
/// Every buffer the runtime places into host-visible structures (string and
/// array storage, owning struct views) comes from here. All methods return 0
/// on failure.
pub trait HostAllocator: Send + Sync {
    /// Allocate `size` zeroed bytes
    fn alloc_zeroed(&self, size: usize, align: usize) -> usize;

    /// Grow or shrink a block, preserving its contents
    fn realloc(&self, ptr: usize, size: usize, align: usize) -> usize;

    /// Release a block (0 is ignored)
    fn free(&self, ptr: usize);
}

/// Largest alignment the C allocator guarantees
const MALLOC_ALIGN: usize = 16;

/// C runtime allocator, for hosts linked against the same CRT
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

impl HostAllocator for LibcAllocator {
    fn alloc_zeroed(&self, size: usize, align: usize) -> usize {
        let size = size.max(1);
        if align <= MALLOC_ALIGN {
            return unsafe { libc::calloc(1, size) as usize };
        }
        aligned_alloc_zeroed(size, align)
    }

    fn realloc(&self, ptr: usize, size: usize, _align: usize) -> usize {
        unsafe { libc::realloc(ptr as *mut libc::c_void, size.max(1)) as usize }
    }

    fn free(&self, ptr: usize) {
        if ptr != 0 {
            unsafe { libc::free(ptr as *mut libc::c_void) }
        }
    }
}

#[cfg(unix)]
fn aligned_alloc_zeroed(size: usize, align: usize) -> usize {
    let mut out: *mut libc::c_void = std::ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut out, align, size) };
    if rc != 0 || out.is_null() {
        return 0;
    }
    unsafe { zero(out as usize, size) };
    out as usize
}

#[cfg(not(unix))]
fn aligned_alloc_zeroed(_size: usize, _align: usize) -> usize {
    0
}

/// The host's own allocator object, called through its vtable
pub struct VtableAllocator {
    instance: usize,
    malloc: MallocFn,
    realloc: ReallocFn,
    free: FreeFn,
}

impl VtableAllocator {
    /// Bind to an allocator object using the profile's vtable slots
    ///
    /// # Safety
    /// `instance` must point to a live allocator object whose vtable has
    /// functions with the expected signatures in the given slots.
    pub unsafe fn new(instance: usize, slots: &AllocatorLayout) -> Option<Self> {
        if instance == 0 {
            return None;
        }
        let vtable = read_ptr(instance);
        if vtable == 0 {
            return None;
        }
        let slot = |index: usize| read_ptr(vtable + index * std::mem::size_of::<usize>());
        let (malloc, realloc, free) = (slot(slots.malloc), slot(slots.realloc), slot(slots.free));
        if malloc == 0 || realloc == 0 || free == 0 {
            return None;
        }
        Some(Self {
            instance,
            malloc: std::mem::transmute::<usize, MallocFn>(malloc),
            realloc: std::mem::transmute::<usize, ReallocFn>(realloc),
            free: std::mem::transmute::<usize, FreeFn>(free),
        })
    }
}

impl HostAllocator for VtableAllocator {
    fn alloc_zeroed(&self, size: usize, align: usize) -> usize {
        let ptr = unsafe { (self.malloc)(self.instance as *mut u8, size, align as u32) } as usize;
        if ptr != 0 {
            unsafe { zero(ptr, size) };
        }
        ptr
    }

    fn realloc(&self, ptr: usize, size: usize, align: usize) -> usize {
        unsafe { (self.realloc)(self.instance as *mut u8, ptr as *mut u8, size, align as u32) as usize }
    }

    fn free(&self, ptr: usize) {
        if ptr != 0 {
            unsafe { (self.free)(self.instance as *mut u8, ptr as *mut u8) }
        }
    }
}

impl std::fmt::Debug for VtableAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtableAllocator")
            .field("instance", &format_args!("{:#x}", self.instance))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_read_write() {
        let mut buf = [0u8; 16];
        let addr = buf.as_mut_ptr() as usize + 3;
        unsafe {
            write::<u32>(addr, 0xDEAD_BEEF);
            assert_eq!(read::<u32>(addr), 0xDEAD_BEEF);
        }
        assert_eq!(buf[3], 0xEF);
    }

    #[test]
    fn test_read_narrow_and_wide_strings() {
        let narrow = b"Actor\0junk";
        let s = unsafe { read_c_string(narrow.as_ptr() as usize, 1, 64) };
        assert_eq!(s, "Actor");

        let wide: Vec<u16> = "Pawn\0".encode_utf16().collect();
        let s = unsafe { read_c_string(wide.as_ptr() as usize, 2, 64) };
        assert_eq!(s, "Pawn");

        let s = unsafe { read_c_string(narrow.as_ptr() as usize, 1, 3) };
        assert_eq!(s, "Act");
    }

    #[test]
    fn test_read_exact_chars() {
        let wide: Vec<u16> = "hello".encode_utf16().collect();
        let s = unsafe { read_chars(wide.as_ptr() as usize, 2, 4) };
        assert_eq!(s, "hell");
    }

    #[test]
    fn test_libc_allocator_zeroes_and_grows() {
        let alloc = LibcAllocator;
        let ptr = alloc.alloc_zeroed(32, 8);
        assert_ne!(ptr, 0);
        unsafe {
            assert_eq!(read::<u64>(ptr + 24), 0);
            write::<u64>(ptr, 42);
        }
        let grown = alloc.realloc(ptr, 4096, 8);
        assert_ne!(grown, 0);
        assert_eq!(unsafe { read::<u64>(grown) }, 42);
        alloc.free(grown);
        alloc.free(0);
    }

    #[cfg(unix)]
    #[test]
    fn test_libc_allocator_large_alignment() {
        let alloc = LibcAllocator;
        let ptr = alloc.alloc_zeroed(64, 64);
        assert_ne!(ptr, 0);
        assert_eq!(ptr % 64, 0);
        alloc.free(ptr);
    }

    #[test]
    fn test_vtable_allocator_rejects_null() {
        let slots = AllocatorLayout {
            malloc: 2,
            realloc: 3,
            free: 4,
        };
        assert!(unsafe { VtableAllocator::new(0, &slots) }.is_none());
    }
}
