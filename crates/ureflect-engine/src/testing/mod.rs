//! Synthetic host for tests
//!
//! [`FakeHost`] lays out a small object system in process memory following
//! the layout in `testing/profile.toml`: chunked name and object tables, the
//! core type descriptors, and builders for classes, script structs,
//! functions and instances. Its entry points (`fake_process_event`,
//! `fake_call_function`, `fake_step`) run a function's native body, which
//! tests supply as a plain `fn(object, params)`.
//!
//! Everything lives in an arena owned by the `FakeHost`; addresses never move
//! and are released when it drops. Hosts handed out by a `FakeHost` must not
//! outlive it.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::host::{Host, HostConfig};
use crate::layout::LayoutProfile;
use crate::memory::{self, host_entry, HostAllocator, LibcAllocator};
use crate::object::{ObjectRef, TypeRef};
use crate::types::PropertyKind;

/// Layout profile of the synthetic host
pub const PROFILE: &str = include_str!("profile.toml");

/// Package that builders place types in unless told otherwise
pub const DEFAULT_PACKAGE: &str = "/Script/Test";

const CORE_PACKAGE: &str = "/Script/CoreUObject";

// ============================================================================
// Layout
// ============================================================================

const OBJECT_FLAGS: usize = 0x08;
const OBJECT_INDEX: usize = 0x0C;
const OBJECT_CLASS: usize = 0x10;
const OBJECT_NAME: usize = 0x18;
const OBJECT_OUTER: usize = 0x20;
const OBJECT_SIZE: usize = 0x28;

const FIELD_NEXT: usize = 0x28;
const FIELD_SIZE: usize = 0x30;

const STRUCT_SUPER: usize = 0x30;
const STRUCT_CHILDREN: usize = 0x38;
const STRUCT_SIZE_OFFSET: usize = 0x40;
const STRUCT_ALIGN_OFFSET: usize = 0x44;
const STRUCT_SIZE: usize = 0x48;

const CLASS_INTERFACES: usize = 0x48;
const CLASS_SIZE: usize = 0x58;
const INTERFACE_STRIDE: usize = 0x10;

const FUNCTION_FLAGS: usize = 0x48;
const FUNCTION_NATIVE: usize = 0x50;
const FUNCTION_SIZE: usize = 0x58;

const PROP_DIM: usize = 0x30;
const PROP_ELEMENT_SIZE: usize = 0x34;
const PROP_FLAGS: usize = 0x38;
const PROP_OFFSET: usize = 0x40;
const PROP_BOOL_BYTE: usize = 0x48;
const PROP_BOOL_MASK: usize = 0x49;
const PROP_REF: usize = 0x50;
const PROP_META: usize = 0x58;
const PROPERTY_SIZE: usize = 0x60;

const FRAME_NODE: usize = 0x10;
const FRAME_OBJECT: usize = 0x18;
const FRAME_CODE: usize = 0x20;
const FRAME_SIZE: usize = 0x30;

const NAMES_COUNT: usize = 0x8;
const OBJECTS_COUNT: usize = 0x14;
const NAME_TEXT: usize = 0x8;
const OBJECT_ITEM_STRIDE: usize = 0x18;
const OBJECT_ITEM_FLAGS: usize = 0x8;
const CHUNK_SIZE: usize = 64;
const MAX_CHUNKS: usize = 256;

/// Object-table flag marking an object pending destruction
pub const DEAD_FLAG: u32 = 1 << 29;

const PARAM: u64 = 0x80;
const OUT_PARAM: u64 = 0x100;
const RETURN_PARAM: u64 = 0x400;
const OPTIONAL_PARAM: u64 = 0x10;

const OP_LITERAL: u8 = 0x01;
const OP_END_OF_PARAMS: u8 = 0x16;

fn align_up(value: usize, align: usize) -> usize {
    let align = align.max(1);
    (value + align - 1) / align * align
}

fn put<T: Copy>(addr: usize, value: T) {
    unsafe { memory::write(addr, value) }
}

fn get<T: Copy>(addr: usize) -> T {
    unsafe { memory::read(addr) }
}

// ============================================================================
// Arena
// ============================================================================

/// Zeroed, never-moving blocks freed together on drop
#[derive(Default)]
struct Arena {
    blocks: Vec<(NonNull<u8>, Layout)>,
}

impl Arena {
    fn alloc(&mut self, size: usize) -> usize {
        let layout = match Layout::from_size_align(size.max(1), 16) {
            Ok(layout) => layout,
            Err(e) => panic!("arena block of {} bytes: {}", size, e),
        };
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        self.blocks.push((ptr, layout));
        ptr.as_ptr() as usize
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for (ptr, layout) in self.blocks.drain(..) {
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

// ============================================================================
// Public helper types
// ============================================================================

/// Field description used by the type builders
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum FieldSpec {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Name,
    Str,
    Array(Box<FieldSpec>),
    Struct(TypeRef),
    Object(TypeRef),
    Interface(TypeRef),
    /// Class reference constrained to subclasses of the given class
    Class(TypeRef),
}

impl FieldSpec {
    /// Property kind the field is declared with
    pub fn kind(&self) -> PropertyKind {
        match self {
            FieldSpec::Bool => PropertyKind::Bool,
            FieldSpec::Int8 => PropertyKind::Int8,
            FieldSpec::Int16 => PropertyKind::Int16,
            FieldSpec::Int32 => PropertyKind::Int32,
            FieldSpec::Int64 => PropertyKind::Int64,
            FieldSpec::UInt8 => PropertyKind::UInt8,
            FieldSpec::UInt16 => PropertyKind::UInt16,
            FieldSpec::UInt32 => PropertyKind::UInt32,
            FieldSpec::UInt64 => PropertyKind::UInt64,
            FieldSpec::Float32 => PropertyKind::Float32,
            FieldSpec::Float64 => PropertyKind::Float64,
            FieldSpec::Name => PropertyKind::Name,
            FieldSpec::Str => PropertyKind::Str,
            FieldSpec::Array(_) => PropertyKind::Array,
            FieldSpec::Struct(_) => PropertyKind::Struct,
            FieldSpec::Object(_) => PropertyKind::Object,
            FieldSpec::Interface(_) => PropertyKind::Interface,
            FieldSpec::Class(_) => PropertyKind::Class,
        }
    }

    /// (element size, alignment)
    fn layout(&self) -> (usize, usize) {
        match self {
            FieldSpec::Bool | FieldSpec::Int8 | FieldSpec::UInt8 => (1, 1),
            FieldSpec::Int16 | FieldSpec::UInt16 => (2, 2),
            FieldSpec::Int32 | FieldSpec::UInt32 | FieldSpec::Float32 => (4, 4),
            FieldSpec::Int64 | FieldSpec::UInt64 | FieldSpec::Float64 => (8, 8),
            FieldSpec::Name => (8, 4),
            FieldSpec::Str | FieldSpec::Array(_) | FieldSpec::Interface(_) => (16, 8),
            FieldSpec::Object(_) | FieldSpec::Class(_) => (8, 8),
            FieldSpec::Struct(ty) => (
                get::<i32>(ty.addr() + STRUCT_SIZE_OFFSET).max(0) as usize,
                get::<i32>(ty.addr() + STRUCT_ALIGN_OFFSET).max(1) as usize,
            ),
        }
    }
}

/// One argument expression in a synthetic bytecode stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameArg {
    /// Literal bytes copied into the parameter slot
    Literal(Vec<u8>),
    /// The end-of-parameters marker
    End,
}

impl FrameArg {
    /// 32-bit integer literal
    pub fn int32(value: i32) -> Self {
        FrameArg::Literal(value.to_le_bytes().to_vec())
    }
}

/// A script frame built by [`FakeHost::frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeFrame {
    /// Frame address
    pub addr: usize,
    /// Start of the bytecode
    pub code: usize,
    /// Position just past the encoded arguments
    pub code_end: usize,
}

/// Core type descriptors every synthetic host carries
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTypes {
    pub object: TypeRef,
    pub field: TypeRef,
    pub structure: TypeRef,
    pub class: TypeRef,
    pub script_struct: TypeRef,
    pub function: TypeRef,
    pub package: TypeRef,
    pub interface: TypeRef,
    pub property: TypeRef,
}

// ============================================================================
// Allocators
// ============================================================================

/// Allocator that refuses every request
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingAllocator;

impl HostAllocator for FailingAllocator {
    fn alloc_zeroed(&self, _size: usize, _align: usize) -> usize {
        0
    }

    fn realloc(&self, _ptr: usize, _size: usize, _align: usize) -> usize {
        0
    }

    fn free(&self, _ptr: usize) {}
}

/// Libc-backed allocator that counts live blocks and frees
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: AtomicUsize,
    frees: AtomicUsize,
}

impl CountingAllocator {
    /// Blocks allocated and not yet freed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of frees of non-null blocks
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl HostAllocator for CountingAllocator {
    fn alloc_zeroed(&self, size: usize, align: usize) -> usize {
        let ptr = LibcAllocator.alloc_zeroed(size, align);
        if ptr != 0 {
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    fn realloc(&self, ptr: usize, size: usize, align: usize) -> usize {
        let new = LibcAllocator.realloc(ptr, size, align);
        if ptr == 0 && new != 0 {
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        new
    }

    fn free(&self, ptr: usize) {
        if ptr == 0 {
            return;
        }
        LibcAllocator.free(ptr);
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counting allocator that refuses every allocation after the first `budget`
#[derive(Debug, Default)]
pub struct LimitedAllocator {
    counter: CountingAllocator,
    remaining: AtomicUsize,
}

impl LimitedAllocator {
    /// Allow `budget` successful allocations
    pub fn new(budget: usize) -> Self {
        Self {
            counter: CountingAllocator::default(),
            remaining: AtomicUsize::new(budget),
        }
    }

    /// Blocks allocated through this allocator and not yet freed
    pub fn live(&self) -> usize {
        self.counter.live()
    }

    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl HostAllocator for LimitedAllocator {
    fn alloc_zeroed(&self, size: usize, align: usize) -> usize {
        if !self.take() {
            return 0;
        }
        self.counter.alloc_zeroed(size, align)
    }

    fn realloc(&self, ptr: usize, size: usize, align: usize) -> usize {
        if !self.take() {
            return 0;
        }
        self.counter.realloc(ptr, size, align)
    }

    fn free(&self, ptr: usize) {
        self.counter.free(ptr)
    }
}

// ============================================================================
// Native invocations
// ============================================================================

/// A native body run by one of the fake entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeInvocation {
    /// Receiver
    pub object: usize,
    /// Function descriptor
    pub function: usize,
    /// Function flags at the time of the call
    pub flags: u32,
}

thread_local! {
    static INVOCATIONS: RefCell<Vec<NativeInvocation>> = const { RefCell::new(Vec::new()) };
}

/// Drain the invocations recorded on this thread
pub fn take_invocations() -> Vec<NativeInvocation> {
    INVOCATIONS.with(|log| std::mem::take(&mut *log.borrow_mut()))
}

fn record_invocation(object: usize, function: usize) {
    let flags = get::<u32>(function + FUNCTION_FLAGS);
    INVOCATIONS.with(|log| {
        log.borrow_mut().push(NativeInvocation {
            object,
            function,
            flags,
        })
    });
}

fn run_native(object: usize, function: usize, params: usize) {
    let native = unsafe { memory::read_ptr(function + FUNCTION_NATIVE) };
    if native != 0 {
        let body = unsafe { std::mem::transmute::<usize, fn(usize, usize)>(native) };
        body(object, params);
    }
}

fn at_end_marker(frame: usize) -> bool {
    let code = unsafe { memory::read_ptr(frame + FRAME_CODE) };
    code != 0 && get::<u8>(code) == OP_END_OF_PARAMS
}

fn step_frame(frame: usize, result: usize) {
    let cursor = frame + FRAME_CODE;
    let code = unsafe { memory::read_ptr(cursor) };
    if code == 0 {
        return;
    }
    if get::<u8>(code) == OP_LITERAL {
        let len = get::<u8>(code + 1) as usize;
        if result != 0 {
            unsafe { memory::copy(result, code + 2, len) };
        }
        put(cursor, code + 2 + len);
    } else {
        put(cursor, code + 1);
    }
}

// ============================================================================
// Entry points
// ============================================================================

host_entry! {
    /// Object dispatch: records the call and runs the native body on `params`
    pub fn fake_process_event(object: *mut u8, function: *mut u8, params: *mut u8) {
        let (object, function, params) = (object as usize, function as usize, params as usize);
        if function == 0 {
            return;
        }
        record_invocation(object, function);
        run_native(object, function, params);
    }
}

host_entry! {
    /// Native dispatch: decodes parameters from the frame, runs the body and
    /// copies the return value into `result`
    pub fn fake_call_function(object: *mut u8, frame: *mut u8, result: *mut u8, function: *mut u8) {
        let (object, frame, result, function) =
            (object as usize, frame as usize, result as usize, function as usize);
        if frame == 0 || function == 0 {
            return;
        }

        let size = get::<i32>(function + STRUCT_SIZE_OFFSET).max(0) as usize;
        let mut buffer = vec![0u64; size / 8 + 1];
        let params = buffer.as_mut_ptr() as usize;

        let mut ret = None;
        let mut field = unsafe { memory::read_ptr(function + STRUCT_CHILDREN) };
        while field != 0 {
            let flags = get::<u64>(field + PROP_FLAGS);
            let offset = get::<i32>(field + PROP_OFFSET).max(0) as usize;
            if flags & RETURN_PARAM != 0 {
                ret = Some((offset, get::<i32>(field + PROP_ELEMENT_SIZE).max(0) as usize));
            } else if flags & PARAM != 0 {
                if at_end_marker(frame) {
                    break;
                }
                step_frame(frame, params + offset);
            }
            field = unsafe { memory::read_ptr(field + FIELD_NEXT) };
        }
        if at_end_marker(frame) {
            step_frame(frame, 0);
        }

        record_invocation(object, function);
        run_native(object, function, params);

        if let Some((offset, len)) = ret {
            if result != 0 {
                unsafe { memory::copy(result, params + offset, len) };
            }
        }
    }
}

host_entry! {
    /// Evaluates one argument expression into `result`
    pub fn fake_step(frame: *mut u8, context: *mut u8, result: *mut u8) {
        let _ = context;
        if !frame.is_null() {
            step_frame(frame as usize, result as usize);
        }
    }
}

host_entry! {
    fn vtable_malloc(this: *mut u8, size: usize, align: u32) -> *mut u8 {
        let _ = this;
        LibcAllocator.alloc_zeroed(size, align as usize) as *mut u8
    }
}

host_entry! {
    fn vtable_realloc(this: *mut u8, ptr: *mut u8, size: usize, align: u32) -> *mut u8 {
        let _ = this;
        LibcAllocator.realloc(ptr as usize, size, align as usize) as *mut u8
    }
}

host_entry! {
    fn vtable_free(this: *mut u8, ptr: *mut u8) {
        let _ = this;
        LibcAllocator.free(ptr as usize)
    }
}

// ============================================================================
// FakeHost
// ============================================================================

/// A synthetic object system and the [`Host`] that reflects over it
pub struct FakeHost {
    host: Option<Host>,
    core: Option<CoreTypes>,
    names_base: usize,
    objects_base: usize,
    interned: FxHashMap<String, i32>,
    packages: FxHashMap<String, ObjectRef>,
    property_classes: FxHashMap<PropertyKind, TypeRef>,
    arena: Arena,
}

impl FakeHost {
    /// Empty tables plus the core type descriptors
    pub fn new() -> Self {
        let mut arena = Arena::default();
        let names_base = arena.alloc(0x10);
        let objects_base = arena.alloc(0x18);
        put(names_base, arena.alloc(MAX_CHUNKS * 8));
        put(objects_base, arena.alloc(MAX_CHUNKS * 8));

        let mut fake = Self {
            arena,
            names_base,
            objects_base,
            interned: FxHashMap::default(),
            packages: FxHashMap::default(),
            property_classes: FxHashMap::default(),
            core: None,
            host: None,
        };
        fake.intern("None");
        fake.bootstrap();

        let host = match Host::new(Self::profile(), fake.config()) {
            Ok(host) => host,
            Err(e) => panic!("synthetic host rejected: {}", e),
        };
        fake.host = Some(host);
        fake
    }

    /// The synthetic layout profile
    pub fn profile() -> LayoutProfile {
        match LayoutProfile::from_str(PROFILE) {
            Ok(profile) => profile,
            Err(e) => panic!("synthetic profile: {}", e),
        }
    }

    /// Host configuration with the fake entry points and the libc allocator
    pub fn config(&self) -> HostConfig {
        HostConfig::new(self.names_base, self.objects_base)
            .with_process_event(fake_process_event)
            .with_call_function(fake_call_function)
            .with_frame_step(fake_step)
    }

    /// The host reflecting over this object system
    pub fn host(&self) -> &Host {
        match &self.host {
            Some(host) => host,
            None => unreachable!("host is set by FakeHost::new"),
        }
    }

    /// A second host over the same tables with a different allocator and
    /// fresh caches
    pub fn host_with_allocator(&self, allocator: Arc<dyn HostAllocator>) -> Host {
        match Host::new(Self::profile(), self.config().with_allocator(allocator)) {
            Ok(host) => host,
            Err(e) => panic!("synthetic host rejected: {}", e),
        }
    }

    /// Core type descriptors
    pub fn core(&self) -> CoreTypes {
        match self.core {
            Some(core) => core,
            None => unreachable!("core types are built by FakeHost::new"),
        }
    }

    /// Name table base address
    pub fn names_base(&self) -> usize {
        self.names_base
    }

    /// Object table base address
    pub fn objects_base(&self) -> usize {
        self.objects_base
    }

    // ------------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------------

    /// Intern a narrow name, reusing an existing entry with the same text
    pub fn intern(&mut self, text: &str) -> i32 {
        if let Some(&index) = self.interned.get(text) {
            return index;
        }
        let bytes = text.as_bytes();
        let entry = self.arena.alloc(NAME_TEXT + bytes.len() + 1);
        unsafe { memory::copy(entry + NAME_TEXT, bytes.as_ptr() as usize, bytes.len()) };
        let index = self.push_name(entry);
        self.interned.insert(text.to_string(), index);
        index
    }

    /// Append a wide name entry
    pub fn intern_wide(&mut self, text: &str) -> i32 {
        let units: Vec<u16> = text.encode_utf16().collect();
        let entry = self.arena.alloc(NAME_TEXT + (units.len() + 1) * 2);
        put::<u32>(entry, 1);
        for (i, unit) in units.iter().enumerate() {
            put(entry + NAME_TEXT + i * 2, *unit);
        }
        self.push_name(entry)
    }

    /// Append an empty name slot
    pub fn reserve_name_slot(&mut self) -> i32 {
        self.push_name(0)
    }

    fn push_name(&mut self, entry: usize) -> i32 {
        let slot = self.push_slot(self.names_base, NAMES_COUNT, 8);
        put(slot.1, entry);
        slot.0
    }

    /// Claim the next element of a chunked table: (index, element address)
    fn push_slot(&mut self, base: usize, count_offset: usize, stride: usize) -> (i32, usize) {
        let count = get::<i32>(base + count_offset).max(0) as usize;
        let chunk_index = count / CHUNK_SIZE;
        assert!(chunk_index < MAX_CHUNKS, "synthetic table is full");

        let chunks = unsafe { memory::read_ptr(base) };
        let mut chunk = unsafe { memory::read_ptr(chunks + chunk_index * 8) };
        if chunk == 0 {
            chunk = self.arena.alloc(CHUNK_SIZE * stride);
            put(chunks + chunk_index * 8, chunk);
        }
        put(base + count_offset, (count + 1) as i32);
        (count as i32, chunk + (count % CHUNK_SIZE) * stride)
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    fn new_object(&mut self, size: usize, class: usize, name: i32, number: u32, outer: usize) -> usize {
        let addr = self.arena.alloc(size.max(OBJECT_SIZE));
        let (index, item) = self.push_slot(self.objects_base, OBJECTS_COUNT, OBJECT_ITEM_STRIDE);
        put(item, addr);
        put(addr + OBJECT_INDEX, index);
        put(addr + OBJECT_CLASS, class);
        put(addr + OBJECT_NAME, name);
        put(addr + OBJECT_NAME + 4, number);
        put(addr + OBJECT_OUTER, outer);
        addr
    }

    fn item_addr(&self, obj: ObjectRef) -> usize {
        let index = get::<i32>(obj.addr() + OBJECT_INDEX).max(0) as usize;
        let chunks = unsafe { memory::read_ptr(self.objects_base) };
        let chunk = unsafe { memory::read_ptr(chunks + (index / CHUNK_SIZE) * 8) };
        chunk + (index % CHUNK_SIZE) * OBJECT_ITEM_STRIDE
    }

    /// Spawn an instance of `ty`
    pub fn spawn(&mut self, ty: TypeRef, name: &str, outer: Option<ObjectRef>) -> ObjectRef {
        self.spawn_numbered(ty, name, 0, outer)
    }

    /// Spawn an instance whose name carries a raw number suffix
    pub fn spawn_numbered(
        &mut self,
        ty: TypeRef,
        name: &str,
        number: u32,
        outer: Option<ObjectRef>,
    ) -> ObjectRef {
        let size = get::<i32>(ty.addr() + STRUCT_SIZE_OFFSET).max(0) as usize;
        let name = self.intern(name);
        let addr = self.new_object(size, ty.addr(), name, number, outer.map_or(0, |o| o.addr()));
        object_ref(addr)
    }

    /// Free the object's table slot
    pub fn remove(&mut self, obj: ObjectRef) {
        put(self.item_addr(obj), 0usize);
    }

    /// Mark the object as pending destruction
    pub fn kill(&self, obj: ObjectRef) {
        let flags = self.item_addr(obj) + OBJECT_ITEM_FLAGS;
        put(flags, get::<u32>(flags) | DEAD_FLAG);
    }

    /// Point the object at a different name
    pub fn rename(&mut self, obj: ObjectRef, name: &str) {
        let index = self.intern(name);
        put(obj.addr() + OBJECT_NAME, index);
        put(obj.addr() + OBJECT_NAME + 4, 0u32);
    }

    /// Overwrite the object's class pointer
    pub fn set_class(&self, obj: ObjectRef, ty: TypeRef) {
        put(obj.addr() + OBJECT_CLASS, ty.addr());
    }

    /// Overwrite a type's parent pointer
    pub fn set_parent(&self, ty: TypeRef, parent: Option<TypeRef>) {
        put(ty.addr() + STRUCT_SUPER, parent.map_or(0, |p| p.addr()));
    }

    fn package(&mut self, path: &str) -> ObjectRef {
        if let Some(&package) = self.packages.get(path) {
            return package;
        }
        let class = self.core.map_or(0, |core| core.package.addr());
        let name = self.intern(path);
        let package = object_ref(self.new_object(OBJECT_SIZE, class, name, 0, 0));
        self.packages.insert(path.to_string(), package);
        package
    }

    // ------------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------------

    /// Start a class
    pub fn class(&mut self, name: &str) -> TypeBuilder<'_> {
        let meta = self.core().class;
        TypeBuilder::new(self, name, meta)
    }

    /// Start a script struct
    pub fn script_struct(&mut self, name: &str) -> TypeBuilder<'_> {
        let meta = self.core().script_struct;
        TypeBuilder::new(self, name, meta)
    }

    /// Start a member function of `owner`
    pub fn function(&mut self, owner: TypeRef, name: &str) -> FunctionBuilder<'_> {
        FunctionBuilder {
            fake: self,
            owner,
            name: name.to_string(),
            params: Vec::new(),
            flags: 0,
            native: None,
        }
    }

    /// An interface class
    pub fn interface(&mut self, name: &str) -> TypeRef {
        let parent = self.core().interface;
        self.class(name).parent(parent).finish()
    }

    /// Record that `class` implements `iface` with the given pointer offset
    pub fn implement_interface(&mut self, class: TypeRef, iface: TypeRef, native: bool, offset: usize) {
        let header = class.addr() + CLASS_INTERFACES;
        let old = unsafe { memory::read_ptr(header) };
        let count = get::<i32>(header + 8).max(0) as usize;

        let data = self.arena.alloc((count + 1) * INTERFACE_STRIDE);
        if old != 0 {
            unsafe { memory::copy(data, old, count * INTERFACE_STRIDE) };
        }
        let record = data + count * INTERFACE_STRIDE;
        put(record, iface.addr());
        put(record + 0x8, offset as i32);
        put(record + 0xC, native as i32);

        put(header, data);
        put(header + 8, (count + 1) as i32);
        put(header + 12, (count + 1) as i32);
    }

    fn new_type(&mut self, meta: usize, name: &str, size: usize, outer: usize) -> TypeRef {
        let name = self.intern(name);
        type_ref(self.new_object(size, meta, name, 0, outer))
    }

    fn bootstrap(&mut self) {
        // Object must be the first live object; Class is patched in below
        let object = self.new_type(0, "Object", CLASS_SIZE, 0);
        let field = self.new_type(0, "Field", CLASS_SIZE, 0);
        let structure = self.new_type(0, "Struct", CLASS_SIZE, 0);
        let class = self.new_type(0, "Class", CLASS_SIZE, 0);
        let script_struct = self.new_type(0, "ScriptStruct", CLASS_SIZE, 0);
        let function = self.new_type(0, "Function", CLASS_SIZE, 0);
        let package = self.new_type(0, "Package", CLASS_SIZE, 0);
        let interface = self.new_type(0, "Interface", CLASS_SIZE, 0);
        let property = self.new_type(0, "Property", CLASS_SIZE, 0);

        let core = CoreTypes {
            object,
            field,
            structure,
            class,
            script_struct,
            function,
            package,
            interface,
            property,
        };
        self.core = Some(core);

        let hierarchy = [
            (object, None, OBJECT_SIZE),
            (field, Some(object), FIELD_SIZE),
            (structure, Some(field), STRUCT_SIZE),
            (class, Some(structure), CLASS_SIZE),
            (script_struct, Some(structure), STRUCT_SIZE),
            (function, Some(structure), FUNCTION_SIZE),
            (package, Some(object), OBJECT_SIZE),
            (interface, Some(object), OBJECT_SIZE),
            (property, Some(field), PROPERTY_SIZE),
        ];
        let mut descriptors = Vec::new();
        for (ty, parent, size) in hierarchy {
            self.set_parent(ty, parent);
            put(ty.addr() + STRUCT_SIZE_OFFSET, size as i32);
            put(ty.addr() + STRUCT_ALIGN_OFFSET, 8i32);
            descriptors.push(ty);
        }

        for kind in PropertyKind::ALL {
            if kind == PropertyKind::Function {
                continue;
            }
            let parent = match kind {
                PropertyKind::Class => self.property_classes[&PropertyKind::Object],
                _ => property,
            };
            let ty = self.new_type(0, kind.class_name(), CLASS_SIZE, 0);
            self.set_parent(ty, Some(parent));
            put(ty.addr() + STRUCT_SIZE_OFFSET, PROPERTY_SIZE as i32);
            put(ty.addr() + STRUCT_ALIGN_OFFSET, 8i32);
            self.property_classes.insert(kind, ty);
            descriptors.push(ty);
        }

        let core_package = self.package(CORE_PACKAGE);
        for ty in descriptors {
            self.set_class(ty.object(), class);
            put(ty.addr() + OBJECT_OUTER, core_package.addr());
        }
    }

    /// Lay out `fields` on `owner` starting at `start`: (size, alignment)
    fn lay_out(&mut self, owner: usize, start: usize, align: usize, fields: &[FieldDecl]) -> (usize, usize) {
        let mut cursor = start;
        let mut max_align = align.max(1);
        let mut last_bool: Option<(usize, u8)> = None;

        for decl in fields {
            let (element_size, field_align) = decl.spec.layout();
            let packed = matches!(decl.spec, FieldSpec::Bool) && decl.dim == 1;
            let (offset, mask) = match (packed, last_bool) {
                (true, Some((offset, mask))) if mask < 0x80 => (offset, mask << 1),
                (true, _) => {
                    cursor += 1;
                    (cursor - 1, 1)
                }
                (false, _) => {
                    let offset = align_up(cursor, field_align);
                    cursor = offset + element_size * decl.dim;
                    (offset, 1)
                }
            };
            last_bool = packed.then_some((offset, mask));
            max_align = max_align.max(field_align);

            let prop = self.new_property(owner, &decl.name, &decl.spec, offset, decl.dim, decl.flags, mask);
            append_child(owner, prop);
        }
        (align_up(cursor, max_align), max_align)
    }

    fn new_property(
        &mut self,
        owner: usize,
        name: &str,
        spec: &FieldSpec,
        offset: usize,
        dim: usize,
        flags: u64,
        mask: u8,
    ) -> usize {
        let class = self.property_classes[&spec.kind()].addr();
        let name_index = self.intern(name);
        let prop = self.new_object(PROPERTY_SIZE, class, name_index, 0, owner);
        let (element_size, _) = spec.layout();

        put(prop + PROP_DIM, dim as i32);
        put(prop + PROP_ELEMENT_SIZE, element_size as i32);
        put(prop + PROP_FLAGS, flags);
        put(prop + PROP_OFFSET, offset as i32);

        match spec {
            FieldSpec::Bool => {
                put(prop + PROP_BOOL_BYTE, 0u8);
                put(prop + PROP_BOOL_MASK, mask);
            }
            FieldSpec::Array(inner) => {
                let inner = self.new_property(prop, name, inner, 0, 1, 0, 1);
                put(prop + PROP_REF, inner);
            }
            FieldSpec::Struct(ty) | FieldSpec::Object(ty) | FieldSpec::Interface(ty) => {
                put(prop + PROP_REF, ty.addr());
            }
            FieldSpec::Class(meta) => {
                put(prop + PROP_REF, self.core().class.addr());
                put(prop + PROP_META, meta.addr());
            }
            _ => {}
        }
        prop
    }

    // ------------------------------------------------------------------------
    // Frames and allocators
    // ------------------------------------------------------------------------

    /// Build a script frame executing `function` on `obj` whose bytecode
    /// encodes `args`
    pub fn frame(&mut self, function: TypeRef, obj: ObjectRef, args: &[FrameArg]) -> FakeFrame {
        let mut code = Vec::new();
        for arg in args {
            match arg {
                FrameArg::Literal(bytes) => {
                    code.push(OP_LITERAL);
                    code.push(bytes.len() as u8);
                    code.extend_from_slice(bytes);
                }
                FrameArg::End => code.push(OP_END_OF_PARAMS),
            }
        }
        let encoded = code.len();
        code.extend_from_slice(&[0; 8]);

        let code_addr = self.arena.alloc(code.len());
        unsafe { memory::copy(code_addr, code.as_ptr() as usize, code.len()) };

        let addr = self.arena.alloc(FRAME_SIZE);
        put(addr + FRAME_NODE, function.addr());
        put(addr + FRAME_OBJECT, obj.addr());
        put(addr + FRAME_CODE, code_addr);

        FakeFrame {
            addr,
            code: code_addr,
            code_end: code_addr + encoded,
        }
    }

    /// Current bytecode position of a frame
    pub fn frame_cursor(&self, frame: &FakeFrame) -> usize {
        unsafe { memory::read_ptr(frame.addr + FRAME_CODE) }
    }

    /// An allocator object whose vtable holds malloc, realloc and free in
    /// slots 2, 3 and 4
    pub fn allocator_object(&mut self) -> usize {
        let vtable = self.arena.alloc(5 * 8);
        put(vtable + 2 * 8, vtable_malloc as usize);
        put(vtable + 3 * 8, vtable_realloc as usize);
        put(vtable + 4 * 8, vtable_free as usize);
        let instance = self.arena.alloc(0x10);
        put(instance, vtable);
        instance
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHost")
            .field("names_base", &format_args!("{:#x}", self.names_base))
            .field("objects_base", &format_args!("{:#x}", self.objects_base))
            .finish()
    }
}

fn object_ref(addr: usize) -> ObjectRef {
    match unsafe { ObjectRef::from_raw(addr) } {
        Some(obj) => obj,
        None => unreachable!("arena blocks are never null"),
    }
}

fn type_ref(addr: usize) -> TypeRef {
    TypeRef::from_object_unchecked(object_ref(addr))
}

fn append_child(owner: usize, child: usize) {
    let head = owner + STRUCT_CHILDREN;
    let mut link = head;
    loop {
        let next = unsafe { memory::read_ptr(link) };
        if next == 0 {
            put(link, child);
            return;
        }
        link = next + FIELD_NEXT;
    }
}

// ============================================================================
// Builders
// ============================================================================

struct FieldDecl {
    name: String,
    spec: FieldSpec,
    dim: usize,
    flags: u64,
}

/// Builder for classes and script structs
pub struct TypeBuilder<'a> {
    fake: &'a mut FakeHost,
    name: String,
    meta: TypeRef,
    parent: Option<TypeRef>,
    package: Option<String>,
    fields: Vec<FieldDecl>,
}

impl<'a> TypeBuilder<'a> {
    fn new(fake: &'a mut FakeHost, name: &str, meta: TypeRef) -> Self {
        Self {
            fake,
            name: name.to_string(),
            meta,
            parent: None,
            package: None,
            fields: Vec::new(),
        }
    }

    /// Derive from `parent`; fields start after the parent's
    pub fn parent(mut self, parent: TypeRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Place the type in a package other than [`DEFAULT_PACKAGE`]
    pub fn package(mut self, path: &str) -> Self {
        self.package = Some(path.to_string());
        self
    }

    /// Add a field
    pub fn field(self, name: &str, spec: FieldSpec) -> Self {
        self.static_array(name, spec, 1)
    }

    /// Add a fixed-size inline array field
    pub fn static_array(mut self, name: &str, spec: FieldSpec, dim: usize) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            spec,
            dim: dim.max(1),
            flags: 0,
        });
        self
    }

    /// Create the descriptor and its properties
    pub fn finish(self) -> TypeRef {
        let fake = self.fake;
        let is_class = self.meta == fake.core().class;
        let package = fake.package(self.package.as_deref().unwrap_or(DEFAULT_PACKAGE));
        let size = if is_class { CLASS_SIZE } else { STRUCT_SIZE };
        let ty = fake.new_type(self.meta.addr(), &self.name, size, package.addr());
        fake.set_parent(ty, self.parent);

        let (start, align) = match self.parent {
            Some(parent) => (
                get::<i32>(parent.addr() + STRUCT_SIZE_OFFSET).max(0) as usize,
                get::<i32>(parent.addr() + STRUCT_ALIGN_OFFSET).max(1) as usize,
            ),
            None if is_class => (OBJECT_SIZE, 8),
            None => (0, 1),
        };
        let (size, align) = fake.lay_out(ty.addr(), start, align, &self.fields);
        put(ty.addr() + STRUCT_SIZE_OFFSET, size as i32);
        put(ty.addr() + STRUCT_ALIGN_OFFSET, align as i32);
        ty
    }
}

/// Builder for member functions
pub struct FunctionBuilder<'a> {
    fake: &'a mut FakeHost,
    owner: TypeRef,
    name: String,
    params: Vec<FieldDecl>,
    flags: u32,
    native: Option<fn(usize, usize)>,
}

impl<'a> FunctionBuilder<'a> {
    fn push(mut self, name: &str, spec: FieldSpec, flags: u64) -> Self {
        self.params.push(FieldDecl {
            name: name.to_string(),
            spec,
            dim: 1,
            flags,
        });
        self
    }

    /// Add a required parameter
    pub fn param(self, name: &str, spec: FieldSpec) -> Self {
        self.push(name, spec, PARAM)
    }

    /// Add an optional parameter
    pub fn optional_param(self, name: &str, spec: FieldSpec) -> Self {
        self.push(name, spec, PARAM | OPTIONAL_PARAM)
    }

    /// Add the return value
    pub fn returns(self, spec: FieldSpec) -> Self {
        self.push("ReturnValue", spec, PARAM | OUT_PARAM | RETURN_PARAM)
    }

    /// Initial function flags
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Body run by the fake entry points with `(object, params)`
    pub fn native(mut self, body: fn(usize, usize)) -> Self {
        self.native = Some(body);
        self
    }

    /// Create the function and append it to its owner
    pub fn finish(self) -> TypeRef {
        let fake = self.fake;
        let meta = fake.core().function.addr();
        let function = fake.new_type(meta, &self.name, FUNCTION_SIZE, self.owner.addr());
        let (size, align) = fake.lay_out(function.addr(), 0, 1, &self.params);
        put(function.addr() + STRUCT_SIZE_OFFSET, size as i32);
        put(function.addr() + STRUCT_ALIGN_OFFSET, align as i32);
        put(function.addr() + FUNCTION_FLAGS, self.flags);
        put(function.addr() + FUNCTION_NATIVE, self.native.map_or(0, |body| body as usize));
        append_child(self.owner.addr(), function.addr());
        function
    }
}
