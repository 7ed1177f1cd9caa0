//! Host context
//!
//! A [`Host`] ties together everything the runtime needs to talk to one host
//! process: the selected layout profile, the name and object table views,
//! the allocator, the host's dispatch entry points, the lookup caches and
//! the hook registry. It is cheap to clone; clones share all state.
//!
//! One host may be installed process-wide with [`Host::install`] so that the
//! detour entry points in [`crate::hooks`] can reach it.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bound::BoundMethod;
use crate::error::{ReflectError, ReflectResult};
use crate::hooks::HookRegistry;
use crate::layout::LayoutProfile;
use crate::memory::{CallFunctionFn, FrameStepFn, HostAllocator, LibcAllocator, ProcessEventFn};
use crate::object::{ObjectRef, TypeRef};
use crate::props::{PropertyType, Value};
use crate::tables::{NameTable, ObjectTable};
use crate::types::TypeCache;
use crate::views::StructView;

static ACTIVE: OnceCell<Host> = OnceCell::new();

// ============================================================================
// Configuration
// ============================================================================

/// Resolved addresses and collaborators of one host process
#[derive(Clone)]
pub struct HostConfig {
    /// Base address of the name table
    pub names_base: usize,
    /// Base address of the object table
    pub objects_base: usize,
    /// Allocator for every buffer handed to the host
    pub allocator: Arc<dyn HostAllocator>,
    /// Object dispatch entry point
    pub process_event: Option<ProcessEventFn>,
    /// Native dispatch entry point
    pub call_function: Option<CallFunctionFn>,
    /// Bytecode step entry point
    pub frame_step: Option<FrameStepFn>,
}

impl HostConfig {
    /// Table bases only; the C allocator and no entry points
    pub fn new(names_base: usize, objects_base: usize) -> Self {
        Self {
            names_base,
            objects_base,
            allocator: Arc::new(LibcAllocator),
            process_event: None,
            call_function: None,
            frame_step: None,
        }
    }

    /// Use a different allocator
    pub fn with_allocator(mut self, allocator: Arc<dyn HostAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Set the object dispatch entry point
    pub fn with_process_event(mut self, f: ProcessEventFn) -> Self {
        self.process_event = Some(f);
        self
    }

    /// Set the native dispatch entry point
    pub fn with_call_function(mut self, f: CallFunctionFn) -> Self {
        self.call_function = Some(f);
        self
    }

    /// Set the bytecode step entry point
    pub fn with_frame_step(mut self, f: FrameStepFn) -> Self {
        self.frame_step = Some(f);
        self
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("names_base", &format_args!("{:#x}", self.names_base))
            .field("objects_base", &format_args!("{:#x}", self.objects_base))
            .field("process_event", &self.process_event.is_some())
            .field("call_function", &self.call_function.is_some())
            .field("frame_step", &self.frame_step.is_some())
            .finish()
    }
}

// ============================================================================
// Host
// ============================================================================

struct HostShared {
    profile: LayoutProfile,
    names: NameTable,
    objects: ObjectTable,
    allocator: Arc<dyn HostAllocator>,
    process_event: Option<ProcessEventFn>,
    call_function: Option<CallFunctionFn>,
    frame_step: Option<FrameStepFn>,
    types: TypeCache,
    hooks: HookRegistry,
    protocol_fault: AtomicBool,
}

/// Reflection context over one host process
#[derive(Clone)]
pub struct Host(Arc<HostShared>);

impl Host {
    /// Create a context from a profile and resolved addresses
    ///
    /// The profile must validate and must match the running process
    /// (pointer width and calling convention).
    pub fn new(profile: LayoutProfile, config: HostConfig) -> ReflectResult<Host> {
        profile
            .validate()
            .and_then(|_| profile.check_native())
            .map_err(|e| ReflectError::resolution("layout profile", e.to_string()))?;

        let names = NameTable::new(config.names_base, &profile.names, profile.pointer_width)?;
        let objects =
            ObjectTable::new(config.objects_base, &profile.objects, profile.pointer_width)?;
        log::debug!(
            "host '{}': names at {:#x} ({} slots), objects at {:#x} ({} slots)",
            profile.name,
            config.names_base,
            names.size(),
            config.objects_base,
            objects.size()
        );

        Ok(Host(Arc::new(HostShared {
            profile,
            names,
            objects,
            allocator: config.allocator,
            process_event: config.process_event,
            call_function: config.call_function,
            frame_step: config.frame_step,
            types: TypeCache::default(),
            hooks: HookRegistry::default(),
            protocol_fault: AtomicBool::new(false),
        })))
    }

    /// Layout profile
    pub fn profile(&self) -> &LayoutProfile {
        &self.0.profile
    }

    /// Name table view
    pub fn names(&self) -> &NameTable {
        &self.0.names
    }

    /// Object table view
    pub fn objects(&self) -> &ObjectTable {
        &self.0.objects
    }

    /// Allocator used for buffers handed to the host
    pub fn allocator(&self) -> &dyn HostAllocator {
        self.0.allocator.as_ref()
    }

    pub(crate) fn types(&self) -> &TypeCache {
        &self.0.types
    }

    pub(crate) fn hooks(&self) -> &HookRegistry {
        &self.0.hooks
    }

    /// Original object dispatch entry point
    pub fn process_event(&self) -> Option<ProcessEventFn> {
        self.0.process_event
    }

    /// Original native dispatch entry point
    pub fn call_function(&self) -> Option<CallFunctionFn> {
        self.0.call_function
    }

    /// Bytecode step entry point
    pub fn frame_step(&self) -> Option<FrameStepFn> {
        self.0.frame_step
    }

    /// Whether two handles share the same context
    pub fn same_host(&self, other: &Host) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ========================================================================
    // Process-wide installation
    // ========================================================================

    /// Make this context reachable from the detour entry points
    ///
    /// Only one host can ever be installed; a second call hands the rejected
    /// host back.
    pub fn install(self) -> Result<(), Host> {
        let name = self.profile().name.clone();
        ACTIVE.set(self)?;
        log::info!("host '{}' installed", name);
        Ok(())
    }

    /// The installed host, if any
    pub fn active() -> Option<&'static Host> {
        ACTIVE.get()
    }

    // ========================================================================
    // Protocol faults
    // ========================================================================

    /// Latch a protocol fault and build its error
    pub(crate) fn protocol_fault(&self, message: String) -> ReflectError {
        if !self.0.protocol_fault.swap(true, Ordering::SeqCst) {
            log::error!("host protocol fault: {}", message);
        }
        ReflectError::Protocol(message)
    }

    /// Refuse work while a protocol fault is latched
    pub(crate) fn check_protocol(&self) -> ReflectResult<()> {
        if self.has_protocol_fault() {
            return Err(ReflectError::Protocol(
                "a previous protocol fault has not been cleared".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a protocol fault is latched
    pub fn has_protocol_fault(&self) -> bool {
        self.0.protocol_fault.load(Ordering::SeqCst)
    }

    /// Accept reflective calls again after a protocol fault
    pub fn clear_protocol_fault(&self) {
        if self.0.protocol_fault.swap(false, Ordering::SeqCst) {
            log::info!("host protocol fault cleared");
        }
    }

    // ========================================================================
    // Object access
    // ========================================================================

    /// Borrowed view over an object's own memory
    pub fn object_view(&self, obj: ObjectRef) -> ReflectResult<StructView> {
        let class = self.class_of(obj).ok_or_else(|| {
            ReflectError::resolution("object class", format!("{:?} has no class", obj))
        })?;
        Ok(unsafe { StructView::borrowed(self.clone(), class, obj.addr()) })
    }

    /// Read a field of an object; static arrays read as a list
    pub fn get_field(&self, obj: ObjectRef, name: &str) -> ReflectResult<Value> {
        self.object_view(obj)?.get(name)
    }

    /// Read one element of a static array field
    pub fn get_field_at(&self, obj: ObjectRef, name: &str, index: usize) -> ReflectResult<Value> {
        self.object_view(obj)?.get_at(name, index)
    }

    /// Write a field of an object
    pub fn set_field(&self, obj: ObjectRef, name: &str, value: &Value) -> ReflectResult<()> {
        self.object_view(obj)?.set(name, value)
    }

    /// Write one element of a static array field
    pub fn set_field_at(
        &self,
        obj: ObjectRef,
        name: &str,
        index: usize,
        value: &Value,
    ) -> ReflectResult<()> {
        self.object_view(obj)?.set_at(name, index, value)
    }

    /// Read a field whose declared kind must match `P`
    pub fn get_as<P: PropertyType>(&self, obj: ObjectRef, name: &str) -> ReflectResult<P::Value> {
        self.object_view(obj)?.get_as::<P>(name)
    }

    /// Write a field whose declared kind must match `P`
    pub fn set_as<P: PropertyType>(
        &self,
        obj: ObjectRef,
        name: &str,
        value: P::Value,
    ) -> ReflectResult<()> {
        self.object_view(obj)?.set_as::<P>(name, value)
    }

    /// Bind a member function of an object's class
    pub fn bind(&self, obj: ObjectRef, function: &str) -> ReflectResult<BoundMethod> {
        let class = self.class_of(obj).ok_or_else(|| {
            ReflectError::resolution("object class", format!("{:?} has no class", obj))
        })?;
        let function = self.find_function(class, function)?;
        Ok(BoundMethod::new(self.clone(), obj, function))
    }

    /// First live object with the given fully-qualified path
    pub fn find_object(&self, path: &str) -> ReflectResult<ObjectRef> {
        let leaf = path.rsplit(['.', ':']).next().unwrap_or(path);
        self.objects()
            .iter()
            .filter_map(|record| record.object)
            .filter(|&obj| self.name_is(obj, leaf))
            .find(|&obj| self.path_name(obj).map(|p| p == path).unwrap_or(false))
            .ok_or_else(|| ReflectError::NotFound {
                what: "object",
                name: path.to_string(),
            })
    }

    /// Live objects whose class is `class` or derives from it
    pub fn instances_of(&self, class: TypeRef) -> Vec<ObjectRef> {
        self.objects()
            .iter()
            .filter_map(|record| record.object)
            .filter(|&obj| self.is_a(obj, class))
            .collect()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("profile", &self.profile().name)
            .field("names", &self.names().size())
            .field("objects", &self.objects().size())
            .field("hooks", &self.0.hooks)
            .field("protocol_fault", &self.has_protocol_fault())
            .finish()
    }
}
