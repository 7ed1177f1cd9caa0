//! Call-site hooks
//!
//! The host funnels calls through two dispatch points: object dispatch
//! (`ProcessEvent`, a parameter buffer) and native dispatch (`CallFunction`,
//! parameters still encoded in the caller's bytecode frame). A detour placed
//! on either routes to [`Host::dispatch_process_event`] or
//! [`Host::dispatch_call_function`], which:
//!
//! 1. package object, function, arguments and cursor state into [`HookDetails`],
//! 2. run pre-hooks in registration order until one returns [`HookAction::Block`],
//! 3. run the host's own body unless blocked, otherwise store the hook's return value,
//! 4. run post-hooks with the return value.
//!
//! Hooks are keyed by function path, e.g. `/Script/Engine.Actor:Tick`.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::bound::{marshal_frame_params, return_property};
use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory::{self, host_entry};
use crate::object::{ObjectRef, TypeRef};
use crate::props::{get_property, set_property, Value};
use crate::types::{Property, PropertyKind};
use crate::views::{Owner, StructView};

/// When a hook runs relative to the host's own body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    /// Before the body; may block it
    Pre,
    /// After the body (or after a blocking pre-hook)
    Post,
}

/// Decision of a pre-hook
#[derive(Debug, Clone)]
pub enum HookAction {
    /// Let the remaining hooks and the host body run
    Continue,
    /// Skip the host body; the value, if any, becomes the return value
    Block(Option<Value>),
}

/// Dispatch point a call arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSource {
    /// Object dispatch with a parameter buffer
    ProcessEvent,
    /// Native dispatch from a bytecode frame
    CallFunction,
}

/// Everything a hook sees about one intercepted call
#[derive(Debug)]
pub struct HookDetails {
    /// Dispatch point
    pub source: HookSource,
    /// Receiver
    pub object: ObjectRef,
    /// Function being called
    pub function: TypeRef,
    /// Parameter buffer
    ///
    /// For object dispatch this is the host's own buffer, so pre-hook edits
    /// reach the host body. For native dispatch it is a decoded copy; the
    /// host body re-reads its arguments from the frame.
    pub args: StructView,
    /// Interpreter frame, for native dispatch
    pub frame: Option<usize>,
    /// Return value; filled in before post-hooks run
    pub return_value: Option<Value>,
    /// Whether a pre-hook blocked the host body
    pub blocked: bool,
}

/// Hook callback
pub type HookFn = Arc<dyn Fn(&mut HookDetails) -> HookAction + Send + Sync>;

struct HookEntry {
    id: String,
    ty: HookType,
    callback: HookFn,
}

/// Hooks per function descriptor address
#[derive(Default)]
pub(crate) struct HookRegistry {
    by_function: RwLock<FxHashMap<usize, Vec<HookEntry>>>,
}

impl HookRegistry {
    fn insert(&self, function: TypeRef, ty: HookType, id: &str, callback: HookFn) -> bool {
        let mut map = self.by_function.write();
        let entries = map.entry(function.addr()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.ty == ty && e.id == id) {
            entry.callback = callback;
            return true;
        }
        entries.push(HookEntry {
            id: id.to_string(),
            ty,
            callback,
        });
        false
    }

    fn remove(&self, function: TypeRef, ty: HookType, id: &str) -> bool {
        let mut map = self.by_function.write();
        let Some(entries) = map.get_mut(&function.addr()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !(e.ty == ty && e.id == id));
        let removed = entries.len() != before;
        if entries.is_empty() {
            map.remove(&function.addr());
        }
        removed
    }

    fn contains(&self, function: TypeRef, ty: HookType, id: &str) -> bool {
        self.by_function
            .read()
            .get(&function.addr())
            .map(|entries| entries.iter().any(|e| e.ty == ty && e.id == id))
            .unwrap_or(false)
    }

    fn is_hooked(&self, function: TypeRef) -> bool {
        self.by_function.read().contains_key(&function.addr())
    }

    /// Callbacks of one type, cloned so none run under the lock
    fn callbacks(&self, function: TypeRef, ty: HookType) -> Vec<HookFn> {
        self.by_function
            .read()
            .get(&function.addr())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.ty == ty)
                    .map(|e| e.callback.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.by_function.read();
        f.debug_struct("HookRegistry")
            .field("functions", &map.len())
            .field("hooks", &map.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

// ============================================================================
// Registration
// ============================================================================

impl Host {
    fn hooked_function(&self, path: &str) -> ReflectResult<TypeRef> {
        let ty = self.find_type_by_path(path)?;
        if self.field_kind(ty.object()) != Some(PropertyKind::Function) {
            return Err(ReflectError::mismatch(
                self.profile().type_names.function.clone(),
                self.class_label(ty.object()),
            ));
        }
        Ok(ty)
    }

    /// Register a hook on the function at `path`
    ///
    /// A hook with the same type and id on the same function is replaced.
    pub fn add_hook<F>(&self, path: &str, ty: HookType, id: &str, callback: F) -> ReflectResult<()>
    where
        F: Fn(&mut HookDetails) -> HookAction + Send + Sync + 'static,
    {
        let function = self.hooked_function(path)?;
        let replaced = self.hooks().insert(function, ty, id, Arc::new(callback));
        log::debug!(
            "{} {:?} hook '{}' on {}",
            if replaced { "replaced" } else { "added" },
            ty,
            id,
            path
        );
        Ok(())
    }

    /// Remove a hook; returns whether one was registered
    pub fn remove_hook(&self, path: &str, ty: HookType, id: &str) -> ReflectResult<bool> {
        let function = self.hooked_function(path)?;
        Ok(self.hooks().remove(function, ty, id))
    }

    /// Whether a hook with this type and id is registered on `path`
    pub fn has_hook(&self, path: &str, ty: HookType, id: &str) -> bool {
        self.hooked_function(path)
            .map(|function| self.hooks().contains(function, ty, id))
            .unwrap_or(false)
    }

    /// Run pre-hooks; `Some` carries the blocking hook's return value
    fn run_pre_hooks(&self, details: &mut HookDetails) -> Option<Option<Value>> {
        for callback in self.hooks().callbacks(details.function, HookType::Pre) {
            if let HookAction::Block(value) = callback(details) {
                details.blocked = true;
                return Some(value);
            }
        }
        None
    }

    fn run_post_hooks(&self, details: &mut HookDetails) {
        for callback in self.hooks().callbacks(details.function, HookType::Post) {
            // Post-hooks cannot block; their action is ignored
            let _ = callback(details);
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Intercepted object dispatch
    ///
    /// Without hooks on `function` this is a plain call of the original
    /// entry point.
    ///
    /// # Safety
    /// Arguments must be what the host passed to its object dispatch, and
    /// the configured original entry point must be callable.
    pub unsafe fn dispatch_process_event(
        &self,
        object: ObjectRef,
        function: TypeRef,
        params: usize,
    ) -> ReflectResult<()> {
        let original = self
            .process_event()
            .ok_or_else(|| ReflectError::resolution("object dispatch", "entry point not configured"))?;
        let run = |buffer: usize| {
            original(
                object.addr() as *mut u8,
                function.addr() as *mut u8,
                buffer as *mut u8,
            )
        };
        if !self.hooks().is_hooked(function) {
            run(params);
            return Ok(());
        }

        let args = if params == 0 {
            match StructView::new(self.clone(), function) {
                Ok(view) => view,
                Err(e) => {
                    run(params);
                    return Err(e);
                }
            }
        } else {
            StructView::borrowed(self.clone(), function, params)
        };
        let ret = match return_property(self, function) {
            Ok(ret) => ret,
            Err(e) => {
                run(params);
                return Err(e);
            }
        };

        log::debug!("object dispatch of hooked {}", self.type_label(Some(function)));
        let mut details = HookDetails {
            source: HookSource::ProcessEvent,
            object,
            function,
            args,
            frame: None,
            return_value: None,
            blocked: false,
        };

        let mut result = Ok(());
        match self.run_pre_hooks(&mut details) {
            Some(value) => {
                if let (Some(value), Some(prop)) = (value, &ret) {
                    let args = &details.args;
                    result = set_property(self, prop, args.base(), args.owner(), None, &value);
                }
            }
            None => run(details.args.base()),
        }

        details.return_value = match &ret {
            Some(prop) => {
                let args = &details.args;
                get_property(self, prop, args.base(), args.owner(), None).ok()
            }
            None => None,
        };
        self.run_post_hooks(&mut details);
        result
    }

    /// Intercepted native dispatch
    ///
    /// Arguments are decoded by stepping the frame. When no pre-hook blocks,
    /// the cursor is rewound and the original entry point decodes them again.
    /// When one blocks, the cursor stays past the parameters, as if the host
    /// body had consumed them, and its value is written to `result`.
    ///
    /// # Safety
    /// Arguments must be what the host passed to its native dispatch, and
    /// the configured original entry point must be callable.
    pub unsafe fn dispatch_call_function(
        &self,
        object: ObjectRef,
        frame: usize,
        result: usize,
        function: TypeRef,
    ) -> ReflectResult<()> {
        let original = self
            .call_function()
            .ok_or_else(|| ReflectError::resolution("native dispatch", "entry point not configured"))?;
        let run = || {
            original(
                object.addr() as *mut u8,
                frame as *mut u8,
                result as *mut u8,
                function.addr() as *mut u8,
            )
        };
        if !self.hooks().is_hooked(function) {
            run();
            return Ok(());
        }

        let cursor_addr = frame + self.profile().frame.code;
        let saved_cursor = memory::read_ptr(cursor_addr);
        let rewind_and_run = || {
            memory::write::<usize>(cursor_addr, saved_cursor);
            run();
        };

        let prepared = StructView::new(self.clone(), function).and_then(|args| {
            marshal_frame_params(self, function, frame, &args)?;
            Ok((args, return_property(self, function)?))
        });
        let (args, ret) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                rewind_and_run();
                return Err(e);
            }
        };

        log::debug!("native dispatch of hooked {}", self.type_label(Some(function)));
        let mut details = HookDetails {
            source: HookSource::CallFunction,
            object,
            function,
            args,
            frame: Some(frame),
            return_value: None,
            blocked: false,
        };

        let mut outcome = Ok(());
        match self.run_pre_hooks(&mut details) {
            Some(value) => {
                if let (Some(value), Some(prop)) = (&value, &ret) {
                    if result != 0 {
                        outcome = set_property(
                            self,
                            &at_origin(prop),
                            result,
                            &Owner::host_backed(),
                            None,
                            value,
                        );
                    }
                }
                details.return_value = value;
            }
            None => {
                rewind_and_run();
                details.return_value = match &ret {
                    Some(prop) if result != 0 => {
                        get_property(self, &at_origin(prop), result, &Owner::host_backed(), None)
                            .ok()
                    }
                    _ => None,
                };
            }
        }

        self.run_post_hooks(&mut details);
        outcome
    }
}

/// The same property relocated to offset 0, for a bare return slot
fn at_origin(prop: &Property) -> Property {
    Property {
        offset: 0,
        ..prop.clone()
    }
}

// ============================================================================
// Detour entry points
// ============================================================================

host_entry! {
    /// Replacement for the host's object dispatch
    ///
    /// Routes to the installed [`Host`]. A panicking hook is contained and
    /// logged.
    pub fn process_event_detour(object: *mut u8, function: *mut u8, params: *mut u8) {
        route_process_event(object as usize, function as usize, params as usize)
    }
}

host_entry! {
    /// Replacement for the host's native dispatch
    ///
    /// Routes to the installed [`Host`]. A panicking hook is contained and
    /// logged.
    pub fn call_function_detour(object: *mut u8, frame: *mut u8, result: *mut u8, function: *mut u8) {
        route_call_function(object as usize, frame as usize, result as usize, function as usize)
    }
}

fn route_process_event(object: usize, function: usize, params: usize) {
    let Some(host) = Host::active() else {
        log::error!("object dispatch intercepted with no installed host");
        return;
    };
    let (Some(object), Some(function)) = (ObjectRef::from_host(object), ObjectRef::from_host(function))
    else {
        if let Some(original) = host.process_event() {
            unsafe { original(object as *mut u8, function as *mut u8, params as *mut u8) };
        }
        return;
    };
    let function = TypeRef::from_object_unchecked(function);

    match catch_unwind(AssertUnwindSafe(|| unsafe {
        host.dispatch_process_event(object, function, params)
    })) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("object dispatch hook failed: {}", e),
        Err(_) => log::error!("hook panicked during object dispatch"),
    }
}

fn route_call_function(object: usize, frame: usize, result: usize, function: usize) {
    let Some(host) = Host::active() else {
        log::error!("native dispatch intercepted with no installed host");
        return;
    };
    let (Some(object), Some(function)) = (ObjectRef::from_host(object), ObjectRef::from_host(function))
    else {
        if let Some(original) = host.call_function() {
            unsafe {
                original(
                    object as *mut u8,
                    frame as *mut u8,
                    result as *mut u8,
                    function as *mut u8,
                )
            };
        }
        return;
    };
    let function = TypeRef::from_object_unchecked(function);

    match catch_unwind(AssertUnwindSafe(|| unsafe {
        host.dispatch_call_function(object, frame, result, function)
    })) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("native dispatch hook failed: {}", e),
        Err(_) => log::error!("hook panicked during native dispatch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeHost, FieldSpec, FrameArg};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn add_native(_object: usize, params: usize) {
        unsafe {
            let a = memory::read::<i32>(params);
            let b = memory::read::<i32>(params + 4);
            memory::write::<i32>(params + 8, a + b);
        }
    }

    fn add_fixture() -> (FakeHost, ObjectRef, TypeRef) {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let add = fake
            .function(actor, "Add")
            .param("A", FieldSpec::Int32)
            .param("B", FieldSpec::Int32)
            .returns(FieldSpec::Int32)
            .native(add_native)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        (fake, obj, add)
    }

    const ADD: &str = "/Script/Test.Actor:Add";

    fn params(host: &Host, add: TypeRef, a: i64, b: i64) -> StructView {
        let view = StructView::new(host.clone(), add).unwrap();
        view.set("A", &Value::Int(a)).unwrap();
        view.set("B", &Value::Int(b)).unwrap();
        view
    }

    #[test]
    fn test_registration() {
        let (fake, _, _) = add_fixture();
        let host = fake.host();

        host.add_hook(ADD, HookType::Pre, "log", |_| HookAction::Continue).unwrap();
        assert!(host.has_hook(ADD, HookType::Pre, "log"));
        assert!(!host.has_hook(ADD, HookType::Post, "log"));
        assert!(host.remove_hook(ADD, HookType::Pre, "log").unwrap());
        assert!(!host.remove_hook(ADD, HookType::Pre, "log").unwrap());
        assert!(!host.has_hook(ADD, HookType::Pre, "log"));

        assert!(matches!(
            host.add_hook("/Script/Test.Actor:Nope", HookType::Pre, "x", |_| HookAction::Continue),
            Err(ReflectError::NotFound { .. })
        ));
        assert!(matches!(
            host.add_hook("/Script/Test.Actor", HookType::Pre, "x", |_| HookAction::Continue),
            Err(ReflectError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unhooked_dispatch_calls_original() {
        let (fake, obj, add) = add_fixture();
        let host = fake.host();
        let args = params(host, add, 1, 2);
        testing::take_invocations();

        unsafe { host.dispatch_process_event(obj, add, args.base()).unwrap() };
        assert_eq!(args.get("ReturnValue").unwrap().as_i64(), Some(3));
        assert_eq!(testing::take_invocations().len(), 1);
    }

    #[test]
    fn test_pre_hook_blocks_and_supplies_return() {
        let (fake, obj, add) = add_fixture();
        let host = fake.host();
        let observed = Arc::new(AtomicI64::new(0));
        let seen = observed.clone();

        host.add_hook(ADD, HookType::Pre, "override", |details| {
            assert_eq!(details.args.get("A").unwrap().as_i64(), Some(1));
            HookAction::Block(Some(Value::Int(99)))
        })
        .unwrap();
        host.add_hook(ADD, HookType::Pre, "never", |_| panic!("runs after a block"))
            .unwrap();
        host.add_hook(ADD, HookType::Post, "observe", move |details| {
            assert!(details.blocked);
            seen.store(details.return_value.as_ref().and_then(Value::as_i64).unwrap_or(-1), Ordering::SeqCst);
            HookAction::Continue
        })
        .unwrap();

        let args = params(host, add, 1, 2);
        testing::take_invocations();
        unsafe { host.dispatch_process_event(obj, add, args.base()).unwrap() };

        assert_eq!(args.get("ReturnValue").unwrap().as_i64(), Some(99));
        assert!(testing::take_invocations().is_empty());
        assert_eq!(observed.load(Ordering::SeqCst), 99);
    }

    #[test]
    fn test_pre_hook_edits_reach_host_body() {
        let (fake, obj, add) = add_fixture();
        let host = fake.host();
        host.add_hook(ADD, HookType::Pre, "double", |details| {
            details.args.set("B", &Value::Int(20)).unwrap();
            HookAction::Continue
        })
        .unwrap();

        let args = params(host, add, 1, 2);
        unsafe { host.dispatch_process_event(obj, add, args.base()).unwrap() };
        assert_eq!(args.get("ReturnValue").unwrap().as_i64(), Some(21));
    }

    #[test]
    fn test_native_dispatch_blocked_consumes_params() {
        let (mut fake, obj, add) = add_fixture();
        let frame = fake.frame(add, obj, &[FrameArg::int32(4), FrameArg::int32(5), FrameArg::End]);
        let host = fake.host();
        host.add_hook(ADD, HookType::Pre, "sum", |details| {
            let a = details.args.get("A").unwrap().as_i64().unwrap_or(0);
            let b = details.args.get("B").unwrap().as_i64().unwrap_or(0);
            HookAction::Block(Some(Value::Int(a * b)))
        })
        .unwrap();

        let mut result = 0i32;
        testing::take_invocations();
        unsafe {
            host.dispatch_call_function(obj, frame.addr, &mut result as *mut i32 as usize, add)
                .unwrap()
        };
        assert_eq!(result, 20);
        assert_eq!(fake.frame_cursor(&frame), frame.code_end);
        assert!(testing::take_invocations().is_empty());
    }

    #[test]
    fn test_native_dispatch_unblocked_rewinds_for_original() {
        let (mut fake, obj, add) = add_fixture();
        let frame = fake.frame(add, obj, &[FrameArg::int32(4), FrameArg::int32(5), FrameArg::End]);
        let host = fake.host();
        let observed = Arc::new(AtomicI64::new(0));
        let seen = observed.clone();
        host.add_hook(ADD, HookType::Post, "observe", move |details| {
            assert!(!details.blocked);
            assert_eq!(details.frame, Some(frame.addr));
            seen.store(details.return_value.as_ref().and_then(Value::as_i64).unwrap_or(-1), Ordering::SeqCst);
            HookAction::Continue
        })
        .unwrap();

        let mut result = 0i32;
        testing::take_invocations();
        unsafe {
            host.dispatch_call_function(obj, frame.addr, &mut result as *mut i32 as usize, add)
                .unwrap()
        };
        assert_eq!(result, 9);
        assert_eq!(observed.load(Ordering::SeqCst), 9);
        assert_eq!(testing::take_invocations().len(), 1);
        assert_eq!(fake.frame_cursor(&frame), frame.code_end);
    }

    #[test]
    fn test_native_dispatch_protocol_fault_still_runs_original() {
        let (mut fake, obj, add) = add_fixture();
        let frame = fake.frame(add, obj, &[FrameArg::int32(4), FrameArg::int32(5)]);
        let host = fake.host();
        host.add_hook(ADD, HookType::Pre, "noop", |_| HookAction::Continue).unwrap();

        let mut result = 0i32;
        testing::take_invocations();
        let err = unsafe {
            host.dispatch_call_function(obj, frame.addr, &mut result as *mut i32 as usize, add)
        }
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(testing::take_invocations().len(), 1);
        host.clear_protocol_fault();
    }
}
