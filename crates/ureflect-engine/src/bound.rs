//! Bound method bridge
//!
//! A [`BoundMethod`] invokes a host member function through the host's own
//! object-dispatch entry point. Each call goes through the same steps:
//!
//! 1. mark the function native (saving its flag word),
//! 2. dispatch with an owning parameter buffer of the function's own type,
//! 3. restore the flag word on every path, including unwinding,
//! 4. read the return field out of the buffer.
//!
//! Two threads calling the same function at once race on the host's flag
//! word. That race is the host's and is not guarded here.

use std::fmt;

use crate::error::{ReflectError, ReflectResult};
use crate::host::Host;
use crate::memory;
use crate::object::{ObjectRef, TypeRef};
use crate::props::{self, Value};
use crate::types::{Property, PropertyKind};
use crate::views::StructView;

// ============================================================================
// Parameters
// ============================================================================

/// Parameter fields of a function in declaration order, return field excluded
pub(crate) fn parameters(host: &Host, function: TypeRef) -> ReflectResult<Vec<Property>> {
    let flags = &host.profile().flags;
    let size = host.properties_size(function);
    let mut params = Vec::new();
    for field in host.own_fields(function) {
        if host.field_kind(field) == Some(PropertyKind::Function) {
            continue;
        }
        let prop = host.decode_property(field, Some(size))?;
        if prop.has_flags(flags.param) && !prop.has_flags(flags.return_param) {
            params.push(prop);
        }
    }
    Ok(params)
}

/// The return field of a function, if it declares one
pub(crate) fn return_property(host: &Host, function: TypeRef) -> ReflectResult<Option<Property>> {
    let flags = &host.profile().flags;
    let size = host.properties_size(function);
    for field in host.own_fields(function) {
        if host.field_kind(field) == Some(PropertyKind::Function) {
            continue;
        }
        let prop = host.decode_property(field, Some(size))?;
        if prop.has_flags(flags.return_param) {
            return Ok(Some(prop));
        }
    }
    Ok(None)
}

fn is_optional(host: &Host, prop: &Property) -> bool {
    let flags = &host.profile().flags;
    prop.has_flags(flags.optional_param) || prop.has_flags(flags.out_param)
}

// ============================================================================
// Native flag guard
// ============================================================================

/// Sets the native bit of a function until dropped
///
/// The saved flag word is written back unconditionally, so the function's
/// flags after the guard are exactly the flags before it.
pub struct NativeFlagGuard<'a> {
    host: &'a Host,
    function: TypeRef,
    saved: u32,
}

impl<'a> NativeFlagGuard<'a> {
    /// Save the flag word of `function` and set its native bit
    pub fn mark(host: &'a Host, function: TypeRef) -> Self {
        let saved = host.function_flags(function.object());
        write_function_flags(host, function, saved | host.profile().flags.function_native);
        Self {
            host,
            function,
            saved,
        }
    }

    /// Flag word that will be restored
    pub fn saved(&self) -> u32 {
        self.saved
    }
}

impl Drop for NativeFlagGuard<'_> {
    fn drop(&mut self) {
        write_function_flags(self.host, self.function, self.saved);
    }
}

fn write_function_flags(host: &Host, function: TypeRef, flags: u32) {
    let off = host.profile().function.function_flags;
    unsafe { memory::write::<u32>(function.addr() + off, flags) }
}

// ============================================================================
// Bound methods
// ============================================================================

/// Result of a call made with an explicit parameter buffer
#[derive(Debug)]
pub struct CallOutput {
    params: StructView,
    return_value: Option<Value>,
}

impl CallOutput {
    /// Parameter buffer after the call, including out parameters
    pub fn params(&self) -> &StructView {
        &self.params
    }

    /// Value of the return field, if the function declares one
    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    /// Take the return value
    pub fn into_return_value(self) -> Option<Value> {
        self.return_value
    }

    /// Read a parameter after the call
    pub fn get(&self, name: &str) -> ReflectResult<Value> {
        self.params.get(name)
    }
}

/// One host member function bound to one object
#[derive(Clone)]
pub struct BoundMethod {
    host: Host,
    object: ObjectRef,
    function: TypeRef,
}

impl BoundMethod {
    /// Bind `function` to `object`
    pub fn new(host: Host, object: ObjectRef, function: TypeRef) -> Self {
        Self {
            host,
            object,
            function,
        }
    }

    /// Receiver object
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    /// Function descriptor
    pub fn function(&self) -> TypeRef {
        self.function
    }

    /// Declared parameters, return field excluded
    pub fn parameters(&self) -> ReflectResult<Vec<Property>> {
        parameters(&self.host, self.function)
    }

    /// Fresh zeroed parameter buffer for this function
    pub fn new_params(&self) -> ReflectResult<StructView> {
        StructView::new(self.host.clone(), self.function)
    }

    /// Call with positional arguments
    ///
    /// Arguments fill parameters in declaration order. Trailing optional and
    /// out parameters may be omitted and stay zeroed.
    pub fn call(&self, args: &[Value]) -> ReflectResult<Option<Value>> {
        let params = self.new_params()?;
        let declared = self.parameters()?;
        if args.len() > declared.len() {
            return Err(ReflectError::Argument(format!(
                "{} takes {} arguments, got {}",
                self.host.type_label(Some(self.function)),
                declared.len(),
                args.len()
            )));
        }

        for (index, prop) in declared.iter().enumerate() {
            match args.get(index) {
                Some(value) => props::set_property(
                    &self.host,
                    prop,
                    params.base(),
                    params.owner(),
                    None,
                    value,
                )?,
                None if is_optional(&self.host, prop) => {}
                None => {
                    return Err(ReflectError::Argument(format!(
                        "missing required argument '{}'",
                        prop.name
                    )))
                }
            }
        }

        Ok(self.call_with(params)?.into_return_value())
    }

    /// Call with a prepared parameter buffer of the function's own type
    pub fn call_with(&self, params: StructView) -> ReflectResult<CallOutput> {
        self.host.check_protocol()?;
        if params.ty() != self.function {
            return Err(ReflectError::mismatch(
                self.host.type_label(Some(self.function)),
                self.host.type_label(Some(params.ty())),
            ));
        }
        let process_event = self
            .host
            .process_event()
            .ok_or_else(|| ReflectError::resolution("object dispatch", "entry point not configured"))?;

        log::debug!(
            "calling {} on {:?}",
            self.host.type_label(Some(self.function)),
            self.object
        );
        {
            let _guard = NativeFlagGuard::mark(&self.host, self.function);
            unsafe {
                process_event(
                    self.object.addr() as *mut u8,
                    self.function.addr() as *mut u8,
                    params.base() as *mut u8,
                )
            };
        }

        let return_value = match return_property(&self.host, self.function)? {
            Some(prop) => Some(props::get_property(
                &self.host,
                &prop,
                params.base(),
                params.owner(),
                None,
            )?),
            None => None,
        };
        Ok(CallOutput {
            params,
            return_value,
        })
    }
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("object", &self.object)
            .field("function", &self.host.type_label(Some(self.function)))
            .finish()
    }
}

// ============================================================================
// Frame marshalling
// ============================================================================

/// Fill `params` by stepping the host's bytecode cursor once per parameter
///
/// Non-parameter fields and the return field are skipped. Trailing optional
/// parameters may be omitted by the caller's bytecode; the cursor must then
/// sit on the end-of-parameters marker, which is consumed. Anything else
/// means the layout profile no longer matches the host and is a protocol
/// fault.
pub fn marshal_frame_params(
    host: &Host,
    function: TypeRef,
    frame: usize,
    params: &StructView,
) -> ReflectResult<()> {
    host.check_protocol()?;
    let step = host
        .frame_step()
        .ok_or_else(|| ReflectError::resolution("frame step", "entry point not configured"))?;
    let layout = &host.profile().frame;
    let cursor_addr = frame + layout.code;
    let context = unsafe { memory::read_ptr(frame + layout.object) };
    let at_marker = || {
        let code = unsafe { memory::read_ptr(cursor_addr) };
        code != 0 && unsafe { memory::read::<u8>(code) } == layout.end_of_params
    };

    for prop in parameters(host, function)? {
        if at_marker() {
            if is_optional(host, &prop) {
                continue;
            }
            return Err(host.protocol_fault(format!(
                "required parameter '{}' of {} missing before end of parameters",
                prop.name,
                host.type_label(Some(function))
            )));
        }
        unsafe {
            step(
                frame as *mut u8,
                context as *mut u8,
                (params.base() + prop.offset) as *mut u8,
            )
        };
    }

    if !at_marker() {
        return Err(host.protocol_fault(format!(
            "end-of-parameters marker not found after parameters of {}",
            host.type_label(Some(function))
        )));
    }
    unsafe {
        let code = memory::read_ptr(cursor_addr);
        memory::write::<usize>(cursor_addr, code + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeHost, FieldSpec, FrameArg};

    fn add_native(_object: usize, params: usize) {
        unsafe {
            let a = memory::read::<i32>(params);
            let b = memory::read::<i32>(params + 4);
            memory::write::<i32>(params + 8, a + b);
        }
    }

    #[test]
    fn test_call_restores_flags_and_returns() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let add = fake
            .function(actor, "Add")
            .param("A", FieldSpec::Int32)
            .param("B", FieldSpec::Int32)
            .returns(FieldSpec::Int32)
            .flags(0x20)
            .native(add_native)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let method = host.bind(obj, "Add").unwrap();
        let before = host.function_flags(add.object());
        let result = method.call(&[Value::Int(2), Value::Int(40)]).unwrap();
        assert_eq!(result.and_then(|v| v.as_i64()), Some(42));
        assert_eq!(host.function_flags(add.object()), before);

        let seen = testing::take_invocations();
        let native = host.profile().flags.function_native;
        assert!(seen
            .iter()
            .any(|call| call.function == add.addr() && call.flags & native != 0));
    }

    #[test]
    fn test_argument_errors_leave_flags() {
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
        let host = fake.host();
        let method = host.bind(obj, "Add").unwrap();
        let before = host.function_flags(add.object());

        assert!(matches!(method.call(&[Value::Int(1)]), Err(ReflectError::Argument(_))));
        assert!(matches!(
            method.call(&[Value::Int(1), Value::Int(2), Value::Int(3)]),
            Err(ReflectError::Argument(_))
        ));
        assert!(matches!(
            method.call(&[Value::Int(1), Value::from("two")]),
            Err(ReflectError::TypeMismatch { .. })
        ));
        assert_eq!(host.function_flags(add.object()), before);
    }

    #[test]
    fn test_guard_restores_on_unwind() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let tick = fake.function(actor, "Tick").flags(0x1).finish();
        let host = fake.host().clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let guard = NativeFlagGuard::mark(&host, tick);
            assert_eq!(guard.saved(), 0x1);
            panic!("dispatch failed");
        }));
        assert!(result.is_err());
        assert_eq!(fake.host().function_flags(tick.object()), 0x1);
    }

    #[test]
    fn test_call_with_rejects_foreign_buffer() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        fake.function(actor, "Tick").finish();
        let other = fake.function(actor, "Jump").finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let method = host.bind(obj, "Tick").unwrap();
        let params = StructView::new(host.clone(), other).unwrap();
        assert!(matches!(
            method.call_with(params),
            Err(ReflectError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_struct_return_outlives_output() {
        let mut fake = FakeHost::new();
        let tag = fake.script_struct("Tag").field("Text", FieldSpec::Str).finish();
        let actor = fake.class("Actor").finish();
        fake.function(actor, "MakeTag")
            .returns(FieldSpec::Struct(tag))
            .native(|_, _| {})
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let host = fake.host();

        let value = host.bind(obj, "MakeTag").unwrap().call(&[]).unwrap().unwrap();
        let view = value.as_struct().unwrap();
        assert!(view.owner().is_owning());
        view.set("Text", &Value::from("kept alive")).unwrap();
        assert_eq!(view.get("Text").unwrap().as_str(), Some("kept alive"));
    }

    #[test]
    fn test_marshal_steps_each_parameter() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let add = fake
            .function(actor, "Add")
            .param("A", FieldSpec::Int32)
            .param("B", FieldSpec::Int32)
            .returns(FieldSpec::Int32)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let frame = fake.frame(
            add,
            obj,
            &[FrameArg::int32(7), FrameArg::int32(5), FrameArg::End],
        );
        let host = fake.host();

        let params = StructView::new(host.clone(), add).unwrap();
        marshal_frame_params(host, add, frame.addr, &params).unwrap();
        assert_eq!(params.get("A").unwrap().as_i64(), Some(7));
        assert_eq!(params.get("B").unwrap().as_i64(), Some(5));
        assert_eq!(fake.frame_cursor(&frame), frame.code_end);
    }

    #[test]
    fn test_marshal_allows_omitted_optional() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let say = fake
            .function(actor, "Say")
            .param("Volume", FieldSpec::Int32)
            .optional_param("Pitch", FieldSpec::Int32)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let frame = fake.frame(
            say,
            obj,
            &[FrameArg::int32(3), FrameArg::End],
        );
        let host = fake.host();

        let params = StructView::new(host.clone(), say).unwrap();
        marshal_frame_params(host, say, frame.addr, &params).unwrap();
        assert_eq!(params.get("Volume").unwrap().as_i64(), Some(3));
        assert_eq!(params.get("Pitch").unwrap().as_i64(), Some(0));
        assert!(!host.has_protocol_fault());
    }

    #[test]
    fn test_missing_marker_latches_protocol_fault() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let add = fake
            .function(actor, "Add")
            .param("A", FieldSpec::Int32)
            .returns(FieldSpec::Int32)
            .native(|_, _| {})
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let frame = fake.frame(
            add,
            obj,
            &[FrameArg::int32(1), FrameArg::int32(2)],
        );
        let host = fake.host();

        let params = StructView::new(host.clone(), add).unwrap();
        let err = marshal_frame_params(host, add, frame.addr, &params).unwrap_err();
        assert!(err.is_fatal());
        assert!(host.has_protocol_fault());

        let method = host.bind(obj, "Add").unwrap();
        assert!(matches!(method.call(&[Value::Int(1)]), Err(ReflectError::Protocol(_))));
        host.clear_protocol_fault();
        assert!(method.call(&[Value::Int(1)]).is_ok());
    }

    #[test]
    fn test_missing_required_parameter_is_fatal() {
        let mut fake = FakeHost::new();
        let actor = fake.class("Actor").finish();
        let add = fake
            .function(actor, "Add")
            .param("A", FieldSpec::Int32)
            .param("B", FieldSpec::Int32)
            .finish();
        let obj = fake.spawn(actor, "A", None);
        let frame = fake.frame(
            add,
            obj,
            &[FrameArg::int32(1), FrameArg::End],
        );
        let host = fake.host();

        let params = StructView::new(host.clone(), add).unwrap();
        let err = marshal_frame_params(host, add, frame.addr, &params).unwrap_err();
        assert!(matches!(err, ReflectError::Protocol(_)));
    }
}
