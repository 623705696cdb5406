//! Native call context accessors for C host functions.
//!
//! A C native receives an opaque `StackVmCall` pointer. Arguments are read
//! by index; results are appended with the `stackvm_return_*` functions.
//! The context, and any string pointer obtained from it, is only valid
//! until the native returns.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char, c_void};

use super::types::{StackVmCall, StackVmNativeFn, StackVmResult, StackVmValueType, value_type};
use crate::vm::{NativeCall, RuntimeError, Value};

/// What a `StackVmCall` pointer actually points at.
pub(crate) struct CallContext<'c, 'a> {
    call: &'c mut NativeCall<'a>,
    error: Option<String>,
}

/// Adapt a C function pointer to a Rust native.
pub(crate) fn wrap_native(
    func: StackVmNativeFn,
    userdata: *mut c_void,
) -> impl Fn(&mut NativeCall<'_>) -> Result<usize, RuntimeError> + 'static {
    move |call: &mut NativeCall<'_>| {
        let argc = call.argc() as u32;
        let name = call.name().to_string();
        let mut ctx = CallContext { call, error: None };
        let ret = unsafe { func(&mut ctx as *mut CallContext<'_, '_> as *mut StackVmCall, argc, userdata) };
        if ret < 0 {
            let message = ctx
                .error
                .take()
                .unwrap_or_else(|| format!("native function '{}' failed with code {}", name, ret));
            return Err(RuntimeError::native(message));
        }
        Ok(ret as usize)
    }
}

/// Run `f` against the context behind `ctx`.
///
/// The borrow handed to `f` cannot outlive the closure, so no reference to
/// the context survives past the accessor that asked for it.
unsafe fn with_context<R>(ctx: *mut StackVmCall, f: impl FnOnce(&mut CallContext<'_, '_>) -> R) -> Option<R> {
    if ctx.is_null() {
        return None;
    }
    let ctx = &mut *(ctx as *mut CallContext<'_, '_>);
    Some(f(ctx))
}

unsafe fn arg(ctx: *mut StackVmCall, i: u32) -> Option<Value> {
    with_context(ctx, |ctx| ((i as usize) < ctx.call.argc()).then(|| ctx.call.arg(i as usize))).flatten()
}

/// Dynamic type of argument `i`, or `Invalid` if there is no such argument.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_arg_type(ctx: *mut StackVmCall, i: u32) -> StackVmValueType {
    arg(ctx, i)
        .and_then(|value| with_context(ctx, |ctx| value_type(ctx.call.heap(), value)))
        .unwrap_or(StackVmValueType::Invalid)
}

/// Integer argument `i`, or 0 if it is not an int.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_arg_int(ctx: *mut StackVmCall, i: u32) -> i64 {
    arg(ctx, i).and_then(|v| v.as_int()).unwrap_or(0)
}

/// Numeric argument `i` as a float, or 0.0 if it is not a number.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_arg_float(ctx: *mut StackVmCall, i: u32) -> f64 {
    arg(ctx, i).and_then(|v| v.as_float()).unwrap_or(0.0)
}

/// Truthiness of argument `i`.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_arg_bool(ctx: *mut StackVmCall, i: u32) -> bool {
    arg(ctx, i).is_some_and(|v| v.is_truthy())
}

/// Bytes of string argument `i`, not NUL-terminated, or NULL.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native; `len` may
/// be NULL.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_arg_string(ctx: *mut StackVmCall, i: u32, len: *mut usize) -> *const c_char {
    // The bytes live in the heap, which cannot collect before the native returns.
    let text = arg(ctx, i)
        .and_then(|value| with_context(ctx, |ctx| ctx.call.string(value).map(|s| (s.as_ptr(), s.len()))))
        .flatten();
    if !len.is_null() {
        *len = text.map_or(0, |(_, n)| n);
    }
    text.map_or(std::ptr::null(), |(ptr, _)| ptr as *const c_char)
}

unsafe fn push_result(ctx: *mut StackVmCall, value: Value) -> StackVmResult {
    with_context(ctx, |ctx| {
        ctx.call.push(value);
        StackVmResult::Ok
    })
    .unwrap_or(StackVmResult::ErrorInvalidArg)
}

/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_return_nil(ctx: *mut StackVmCall) -> StackVmResult {
    push_result(ctx, Value::Nil)
}

/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_return_bool(ctx: *mut StackVmCall, value: bool) -> StackVmResult {
    push_result(ctx, Value::Bool(value))
}

/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_return_int(ctx: *mut StackVmCall, value: i64) -> StackVmResult {
    push_result(ctx, Value::Int(value))
}

/// # Safety
///
/// `ctx` must be the context passed to the running native.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_return_float(ctx: *mut StackVmCall, value: f64) -> StackVmResult {
    push_result(ctx, Value::Float(value))
}

/// Append a string result, copying `len` UTF-8 bytes.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native and `str`
/// must point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_return_string(
    ctx: *mut StackVmCall,
    str: *const c_char,
    len: usize,
) -> StackVmResult {
    if str.is_null() {
        return StackVmResult::ErrorInvalidArg;
    }
    let bytes = std::slice::from_raw_parts(str as *const u8, len);
    let Ok(text) = std::str::from_utf8(bytes) else {
        return StackVmResult::ErrorInvalidArg;
    };
    with_context(ctx, |ctx| match ctx.call.new_string(text) {
        Ok(value) => {
            ctx.call.push(value);
            StackVmResult::Ok
        }
        Err(e) => {
            ctx.error = Some(e.message);
            StackVmResult::ErrorRuntime
        }
    })
    .unwrap_or(StackVmResult::ErrorInvalidArg)
}

/// Record an error message for the running native and return -1, so a
/// native can `return stackvm_call_error(ctx, "...");`.
///
/// # Safety
///
/// `ctx` must be the context passed to the running native; `message`
/// must be NULL or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_call_error(ctx: *mut StackVmCall, message: *const c_char) -> i32 {
    let text = if message.is_null() {
        "native function failed".to_string()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };
    with_context(ctx, |ctx| ctx.error = Some(text));
    -1
}
