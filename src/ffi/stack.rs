//! Value stack FFI functions.
//!
//! The host exchanges values with the VM through a stack owned by the
//! VM handle. Arguments are pushed before `stackvm_call`, results are
//! left on it afterwards. Heap values on this stack are pinned, so they
//! survive collections until popped.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::types::{StackVm, StackVmResult, StackVmValueType, value_type};
use super::vm_ffi::{get_wrapper, get_wrapper_mut, str_arg};
use crate::vm::Value;

// =============================================================================
// Push Functions
// =============================================================================

/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_push_nil(vm: *mut StackVm) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.push(Value::Nil);
    }
}

/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_push_bool(vm: *mut StackVm, value: bool) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.push(Value::Bool(value));
    }
}

/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_push_int(vm: *mut StackVm, value: i64) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.push(Value::Int(value));
    }
}

/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_push_float(vm: *mut StackVm, value: f64) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.push(Value::Float(value));
    }
}

/// Push a string value onto the stack.
///
/// The bytes are copied into the VM heap and must be valid UTF-8; they
/// need not be NUL-terminated.
///
/// # Safety
///
/// `vm` must be a valid VM instance and `str` must point to `len`
/// readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_push_string(
    vm: *mut StackVm,
    str: *const c_char,
    len: usize,
) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    if str.is_null() {
        wrapper.set_error("string pointer is NULL");
        return StackVmResult::ErrorInvalidArg;
    }
    let bytes = std::slice::from_raw_parts(str as *const u8, len);
    let Ok(text) = std::str::from_utf8(bytes) else {
        wrapper.set_error("string is not valid UTF-8");
        return StackVmResult::ErrorInvalidArg;
    };
    match wrapper.vm.new_string(text) {
        Ok(value) => {
            wrapper.push(value);
            StackVmResult::Ok
        }
        Err(e) => wrapper.fail(e),
    }
}

/// Pop `count` values and push an array holding them in push order.
///
/// # Safety
///
/// `vm` must be a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_push_array(vm: *mut StackVm, count: u32) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let count = count as usize;
    if count > wrapper.ffi_stack.len() {
        wrapper.set_error(format!(
            "array of {} elements but only {} values on the stack",
            count,
            wrapper.ffi_stack.len()
        ));
        return StackVmResult::ErrorInvalidArg;
    }
    let start = wrapper.ffi_stack.len() - count;
    let items = wrapper.ffi_stack[start..].to_vec();
    // Elements stay pinned on the stack until the array owns them.
    match wrapper.vm.new_array(items) {
        Ok(array) => {
            wrapper.pop_n(count);
            wrapper.push(array);
            StackVmResult::Ok
        }
        Err(e) => wrapper.fail(e),
    }
}

/// Push the value of a global, or nil if it is unbound.
///
/// # Safety
///
/// `vm` must be a valid VM instance and `name` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_get_global(vm: *mut StackVm, name: *const c_char) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let name = match str_arg(wrapper, name, "global name") {
        Ok(name) => name,
        Err(code) => return code,
    };
    let value = wrapper.vm.get_global(name).unwrap_or(Value::Nil);
    wrapper.push(value);
    StackVmResult::Ok
}

/// Pop the top value and bind it to a global. Assigning nil unbinds it.
///
/// # Safety
///
/// `vm` must be a valid VM instance and `name` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_set_global(vm: *mut StackVm, name: *const c_char) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let name = match str_arg(wrapper, name, "global name") {
        Ok(name) => name,
        Err(code) => return code,
    };
    let Some(&value) = wrapper.ffi_stack.last() else {
        wrapper.set_error("stack is empty");
        return StackVmResult::ErrorInvalidArg;
    };
    match wrapper.vm.set_global(name, value) {
        Ok(()) => {
            wrapper.pop_n(1);
            StackVmResult::Ok
        }
        Err(e) => wrapper.fail(e),
    }
}

// =============================================================================
// Inspection Functions
// =============================================================================

/// Resolve a stack index to an absolute index.
///
/// Positive indices are from the bottom (0 = first element).
/// Negative indices are from the top (-1 = last element).
fn resolve_index(stack_len: usize, index: i32) -> Option<usize> {
    if index >= 0 {
        let idx = index as usize;
        (idx < stack_len).then_some(idx)
    } else {
        let offset = index.unsigned_abs() as usize;
        (offset <= stack_len).then(|| stack_len - offset)
    }
}

unsafe fn value_at(vm: *const StackVm, index: i32) -> Option<Value> {
    let wrapper = get_wrapper(vm)?;
    let idx = resolve_index(wrapper.ffi_stack.len(), index)?;
    Some(wrapper.ffi_stack[idx])
}

/// Dynamic type of the value at `index`, or `Invalid` if out of range.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_type(vm: *const StackVm, index: i32) -> StackVmValueType {
    match (get_wrapper(vm), value_at(vm, index)) {
        (Some(wrapper), Some(value)) => value_type(wrapper.vm.heap(), value),
        _ => StackVmValueType::Invalid,
    }
}

/// Truthiness of the value at `index`: only nil and false are false.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_to_bool(vm: *const StackVm, index: i32) -> bool {
    value_at(vm, index).is_some_and(|v| v.is_truthy())
}

/// Integer at `index`. Returns 0 if the value is not an int.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_to_int(vm: *const StackVm, index: i32) -> i64 {
    value_at(vm, index).and_then(|v| v.as_int()).unwrap_or(0)
}

/// Number at `index`, ints converted. Returns 0.0 for non-numbers.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_to_float(vm: *const StackVm, index: i32) -> f64 {
    value_at(vm, index).and_then(|v| v.as_float()).unwrap_or(0.0)
}

/// Bytes of the string at `index`, not NUL-terminated.
///
/// Returns NULL if the value is not a string. The pointer stays valid
/// while the value remains on the stack.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance; `len` may be NULL.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_to_string(
    vm: *const StackVm,
    index: i32,
    len: *mut usize,
) -> *const c_char {
    let text = match (get_wrapper(vm), value_at(vm, index)) {
        (Some(wrapper), Some(value)) => wrapper.vm.string(value),
        _ => None,
    };
    if !len.is_null() {
        *len = text.map_or(0, str::len);
    }
    text.map_or(std::ptr::null(), |s| s.as_ptr() as *const c_char)
}

/// Length of the array at `index`, or -1 if it is not an array.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_array_len(vm: *const StackVm, index: i32) -> i64 {
    match (get_wrapper(vm), value_at(vm, index)) {
        (Some(wrapper), Some(value)) => wrapper.vm.array(value).map_or(-1, |a| a.len() as i64),
        _ => -1,
    }
}

/// Push element `i` of the array at `index`.
///
/// # Safety
///
/// `vm` must be a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_array_get(vm: *mut StackVm, index: i32, i: u32) -> StackVmResult {
    let Some(value) = value_at(vm, index) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let element = wrapper.vm.array(value).and_then(|a| a.get(i as usize).copied());
    match element {
        Some(element) => {
            wrapper.push(element);
            StackVmResult::Ok
        }
        None => {
            wrapper.set_error(format!("no array element {} at stack index {}", i, index));
            StackVmResult::ErrorInvalidArg
        }
    }
}

// =============================================================================
// Stack Manipulation
// =============================================================================

/// Pop values from the stack, unpinning them.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_pop(vm: *mut StackVm, count: i32) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.pop_n(count.max(0) as usize);
    }
}

/// Number of values on the stack.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_get_top(vm: *const StackVm) -> i32 {
    get_wrapper(vm).map_or(0, |w| w.ffi_stack.len() as i32)
}
