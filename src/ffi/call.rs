//! Function call and registration FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{c_char, c_void};

use super::native::wrap_native;
use super::types::{StackVm, StackVmNativeFn, StackVmResult};
use super::vm_ffi::{get_wrapper_mut, str_arg};

/// Call a global function by name.
///
/// The top `nargs` stack values are popped as arguments. On success the
/// results are pushed and their count stored in `nresults` (which may be
/// NULL). On failure nothing is pushed, the VM stack is restored, and the
/// error is available through `stackvm_get_error`.
///
/// # Returns
/// - `STACK_VM_RESULT_OK` on success
/// - `STACK_VM_RESULT_ERROR_NOT_FOUND` if the global is unbound
/// - `STACK_VM_RESULT_ERROR_RUNTIME` on execution error
///
/// # Safety
///
/// `vm` must be a valid VM instance and `func_name` a NUL-terminated
/// string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_call(
    vm: *mut StackVm,
    func_name: *const c_char,
    nargs: u32,
    nresults: *mut u32,
) -> StackVmResult {
    if !nresults.is_null() {
        *nresults = 0;
    }
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let name = match str_arg(wrapper, func_name, "function name") {
        Ok(name) => name,
        Err(code) => return code,
    };
    let nargs = nargs as usize;
    if nargs > wrapper.ffi_stack.len() {
        wrapper.set_error(format!(
            "call with {} arguments but only {} values on the stack",
            nargs,
            wrapper.ffi_stack.len()
        ));
        return StackVmResult::ErrorInvalidArg;
    }

    // Arguments are unpinned here and rooted by the VM stack once the
    // call starts; nothing allocates in between.
    let args = wrapper.pop_n(nargs);
    match wrapper.vm.call(name, &args) {
        Ok(results) => {
            if !nresults.is_null() {
                *nresults = results.len() as u32;
            }
            for value in results {
                wrapper.push(value);
            }
            wrapper.clear_error();
            StackVmResult::Ok
        }
        Err(e) => wrapper.fail(e),
    }
}

/// Register a C function as a global native.
///
/// `arity` is the exact argument count, or -1 to accept any count.
/// `userdata` is passed through to every invocation.
///
/// # Safety
///
/// `vm` must be a valid VM instance, `name` a NUL-terminated string, and
/// `userdata` must stay valid for as long as the VM may call `func`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_register_native(
    vm: *mut StackVm,
    name: *const c_char,
    arity: i32,
    func: StackVmNativeFn,
    userdata: *mut c_void,
) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let name = match str_arg(wrapper, name, "function name") {
        Ok(name) => name,
        Err(code) => return code,
    };
    let arity = match arity {
        -1 => None,
        0..=255 => Some(arity as u8),
        _ => {
            wrapper.set_error(format!("invalid arity {}", arity));
            return StackVmResult::ErrorInvalidArg;
        }
    };
    match wrapper.vm.register_native(name, arity, wrap_native(func, userdata)) {
        Ok(()) => StackVmResult::Ok,
        Err(e) => wrapper.fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::error::{stackvm_error_kind, stackvm_get_error};
    use crate::ffi::load::stackvm_load_asm;
    use crate::ffi::native::*;
    use crate::ffi::stack::*;
    use crate::ffi::types::{StackVmCall, StackVmErrorKind, StackVmValueType};
    use crate::ffi::vm_ffi::{stackvm_free, stackvm_new};
    use std::ffi::CStr;

    unsafe extern "C" fn add_native(ctx: *mut StackVmCall, _argc: u32, _userdata: *mut c_void) -> i32 {
        unsafe {
            let a = stackvm_arg_int(ctx, 0);
            let b = stackvm_arg_int(ctx, 1);
            stackvm_return_int(ctx, a + b);
        }
        1
    }

    unsafe extern "C" fn failing_native(ctx: *mut StackVmCall, _argc: u32, _userdata: *mut c_void) -> i32 {
        unsafe { stackvm_call_error(ctx, c"no luck".as_ptr()) }
    }

    unsafe extern "C" fn counting_native(ctx: *mut StackVmCall, argc: u32, userdata: *mut c_void) -> i32 {
        unsafe {
            *(userdata as *mut u32) += argc;
            let greeting = "hi";
            stackvm_return_string(ctx, greeting.as_ptr() as *const c_char, greeting.len());
        }
        1
    }

    // Returns the string argument twice over, or an error for anything else.
    unsafe extern "C" fn twice_native(ctx: *mut StackVmCall, _argc: u32, _userdata: *mut c_void) -> i32 {
        unsafe {
            if stackvm_arg_type(ctx, 0) != StackVmValueType::String {
                return stackvm_call_error(ctx, c"expected a string".as_ptr());
            }
            let mut len = 0usize;
            let ptr = stackvm_arg_string(ctx, 0, &mut len);
            let text = std::str::from_utf8(std::slice::from_raw_parts(ptr as *const u8, len)).unwrap();
            let doubled = text.repeat(2);
            stackvm_return_string(ctx, doubled.as_ptr() as *const c_char, doubled.len());
            assert_eq!(stackvm_arg_type(ctx, 1), StackVmValueType::Invalid);
        }
        1
    }

    #[test]
    fn test_native_reads_string_args() {
        unsafe {
            let vm = stackvm_new();
            stackvm_register_native(vm, c"twice".as_ptr(), 1, twice_native, std::ptr::null_mut());
            let word = "ab";
            stackvm_push_string(vm, word.as_ptr() as *const c_char, word.len());
            assert_eq!(stackvm_call(vm, c"twice".as_ptr(), 1, std::ptr::null_mut()), StackVmResult::Ok);
            let mut len = 0usize;
            let ptr = stackvm_to_string(vm, -1, &mut len);
            assert_eq!(std::slice::from_raw_parts(ptr as *const u8, len), b"abab");
            stackvm_pop(vm, 1);

            stackvm_push_int(vm, 3);
            assert_eq!(
                stackvm_call(vm, c"twice".as_ptr(), 1, std::ptr::null_mut()),
                StackVmResult::ErrorRuntime
            );
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_null_context_is_rejected() {
        unsafe {
            let ctx = std::ptr::null_mut();
            assert_eq!(stackvm_arg_type(ctx, 0), StackVmValueType::Invalid);
            assert_eq!(stackvm_arg_int(ctx, 0), 0);
            assert!(stackvm_arg_string(ctx, 0, std::ptr::null_mut()).is_null());
            assert_eq!(stackvm_return_int(ctx, 1), StackVmResult::ErrorInvalidArg);
            assert_eq!(stackvm_call_error(ctx, std::ptr::null()), -1);
        }
    }

    #[test]
    fn test_register_and_call_native() {
        unsafe {
            let vm = stackvm_new();
            assert_eq!(
                stackvm_register_native(vm, c"add".as_ptr(), 2, add_native, std::ptr::null_mut()),
                StackVmResult::Ok
            );

            stackvm_push_int(vm, 10);
            stackvm_push_int(vm, 20);
            let mut n = 0u32;
            assert_eq!(stackvm_call(vm, c"add".as_ptr(), 2, &mut n), StackVmResult::Ok);
            assert_eq!(n, 1);
            assert_eq!(stackvm_get_top(vm), 1);
            assert_eq!(stackvm_to_int(vm, -1), 30);
            stackvm_pop(vm, 1);

            stackvm_push_int(vm, 10);
            assert_eq!(stackvm_call(vm, c"add".as_ptr(), 1, &mut n), StackVmResult::ErrorRuntime);
            assert_eq!(stackvm_error_kind(vm), StackVmErrorKind::ArityMismatch);
            assert_eq!(stackvm_get_top(vm), 0);

            stackvm_free(vm);
        }
    }

    #[test]
    fn test_script_calls_native() {
        let source = c"
.func main arity=1 returns=1 export
    get_global add
    get_local 0
    int 5
    call 2 1
    return
.end
";
        unsafe {
            let vm = stackvm_new();
            stackvm_register_native(vm, c"add".as_ptr(), 2, add_native, std::ptr::null_mut());
            assert_eq!(stackvm_load_asm(vm, source.as_ptr()), StackVmResult::Ok);
            stackvm_push_int(vm, 37);
            assert_eq!(stackvm_call(vm, c"main".as_ptr(), 1, std::ptr::null_mut()), StackVmResult::Ok);
            assert_eq!(stackvm_to_int(vm, -1), 42);
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_native_error_message() {
        unsafe {
            let vm = stackvm_new();
            stackvm_register_native(vm, c"fail".as_ptr(), -1, failing_native, std::ptr::null_mut());
            assert_eq!(
                stackvm_call(vm, c"fail".as_ptr(), 0, std::ptr::null_mut()),
                StackVmResult::ErrorRuntime
            );
            assert_eq!(stackvm_error_kind(vm), StackVmErrorKind::Native);
            let message = CStr::from_ptr(stackvm_get_error(vm)).to_str().unwrap();
            assert!(message.contains("no luck"), "{message}");
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_native_userdata_and_strings() {
        let mut seen = 0u32;
        unsafe {
            let vm = stackvm_new();
            stackvm_register_native(
                vm,
                c"count".as_ptr(),
                -1,
                counting_native,
                &mut seen as *mut u32 as *mut c_void,
            );
            stackvm_push_nil(vm);
            stackvm_push_nil(vm);
            stackvm_push_nil(vm);
            assert_eq!(stackvm_call(vm, c"count".as_ptr(), 3, std::ptr::null_mut()), StackVmResult::Ok);
            let mut len = 0usize;
            let ptr = stackvm_to_string(vm, -1, &mut len);
            assert_eq!(std::slice::from_raw_parts(ptr as *const u8, len), b"hi");
            stackvm_free(vm);
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_call_not_found() {
        unsafe {
            let vm = stackvm_new();
            assert_eq!(
                stackvm_call(vm, c"nonexistent".as_ptr(), 0, std::ptr::null_mut()),
                StackVmResult::ErrorNotFound
            );
            assert_eq!(
                stackvm_call(vm, c"nonexistent".as_ptr(), 4, std::ptr::null_mut()),
                StackVmResult::ErrorInvalidArg
            );
            stackvm_free(vm);
        }
    }
}
