//! Error handling FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::types::{StackVm, StackVmErrorKind};
use super::vm_ffi::{get_wrapper, get_wrapper_mut};

/// Get the last error message.
///
/// Returns NULL if no error is recorded. The pointer is valid until the
/// next API call that may record or clear an error.
///
/// # Example (C)
/// ```c
/// if (stackvm_call(vm, "main", 0, &nresults) != STACK_VM_RESULT_OK) {
///     printf("Error: %s\n", stackvm_get_error(vm));
/// }
/// ```
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_get_error(vm: *const StackVm) -> *const c_char {
    get_wrapper(vm)
        .and_then(|w| w.last_error.as_ref())
        .map_or(std::ptr::null(), |e| e.as_ptr())
}

/// Runtime error kind of the last error, or `None` for other failures.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_error_kind(vm: *const StackVm) -> StackVmErrorKind {
    get_wrapper(vm).map_or(StackVmErrorKind::None, |w| w.last_kind)
}

/// Instruction offset where the last runtime or verification error was
/// detected, or -1 if unknown.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_error_offset(vm: *const StackVm) -> i64 {
    get_wrapper(vm).map_or(-1, |w| w.last_offset)
}

/// Check if there is a pending error.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_has_error(vm: *const StackVm) -> bool {
    get_wrapper(vm).is_some_and(|w| w.last_error.is_some())
}

/// Clear the last error.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_clear_error(vm: *mut StackVm) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.clear_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::vm_ffi::{stackvm_free, stackvm_new};
    use crate::vm::{ErrorKind, Location, RuntimeError};
    use std::ffi::CStr;

    #[test]
    fn test_get_error() {
        unsafe {
            let vm = stackvm_new();
            assert!(stackvm_get_error(vm).is_null());
            assert!(!stackvm_has_error(vm));
            assert_eq!(stackvm_error_offset(vm), -1);

            let err = RuntimeError::new(ErrorKind::IndexOutOfRange, "index 5").at(Location {
                function: "f".to_string(),
                offset: 3,
                line: None,
            });
            get_wrapper_mut(vm).unwrap().fail(err.into());

            assert!(stackvm_has_error(vm));
            assert_eq!(stackvm_error_kind(vm), StackVmErrorKind::IndexOutOfRange);
            assert_eq!(stackvm_error_offset(vm), 3);
            let message = CStr::from_ptr(stackvm_get_error(vm)).to_str().unwrap();
            assert_eq!(message, "IndexOutOfRange: index 5 (in f at 3)");

            stackvm_clear_error(vm);
            assert!(!stackvm_has_error(vm));
            assert!(stackvm_get_error(vm).is_null());
            assert_eq!(stackvm_error_kind(vm), StackVmErrorKind::None);

            stackvm_free(vm);
        }
    }

    #[test]
    fn test_error_null_vm() {
        unsafe {
            assert!(stackvm_get_error(std::ptr::null()).is_null());
            assert!(!stackvm_has_error(std::ptr::null()));
            stackvm_clear_error(std::ptr::null_mut());
        }
    }
}
