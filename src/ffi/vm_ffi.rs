//! VM lifecycle FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char, c_void};

use super::types::{StackVm, StackVmErrorFn, StackVmResult, VmWrapper};
use crate::config::RuntimeConfig;

/// Create a new VM instance with the default configuration.
///
/// The returned VM must be freed with `stackvm_free()`.
///
/// # Example (C)
/// ```c
/// StackVm *vm = stackvm_new();
/// // ... use vm ...
/// stackvm_free(vm);
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn stackvm_new() -> *mut StackVm {
    let wrapper = Box::new(VmWrapper::default());
    Box::into_raw(wrapper) as *mut StackVm
}

/// Create a new VM instance configured from TOML text.
///
/// Returns NULL if `config_toml` is not valid UTF-8 or not a valid
/// configuration. A NULL `config_toml` selects the defaults.
///
/// # Safety
///
/// `config_toml` must be NULL or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_new_with_config(config_toml: *const c_char) -> *mut StackVm {
    let config = if config_toml.is_null() {
        RuntimeConfig::default()
    } else {
        let Ok(text) = CStr::from_ptr(config_toml).to_str() else {
            return std::ptr::null_mut();
        };
        match RuntimeConfig::from_toml(text) {
            Ok(config) => config,
            Err(_) => return std::ptr::null_mut(),
        }
    };
    Box::into_raw(Box::new(VmWrapper::new(config))) as *mut StackVm
}

/// Free a VM instance and everything it owns.
///
/// # Safety
///
/// - `vm` must be NULL or a pointer returned by `stackvm_new*()`
/// - `vm` must not have been freed already
/// - No other operations may be in progress on this VM
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_free(vm: *mut StackVm) {
    if vm.is_null() {
        return;
    }
    let _ = Box::from_raw(vm as *mut VmWrapper);
}

/// Set the error callback function.
///
/// The callback will be invoked whenever an error is recorded.
///
/// # Safety
///
/// `vm` must be a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_set_error_callback(
    vm: *mut StackVm,
    callback: StackVmErrorFn,
    userdata: *mut c_void,
) {
    if let Some(wrapper) = get_wrapper_mut(vm) {
        wrapper.error_callback = callback;
        wrapper.error_userdata = userdata;
    }
}

/// Run a full garbage collection.
///
/// # Safety
///
/// `vm` must be a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_collect(vm: *mut StackVm) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    match wrapper.vm.collect_garbage() {
        Ok(()) => StackVmResult::Ok,
        Err(e) => wrapper.fail(e),
    }
}

/// Number of live heap objects.
///
/// # Safety
///
/// `vm` must be NULL or a valid VM instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_live_objects(vm: *const StackVm) -> usize {
    get_wrapper(vm).map_or(0, |w| w.vm.heap().live_objects())
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper_mut(vm: *mut StackVm) -> Option<&'static mut VmWrapper> {
    if vm.is_null() {
        None
    } else {
        Some(&mut *(vm as *mut VmWrapper))
    }
}

/// Helper to get an immutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper(vm: *const StackVm) -> Option<&'static VmWrapper> {
    if vm.is_null() {
        None
    } else {
        Some(&*(vm as *const VmWrapper))
    }
}

/// Borrow a NUL-terminated UTF-8 argument, recording an error on failure.
pub(crate) unsafe fn str_arg<'a>(
    wrapper: &mut VmWrapper,
    ptr: *const c_char,
    what: &str,
) -> Result<&'a str, StackVmResult> {
    if ptr.is_null() {
        wrapper.set_error(format!("{} is NULL", what));
        return Err(StackVmResult::ErrorInvalidArg);
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| {
        wrapper.set_error(format!("invalid UTF-8 in {}", what));
        StackVmResult::ErrorInvalidArg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_new_free() {
        let vm = stackvm_new();
        assert!(!vm.is_null());
        unsafe {
            stackvm_free(vm);
            // Should not crash
            stackvm_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_new_with_config() {
        unsafe {
            let vm = stackvm_new_with_config(c"stack_size = 64\n".as_ptr());
            assert!(!vm.is_null());
            assert_eq!(get_wrapper(vm).unwrap().vm.config().stack_size, 64);
            stackvm_free(vm);

            assert!(stackvm_new_with_config(c"stack_size = 0\n".as_ptr()).is_null());
            assert!(stackvm_new_with_config(c"stack_size = ".as_ptr()).is_null());
        }
    }

    #[test]
    fn test_error_callback() {
        use std::sync::atomic::{AtomicBool, Ordering};

        static CALLBACK_CALLED: AtomicBool = AtomicBool::new(false);

        unsafe extern "C" fn on_error(_message: *const c_char, _userdata: *mut c_void) {
            CALLBACK_CALLED.store(true, Ordering::SeqCst);
        }

        let vm = stackvm_new();
        unsafe {
            stackvm_set_error_callback(vm, Some(on_error), std::ptr::null_mut());
            get_wrapper_mut(vm).unwrap().set_error("test error");
            assert!(CALLBACK_CALLED.load(Ordering::SeqCst));
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_collect() {
        let vm = stackvm_new();
        unsafe {
            assert_eq!(stackvm_collect(vm), StackVmResult::Ok);
            assert_eq!(stackvm_live_objects(vm), 0);
            assert_eq!(stackvm_collect(std::ptr::null_mut()), StackVmResult::ErrorInvalidArg);
            stackvm_free(vm);
        }
    }
}
