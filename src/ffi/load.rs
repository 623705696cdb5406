//! Code unit loading FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::types::{StackVm, StackVmResult, VmWrapper};
use super::vm_ffi::{get_wrapper_mut, str_arg};
use crate::asm;
use crate::vm::{UnitId, VmError, bytecode};

fn finish_load(wrapper: &mut VmWrapper, result: Result<UnitId, VmError>) -> StackVmResult {
    match result {
        Ok(_) => {
            wrapper.clear_error();
            StackVmResult::Ok
        }
        Err(e) => wrapper.fail(e),
    }
}

fn load_source(wrapper: &mut VmWrapper, data: &[u8]) -> StackVmResult {
    if bytecode::is_binary(data) {
        let result = wrapper.vm.load_bytes(data);
        return finish_load(wrapper, result);
    }
    let Ok(text) = std::str::from_utf8(data) else {
        wrapper.set_error("input is neither a binary unit nor UTF-8 assembly");
        return StackVmResult::ErrorBytecode;
    };
    match asm::assemble(text) {
        Ok(unit) => {
            let result = wrapper.vm.load(unit);
            finish_load(wrapper, result)
        }
        Err(e) => {
            wrapper.set_error(format!("assembly error: {}", e));
            StackVmResult::ErrorBytecode
        }
    }
}

/// Load a binary code unit from memory.
///
/// The unit is decoded and verified; its exported functions become
/// globals. Nothing executes.
///
/// # Returns
/// - `STACK_VM_RESULT_OK` on success
/// - `STACK_VM_RESULT_ERROR_INVALID_ARG` if data is NULL
/// - `STACK_VM_RESULT_ERROR_BYTECODE` if the data is malformed
/// - `STACK_VM_RESULT_ERROR_VERIFY` if verification fails
///
/// # Safety
///
/// `vm` must be a valid VM instance and `data` must point to `len`
/// readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_load(vm: *mut StackVm, data: *const u8, len: usize) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    if data.is_null() {
        wrapper.set_error("data pointer is NULL");
        return StackVmResult::ErrorInvalidArg;
    }
    let slice = std::slice::from_raw_parts(data, len);
    let result = wrapper.vm.load_bytes(slice);
    finish_load(wrapper, result)
}

/// Assemble and load `.sva` source text.
///
/// # Safety
///
/// `vm` must be a valid VM instance and `source` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_load_asm(vm: *mut StackVm, source: *const c_char) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let text = match str_arg(wrapper, source, "source") {
        Ok(text) => text,
        Err(code) => return code,
    };
    load_source(wrapper, text.as_bytes())
}

/// Load a code unit from a file, binary or assembly.
///
/// # Returns
/// - `STACK_VM_RESULT_ERROR_NOT_FOUND` if the file cannot be read
/// - otherwise as `stackvm_load`
///
/// # Safety
///
/// `vm` must be a valid VM instance and `path` a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stackvm_load_file(vm: *mut StackVm, path: *const c_char) -> StackVmResult {
    let Some(wrapper) = get_wrapper_mut(vm) else {
        return StackVmResult::ErrorInvalidArg;
    };
    let path = match str_arg(wrapper, path, "path") {
        Ok(path) => path,
        Err(code) => return code,
    };
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            wrapper.set_error(format!("cannot read file: {}", e));
            return StackVmResult::ErrorNotFound;
        }
    };
    load_source(wrapper, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::error::stackvm_error_offset;
    use crate::ffi::vm_ffi::{stackvm_free, stackvm_new};
    use crate::vm::{CodeUnit, Function, Op};
    use std::ffi::CString;

    fn sample_unit() -> CodeUnit {
        let mut unit = CodeUnit::new("sample");
        let mut f = Function::new("answer", 0, 1);
        f.code = vec![Op::Int(42), Op::Return];
        unit.functions.push(f);
        unit
    }

    #[test]
    fn test_load_binary() {
        let data = bytecode::serialize(&sample_unit());
        unsafe {
            let vm = stackvm_new();
            assert_eq!(stackvm_load(vm, data.as_ptr(), data.len()), StackVmResult::Ok);
            assert!(get_wrapper_mut(vm).unwrap().vm.get_global("answer").is_some());
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_load_null_data() {
        unsafe {
            let vm = stackvm_new();
            assert_eq!(stackvm_load(vm, std::ptr::null(), 0), StackVmResult::ErrorInvalidArg);
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_load_invalid_data() {
        unsafe {
            let vm = stackvm_new();
            let bad = b"not valid bytecode";
            assert_eq!(stackvm_load(vm, bad.as_ptr(), bad.len()), StackVmResult::ErrorBytecode);
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_load_unverifiable() {
        let mut unit = sample_unit();
        unit.functions[0].code = vec![Op::Add, Op::Return];
        let data = bytecode::serialize(&unit);
        unsafe {
            let vm = stackvm_new();
            assert_eq!(stackvm_load(vm, data.as_ptr(), data.len()), StackVmResult::ErrorVerify);
            assert_eq!(stackvm_error_offset(vm), 0);
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_load_asm() {
        let source = c".func two returns=1 export\nint 2\nreturn\n.end\n";
        unsafe {
            let vm = stackvm_new();
            assert_eq!(stackvm_load_asm(vm, source.as_ptr()), StackVmResult::Ok);
            assert!(get_wrapper_mut(vm).unwrap().vm.get_global("two").is_some());

            let broken = c".func f\nfrobnicate\n.end\n";
            assert_eq!(stackvm_load_asm(vm, broken.as_ptr()), StackVmResult::ErrorBytecode);
            stackvm_free(vm);
        }
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.svm");
        std::fs::write(&path, bytecode::serialize(&sample_unit())).unwrap();
        let path = CString::new(path.to_str().unwrap()).unwrap();
        let missing = CString::new("/nonexistent/unit.svm").unwrap();
        unsafe {
            let vm = stackvm_new();
            assert_eq!(stackvm_load_file(vm, path.as_ptr()), StackVmResult::Ok);
            assert_eq!(stackvm_load_file(vm, missing.as_ptr()), StackVmResult::ErrorNotFound);
            stackvm_free(vm);
        }
    }
}
