//! FFI type definitions for the C API.

use std::ffi::{CString, c_char, c_void};

use crate::config::RuntimeConfig;
use crate::vm::{ErrorKind, Heap, HeapObject, Value, Vm, VmError};

/// Result codes for FFI operations.
///
/// These map to the `StackVmResult` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackVmResult {
    /// Operation succeeded
    Ok = 0,
    /// Runtime error during execution; see `stackvm_error_kind`
    ErrorRuntime = 1,
    /// Code unit failed verification
    ErrorVerify = 2,
    /// Malformed binary unit or assembly text
    ErrorBytecode = 3,
    /// Invalid argument passed to function
    ErrorInvalidArg = 4,
    /// Function or global not found
    ErrorNotFound = 5,
    /// The VM hit an internal error and refuses further work
    ErrorInternal = 6,
}

impl StackVmResult {
    pub fn is_ok(self) -> bool {
        self == StackVmResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != StackVmResult::Ok
    }
}

/// Runtime error category of the last failed operation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackVmErrorKind {
    None = 0,
    DivideByZero = 1,
    IndexOutOfRange = 2,
    ArityMismatch = 3,
    TypeMismatch = 4,
    StackOverflow = 5,
    OutOfMemory = 6,
    Cancelled = 7,
    Thrown = 8,
    Native = 9,
}

impl From<ErrorKind> for StackVmErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::DivideByZero => StackVmErrorKind::DivideByZero,
            ErrorKind::IndexOutOfRange => StackVmErrorKind::IndexOutOfRange,
            ErrorKind::ArityMismatch => StackVmErrorKind::ArityMismatch,
            ErrorKind::TypeMismatch => StackVmErrorKind::TypeMismatch,
            ErrorKind::StackOverflow => StackVmErrorKind::StackOverflow,
            ErrorKind::OutOfMemory => StackVmErrorKind::OutOfMemory,
            ErrorKind::Cancelled => StackVmErrorKind::Cancelled,
            ErrorKind::Thrown => StackVmErrorKind::Thrown,
            ErrorKind::Native => StackVmErrorKind::Native,
        }
    }
}

/// Dynamic type of a value, as seen from C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackVmValueType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Array = 5,
    Table = 6,
    Function = 7,
    Native = 8,
    UserData = 9,
    /// Index out of range or stale handle
    Invalid = 10,
}

pub(crate) fn value_type(heap: &Heap, value: Value) -> StackVmValueType {
    match value {
        Value::Nil => StackVmValueType::Nil,
        Value::Bool(_) => StackVmValueType::Bool,
        Value::Int(_) => StackVmValueType::Int,
        Value::Float(_) => StackVmValueType::Float,
        Value::Ref(r) => match heap.get(r) {
            Some(HeapObject::String(_)) => StackVmValueType::String,
            Some(HeapObject::Array(_)) => StackVmValueType::Array,
            Some(HeapObject::Table(_)) => StackVmValueType::Table,
            Some(HeapObject::Closure(_)) => StackVmValueType::Function,
            Some(HeapObject::Native(_)) => StackVmValueType::Native,
            Some(HeapObject::UserData(_)) => StackVmValueType::UserData,
            None => StackVmValueType::Invalid,
        },
    }
}

/// Error callback function type.
///
/// Called when an error occurs, with the error message and user data.
pub type StackVmErrorFn = Option<unsafe extern "C" fn(message: *const c_char, userdata: *mut c_void)>;

/// Native function type.
///
/// Receives the call context, the argument count and the userdata given
/// at registration. Reads arguments with `stackvm_arg_*`, pushes results
/// with `stackvm_return_*`, and returns the number of results, or a
/// negative value to raise an error (see `stackvm_call_error`).
pub type StackVmNativeFn =
    unsafe extern "C" fn(ctx: *mut StackVmCall, argc: u32, userdata: *mut c_void) -> i32;

/// Opaque VM instance type.
///
/// All operations require a valid `StackVm` pointer created by
/// `stackvm_new()` or `stackvm_new_with_config()`.
#[repr(C)]
pub struct StackVm {
    _private: [u8; 0],
}

/// Opaque native call context, valid only during a native call.
#[repr(C)]
pub struct StackVmCall {
    _private: [u8; 0],
}

/// Internal VM wrapper that holds the Rust VM and FFI state.
pub(crate) struct VmWrapper {
    pub vm: Vm,
    /// Last error message (as CString for FFI compatibility)
    pub last_error: Option<CString>,
    pub last_kind: StackVmErrorKind,
    /// Instruction offset of the last runtime error, or -1
    pub last_offset: i64,
    pub error_callback: StackVmErrorFn,
    pub error_userdata: *mut c_void,
    /// Values exchanged with the host. Heap values here are pinned.
    pub ffi_stack: Vec<Value>,
}

impl VmWrapper {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            vm: Vm::new(config),
            last_error: None,
            last_kind: StackVmErrorKind::None,
            last_offset: -1,
            error_callback: None,
            error_userdata: std::ptr::null_mut(),
            ffi_stack: Vec::with_capacity(64),
        }
    }

    /// Set an error message and optionally call the error callback.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let msg = message.into().replace('\0', "\\0");
        let c_msg = CString::new(msg).unwrap_or_default();

        if let Some(callback) = self.error_callback {
            unsafe {
                callback(c_msg.as_ptr(), self.error_userdata);
            }
        }

        self.last_error = Some(c_msg);
    }

    /// Record a VM error and map it to a result code.
    pub fn fail(&mut self, err: VmError) -> StackVmResult {
        let (code, kind, offset) = match &err {
            VmError::Runtime(e) => (
                StackVmResult::ErrorRuntime,
                StackVmErrorKind::from(e.kind),
                e.location.as_ref().map_or(-1, |l| l.offset as i64),
            ),
            VmError::Verify(e) => (StackVmResult::ErrorVerify, StackVmErrorKind::None, e.offset as i64),
            VmError::Bytecode(_) => (StackVmResult::ErrorBytecode, StackVmErrorKind::None, -1),
            VmError::UndefinedEntry(_) => (StackVmResult::ErrorNotFound, StackVmErrorKind::None, -1),
            VmError::Internal(_) | VmError::Poisoned => {
                (StackVmResult::ErrorInternal, StackVmErrorKind::None, -1)
            }
        };
        self.set_error(err.to_string());
        self.last_kind = kind;
        self.last_offset = offset;
        code
    }

    /// Clear the last error.
    pub fn clear_error(&mut self) {
        self.last_error = None;
        self.last_kind = StackVmErrorKind::None;
        self.last_offset = -1;
    }

    /// Push a value onto the FFI stack, pinning heap values.
    pub fn push(&mut self, value: Value) {
        self.vm.pin(value);
        self.ffi_stack.push(value);
    }

    /// Pop values off the FFI stack, unpinning them.
    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let start = self.ffi_stack.len().saturating_sub(n);
        let popped: Vec<Value> = self.ffi_stack.drain(start..).collect();
        for value in &popped {
            self.vm.unpin(*value);
        }
        popped
    }
}

impl Default for VmWrapper {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::RuntimeError;

    #[test]
    fn test_result_codes() {
        assert!(StackVmResult::Ok.is_ok());
        assert!(!StackVmResult::Ok.is_err());
        assert!(StackVmResult::ErrorRuntime.is_err());
    }

    #[test]
    fn test_fail_records_kind() {
        let mut wrapper = VmWrapper::default();
        let code = wrapper.fail(RuntimeError::new(ErrorKind::DivideByZero, "boom").into());
        assert_eq!(code, StackVmResult::ErrorRuntime);
        assert_eq!(wrapper.last_kind, StackVmErrorKind::DivideByZero);
        assert_eq!(
            wrapper.last_error.as_ref().unwrap().to_str().unwrap(),
            "DivideByZero: boom"
        );
        wrapper.clear_error();
        assert!(wrapper.last_error.is_none());
        assert_eq!(wrapper.last_kind, StackVmErrorKind::None);
    }

    #[test]
    fn test_pushed_values_are_pinned() {
        let mut wrapper = VmWrapper::default();
        let s = wrapper.vm.new_string("kept").unwrap();
        wrapper.push(s);
        wrapper.vm.collect_garbage().unwrap();
        assert_eq!(wrapper.vm.string(s), Some("kept"));
        wrapper.pop_n(1);
        wrapper.vm.collect_garbage().unwrap();
        assert_eq!(wrapper.vm.string(s), None);
    }
}
