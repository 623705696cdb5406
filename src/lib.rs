//! stackvm - an embeddable stack-based bytecode virtual machine.
//!
//! Hosts load verified code units, register native functions, and call
//! exported functions with typed values. For C/C++ embedding, use the
//! `stackvm_*` functions exported from the FFI module.

pub mod asm;
pub mod config;
pub mod ffi;
pub mod vm;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use vm::{CodeUnit, Constant, ErrorKind, Function, Op, RuntimeError, Value, Vm, VmError};

// Re-export FFI types for C bindings
pub use ffi::*;
