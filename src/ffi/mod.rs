//! C API for embedding the VM.
//!
//! All public functions use the `extern "C"` ABI; `build.rs` generates
//! `include/stackvm.h` from them.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Valid VM instances created by `stackvm_new()`
//! - Native contexts used only during the native call they were passed to
//!
//! A VM instance is not thread-safe; calls on one instance must not overlap.

mod call;
mod error;
mod load;
mod native;
mod stack;
mod types;
mod vm_ffi;

#[allow(unused_imports)]
pub use call::*;
#[allow(unused_imports)]
pub use error::*;
#[allow(unused_imports)]
pub use load::*;
#[allow(unused_imports)]
pub use native::*;
#[allow(unused_imports)]
pub use stack::*;
#[allow(unused_imports)]
pub use types::*;
#[allow(unused_imports)]
pub use vm_ffi::*;

pub const STACKVM_VERSION_MAJOR: u32 = 0;
pub const STACKVM_VERSION_MINOR: u32 = 1;
pub const STACKVM_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn stackvm_version() -> *const std::ffi::c_char {
    c"0.1.0".as_ptr()
}

#[unsafe(no_mangle)]
pub extern "C" fn stackvm_version_major() -> u32 {
    STACKVM_VERSION_MAJOR
}

#[unsafe(no_mangle)]
pub extern "C" fn stackvm_version_minor() -> u32 {
    STACKVM_VERSION_MINOR
}

#[unsafe(no_mangle)]
pub extern "C" fn stackvm_version_patch() -> u32 {
    STACKVM_VERSION_PATCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(stackvm_version_major(), 0);
        assert_eq!(stackvm_version_minor(), 1);
        assert_eq!(stackvm_version_patch(), 0);

        let version = unsafe { std::ffi::CStr::from_ptr(stackvm_version()).to_str().unwrap() };
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }
}
