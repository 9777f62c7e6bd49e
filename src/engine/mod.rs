//! Engine implementations.
//!
//! [`MemoryEngine`] runs entirely in process. It backs the test suite and
//! the demos, and serves as the reference for what a native engine has to
//! report through [`NativeEngine`](crate::ffi::NativeEngine).

mod memory;

pub use memory::MemoryEngine;
