//! Native engine boundary.
//!
//! This module contains the opaque tokens, status codes and the engine trait
//! that the safe wrappers in the parent modules are written against.

pub mod error;
pub mod handles;
pub mod raw;

pub use error::{check_status, error_from_status};
pub use handles::*;
pub use raw::*;
