//! Handle types for opaque references to native engine objects.
//!
//! Each handle type is a newtype wrapper around u64 to provide type safety.
//! The value is meaningful only to the engine that issued it.

/// Macro to define a handle type.
macro_rules! define_handle {
    ($name:ident) => {
        /// Opaque token referencing state held by the native engine.
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            _h: u64,
        }

        impl $name {
            /// Create an invalid (null) handle.
            #[inline]
            pub const fn invalid() -> Self {
                Self { _h: 0 }
            }

            /// Wrap a raw engine value.
            #[inline]
            pub const fn from_raw(h: u64) -> Self {
                Self { _h: h }
            }

            /// The raw engine value.
            #[inline]
            pub const fn id(&self) -> u64 {
                self._h
            }

            /// Check if this handle is valid (non-zero).
            #[inline]
            pub const fn is_valid(&self) -> bool {
                self._h != 0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::invalid()
            }
        }
    };
}

define_handle!(RawLoop);
define_handle!(RawStream);
