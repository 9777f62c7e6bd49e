//! Callback-driven stream handles over a native asynchronous I/O engine.
//!
//! This crate provides a safe Rust interface to libuv-style duplex streams:
//! TCP connections, named pipes and terminals. A [`StreamHandle`] owns one
//! native stream and exposes non-blocking operations whose outcomes are
//! reported later through per-event callbacks, which an [`EventLoop`]
//! invokes on its own thread.
//!
//! The native side is any [`NativeEngine`](ffi::NativeEngine).
//! [`MemoryEngine`] is an in-process implementation with named endpoints,
//! listen backlogs and handle passing over pipes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use uvstream::{EventLoop, HandleType, MemoryEngine, RunMode, StreamHandle};
//!
//! fn main() -> uvstream::Result<()> {
//!     let event_loop = EventLoop::new(Arc::new(MemoryEngine::new()));
//!
//!     let server = StreamHandle::new(&event_loop, HandleType::NamedPipe)?;
//!     server.bind("/tmp/demo.sock")?;
//!     server.listen(8)?;
//!     server.set_close_callback(|s| println!("closed {:?}", s.raw()));
//!
//!     let client = StreamHandle::new(&event_loop, HandleType::NamedPipe)?;
//!     client.set_connect_callback(|client, status| {
//!         println!("connect: {status:?}");
//!         client.close();
//!     });
//!     client.connect("/tmp/demo.sock")?;
//!
//!     // Nobody accepts, so the connection is rejected once the callback
//!     // slot on the server turns out to be empty.
//!     event_loop.run(RunMode::Default)?;
//!
//!     server.close();
//!     event_loop.run(RunMode::Default)?;
//!     assert!(!event_loop.is_alive());
//!     Ok(())
//! }
//! ```
//!
//! # Threading
//!
//! Loops and handles are `!Send`. Run one loop per thread; the engine
//! itself is shared and `Send + Sync`.

pub mod callback;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod ffi;
mod handle;
pub mod stream;
pub mod types;

// Re-export main types at the crate root
pub use callback::{Callback, EventKind};
pub use engine::MemoryEngine;
pub use error::{Error, Result};
pub use event_loop::{CallbackHandler, CatchPanics, DirectHandler, EventLoop};
pub use stream::{StreamHandle, StreamState};
pub use types::{EngineStats, HandleType, LoopOptions, MemoryEngineOptions, RunMode};
