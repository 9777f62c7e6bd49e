//! Type definitions and option structs.

use std::os::raw::c_int;

use crate::ffi::{UV_NAMED_PIPE, UV_SOMAXCONN, UV_TCP, UV_TTY, UV_UNKNOWN_HANDLE};

/// Transport kind of a stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandleType {
    /// No handle; used for reads that carried no transferred handle.
    #[default]
    Unknown,
    /// Local pipe or Unix domain socket. The only kind that can carry handles.
    NamedPipe,
    /// TCP socket.
    Tcp,
    /// Terminal.
    Tty,
}

impl HandleType {
    /// Whether a connection of this kind can be passed with `write2`.
    pub fn is_transferable(self) -> bool {
        matches!(self, HandleType::NamedPipe | HandleType::Tcp)
    }

    /// Whether streams of this kind can carry other handles.
    pub fn supports_ipc(self) -> bool {
        self == HandleType::NamedPipe
    }
}

impl From<HandleType> for c_int {
    fn from(kind: HandleType) -> c_int {
        match kind {
            HandleType::Unknown => UV_UNKNOWN_HANDLE,
            HandleType::NamedPipe => UV_NAMED_PIPE,
            HandleType::Tcp => UV_TCP,
            HandleType::Tty => UV_TTY,
        }
    }
}

impl From<c_int> for HandleType {
    fn from(raw: c_int) -> HandleType {
        match raw {
            UV_NAMED_PIPE => HandleType::NamedPipe,
            UV_TCP => HandleType::Tcp,
            UV_TTY => HandleType::Tty,
            _ => HandleType::Unknown,
        }
    }
}

/// How long [`EventLoop::run`](crate::EventLoop::run) keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Poll and dispatch until a pass makes no progress.
    #[default]
    Default,
    /// One poll and dispatch pass.
    Once,
    /// One pass without waiting. Identical to `Once` for engines that never block.
    NoWait,
}

/// Event loop configuration.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Maximum completions dispatched per pass; 0 means unlimited.
    pub max_events_per_tick: usize,
    /// Catch panics raised by callbacks, log them and keep running.
    pub catch_callback_panics: bool,
}

/// Configuration of the in-process [`MemoryEngine`](crate::MemoryEngine).
#[derive(Debug, Clone)]
pub struct MemoryEngineOptions {
    /// Platform cap applied to listen backlogs.
    pub max_backlog: u32,
    /// Largest buffer handed to a single read callback.
    pub read_chunk_size: usize,
    /// Native streams that may exist at once; allocation beyond fails with ENOMEM.
    pub max_handles: usize,
}

impl Default for MemoryEngineOptions {
    fn default() -> Self {
        Self {
            max_backlog: UV_SOMAXCONN,
            read_chunk_size: 64 * 1024,
            max_handles: 4096,
        }
    }
}

/// Counters kept by the [`MemoryEngine`](crate::MemoryEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Native streams allocated.
    pub handles_opened: u64,
    /// Native streams torn down (each fired one `Close` event).
    pub handles_closed: u64,
    /// Teardown requests received, including repeats.
    pub close_requests: u64,
    /// Read-start requests received.
    pub read_starts: u64,
    /// Writes accepted for asynchronous completion.
    pub writes_queued: u64,
}
