//! Raw engine boundary.
//!
//! This module contains the status codes, completion events and the engine
//! trait that a native I/O engine implements. Users should prefer the safe
//! wrappers in the parent modules.

use std::os::raw::c_int;

use bytes::Bytes;
use crossbeam_channel::Sender;

use super::handles::*;
use crate::types::HandleType;

/// Status code returned by engine calls and carried by completions.
///
/// Zero is success; negative values are errors, numbered as libuv does on
/// Linux.
pub type Status = c_int;

// Status codes
pub const UV_OK: Status = 0;
pub const UV_ENOENT: Status = -2;
pub const UV_EBADF: Status = -9;
pub const UV_EAGAIN: Status = -11;
pub const UV_ENOMEM: Status = -12;
pub const UV_EBUSY: Status = -16;
pub const UV_EINVAL: Status = -22;
pub const UV_EPIPE: Status = -32;
pub const UV_ENOTSUP: Status = -95;
pub const UV_EADDRINUSE: Status = -98;
pub const UV_ECONNRESET: Status = -104;
pub const UV_EISCONN: Status = -106;
pub const UV_ENOTCONN: Status = -107;
pub const UV_ECONNREFUSED: Status = -111;
pub const UV_EALREADY: Status = -114;
pub const UV_ECANCELED: Status = -125;
pub const UV_EOF: Status = -4095;

// Handle type values
pub const UV_UNKNOWN_HANDLE: c_int = 0;
pub const UV_NAMED_PIPE: c_int = 7;
pub const UV_TCP: c_int = 12;
pub const UV_TTY: c_int = 14;

/// Upper bound applied to listen backlogs (SOMAXCONN).
pub const UV_SOMAXCONN: u32 = 128;

/// Completion reported by the engine for a single stream.
///
/// The engine sends these over the channel it was given in
/// [`NativeEngine::register_loop`]; the owning loop routes them to the
/// stream wrapper bound to `stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// Data (or end of stream / a read error) arrived.
    Read {
        stream: RawStream,
        status: Status,
        data: Bytes,
    },
    /// Data arrived on a stream reading with handle reception enabled.
    /// `pending` is [`HandleType::Unknown`] when no handle came with it.
    Read2 {
        stream: RawStream,
        status: Status,
        data: Bytes,
        pending: HandleType,
    },
    /// The oldest outstanding write finished.
    Write { stream: RawStream, status: Status },
    /// An outgoing connection attempt finished.
    Connect { stream: RawStream, status: Status },
    /// A listening stream has a connection waiting to be accepted.
    Connection { stream: RawStream, status: Status },
    /// A half-close finished.
    Shutdown { stream: RawStream, status: Status },
    /// The native stream was torn down; its token is no longer valid.
    Close { stream: RawStream },
}

impl NativeEvent {
    /// The stream this event belongs to.
    pub fn stream(&self) -> RawStream {
        match self {
            NativeEvent::Read { stream, .. }
            | NativeEvent::Read2 { stream, .. }
            | NativeEvent::Write { stream, .. }
            | NativeEvent::Connect { stream, .. }
            | NativeEvent::Connection { stream, .. }
            | NativeEvent::Shutdown { stream, .. }
            | NativeEvent::Close { stream } => *stream,
        }
    }
}

/// A native asynchronous I/O engine.
///
/// Calls never block. Anything that completes asynchronously is reported
/// later as a [`NativeEvent`] on the loop's channel, in the order the engine
/// observed it. Calls on an unknown or torn-down token return `UV_EBADF`.
pub trait NativeEngine: Send + Sync {
    /// Attach a loop; completions for its streams go to `events`.
    fn register_loop(&self, events: Sender<NativeEvent>) -> RawLoop;

    /// Detach a loop and release every stream still attached to it.
    fn unregister_loop(&self, lp: RawLoop);

    /// Allocate a native stream of the given transport kind.
    fn stream_new(&self, lp: RawLoop, kind: HandleType) -> Result<RawStream, Status>;

    /// Start delivering inbound data. `with_handles` selects `Read2` events.
    fn read_start(&self, stream: RawStream, with_handles: bool) -> Status;

    /// Stop delivering inbound data; unread data stays buffered.
    fn read_stop(&self, stream: RawStream) -> Status;

    /// Hand back a `Read`/`Read2` completion that arrived after reading
    /// stopped. It is delivered again, ahead of newer data, on the next
    /// read. A non-`Unknown` `pending` takes back the oldest received
    /// handle with it.
    fn unread(&self, stream: RawStream, status: Status, data: Bytes, pending: HandleType);

    /// Queue `data`, optionally carrying another stream's connection.
    fn write(&self, stream: RawStream, data: &[u8], send_handle: Option<RawStream>) -> Status;

    /// Bytes queued but not yet flushed.
    fn write_queue_size(&self, stream: RawStream) -> usize;

    /// Half-close once queued writes drain.
    fn shutdown(&self, stream: RawStream) -> Status;

    /// Request teardown. Idempotent at the engine level.
    fn close(&self, stream: RawStream);

    /// Bind to an engine-defined address.
    fn bind(&self, stream: RawStream, addr: &str) -> Status;

    /// Start connecting to an engine-defined address.
    fn connect(&self, stream: RawStream, addr: &str) -> Status;

    /// Accept incoming connections on a bound stream.
    fn listen(&self, stream: RawStream, backlog: u32) -> Status;

    /// Bind the oldest pending connection (or received handle) to `client`.
    fn accept(&self, server: RawStream, client: RawStream) -> Status;

    /// Drop the oldest pending connection (or received handle) unaccepted.
    /// The remote side observes a reset.
    fn reject_pending(&self, server: RawStream);

    fn is_readable(&self, stream: RawStream) -> bool;

    fn is_writable(&self, stream: RawStream) -> bool;

    /// Human readable description, used for loop handle listings.
    fn describe(&self, stream: RawStream) -> String;

    /// Run one non-blocking I/O pass for the streams of `lp`.
    ///
    /// Returns `true` if any state changed or any event was emitted.
    fn poll(&self, lp: RawLoop) -> bool;
}
