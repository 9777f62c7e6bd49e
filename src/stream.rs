//! Duplex stream handles.
//!
//! A [`StreamHandle`] wraps one native stream and exposes non-blocking
//! read, write, half-close, listen/accept and close. Outcomes arrive later
//! through the callbacks registered on the handle, invoked on the loop's
//! thread in the order the engine observed the events.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::callback::{Callback, CallbackRegistry, EventKind};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::ffi::{self, check_status, NativeEvent, RawStream, Status};
use crate::handle::NativeHandle;
use crate::types::HandleType;

/// Observable lifecycle state of a stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Bound to a native stream; reading never started.
    Bound,
    /// Delivering inbound data.
    Reading,
    /// Reading was started and later stopped.
    Idle,
    /// Accepting incoming connections.
    Listening,
    /// Close requested; waiting for the engine to confirm.
    Closing,
    /// Native stream released. The wrapper is inert.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Stopped,
    Plain,
    WithHandles,
}

pub(crate) struct StreamInner {
    native: NativeHandle,
    phase: Cell<Phase>,
    read_mode: Cell<ReadMode>,
    read_started: Cell<bool>,
    listening: Cell<bool>,
    /// Set for the duration of a connection or handle-reception callback.
    accepting: Cell<Option<HandleType>>,
    callbacks: RefCell<CallbackRegistry>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if self.phase.get() == Phase::Open && !self.native.is_disposed() {
            warn!(
                stream = self.native.token().id(),
                "stream handle dropped without close, closing it now"
            );
            self.native.engine().close(self.native.token());
        }
    }
}

/// A duplex byte stream bound to an [`EventLoop`].
///
/// Cloning yields another reference to the same handle. Dropping the last
/// reference without calling [`close`](Self::close) closes the native stream
/// as a safety net; rely on explicit `close` for timely release.
///
/// # Example
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use std::sync::Arc;
/// use uvstream::{EventLoop, HandleType, MemoryEngine, RunMode, StreamHandle};
///
/// let event_loop = EventLoop::new(Arc::new(MemoryEngine::new()));
/// let accepted = Rc::new(RefCell::new(Vec::new()));
///
/// let server = StreamHandle::new(&event_loop, HandleType::Tcp)?;
/// server.bind("svc")?;
/// server.listen(5)?;
/// let conns = Rc::clone(&accepted);
/// server.set_connection_callback(move |server, status| {
///     let Some(event_loop) = server.event_loop() else { return };
///     if status.is_err() {
///         return;
///     }
///     if let Ok(conn) = StreamHandle::new(&event_loop, HandleType::Tcp) {
///         if server.accept(&conn).is_ok() && conn.write(b"hi").is_ok() {
///             conns.borrow_mut().push(conn);
///         }
///     }
/// });
///
/// let received = Rc::new(RefCell::new(Vec::new()));
/// let sink = Rc::clone(&received);
/// let client = StreamHandle::new(&event_loop, HandleType::Tcp)?;
/// client.set_read_callback(move |client, data| {
///     if let Ok(data) = data {
///         sink.borrow_mut().extend_from_slice(&data);
///         client.close();
///     }
/// });
/// client.connect("svc")?;
/// client.read_start()?;
///
/// event_loop.run(RunMode::Default)?;
/// assert_eq!(&received.borrow()[..], b"hi");
/// # Ok::<(), uvstream::Error>(())
/// ```
#[derive(Clone)]
pub struct StreamHandle {
    inner: Rc<StreamInner>,
}

impl StreamHandle {
    /// Allocate a native stream of `kind` and bind it to `event_loop`.
    pub fn new(event_loop: &EventLoop, kind: HandleType) -> Result<Self> {
        let native = NativeHandle::open(event_loop, kind)?;
        let raw = native.token();
        let inner = Rc::new(StreamInner {
            native,
            phase: Cell::new(Phase::Open),
            read_mode: Cell::new(ReadMode::Stopped),
            read_started: Cell::new(false),
            listening: Cell::new(false),
            accepting: Cell::new(None),
            callbacks: RefCell::new(CallbackRegistry::new()),
        });
        event_loop.register(raw, Rc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Rc<StreamInner>) -> Self {
        Self { inner }
    }

    /// The engine token for this handle.
    pub fn raw(&self) -> RawStream {
        self.inner.native.token()
    }

    pub fn handle_type(&self) -> HandleType {
        self.inner.native.kind()
    }

    /// The loop this handle is bound to, if it still exists.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.inner.native.event_loop()
    }

    pub fn state(&self) -> StreamState {
        match self.inner.phase.get() {
            Phase::Closed => StreamState::Closed,
            Phase::Closing => StreamState::Closing,
            Phase::Open if self.inner.listening.get() => StreamState::Listening,
            Phase::Open if self.inner.read_mode.get() != ReadMode::Stopped => StreamState::Reading,
            Phase::Open if self.inner.read_started.get() => StreamState::Idle,
            Phase::Open => StreamState::Bound,
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.phase.get() != Phase::Open
    }

    pub fn is_reading(&self) -> bool {
        self.inner.phase.get() == Phase::Open && self.inner.read_mode.get() != ReadMode::Stopped
    }

    // Callback registration

    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle, Result<Bytes>) + 'static,
    {
        self.set_callback(Callback::Read(Box::new(callback)));
    }

    pub fn set_read2_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle, Result<Bytes>, HandleType) + 'static,
    {
        self.set_callback(Callback::Read2(Box::new(callback)));
    }

    pub fn set_write_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle, Result<()>) + 'static,
    {
        self.set_callback(Callback::Write(Box::new(callback)));
    }

    pub fn set_connect_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle, Result<()>) + 'static,
    {
        self.set_callback(Callback::Connect(Box::new(callback)));
    }

    /// Called when a connection is waiting on a listening handle.
    ///
    /// Claim it by calling [`accept`](Self::accept) before the callback
    /// returns; otherwise the connection is rejected.
    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle, Result<()>) + 'static,
    {
        self.set_callback(Callback::Connection(Box::new(callback)));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle) + 'static,
    {
        self.set_callback(Callback::Close(Box::new(callback)));
    }

    pub fn set_shutdown_callback<F>(&self, callback: F)
    where
        F: FnMut(&StreamHandle, Result<()>) + 'static,
    {
        self.set_callback(Callback::Shutdown(Box::new(callback)));
    }

    /// Store a callback in its slot, discarding the previous one.
    pub fn set_callback(&self, callback: Callback) {
        self.inner.callbacks.borrow_mut().set(callback);
    }

    pub fn clear_callback(&self, kind: EventKind) {
        self.inner.callbacks.borrow_mut().clear(kind);
    }

    // Operations

    /// Start delivering inbound data to the read callback.
    ///
    /// A no-op while reading is already active.
    pub fn read_start(&self) -> Result<()> {
        self.start_reading(ReadMode::Plain)
    }

    /// Start delivering inbound data together with transferred handles to
    /// the read2 callback. Only pipes can receive handles.
    pub fn read2_start(&self) -> Result<()> {
        let kind = self.handle_type();
        if !kind.supports_ipc() {
            return Err(Error::IncompatibleTransport {
                expected: HandleType::NamedPipe,
                found: kind,
            });
        }
        self.start_reading(ReadMode::WithHandles)
    }

    fn start_reading(&self, mode: ReadMode) -> Result<()> {
        let raw = self.check_open()?;
        if self.inner.read_mode.get() != ReadMode::Stopped {
            return Ok(());
        }
        check_status(self.engine().read_start(raw, mode == ReadMode::WithHandles))?;
        self.inner.read_mode.set(mode);
        self.inner.read_started.set(true);
        trace!(stream = raw.id(), ?mode, "read started");
        Ok(())
    }

    /// Stop delivering inbound data. Valid even if reading never started.
    pub fn read_stop(&self) -> Result<()> {
        let raw = self.check_open()?;
        check_status(self.engine().read_stop(raw))?;
        self.inner.read_mode.set(ReadMode::Stopped);
        trace!(stream = raw.id(), "read stopped");
        Ok(())
    }

    /// Queue `data` for transmission.
    ///
    /// `Ok` means the engine accepted the write; its outcome is reported to
    /// the write callback. An `Err` is an immediate rejection and no
    /// callback fires for it.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let raw = self.check_open()?;
        let status = self.engine().write(raw, data, None);
        trace!(stream = raw.id(), len = data.len(), status, "write");
        check_status(status)
    }

    /// Queue `len` bytes of `data` starting at `offset`.
    pub fn write_at(&self, data: &[u8], offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "range {offset}+{len} out of bounds for buffer of {}",
                    data.len()
                ))
            })?;
        self.write(&data[offset..end])
    }

    /// Queue the UTF-8 bytes of `s`.
    pub fn write_str(&self, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    /// Queue `data` and pass `handle`'s connection to the remote peer.
    ///
    /// This handle must be a pipe; `handle` must be an open, connected TCP
    /// or pipe handle on the same loop. Once the write is flushed the
    /// connection belongs to the receiver and `handle` is left unconnected.
    pub fn write2(&self, data: &[u8], handle: &StreamHandle) -> Result<()> {
        let raw = self.check_open()?;
        let carrier = self.handle_type();
        if !carrier.supports_ipc() {
            return Err(Error::IncompatibleTransport {
                expected: HandleType::NamedPipe,
                found: carrier,
            });
        }
        let carried = handle.handle_type();
        if !carried.is_transferable() {
            return Err(Error::IncompatibleTransport {
                expected: HandleType::Tcp,
                found: carried,
            });
        }
        if Rc::ptr_eq(&self.inner, &handle.inner) {
            return Err(Error::InvalidArgument("a handle cannot carry itself".to_string()));
        }
        let send_raw = handle.check_open()?;
        let same_loop = match (self.event_loop(), handle.event_loop()) {
            (Some(a), Some(b)) => a.raw() == b.raw(),
            _ => false,
        };
        if !same_loop {
            return Err(Error::InvalidArgument(
                "handle belongs to another event loop".to_string(),
            ));
        }

        let status = self.engine().write(raw, data, Some(send_raw));
        trace!(stream = raw.id(), send = send_raw.id(), len = data.len(), status, "write2");
        check_status(status)
    }

    /// Half-close: no further writes. Completion goes to the shutdown callback.
    pub fn close_write(&self) -> Result<()> {
        let raw = self.check_open()?;
        check_status(self.engine().shutdown(raw))?;
        debug!(stream = raw.id(), "shutdown requested");
        Ok(())
    }

    /// Request teardown of the native stream.
    ///
    /// Idempotent and non-blocking. The close callback fires once the engine
    /// confirms, after which the handle is inert.
    pub fn close(&self) {
        if self.inner.phase.get() != Phase::Open {
            trace!(stream = self.raw().id(), "close ignored, already closing");
            return;
        }
        let raw = self.raw();
        self.inner.phase.set(Phase::Closing);
        self.inner.read_mode.set(ReadMode::Stopped);
        self.inner.listening.set(false);
        self.engine().close(raw);
        debug!(stream = raw.id(), "close requested");

        match self.event_loop() {
            Some(event_loop) => event_loop.mark_closing(raw, Rc::clone(&self.inner)),
            None => {
                // Without a loop no Close event will arrive.
                self.inner.phase.set(Phase::Closed);
                self.inner.native.dispose();
            }
        }
    }

    /// Bind to an engine-defined address.
    pub fn bind(&self, addr: &str) -> Result<()> {
        let raw = self.check_open()?;
        check_status(self.engine().bind(raw, addr))
    }

    /// Start connecting to `addr`. The outcome goes to the connect callback.
    pub fn connect(&self, addr: &str) -> Result<()> {
        let raw = self.check_open()?;
        check_status(self.engine().connect(raw, addr))?;
        debug!(stream = raw.id(), addr, "connecting");
        Ok(())
    }

    /// Start accepting connections. The backlog is capped by the engine.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        let raw = self.check_open()?;
        check_status(self.engine().listen(raw, backlog))?;
        self.inner.listening.set(true);
        debug!(stream = raw.id(), backlog, "listening");
        Ok(())
    }

    /// Bind the pending connection, or the handle received with the current
    /// read2 event, to `client`.
    ///
    /// Only valid inside the connection callback, or inside a read2 callback
    /// that reported a handle. `client` must be a fresh handle of the
    /// matching transport kind.
    pub fn accept(&self, client: &StreamHandle) -> Result<()> {
        let raw = self.check_open()?;
        let Some(expected) = self.inner.accepting.get() else {
            return Err(Error::NotAccepting);
        };
        if Rc::ptr_eq(&self.inner, &client.inner) {
            return Err(Error::InvalidArgument("a handle cannot accept into itself".to_string()));
        }
        let client_raw = client.check_open()?;
        let found = client.handle_type();
        if found != expected {
            return Err(Error::IncompatibleTransport { expected, found });
        }

        check_status(self.engine().accept(raw, client_raw))?;
        self.inner.accepting.set(None);
        debug!(stream = raw.id(), client = client_raw.id(), "accepted");
        Ok(())
    }

    pub fn is_readable(&self) -> bool {
        self.check_open()
            .map(|raw| self.engine().is_readable(raw))
            .unwrap_or(false)
    }

    pub fn is_writable(&self) -> bool {
        self.check_open()
            .map(|raw| self.engine().is_writable(raw))
            .unwrap_or(false)
    }

    /// Bytes queued but not yet flushed to the transport.
    pub fn write_queue_size(&self) -> usize {
        match self.inner.native.raw() {
            Ok(raw) => self.engine().write_queue_size(raw),
            Err(_) => 0,
        }
    }

    fn check_open(&self) -> Result<RawStream> {
        match self.inner.phase.get() {
            Phase::Open => self.inner.native.raw(),
            Phase::Closing => Err(Error::AlreadyClosed),
            Phase::Closed => Err(Error::InvalidHandle),
        }
    }

    fn engine(&self) -> &dyn ffi::NativeEngine {
        self.inner.native.engine()
    }

    // Event intake

    /// Route one engine completion to the matching callback.
    pub(crate) fn on_native_event(&self, event: NativeEvent) {
        trace!(stream = self.raw().id(), ?event, "dispatch");
        let open = self.inner.phase.get() == Phase::Open;
        let stopped = open && self.inner.read_mode.get() == ReadMode::Stopped;
        match event {
            NativeEvent::Read { status, data, .. } if stopped => {
                self.unread(status, data, HandleType::Unknown);
            }
            NativeEvent::Read2 {
                status,
                data,
                pending,
                ..
            } if stopped => self.unread(status, data, pending),
            NativeEvent::Read { status, data, .. } => {
                if open {
                    self.on_read(read_result(status, data));
                }
            }
            NativeEvent::Read2 {
                status,
                data,
                pending,
                ..
            } => self.on_read2(read_result(status, data), pending, open),
            NativeEvent::Write { status, .. } => self.on_status(EventKind::Write, status),
            NativeEvent::Connect { status, .. } => self.on_status(EventKind::Connect, status),
            NativeEvent::Shutdown { status, .. } => self.on_status(EventKind::Shutdown, status),
            NativeEvent::Connection { status, .. } => self.on_connection(status, open),
            NativeEvent::Close { .. } => self.on_close(),
        }
    }

    fn on_read(&self, result: Result<Bytes>) {
        let mut result = Some(result);
        self.fire(EventKind::Read, |stream, callback| {
            if let (Callback::Read(f), Some(result)) = (callback, result.take()) {
                f(stream, result);
            }
        });
    }

    fn on_read2(&self, result: Result<Bytes>, pending: HandleType, open: bool) {
        if pending != HandleType::Unknown && open {
            self.inner.accepting.set(Some(pending));
        }
        if open {
            let mut result = Some(result);
            self.fire(EventKind::Read2, |stream, callback| {
                if let (Callback::Read2(f), Some(result)) = (callback, result.take()) {
                    f(stream, result, pending);
                }
            });
        }

        if pending == HandleType::Unknown {
            return;
        }
        let claimed = open && self.inner.accepting.take().is_none();
        if !claimed {
            warn!(stream = self.raw().id(), ?pending, "received handle not accepted, dropping it");
            self.reject_pending();
        }
    }

    fn on_connection(&self, status: Status, open: bool) {
        let result = check_status(status);
        let has_pending = result.is_ok();
        if has_pending && open {
            self.inner.accepting.set(Some(self.handle_type()));
        }
        if open {
            let mut result = Some(result);
            self.fire(EventKind::Connection, |stream, callback| {
                if let (Callback::Connection(f), Some(result)) = (callback, result.take()) {
                    f(stream, result);
                }
            });
        }

        if !has_pending {
            return;
        }
        let claimed = open && self.inner.accepting.take().is_none();
        if !claimed {
            debug!(stream = self.raw().id(), "connection not accepted, rejecting it");
            self.reject_pending();
        }
    }

    fn on_status(&self, kind: EventKind, status: Status) {
        let mut result = Some(check_status(status));
        self.fire(kind, |stream, callback| {
            let Some(result) = result.take() else {
                return;
            };
            match callback {
                Callback::Write(f)
                | Callback::Connect(f)
                | Callback::Connection(f)
                | Callback::Shutdown(f) => f(stream, result),
                Callback::Read(_) | Callback::Read2(_) | Callback::Close(_) => {}
            }
        });
    }

    fn on_close(&self) {
        self.inner.phase.set(Phase::Closed);
        self.inner.read_mode.set(ReadMode::Stopped);
        self.inner.listening.set(false);
        self.inner.accepting.set(None);
        self.inner.native.dispose();
        debug!(stream = self.raw().id(), "closed");

        self.fire(EventKind::Close, |stream, callback| {
            if let Callback::Close(f) = callback {
                f(stream);
            }
        });
        self.inner.callbacks.borrow_mut().clear_all();
    }

    /// Give a read completion that raced with `read_stop` back to the
    /// engine so the next `read_start` sees it first.
    fn unread(&self, status: Status, data: Bytes, pending: HandleType) {
        if let Ok(raw) = self.inner.native.raw() {
            trace!(stream = raw.id(), "read arrived after read_stop, handing it back");
            self.engine().unread(raw, status, data, pending);
        }
    }

    fn reject_pending(&self) {
        if let Ok(raw) = self.inner.native.raw() {
            self.engine().reject_pending(raw);
        }
    }

    /// Invoke the callback registered for `kind` through the loop's
    /// trampoline. A missing callback drops the event.
    fn fire(&self, kind: EventKind, mut call: impl FnMut(&StreamHandle, &mut Callback)) {
        let taken = self.inner.callbacks.borrow_mut().take(kind);
        let Some(mut taken) = taken else {
            trace!(stream = self.raw().id(), ?kind, "no callback registered, event dropped");
            return;
        };

        let mut invoke = || call(self, taken.callback_mut());
        match self.event_loop() {
            Some(event_loop) => event_loop.invoke_on_loop_thread(kind, self.raw(), &mut invoke),
            None => invoke(),
        }
        self.inner.callbacks.borrow_mut().restore(taken);
    }
}

fn read_result(status: Status, data: Bytes) -> Result<Bytes> {
    if status >= 0 {
        Ok(data)
    } else {
        Err(ffi::error_from_status(status))
    }
}

impl PartialEq for StreamHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for StreamHandle {}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("native", &self.inner.native)
            .field("state", &self.state())
            .field("callbacks", &*self.inner.callbacks.borrow())
            .finish()
    }
}
