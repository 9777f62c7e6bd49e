//! The event loop that services stream handles.
//!
//! An [`EventLoop`] owns the receiving end of the engine's completion
//! channel, a registry mapping native tokens to their wrappers, and the
//! callback trampoline every application callback runs through. It is
//! `!Send`: one loop is driven by one thread, and every handle bound to it
//! is operated from that thread.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use tracing::{debug, error, trace};

use crate::callback::EventKind;
use crate::error::{Error, Result};
use crate::ffi::{NativeEngine, NativeEvent, RawLoop, RawStream};
use crate::stream::{StreamHandle, StreamInner};
use crate::types::{LoopOptions, RunMode};

/// Runs application callbacks on behalf of the loop.
///
/// Every callback registered on a stream handle is invoked through the
/// loop's handler, on the loop's own thread.
pub trait CallbackHandler {
    fn invoke(&self, kind: EventKind, stream: RawStream, callback: &mut dyn FnMut());
}

/// Calls the callback directly; a panic unwinds out of [`EventLoop::run`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectHandler;

impl CallbackHandler for DirectHandler {
    fn invoke(&self, _kind: EventKind, _stream: RawStream, callback: &mut dyn FnMut()) {
        callback();
    }
}

/// Catches panicking callbacks, logs them and lets the loop continue.
#[derive(Debug, Default)]
pub struct CatchPanics {
    caught: Cell<usize>,
}

impl CatchPanics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callback panics caught so far.
    pub fn caught(&self) -> usize {
        self.caught.get()
    }
}

impl CallbackHandler for CatchPanics {
    fn invoke(&self, kind: EventKind, stream: RawStream, callback: &mut dyn FnMut()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            self.caught.set(self.caught.get() + 1);
            error!(
                stream = stream.id(),
                ?kind,
                message = panic_message(payload.as_ref()),
                "callback panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// How the loop refers to a bound wrapper.
enum Binding {
    /// Open handles are held weakly so dropping the wrapper can close it.
    Open(Weak<StreamInner>),
    /// Closing handles are kept alive until the engine confirms teardown.
    Closing(Rc<StreamInner>),
}

pub(crate) struct LoopInner {
    raw: RawLoop,
    engine: Arc<dyn NativeEngine>,
    events: Receiver<NativeEvent>,
    bindings: RefCell<HashMap<RawStream, Binding>>,
    handler: RefCell<Rc<dyn CallbackHandler>>,
    options: LoopOptions,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        debug!(event_loop = self.raw.id(), "event loop released");
        self.engine.unregister_loop(self.raw);
    }
}

/// A single-threaded event loop bound to a native engine.
///
/// Cloning is cheap and yields another reference to the same loop.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use uvstream::{EventLoop, HandleType, MemoryEngine, RunMode, StreamHandle};
///
/// let engine = Arc::new(MemoryEngine::new());
/// let event_loop = EventLoop::new(engine);
///
/// let server = StreamHandle::new(&event_loop, HandleType::Tcp)?;
/// server.bind("echo")?;
/// server.listen(16)?;
///
/// event_loop.run(RunMode::Default)?;
/// server.close();
/// event_loop.run(RunMode::Default)?;
/// assert!(server.is_closed());
/// # Ok::<(), uvstream::Error>(())
/// ```
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a loop on `engine` with default options.
    pub fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self::with_options(engine, LoopOptions::default())
    }

    /// Create a loop on `engine`.
    pub fn with_options(engine: Arc<dyn NativeEngine>, options: LoopOptions) -> Self {
        let (tx, rx) = unbounded();
        let raw = engine.register_loop(tx);
        let handler: Rc<dyn CallbackHandler> = if options.catch_callback_panics {
            Rc::new(CatchPanics::new())
        } else {
            Rc::new(DirectHandler)
        };
        debug!(event_loop = raw.id(), ?options, "event loop created");
        Self {
            inner: Rc::new(LoopInner {
                raw,
                engine,
                events: rx,
                bindings: RefCell::new(HashMap::new()),
                handler: RefCell::new(handler),
                options,
                running: Cell::new(false),
                stop_requested: Cell::new(false),
            }),
        }
    }

    /// The engine token for this loop.
    pub fn raw(&self) -> RawLoop {
        self.inner.raw
    }

    /// Replace the trampoline used to invoke callbacks.
    pub fn set_callback_handler(&self, handler: Rc<dyn CallbackHandler>) {
        *self.inner.handler.borrow_mut() = handler;
    }

    /// Run `callback` through the loop's callback handler.
    pub fn invoke_on_loop_thread(&self, kind: EventKind, stream: RawStream, callback: &mut dyn FnMut()) {
        let handler = Rc::clone(&self.inner.handler.borrow());
        handler.invoke(kind, stream, callback);
    }

    /// Poll the engine and dispatch completions.
    ///
    /// Returns whether any handle is still bound to the loop. Calling `run`
    /// from inside a callback fails with [`Error::Busy`].
    pub fn run(&self, mode: RunMode) -> Result<bool> {
        if self.inner.running.replace(true) {
            return Err(Error::Busy);
        }
        let _running = RunningGuard(&self.inner.running);
        self.inner.stop_requested.set(false);

        loop {
            let progressed = self.inner.engine.poll(self.inner.raw);
            let dispatched = self.drain();
            trace!(event_loop = self.inner.raw.id(), progressed, dispatched, "loop pass");

            if self.inner.stop_requested.get() || mode != RunMode::Default {
                break;
            }
            if !progressed && dispatched == 0 {
                break;
            }
        }
        Ok(self.is_alive())
    }

    /// Make the current [`run`](Self::run) return after its current pass.
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    /// Request close on every handle bound to this loop.
    pub fn close_all(&self) {
        let open: Vec<StreamHandle> = self
            .inner
            .bindings
            .borrow()
            .values()
            .filter_map(|b| match b {
                Binding::Open(weak) => weak.upgrade().map(StreamHandle::from_inner),
                Binding::Closing(_) => None,
            })
            .collect();
        debug!(event_loop = self.inner.raw.id(), count = open.len(), "closing all handles");
        for stream in open {
            stream.close();
        }
    }

    /// Descriptions of every handle bound to this loop.
    pub fn handles(&self) -> Vec<String> {
        let mut tokens: Vec<RawStream> = self.inner.bindings.borrow().keys().copied().collect();
        tokens.sort();
        tokens
            .into_iter()
            .map(|raw| self.inner.engine.describe(raw))
            .collect()
    }

    /// Whether any handle is bound or any completion is waiting.
    pub fn is_alive(&self) -> bool {
        !self.inner.bindings.borrow().is_empty() || !self.inner.events.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    fn drain(&self) -> usize {
        let limit = match self.inner.options.max_events_per_tick {
            0 => usize::MAX,
            n => n,
        };
        let mut dispatched = 0;
        while dispatched < limit {
            let Ok(event) = self.inner.events.try_recv() else {
                break;
            };
            self.dispatch(event);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(&self, event: NativeEvent) {
        let raw = event.stream();
        let target = if matches!(event, NativeEvent::Close { .. }) {
            match self.inner.bindings.borrow_mut().remove(&raw) {
                Some(Binding::Open(weak)) => weak.upgrade(),
                Some(Binding::Closing(inner)) => Some(inner),
                None => None,
            }
        } else {
            match self.inner.bindings.borrow().get(&raw) {
                Some(Binding::Open(weak)) => weak.upgrade(),
                Some(Binding::Closing(inner)) => Some(Rc::clone(inner)),
                None => None,
            }
        };

        match target {
            Some(inner) => StreamHandle::from_inner(inner).on_native_event(event),
            None => trace!(stream = raw.id(), ?event, "event for unbound stream dropped"),
        }
    }

    pub(crate) fn register(&self, raw: RawStream, inner: Weak<StreamInner>) {
        self.inner.bindings.borrow_mut().insert(raw, Binding::Open(inner));
    }

    /// Hold a strong reference until the engine reports `Close`.
    pub(crate) fn mark_closing(&self, raw: RawStream, inner: Rc<StreamInner>) {
        if let Some(binding) = self.inner.bindings.borrow_mut().get_mut(&raw) {
            *binding = Binding::Closing(inner);
        }
    }

    pub(crate) fn engine(&self) -> Arc<dyn NativeEngine> {
        Arc::clone(&self.inner.engine)
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<LoopInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("raw", &self.inner.raw)
            .field("handles", &self.inner.bindings.borrow().len())
            .field("running", &self.inner.running.get())
            .finish()
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    #[test]
    fn test_empty_loop_runs_to_completion() {
        let event_loop = EventLoop::new(Arc::new(MemoryEngine::new()));
        assert!(!event_loop.run(RunMode::Default).unwrap());
        assert!(!event_loop.is_running());
        assert!(event_loop.handles().is_empty());
    }

    #[test]
    fn test_catch_panics_counts() {
        let handler = CatchPanics::new();
        let mut cb = || panic!("boom");
        handler.invoke(EventKind::Close, RawStream::invalid(), &mut cb);
        assert_eq!(handler.caught(), 1);
    }

    #[test]
    fn test_direct_handler_runs_callback() {
        let mut ran = false;
        DirectHandler.invoke(EventKind::Write, RawStream::invalid(), &mut || ran = true);
        assert!(ran);
    }
}
