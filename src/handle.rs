//! Native resource ownership.
//!
//! A [`NativeHandle`] pairs one engine token with the loop that services it.
//! It performs no I/O itself; it only guarantees the token is used while
//! valid and released exactly once.

use std::cell::Cell;
use std::rc::Weak;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopInner};
use crate::ffi::{self, NativeEngine, RawStream};
use crate::types::HandleType;

pub(crate) struct NativeHandle {
    raw: RawStream,
    kind: HandleType,
    engine: Arc<dyn NativeEngine>,
    event_loop: Weak<LoopInner>,
    disposed: Cell<bool>,
}

impl NativeHandle {
    /// Allocate a native stream on `event_loop` and bind to it.
    ///
    /// Fails without leaving anything allocated if the engine refuses.
    pub(crate) fn open(event_loop: &EventLoop, kind: HandleType) -> Result<Self> {
        let engine = event_loop.engine();
        let raw = engine
            .stream_new(event_loop.raw(), kind)
            .map_err(ffi::error_from_status)?;
        if !raw.is_valid() {
            return Err(Error::InvalidHandle);
        }
        Ok(Self::bind(raw, kind, event_loop))
    }

    /// Wrap a token the engine already issued for `event_loop`.
    pub(crate) fn bind(raw: RawStream, kind: HandleType, event_loop: &EventLoop) -> Self {
        debug!(stream = raw.id(), ?kind, "native handle bound");
        Self {
            raw,
            kind,
            engine: event_loop.engine(),
            event_loop: event_loop.downgrade(),
            disposed: Cell::new(false),
        }
    }

    /// The token, or `InvalidHandle` once disposed.
    pub(crate) fn raw(&self) -> Result<RawStream> {
        if self.disposed.get() {
            return Err(Error::InvalidHandle);
        }
        Ok(self.raw)
    }

    /// The token regardless of disposal, for logging and registry lookups.
    pub(crate) fn token(&self) -> RawStream {
        self.raw
    }

    pub(crate) fn kind(&self) -> HandleType {
        self.kind
    }

    pub(crate) fn engine(&self) -> &dyn NativeEngine {
        self.engine.as_ref()
    }

    pub(crate) fn event_loop(&self) -> Option<EventLoop> {
        EventLoop::upgrade(&self.event_loop)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Mark the token released. Returns `false` if it already was.
    pub(crate) fn dispose(&self) -> bool {
        if self.disposed.replace(true) {
            return false;
        }
        debug!(stream = self.raw.id(), "native handle disposed");
        true
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("disposed", &self.disposed.get())
            .finish()
    }
}
