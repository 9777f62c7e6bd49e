//! Per-handle callback storage.
//!
//! One slot per [`EventKind`]. Registering replaces whatever the slot held;
//! there is no multicast. An empty slot is a valid configuration: the event
//! is dropped without error.

use bytes::Bytes;

use crate::error::Result;
use crate::stream::StreamHandle;
use crate::types::HandleType;

/// Kinds of events a stream handle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Read,
    Read2,
    Write,
    Connect,
    Connection,
    Close,
    Shutdown,
}

impl EventKind {
    /// Number of kinds, i.e. registry slots.
    pub const COUNT: usize = 7;

    /// All kinds, in slot order.
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Read,
        EventKind::Read2,
        EventKind::Write,
        EventKind::Connect,
        EventKind::Connection,
        EventKind::Close,
        EventKind::Shutdown,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Receives inbound data, `Err(Error::Eof)` at end of stream, or a read error.
pub type ReadCallback = Box<dyn FnMut(&StreamHandle, Result<Bytes>)>;

/// Like [`ReadCallback`], plus the kind of handle that arrived with the data
/// ([`HandleType::Unknown`] if none). Claim it with `accept` inside the call.
pub type Read2Callback = Box<dyn FnMut(&StreamHandle, Result<Bytes>, HandleType)>;

/// Receives the outcome of a write, connect, shutdown or incoming connection.
pub type StatusCallback = Box<dyn FnMut(&StreamHandle, Result<()>)>;

/// Runs once the native stream is gone.
pub type CloseCallback = Box<dyn FnMut(&StreamHandle)>;

/// A registered callback, tagged with the event kind it serves.
pub enum Callback {
    Read(ReadCallback),
    Read2(Read2Callback),
    Write(StatusCallback),
    Connect(StatusCallback),
    Connection(StatusCallback),
    Close(CloseCallback),
    Shutdown(StatusCallback),
}

impl Callback {
    /// The slot this callback lives in.
    pub fn kind(&self) -> EventKind {
        match self {
            Callback::Read(_) => EventKind::Read,
            Callback::Read2(_) => EventKind::Read2,
            Callback::Write(_) => EventKind::Write,
            Callback::Connect(_) => EventKind::Connect,
            Callback::Connection(_) => EventKind::Connection,
            Callback::Close(_) => EventKind::Close,
            Callback::Shutdown(_) => EventKind::Shutdown,
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Callback").field(&self.kind()).finish()
    }
}

/// A callback taken out of its slot for the duration of one invocation.
///
/// The generation lets [`CallbackRegistry::restore`] tell whether the slot
/// was replaced or cleared while the callback ran.
#[derive(Debug)]
pub struct Taken {
    callback: Callback,
    generation: u64,
}

impl Taken {
    pub fn callback_mut(&mut self) -> &mut Callback {
        &mut self.callback
    }
}

#[derive(Default)]
struct Slot {
    callback: Option<Callback>,
    generation: u64,
}

/// Tagged single-slot storage, one slot per [`EventKind`].
#[derive(Default)]
pub struct CallbackRegistry {
    slots: [Slot; EventKind::COUNT],
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `callback`, returning the one it replaced.
    pub fn set(&mut self, callback: Callback) -> Option<Callback> {
        let slot = &mut self.slots[callback.kind().slot()];
        slot.generation += 1;
        slot.callback.replace(callback)
    }

    /// Empty the slot for `kind`, returning what it held.
    pub fn clear(&mut self, kind: EventKind) -> Option<Callback> {
        let slot = &mut self.slots[kind.slot()];
        slot.generation += 1;
        slot.callback.take()
    }

    /// Empty every slot.
    pub fn clear_all(&mut self) {
        for kind in EventKind::ALL {
            self.clear(kind);
        }
    }

    pub fn is_set(&self, kind: EventKind) -> bool {
        self.slots[kind.slot()].callback.is_some()
    }

    /// Take the callback out so it can run without the registry borrowed.
    pub fn take(&mut self, kind: EventKind) -> Option<Taken> {
        let slot = &mut self.slots[kind.slot()];
        let generation = slot.generation;
        slot.callback.take().map(|callback| Taken {
            callback,
            generation,
        })
    }

    /// Put a taken callback back unless the slot changed in the meantime.
    ///
    /// Returns `false` if the callback was discarded.
    pub fn restore(&mut self, taken: Taken) -> bool {
        let slot = &mut self.slots[taken.callback.kind().slot()];
        if slot.generation == taken.generation && slot.callback.is_none() {
            slot.callback = Some(taken.callback);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|k| self.is_set(*k))
            .collect();
        f.debug_struct("CallbackRegistry").field("set", &set).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_cb() -> Callback {
        Callback::Close(Box::new(|_| {}))
    }

    #[test]
    fn test_set_replaces() {
        let mut reg = CallbackRegistry::new();
        assert!(reg.set(close_cb()).is_none());
        let old = reg.set(close_cb());
        assert!(matches!(old, Some(Callback::Close(_))));
        assert!(reg.is_set(EventKind::Close));
        assert!(!reg.is_set(EventKind::Read));
    }

    #[test]
    fn test_take_and_restore() {
        let mut reg = CallbackRegistry::new();
        reg.set(Callback::Write(Box::new(|_, _| {})));
        let taken = reg.take(EventKind::Write).unwrap();
        assert!(!reg.is_set(EventKind::Write));
        assert!(reg.restore(taken));
        assert!(reg.is_set(EventKind::Write));
    }

    #[test]
    fn test_restore_loses_to_replacement() {
        let mut reg = CallbackRegistry::new();
        reg.set(close_cb());
        let taken = reg.take(EventKind::Close).unwrap();
        reg.set(close_cb());
        assert!(!reg.restore(taken));
        assert!(reg.is_set(EventKind::Close));
    }

    #[test]
    fn test_restore_loses_to_clear() {
        let mut reg = CallbackRegistry::new();
        reg.set(close_cb());
        let taken = reg.take(EventKind::Close).unwrap();
        reg.clear(EventKind::Close);
        assert!(!reg.restore(taken));
        assert!(!reg.is_set(EventKind::Close));
    }

    #[test]
    fn test_take_empty_slot() {
        let mut reg = CallbackRegistry::new();
        assert!(reg.take(EventKind::Shutdown).is_none());
        reg.set(close_cb());
        reg.clear_all();
        assert!(!reg.is_set(EventKind::Close));
    }
}
