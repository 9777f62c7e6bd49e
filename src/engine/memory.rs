//! In-process engine.
//!
//! Streams live in a slab and are named by tokens that pack the slab index
//! with a generation, so a stale token never reaches a reused slot.
//! Connections are pairs of endpoints exchanging byte chunks; all of them
//! may be spread across several loops.
//!
//! Each [`poll`](NativeEngine::poll) pass visits the loop's streams in slab
//! order and, per stream, finishes a requested close, resolves a pending
//! connect, flushes at most one queued write, completes a half-close once
//! the write queue is empty and delivers at most one inbound chunk. Doing
//! one write per pass keeps the write queue depth observable between
//! completions.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::ffi::{
    NativeEngine, NativeEvent, RawLoop, RawStream, Status, UV_EADDRINUSE, UV_EAGAIN, UV_EALREADY,
    UV_EBADF, UV_ECANCELED, UV_ECONNREFUSED, UV_ECONNRESET, UV_EINVAL, UV_EISCONN, UV_ENOMEM,
    UV_ENOTCONN, UV_ENOTSUP, UV_EOF, UV_EPIPE, UV_OK,
};
use crate::types::{EngineStats, HandleType, MemoryEngineOptions};

const INDEX_MASK: u64 = 0xFFFF_FFFF;

fn pack(index: usize, generation: u32) -> u64 {
    (u64::from(generation) << 32) | (index as u64 + 1)
}

fn unpack(id: u64) -> Option<usize> {
    match id & INDEX_MASK {
        0 => None,
        low => Some((low - 1) as usize),
    }
}

struct LoopSlot {
    token: RawLoop,
    events: Sender<NativeEvent>,
}

enum Link {
    Idle,
    Connecting(String),
    /// `peer` is `None` while waiting to be accepted.
    Connected { peer: Option<RawStream> },
    /// The peer went away; buffered inbound data is still readable.
    Broken,
    Listening {
        backlog: u32,
        pending: VecDeque<RawStream>,
    },
}

impl Link {
    fn label(&self) -> &'static str {
        match self {
            Link::Idle => "idle",
            Link::Connecting(_) => "connecting",
            Link::Connected { peer: Some(_) } => "connected",
            Link::Connected { peer: None } => "pending",
            Link::Broken => "broken",
            Link::Listening { .. } => "listening",
        }
    }
}

enum Inbound {
    Data {
        data: Bytes,
        handle: Option<(RawStream, HandleType)>,
    },
    Eof,
    Reset,
}

struct WriteReq {
    data: Bytes,
    send: Option<RawStream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfClose {
    Open,
    Requested,
    Done,
}

struct Endpoint {
    token: RawStream,
    lp: RawLoop,
    kind: HandleType,
    addr: Option<String>,
    link: Link,
    /// `Some(with_handles)` while reading.
    reading: Option<bool>,
    read_eof: bool,
    inbound: VecDeque<Inbound>,
    /// Completions handed back after reading stopped; read before `inbound`.
    returned: VecDeque<Inbound>,
    writes: VecDeque<WriteReq>,
    queued: usize,
    half_close: HalfClose,
    closing: bool,
    /// Handles delivered through `Read2` and not yet accepted.
    received: VecDeque<(RawStream, HandleType)>,
}

impl Endpoint {
    fn new(token: RawStream, lp: RawLoop, kind: HandleType) -> Self {
        Self {
            token,
            lp,
            kind,
            addr: None,
            link: Link::Idle,
            reading: None,
            read_eof: false,
            inbound: VecDeque::new(),
            returned: VecDeque::new(),
            writes: VecDeque::new(),
            queued: 0,
            half_close: HalfClose::Open,
            closing: false,
            received: VecDeque::new(),
        }
    }
}

enum WriteStep {
    Flush(RawStream),
    Fail,
}

#[derive(Default)]
struct EngineState {
    loops: Slab<LoopSlot>,
    streams: Slab<Endpoint>,
    names: HashMap<String, RawStream>,
    generation: u32,
    stats: EngineStats,
}

impl EngineState {
    fn next_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn has_loop(&self, lp: RawLoop) -> bool {
        unpack(lp.id())
            .and_then(|i| self.loops.get(i))
            .is_some_and(|slot| slot.token == lp)
    }

    fn get(&self, token: RawStream) -> Option<&Endpoint> {
        let index = unpack(token.id())?;
        self.streams.get(index).filter(|ep| ep.token == token)
    }

    fn get_mut(&mut self, token: RawStream) -> Option<&mut Endpoint> {
        let index = unpack(token.id())?;
        self.streams.get_mut(index).filter(|ep| ep.token == token)
    }

    fn remove(&mut self, token: RawStream) -> Option<Endpoint> {
        self.get(token)?;
        let index = unpack(token.id())?;
        Some(self.streams.remove(index))
    }

    fn emit(&self, lp: RawLoop, event: NativeEvent) {
        let slot = unpack(lp.id())
            .and_then(|i| self.loops.get(i))
            .filter(|slot| slot.token == lp);
        match slot {
            Some(slot) => {
                if slot.events.send(event).is_err() {
                    trace!(event_loop = lp.id(), "loop receiver gone, event dropped");
                }
            }
            None => trace!(event_loop = lp.id(), ?event, "loop unregistered, event dropped"),
        }
    }

    /// The other end of `peer`'s connection is gone.
    fn peer_gone(&mut self, peer: RawStream, marker: Inbound) {
        if let Some(ep) = self.get_mut(peer) {
            ep.link = Link::Broken;
            ep.inbound.push_back(marker);
        }
    }

    /// Remove a pending connector from every listen queue.
    fn withdraw(&mut self, token: RawStream) {
        for (_, ep) in self.streams.iter_mut() {
            if let Link::Listening { pending, .. } = &mut ep.link {
                pending.retain(|t| *t != token);
            }
        }
    }

    fn step(&mut self, token: RawStream, chunk: usize) -> bool {
        let closing = match self.get(token) {
            Some(ep) => ep.closing,
            None => return false,
        };
        if closing {
            self.finish_close(token);
            return true;
        }

        let mut progressed = self.step_connect(token);
        progressed |= self.step_write(token);
        progressed |= self.step_half_close(token);
        progressed |= self.step_read(token, chunk);
        progressed
    }

    fn finish_close(&mut self, token: RawStream) {
        let Some(ep) = self.remove(token) else {
            return;
        };
        let lp = ep.lp;

        for _ in 0..ep.writes.len() {
            self.emit(lp, NativeEvent::Write { stream: token, status: UV_ECANCELED });
        }
        if ep.half_close == HalfClose::Requested {
            self.emit(lp, NativeEvent::Shutdown { stream: token, status: UV_ECANCELED });
        }

        match ep.link {
            Link::Connected { peer: Some(peer) } => self.peer_gone(peer, Inbound::Eof),
            Link::Connected { peer: None } => self.withdraw(token),
            Link::Connecting(_) => {
                self.emit(lp, NativeEvent::Connect { stream: token, status: UV_ECANCELED });
            }
            Link::Listening { pending, .. } => {
                for peer in pending {
                    self.peer_gone(peer, Inbound::Reset);
                }
            }
            Link::Idle | Link::Broken => {}
        }
        for (peer, _) in ep.received {
            self.peer_gone(peer, Inbound::Reset);
        }
        for item in ep.returned.into_iter().chain(ep.inbound) {
            if let Inbound::Data { handle: Some((peer, _)), .. } = item {
                self.peer_gone(peer, Inbound::Reset);
            }
        }
        if let Some(addr) = ep.addr {
            if self.names.get(&addr) == Some(&token) {
                self.names.remove(&addr);
            }
        }

        self.stats.handles_closed += 1;
        debug!(stream = token.id(), "native stream torn down");
        self.emit(lp, NativeEvent::Close { stream: token });
    }

    fn step_connect(&mut self, token: RawStream) -> bool {
        let (lp, kind, addr) = match self.get(token) {
            Some(Endpoint {
                lp,
                kind,
                link: Link::Connecting(addr),
                ..
            }) => (*lp, *kind, addr.clone()),
            _ => return false,
        };

        let mut accepted_by = None;
        if let Some(listener) = self.names.get(&addr).copied().filter(|l| *l != token) {
            if let Some(lep) = self.get_mut(listener) {
                let listener_loop = lep.lp;
                // A listener only takes connections of its own transport.
                if !lep.closing && lep.kind == kind {
                    if let Link::Listening { backlog, pending } = &mut lep.link {
                        if (pending.len() as u32) < *backlog {
                            pending.push_back(token);
                            accepted_by = Some((listener, listener_loop));
                        }
                    }
                }
            }
        }

        let status = if accepted_by.is_some() { UV_OK } else { UV_ECONNREFUSED };
        if let Some(ep) = self.get_mut(token) {
            ep.link = if accepted_by.is_some() {
                Link::Connected { peer: None }
            } else {
                Link::Idle
            };
        }
        trace!(stream = token.id(), addr = %addr, status, "connect resolved");
        self.emit(lp, NativeEvent::Connect { stream: token, status });
        if let Some((listener, listener_loop)) = accepted_by {
            self.emit(listener_loop, NativeEvent::Connection { stream: listener, status: UV_OK });
        }
        true
    }

    fn step_write(&mut self, token: RawStream) -> bool {
        let Some(ep) = self.get(token) else {
            return false;
        };
        if ep.writes.is_empty() {
            return false;
        }
        let lp = ep.lp;
        let step = match &ep.link {
            Link::Connected { peer: Some(peer) } => WriteStep::Flush(*peer),
            Link::Connected { peer: None } | Link::Connecting(_) => return false,
            Link::Idle | Link::Broken | Link::Listening { .. } => WriteStep::Fail,
        };

        match step {
            WriteStep::Flush(peer) => self.flush_one(token, lp, peer),
            WriteStep::Fail => self.fail_writes(token, lp, UV_EPIPE),
        }
        true
    }

    fn flush_one(&mut self, token: RawStream, lp: RawLoop, peer: RawStream) {
        let req = self.get_mut(token).and_then(|ep| {
            let req = ep.writes.pop_front()?;
            ep.queued = ep.queued.saturating_sub(req.data.len());
            Some(req)
        });
        let Some(req) = req else {
            return;
        };

        let handle = match req.send {
            Some(donor) => match self.detach(donor) {
                Ok(handle) => Some(handle),
                Err(status) => {
                    self.emit(lp, NativeEvent::Write { stream: token, status });
                    return;
                }
            },
            None => None,
        };

        let status = match self.get_mut(peer) {
            Some(pep) if !pep.closing => {
                pep.inbound.push_back(Inbound::Data {
                    data: req.data,
                    handle,
                });
                UV_OK
            }
            _ => {
                if let Some((remote, _)) = handle {
                    self.peer_gone(remote, Inbound::Reset);
                }
                UV_EPIPE
            }
        };
        trace!(stream = token.id(), status, "write flushed");
        self.emit(lp, NativeEvent::Write { stream: token, status });
    }

    fn fail_writes(&mut self, token: RawStream, lp: RawLoop, status: Status) {
        let failed = match self.get_mut(token) {
            Some(ep) => {
                ep.queued = 0;
                std::mem::take(&mut ep.writes).len()
            }
            None => 0,
        };
        for _ in 0..failed {
            self.emit(lp, NativeEvent::Write { stream: token, status });
        }
    }

    /// Move the donor's connection out so it can travel with a write.
    fn detach(&mut self, donor: RawStream) -> Result<(RawStream, HandleType), Status> {
        let Some(dep) = self.get_mut(donor) else {
            return Err(UV_EBADF);
        };
        if dep.closing {
            return Err(UV_EBADF);
        }
        let remote = match &dep.link {
            Link::Connected { peer: Some(remote) } => *remote,
            _ => return Err(UV_ENOTCONN),
        };
        let kind = dep.kind;
        dep.link = Link::Idle;
        dep.reading = None;

        if let Some(rep) = self.get_mut(remote) {
            rep.link = Link::Connected { peer: None };
        }
        debug!(donor = donor.id(), remote = remote.id(), "connection detached for transfer");
        Ok((remote, kind))
    }

    fn step_half_close(&mut self, token: RawStream) -> bool {
        let Some(ep) = self.get(token) else {
            return false;
        };
        if ep.half_close != HalfClose::Requested || !ep.writes.is_empty() {
            return false;
        }
        let lp = ep.lp;
        let (status, peer) = match &ep.link {
            Link::Connected { peer: Some(peer) } => (UV_OK, Some(*peer)),
            Link::Connected { peer: None } | Link::Connecting(_) => return false,
            Link::Idle | Link::Broken | Link::Listening { .. } => (UV_ENOTCONN, None),
        };

        if let Some(pep) = peer.and_then(|p| self.get_mut(p)) {
            pep.inbound.push_back(Inbound::Eof);
        }
        if let Some(ep) = self.get_mut(token) {
            ep.half_close = HalfClose::Done;
        }
        self.emit(lp, NativeEvent::Shutdown { stream: token, status });
        true
    }

    fn step_read(&mut self, token: RawStream, chunk: usize) -> bool {
        let Some(ep) = self.get_mut(token) else {
            return false;
        };
        let Some(with_handles) = ep.reading else {
            return false;
        };
        if ep.read_eof {
            return false;
        }
        let (item, from_returned) = match ep.returned.pop_front() {
            Some(item) => (item, true),
            None => match ep.inbound.pop_front() {
                Some(item) => (item, false),
                None => return false,
            },
        };
        let lp = ep.lp;

        let mut dropped = None;
        let (status, data, pending) = match item {
            Inbound::Data { mut data, handle } => {
                if data.len() > chunk {
                    let rest = Inbound::Data { data: data.split_off(chunk), handle: None };
                    if from_returned {
                        ep.returned.push_front(rest);
                    } else {
                        ep.inbound.push_front(rest);
                    }
                }
                let pending = match handle {
                    Some((remote, kind)) if with_handles => {
                        ep.received.push_back((remote, kind));
                        kind
                    }
                    Some((remote, _)) => {
                        dropped = Some(remote);
                        HandleType::Unknown
                    }
                    None => HandleType::Unknown,
                };
                (UV_OK, data, pending)
            }
            Inbound::Eof => {
                ep.read_eof = true;
                (UV_EOF, Bytes::new(), HandleType::Unknown)
            }
            Inbound::Reset => {
                ep.read_eof = true;
                (UV_ECONNRESET, Bytes::new(), HandleType::Unknown)
            }
        };

        if let Some(remote) = dropped {
            warn!(stream = token.id(), remote = remote.id(), "handle received while not reading handles, dropped");
            self.peer_gone(remote, Inbound::Reset);
        }
        let event = if with_handles {
            NativeEvent::Read2 {
                stream: token,
                status,
                data,
                pending,
            }
        } else {
            NativeEvent::Read {
                stream: token,
                status,
                data,
            }
        };
        self.emit(lp, event);
        true
    }

    fn check_write(&self, stream: RawStream, send: Option<RawStream>) -> Status {
        let Some(ep) = self.get(stream) else {
            return UV_EBADF;
        };
        if ep.closing {
            return UV_EBADF;
        }
        if ep.half_close != HalfClose::Open {
            return UV_EPIPE;
        }
        match ep.link {
            Link::Connected { .. } | Link::Connecting(_) => {}
            Link::Broken => return UV_EPIPE,
            Link::Idle | Link::Listening { .. } => return UV_ENOTCONN,
        }

        let Some(donor) = send else {
            return UV_OK;
        };
        if !ep.kind.supports_ipc() || donor == stream {
            return UV_EINVAL;
        }
        match self.get(donor) {
            None => UV_EBADF,
            Some(dep) if dep.closing => UV_EBADF,
            Some(dep) if dep.lp != ep.lp || !dep.kind.is_transferable() => UV_EINVAL,
            Some(Endpoint {
                link: Link::Connected { peer: Some(_) },
                ..
            }) => UV_OK,
            Some(_) => UV_ENOTCONN,
        }
    }
}

/// An engine that keeps every stream in process memory.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use uvstream::{EventLoop, MemoryEngine, MemoryEngineOptions};
///
/// let engine = Arc::new(MemoryEngine::with_options(MemoryEngineOptions {
///     read_chunk_size: 1024,
///     ..Default::default()
/// }));
/// let event_loop = EventLoop::new(engine.clone());
/// assert_eq!(engine.stats().handles_opened, 0);
/// # drop(event_loop);
/// ```
pub struct MemoryEngine {
    options: MemoryEngineOptions,
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_options(MemoryEngineOptions::default())
    }

    pub fn with_options(options: MemoryEngineOptions) -> Self {
        Self {
            options,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn options(&self) -> &MemoryEngineOptions {
        &self.options
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.state.lock().stats
    }

    /// Number of native streams currently allocated.
    pub fn live_handles(&self) -> usize {
        self.state.lock().streams.len()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MemoryEngine")
            .field("options", &self.options)
            .field("loops", &st.loops.len())
            .field("streams", &st.streams.len())
            .field("stats", &st.stats)
            .finish()
    }
}

impl NativeEngine for MemoryEngine {
    fn register_loop(&self, events: Sender<NativeEvent>) -> RawLoop {
        let mut st = self.state.lock();
        let generation = st.next_generation();
        let entry = st.loops.vacant_entry();
        let token = RawLoop::from_raw(pack(entry.key(), generation));
        entry.insert(LoopSlot { token, events });
        debug!(event_loop = token.id(), "loop registered");
        token
    }

    fn unregister_loop(&self, lp: RawLoop) {
        let mut st = self.state.lock();
        let Some(index) = unpack(lp.id()).filter(|_| st.has_loop(lp)) else {
            return;
        };
        st.loops.remove(index);

        let tokens: Vec<RawStream> = st
            .streams
            .iter()
            .filter(|(_, ep)| ep.lp == lp)
            .map(|(_, ep)| ep.token)
            .collect();
        debug!(event_loop = lp.id(), streams = tokens.len(), "loop unregistered");
        for token in tokens {
            st.finish_close(token);
        }
    }

    fn stream_new(&self, lp: RawLoop, kind: HandleType) -> Result<RawStream, Status> {
        if kind == HandleType::Unknown {
            return Err(UV_EINVAL);
        }
        let mut st = self.state.lock();
        if !st.has_loop(lp) {
            return Err(UV_EBADF);
        }
        if st.streams.len() >= self.options.max_handles {
            warn!(limit = self.options.max_handles, "native stream limit reached");
            return Err(UV_ENOMEM);
        }
        let generation = st.next_generation();
        let entry = st.streams.vacant_entry();
        let token = RawStream::from_raw(pack(entry.key(), generation));
        entry.insert(Endpoint::new(token, lp, kind));
        st.stats.handles_opened += 1;
        Ok(token)
    }

    fn read_start(&self, stream: RawStream, with_handles: bool) -> Status {
        let mut st = self.state.lock();
        st.stats.read_starts += 1;
        let Some(ep) = st.get_mut(stream) else {
            return UV_EBADF;
        };
        if ep.closing {
            return UV_EBADF;
        }
        if with_handles && !ep.kind.supports_ipc() {
            return UV_ENOTSUP;
        }
        match ep.link {
            Link::Connecting(_) | Link::Connected { .. } | Link::Broken => {
                ep.reading = Some(with_handles);
                UV_OK
            }
            Link::Idle | Link::Listening { .. } => UV_ENOTCONN,
        }
    }

    fn read_stop(&self, stream: RawStream) -> Status {
        let mut st = self.state.lock();
        match st.get_mut(stream) {
            Some(ep) => {
                ep.reading = None;
                UV_OK
            }
            None => UV_EBADF,
        }
    }

    fn unread(&self, stream: RawStream, status: Status, data: Bytes, pending: HandleType) {
        let mut st = self.state.lock();
        let Some(ep) = st.get_mut(stream) else {
            return;
        };
        let item = match status {
            UV_EOF => Inbound::Eof,
            s if s < 0 => Inbound::Reset,
            _ => {
                let handle = match pending {
                    HandleType::Unknown => None,
                    _ => ep.received.pop_front(),
                };
                Inbound::Data { data, handle }
            }
        };
        if matches!(item, Inbound::Eof | Inbound::Reset) {
            ep.read_eof = false;
        }
        ep.returned.push_back(item);
        trace!(stream = stream.id(), status, "read completion handed back");
    }

    fn write(&self, stream: RawStream, data: &[u8], send_handle: Option<RawStream>) -> Status {
        let mut st = self.state.lock();
        let status = st.check_write(stream, send_handle);
        if status != UV_OK {
            return status;
        }
        if let Some(ep) = st.get_mut(stream) {
            ep.writes.push_back(WriteReq {
                data: Bytes::copy_from_slice(data),
                send: send_handle,
            });
            ep.queued += data.len();
        }
        st.stats.writes_queued += 1;
        UV_OK
    }

    fn write_queue_size(&self, stream: RawStream) -> usize {
        self.state.lock().get(stream).map_or(0, |ep| ep.queued)
    }

    fn shutdown(&self, stream: RawStream) -> Status {
        let mut st = self.state.lock();
        let Some(ep) = st.get_mut(stream) else {
            return UV_EBADF;
        };
        if ep.closing {
            return UV_EBADF;
        }
        if ep.half_close != HalfClose::Open {
            return UV_EPIPE;
        }
        match ep.link {
            Link::Connecting(_) | Link::Connected { .. } => {
                ep.half_close = HalfClose::Requested;
                UV_OK
            }
            Link::Idle | Link::Broken | Link::Listening { .. } => UV_ENOTCONN,
        }
    }

    fn close(&self, stream: RawStream) {
        let mut st = self.state.lock();
        st.stats.close_requests += 1;
        if let Some(ep) = st.get_mut(stream) {
            if !ep.closing {
                ep.closing = true;
                ep.reading = None;
                trace!(stream = stream.id(), "teardown scheduled");
            }
        }
    }

    fn bind(&self, stream: RawStream, addr: &str) -> Status {
        let mut st = self.state.lock();
        let Some(ep) = st.get(stream) else {
            return UV_EBADF;
        };
        if ep.kind == HandleType::Tty {
            return UV_ENOTSUP;
        }
        if addr.is_empty() || ep.addr.is_some() {
            return UV_EINVAL;
        }
        if st.names.contains_key(addr) {
            return UV_EADDRINUSE;
        }
        st.names.insert(addr.to_string(), stream);
        if let Some(ep) = st.get_mut(stream) {
            ep.addr = Some(addr.to_string());
        }
        UV_OK
    }

    fn connect(&self, stream: RawStream, addr: &str) -> Status {
        let mut st = self.state.lock();
        let Some(ep) = st.get_mut(stream) else {
            return UV_EBADF;
        };
        if ep.kind == HandleType::Tty {
            return UV_ENOTSUP;
        }
        match ep.link {
            Link::Idle => {
                ep.link = Link::Connecting(addr.to_string());
                UV_OK
            }
            Link::Connecting(_) => UV_EALREADY,
            Link::Connected { .. } | Link::Broken => UV_EISCONN,
            Link::Listening { .. } => UV_EINVAL,
        }
    }

    fn listen(&self, stream: RawStream, backlog: u32) -> Status {
        let capped = backlog.min(self.options.max_backlog).max(1);
        let mut st = self.state.lock();
        let Some(ep) = st.get_mut(stream) else {
            return UV_EBADF;
        };
        if ep.kind == HandleType::Tty {
            return UV_ENOTSUP;
        }
        if ep.addr.is_none() {
            return UV_EINVAL;
        }
        if let Link::Listening { backlog, .. } = &mut ep.link {
            *backlog = capped;
            return UV_OK;
        }
        if !matches!(ep.link, Link::Idle) {
            return UV_EINVAL;
        }
        ep.link = Link::Listening {
            backlog: capped,
            pending: VecDeque::new(),
        };
        UV_OK
    }

    fn accept(&self, server: RawStream, client: RawStream) -> Status {
        let mut st = self.state.lock();
        let client_kind = match st.get(client) {
            None => return UV_EBADF,
            Some(c) if c.closing => return UV_EBADF,
            Some(c) if !matches!(c.link, Link::Idle) => return UV_EISCONN,
            Some(c) => c.kind,
        };

        let Some(sep) = st.get_mut(server) else {
            return UV_EBADF;
        };
        let server_kind = sep.kind;
        let front = match &sep.link {
            Link::Listening { pending, .. } => pending.front().map(|p| (*p, server_kind)),
            _ => sep.received.front().copied(),
        };
        let Some((remote, kind)) = front else {
            return UV_EAGAIN;
        };
        if kind != client_kind {
            return UV_EINVAL;
        }
        match &mut sep.link {
            Link::Listening { pending, .. } => {
                pending.pop_front();
            }
            _ => {
                sep.received.pop_front();
            }
        }

        let waiting = st
            .get(remote)
            .is_some_and(|r| !r.closing && matches!(r.link, Link::Connected { peer: None }));
        if !waiting {
            return UV_ECONNRESET;
        }
        if let Some(rep) = st.get_mut(remote) {
            rep.link = Link::Connected { peer: Some(client) };
        }
        if let Some(cep) = st.get_mut(client) {
            cep.link = Link::Connected { peer: Some(remote) };
        }
        debug!(server = server.id(), client = client.id(), remote = remote.id(), "connection accepted");
        UV_OK
    }

    fn reject_pending(&self, server: RawStream) {
        let mut st = self.state.lock();
        let Some(sep) = st.get_mut(server) else {
            return;
        };
        let victim = match &mut sep.link {
            Link::Listening { pending, .. } => pending.pop_front(),
            _ => sep.received.pop_front().map(|(remote, _)| remote),
        };
        if let Some(remote) = victim {
            debug!(server = server.id(), remote = remote.id(), "pending connection rejected");
            st.peer_gone(remote, Inbound::Reset);
        }
    }

    fn is_readable(&self, stream: RawStream) -> bool {
        self.state.lock().get(stream).is_some_and(|ep| {
            !ep.closing && !ep.read_eof && matches!(ep.link, Link::Connected { .. })
        })
    }

    fn is_writable(&self, stream: RawStream) -> bool {
        self.state.lock().get(stream).is_some_and(|ep| {
            !ep.closing
                && ep.half_close == HalfClose::Open
                && matches!(ep.link, Link::Connected { .. })
        })
    }

    fn describe(&self, stream: RawStream) -> String {
        let st = self.state.lock();
        let Some(ep) = st.get(stream) else {
            return format!("[---] {:#x} released", stream.id());
        };
        let flags = [
            if ep.reading.is_some() { 'R' } else { '-' },
            if ep.writes.is_empty() { '-' } else { 'W' },
            if ep.closing { 'C' } else { '-' },
        ];
        let at = ep
            .addr
            .as_deref()
            .map(|a| format!(" @{a}"))
            .unwrap_or_default();
        format!(
            "[{}] {:?} {:#x} {}{}",
            flags.iter().collect::<String>(),
            ep.kind,
            stream.id(),
            ep.link.label(),
            at
        )
    }

    fn poll(&self, lp: RawLoop) -> bool {
        let mut st = self.state.lock();
        if !st.has_loop(lp) {
            return false;
        }
        let tokens: Vec<RawStream> = st
            .streams
            .iter()
            .filter(|(_, ep)| ep.lp == lp)
            .map(|(_, ep)| ep.token)
            .collect();
        let chunk = self.options.read_chunk_size.max(1);

        let mut progressed = false;
        for token in tokens {
            progressed |= st.step(token, chunk);
        }
        progressed
    }
}
