//! Handle lifecycle tests: construction, close, drop and loop control.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Fixture, Journal};
use uvstream::ffi::RawStream;
use uvstream::{
    CallbackHandler, Error, EventKind, HandleType, LoopOptions, MemoryEngineOptions, RunMode,
    StreamHandle, StreamState,
};

#[test]
fn test_close_is_idempotent() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    let journal = Journal::default();
    let j = journal.clone();
    stream.set_close_callback(move |_| j.push("close"));

    stream.close();
    stream.close();
    stream.close();
    assert_eq!(stream.state(), StreamState::Closing);
    assert_eq!(fx.engine.stats().close_requests, 1, "one teardown request");

    fx.run();
    stream.close();

    assert_eq!(journal.count("close"), 1, "onClose fires once");
    assert_eq!(fx.engine.stats().handles_closed, 1);
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn test_operations_after_close_fail() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);

    stream.close();
    assert_eq!(stream.write(b"x"), Err(Error::AlreadyClosed));
    assert_eq!(stream.listen(1), Err(Error::AlreadyClosed));

    fx.run();
    assert_eq!(stream.read_start(), Err(Error::InvalidHandle));
    assert_eq!(stream.close_write(), Err(Error::InvalidHandle));
    assert!(stream.write(b"x").unwrap_err().is_closed());
    assert!(!stream.is_readable());
    assert!(!stream.is_writable());
    assert_eq!(stream.write_queue_size(), 0);
}

#[test]
fn test_read_start_twice_issues_one_request() {
    let fx = Fixture::new();
    let (_server, client, _conn) = fx.connected_pair(HandleType::Tcp, "svc");
    let before = fx.engine.stats().read_starts;

    client.read_start().expect("read_start should succeed");
    client.read_start().expect("second read_start should be a no-op");

    assert!(client.is_reading());
    assert_eq!(client.state(), StreamState::Reading);
    assert_eq!(fx.engine.stats().read_starts - before, 1);

    client.read_stop().expect("read_stop should succeed");
    assert_eq!(client.state(), StreamState::Idle);
    client.read_stop().expect("read_stop is valid while stopped");

    client.read_start().expect("read_start after stop should succeed");
    assert_eq!(fx.engine.stats().read_starts - before, 2);
}

#[test]
fn test_read_stop_without_start() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    stream.read_stop().expect("read_stop should succeed");
    assert_eq!(stream.state(), StreamState::Bound);
}

#[test]
fn test_read_start_requires_connection() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    assert_eq!(stream.read_start(), Err(Error::NotConnected));
    assert!(!stream.is_reading());
}

#[test]
fn test_drop_closes_as_safety_net() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::NamedPipe);
    stream.bind("dropped").expect("bind should succeed");
    drop(stream);

    assert_eq!(fx.engine.stats().close_requests, 1);
    fx.run();
    assert_eq!(fx.engine.stats().handles_closed, 1);
    assert_eq!(fx.engine.live_handles(), 0);
    assert!(fx.event_loop.handles().is_empty());

    // The address is free again.
    let again = fx.stream(HandleType::NamedPipe);
    again.bind("dropped").expect("address should be released");
}

#[test]
fn test_close_callback_fires_after_wrapper_dropped() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    let journal = Journal::default();
    let j = journal.clone();
    stream.set_close_callback(move |s| {
        assert_eq!(s.state(), StreamState::Closed);
        j.push("close");
    });

    stream.close();
    drop(stream);
    fx.run();

    assert_eq!(journal.entries(), vec!["close"]);
    assert_eq!(fx.engine.stats().close_requests, 1);
}

#[test]
fn test_construction_failure_leaves_nothing_behind() {
    let fx = Fixture::with_options(
        MemoryEngineOptions {
            max_handles: 1,
            ..Default::default()
        },
        LoopOptions::default(),
    );
    let _first = fx.stream(HandleType::Tcp);

    let err = StreamHandle::new(&fx.event_loop, HandleType::Tcp).unwrap_err();
    assert_eq!(err, Error::OutOfMemory);
    assert_eq!(fx.event_loop.handles().len(), 1);

    let err = StreamHandle::new(&fx.event_loop, HandleType::Unknown).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
    assert_eq!(fx.engine.stats().handles_opened, 1);
}

#[test]
fn test_state_transitions() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    assert_eq!(stream.state(), StreamState::Bound);
    assert_eq!(stream.handle_type(), HandleType::Tcp);

    stream.bind("states").expect("bind should succeed");
    stream.listen(3).expect("listen should succeed");
    assert_eq!(stream.state(), StreamState::Listening);

    stream.close();
    assert_eq!(stream.state(), StreamState::Closing);
    assert!(stream.is_closed());

    fx.run();
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn test_listen_requires_bind() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    assert!(matches!(stream.listen(5), Err(Error::InvalidArgument(_))));
    assert_eq!(stream.state(), StreamState::Bound);
}

#[test]
fn test_bind_conflicts() {
    let fx = Fixture::new();
    let a = fx.stream(HandleType::Tcp);
    let b = fx.stream(HandleType::Tcp);
    let tty = fx.stream(HandleType::Tty);

    a.bind("taken").expect("bind should succeed");
    assert_eq!(b.bind("taken"), Err(Error::AddressInUse));
    assert_eq!(tty.bind("tty"), Err(Error::NotSupported));
}

#[test]
fn test_callback_replacement_and_clear() {
    let fx = Fixture::new();
    let (_server, client, _conn) = fx.connected_pair(HandleType::Tcp, "replace");
    let journal = Journal::default();

    let j = journal.clone();
    client.set_write_callback(move |_, _| j.push("first"));
    let j = journal.clone();
    client.set_write_callback(move |_, _| j.push("second"));

    client.write(b"one").expect("write should succeed");
    fx.run();
    assert_eq!(journal.entries(), vec!["second"]);

    client.clear_callback(EventKind::Write);
    client.write(b"two").expect("write should succeed");
    fx.run();
    assert_eq!(journal.entries(), vec!["second"], "cleared slot drops the event");
}

#[test]
fn test_callback_may_replace_itself() {
    let fx = Fixture::new();
    let (_server, client, _conn) = fx.connected_pair(HandleType::Tcp, "self-replace");
    let journal = Journal::default();

    let j = journal.clone();
    client.set_write_callback(move |s, _| {
        j.push("old");
        let j = j.clone();
        s.set_write_callback(move |_, _| j.push("new"));
    });

    client.write(b"a").expect("write should succeed");
    client.write(b"b").expect("write should succeed");
    fx.run();

    assert_eq!(journal.entries(), vec!["old", "new"]);
}

#[test]
fn test_reentrant_run_is_busy() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    let outcome: Rc<RefCell<Option<uvstream::Result<bool>>>> = Rc::default();

    let slot = Rc::clone(&outcome);
    stream.set_close_callback(move |s| {
        let event_loop = s.event_loop().expect("loop should be alive");
        assert!(event_loop.is_running());
        *slot.borrow_mut() = Some(event_loop.run(RunMode::NoWait));
    });
    stream.close();
    fx.run();

    assert_eq!(outcome.borrow_mut().take(), Some(Err(Error::Busy)));
    assert!(!fx.event_loop.is_running());
}

#[test]
fn test_close_all_and_handle_listing() {
    let fx = Fixture::new();
    let server = fx.stream(HandleType::NamedPipe);
    server.bind("listing").expect("bind should succeed");
    server.listen(1).expect("listen should succeed");
    let _a = fx.stream(HandleType::Tcp);
    let _b = fx.stream(HandleType::Tty);

    let listing = fx.event_loop.handles();
    assert_eq!(listing.len(), 3);
    assert!(listing[0].contains("NamedPipe"), "{listing:?}");
    assert!(listing[0].ends_with("listening @listing"), "{listing:?}");
    assert!(listing.iter().any(|h| h.contains("Tty")), "{listing:?}");

    fx.event_loop.close_all();
    assert!(fx.event_loop.handles().iter().all(|h| h.starts_with("[--C]")));

    fx.run();
    assert!(fx.event_loop.handles().is_empty());
    assert!(!fx.event_loop.is_alive());
    assert_eq!(fx.engine.stats().handles_closed, 3);
}

#[test]
fn test_run_once_does_a_single_pass() {
    let fx = Fixture::new();
    let stream = fx.stream(HandleType::Tcp);
    let journal = Journal::default();
    let j = journal.clone();
    stream.set_connect_callback(move |_, status| {
        assert_eq!(status, Err(Error::ConnectionRefused));
        j.push("connect");
    });
    stream.connect("nobody-home").expect("connect should be queued");

    let alive = fx.event_loop.run(RunMode::Once).expect("run should succeed");
    assert!(alive, "stream is still bound");
    assert_eq!(journal.entries(), vec!["connect"]);

    stream.close();
    let alive = fx.event_loop.run(RunMode::NoWait).expect("run should succeed");
    assert!(!alive);
}

#[test]
fn test_stop_ends_run_after_current_pass() {
    let fx = Fixture::new();
    let (_server, client, conn) = fx.connected_pair(HandleType::Tcp, "stop");
    let journal = Journal::default();
    let j = journal.clone();
    client.set_write_callback(move |s, _| {
        j.push("write");
        if let Some(event_loop) = s.event_loop() {
            event_loop.stop();
        }
    });
    conn.read_start().expect("read_start should succeed");

    client.write(b"a").expect("write should succeed");
    client.write(b"b").expect("write should succeed");
    fx.run();
    assert_eq!(journal.count("write"), 1, "run stopped after first completion");

    fx.run();
    assert_eq!(journal.count("write"), 2);
}

#[test]
fn test_dropping_loop_releases_native_streams() {
    let Fixture { engine, event_loop } = Fixture::new();
    let stream = StreamHandle::new(&event_loop, HandleType::Tcp).expect("allocation");
    drop(event_loop);

    assert_eq!(engine.live_handles(), 0);
    assert!(stream.event_loop().is_none());

    stream.close();
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn test_catch_panics_keeps_loop_running() {
    let fx = Fixture::with_options(
        MemoryEngineOptions::default(),
        LoopOptions {
            catch_callback_panics: true,
            ..Default::default()
        },
    );
    let a = fx.stream(HandleType::Tcp);
    let b = fx.stream(HandleType::Tcp);
    let journal = Journal::default();

    a.set_close_callback(|_| panic!("close callback failure"));
    let j = journal.clone();
    b.set_close_callback(move |_| j.push("b closed"));

    a.close();
    b.close();
    fx.run();

    assert_eq!(a.state(), StreamState::Closed);
    assert_eq!(journal.entries(), vec!["b closed"]);
}

struct Recording(RefCell<Vec<EventKind>>);

impl CallbackHandler for Recording {
    fn invoke(&self, kind: EventKind, _stream: RawStream, callback: &mut dyn FnMut()) {
        self.0.borrow_mut().push(kind);
        callback();
    }
}

#[test]
fn test_custom_callback_handler() {
    let fx = Fixture::new();
    let recording = Rc::new(Recording(RefCell::new(Vec::new())));
    fx.event_loop.set_callback_handler(recording.clone());

    let stream = fx.stream(HandleType::Tcp);
    stream.set_connect_callback(|_, _| {});
    stream.set_close_callback(|_| {});
    stream.connect("void").expect("connect should be queued");
    fx.run();
    stream.close();
    fx.run();

    assert_eq!(
        *recording.0.borrow(),
        vec![EventKind::Connect, EventKind::Close]
    );
}
