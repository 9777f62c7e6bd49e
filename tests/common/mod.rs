//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Once};

use tracing_subscriber::fmt::format::FmtSpan;
use uvstream::{
    EventLoop, HandleType, LoopOptions, MemoryEngine, MemoryEngineOptions, RunMode, StreamHandle,
};

static INIT_LOGGING: Once = Once::new();

/// Install a fmt subscriber that writes through the test harness.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

pub struct Fixture {
    pub engine: Arc<MemoryEngine>,
    pub event_loop: EventLoop,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_options(MemoryEngineOptions::default(), LoopOptions::default())
    }

    pub fn with_options(engine: MemoryEngineOptions, options: LoopOptions) -> Self {
        init_test_logging();
        let engine = Arc::new(MemoryEngine::with_options(engine));
        let event_loop = EventLoop::with_options(engine.clone(), options);
        Self { engine, event_loop }
    }

    pub fn stream(&self, kind: HandleType) -> StreamHandle {
        StreamHandle::new(&self.event_loop, kind).expect("stream allocation should succeed")
    }

    pub fn run(&self) {
        self.event_loop
            .run(RunMode::Default)
            .expect("run should not be re-entered");
    }

    /// Listen on `addr`, connect a client to it and accept the connection.
    ///
    /// Returns `(server, client, accepted)`.
    pub fn connected_pair(
        &self,
        kind: HandleType,
        addr: &str,
    ) -> (StreamHandle, StreamHandle, StreamHandle) {
        let server = self.stream(kind);
        server.bind(addr).expect("bind should succeed");
        server.listen(5).expect("listen should succeed");

        let slot: Rc<RefCell<Option<StreamHandle>>> = Rc::default();
        let accepted = Rc::clone(&slot);
        server.set_connection_callback(move |server, status| {
            status.expect("connection status should be ok");
            let event_loop = server.event_loop().expect("loop should be alive");
            let conn = StreamHandle::new(&event_loop, server.handle_type())
                .expect("stream allocation should succeed");
            server.accept(&conn).expect("accept should succeed");
            *accepted.borrow_mut() = Some(conn);
        });

        let client = self.stream(kind);
        client.connect(addr).expect("connect should succeed");
        self.run();

        let conn = slot.borrow_mut().take().expect("connection should be accepted");
        (server, client, conn)
    }
}

/// Ordered record of callback invocations.
#[derive(Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.borrow().iter().filter(|e| *e == entry).count()
    }
}

/// Collects everything delivered to a read callback.
#[derive(Clone, Default)]
pub struct Received(Rc<RefCell<Vec<u8>>>);

impl Received {
    pub fn attach(&self, stream: &StreamHandle) {
        let sink = self.clone();
        stream.set_read_callback(move |_, data| {
            if let Ok(data) = data {
                sink.0.borrow_mut().extend_from_slice(&data);
            }
        });
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}
