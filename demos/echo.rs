//! Echo server and client on one event loop.
//!
//! Run with: cargo run --example echo

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use uvstream::{EventLoop, HandleType, MemoryEngine, RunMode, StreamHandle};

fn main() -> uvstream::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let engine = Arc::new(MemoryEngine::new());
    let event_loop = EventLoop::new(engine.clone());

    println!("\n--- Starting echo server ---");
    let server = StreamHandle::new(&event_loop, HandleType::Tcp)?;
    server.bind("echo:7")?;
    server.listen(16)?;

    let connections: Rc<RefCell<Vec<StreamHandle>>> = Rc::default();
    let conns = Rc::clone(&connections);
    server.set_connection_callback(move |server, status| {
        if let Err(e) = status {
            eprintln!("connection error: {e}");
            return;
        }
        let Some(event_loop) = server.event_loop() else {
            return;
        };
        let conn = match StreamHandle::new(&event_loop, HandleType::Tcp) {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("cannot allocate connection: {e}");
                return;
            }
        };
        if let Err(e) = server.accept(&conn) {
            eprintln!("accept failed: {e}");
            conn.close();
            return;
        }

        conn.set_read_callback(|conn, data| match data {
            Ok(data) => {
                if let Err(e) = conn.write(&data) {
                    eprintln!("echo write failed: {e}");
                    conn.close();
                }
            }
            // Flush the echoes, then hang up.
            Err(e) if e.is_eof() => {
                if conn.close_write().is_err() {
                    conn.close();
                }
            }
            Err(e) => {
                eprintln!("read error: {e}");
                conn.close();
            }
        });
        conn.set_shutdown_callback(|conn, _| conn.close());
        match conn.read_start() {
            Ok(()) => conns.borrow_mut().push(conn),
            Err(e) => {
                eprintln!("read_start failed: {e}");
                conn.close();
            }
        }
    });

    println!("\n--- Connecting client ---");
    let client = StreamHandle::new(&event_loop, HandleType::Tcp)?;
    let echoed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&echoed);
    client.set_connect_callback(|client, status| {
        if let Err(e) = status {
            eprintln!("connect failed: {e}");
            client.close();
            return;
        }
        for line in ["hello\n", "world\n"] {
            if let Err(e) = client.write_str(line) {
                eprintln!("write failed: {e}");
            }
        }
        println!("Queued {} bytes", client.write_queue_size());
        let _ = client.close_write();
    });
    client.set_read_callback(move |client, data| match data {
        Ok(data) => sink.borrow_mut().extend_from_slice(&data),
        Err(_) => client.close(),
    });
    client.set_close_callback(|_| println!("Client closed"));
    client.connect("echo:7")?;
    client.read_start()?;

    event_loop.run(RunMode::Default)?;
    print!("Echoed:\n{}", String::from_utf8_lossy(&echoed.borrow()));

    println!("\n--- Handles still open ---");
    for handle in event_loop.handles() {
        println!("  {handle}");
    }

    server.close();
    event_loop.close_all();
    event_loop.run(RunMode::Default)?;

    let stats = engine.stats();
    println!("\n--- Engine stats ---");
    println!("  Opened: {}", stats.handles_opened);
    println!("  Closed: {}", stats.handles_closed);
    println!("  Writes: {}", stats.writes_queued);

    Ok(())
}
