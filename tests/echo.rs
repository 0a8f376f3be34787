//! End-to-end scenarios against the TCP core: echo, drain-close, idle
//! release, protocol upgrade, and multi-loop load.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eddy::{Buffer, ConnRef, ConnectionCallbacks, ServerHandle, TcpServer};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// The servers bind 0.0.0.0; clients dial loopback at the bound port.
fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

struct EchoServer {
    addr: SocketAddr,
    handle: ServerHandle,
    closed: Arc<AtomicUsize>,
}

/// Echo server on an ephemeral port; `shutdown_after_echo` makes it close
/// the connection after answering, `inactive` arms the idle release.
fn start_echo_server(threads: usize, inactive: Option<u32>, shutdown_after_echo: bool) -> EchoServer {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_in_server = closed.clone();
    thread::spawn(move || {
        let mut server = TcpServer::new(0).expect("failed to bind echo server");
        server.set_thread_num(threads);
        if let Some(seconds) = inactive {
            server.enable_inactive_release(seconds);
        }
        server.set_message_callback(move |conn: &ConnRef, buf: &mut Buffer| {
            let len = buf.readable_size();
            let data = buf.read_bytes(len);
            conn.send(&data);
            if shutdown_after_echo {
                conn.shutdown();
            }
        });
        server.set_closed_callback(move |_conn| {
            closed_in_server.fetch_add(1, Ordering::SeqCst);
        });
        tx.send((server.local_addr(), server.handle())).unwrap();
        server.start();
    });
    let (addr, handle) = rx.recv().unwrap();
    EchoServer {
        addr,
        handle,
        closed,
    }
}

#[test]
fn echo_one_line_then_server_closes() {
    let server = start_echo_server(1, None, true);

    let mut client = TcpStream::connect(loopback(server.addr)).unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"hello\n");

    assert!(wait_until(Duration::from_secs(5), || {
        server.handle.connection_count() == 0
    }));
    assert_eq!(server.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn buffered_input_is_delivered_before_the_closed_callback() {
    init_tracing();
    let payload_len = 10 * 1024;
    let events: Arc<Mutex<Vec<(&'static str, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    {
        let events = events.clone();
        thread::spawn(move || {
            let mut server = TcpServer::new(0).expect("failed to bind");
            server.set_thread_num(1);
            let on_message = events.clone();
            server.set_message_callback(move |_conn: &ConnRef, buf: &mut Buffer| {
                let len = buf.readable_size();
                buf.advance_read(len);
                on_message.lock().unwrap().push(("message", len));
            });
            let on_closed = events.clone();
            server.set_closed_callback(move |_conn| {
                on_closed.lock().unwrap().push(("closed", 0));
            });
            tx.send(server.local_addr()).unwrap();
            server.start();
        });
    }
    let addr = rx.recv().unwrap();

    let mut client = TcpStream::connect(loopback(addr)).unwrap();
    client.write_all(&vec![0x42u8; payload_len]).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        events.lock().unwrap().iter().any(|(kind, _)| *kind == "closed")
    }));

    let events = events.lock().unwrap();
    let delivered: usize = events
        .iter()
        .filter(|(kind, _)| *kind == "message")
        .map(|(_, len)| len)
        .sum();
    assert_eq!(delivered, payload_len);
    assert_eq!(events.last().unwrap().0, "closed");
}

#[test]
fn idle_connection_is_released_in_the_timeout_window() {
    let server = start_echo_server(1, Some(2), false);

    let mut client = TcpStream::connect(loopback(server.addr)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        server.handle.connection_count() == 1
    }));

    let start = Instant::now();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut byte = [0u8; 1];
    let n = client.read(&mut byte).unwrap();
    assert_eq!(n, 0, "expected EOF from the idle release");

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "released too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(4), "released too late: {elapsed:?}");

    assert!(wait_until(Duration::from_secs(5), || {
        server.closed.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(server.handle.connection_count(), 0);
}

#[test]
fn activity_slides_the_idle_window() {
    let server = start_echo_server(1, Some(2), false);

    let mut client = TcpStream::connect(loopback(server.addr)).unwrap();
    let connect_time = Instant::now();

    // Keep the connection busy past the original deadline.
    for _ in 0..4 {
        thread::sleep(Duration::from_millis(700));
        client.write_all(b"ping\n").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");
    }
    assert!(connect_time.elapsed() > Duration::from_secs(2));
    assert_eq!(server.closed.load(Ordering::SeqCst), 0);

    // Now go quiet and let the release fire.
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut byte = [0u8; 1];
    assert_eq!(client.read(&mut byte).unwrap(), 0);
}

#[test]
fn upgrade_switches_the_protocol_layer() {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server = TcpServer::new(0).expect("failed to bind");
        server.set_thread_num(1);
        server.set_message_callback(|conn: &ConnRef, buf: &mut Buffer| {
            let len = buf.readable_size();
            let data = buf.read_bytes(len);
            let mut reply = b"v1:".to_vec();
            reply.extend_from_slice(&data);
            conn.send(&reply);

            // Hand the connection to the second protocol; runs on the
            // owner loop since message callbacks are dispatched there.
            let mut callbacks = ConnectionCallbacks::default();
            callbacks.message = Some(Arc::new(|conn: &ConnRef, buf: &mut Buffer| {
                let len = buf.readable_size();
                let data = buf.read_bytes(len);
                let mut reply = b"v2:".to_vec();
                reply.extend_from_slice(&data);
                conn.send(&reply);
            }));
            conn.upgrade(eddy::Context::default(), callbacks);
        });
        tx.send(server.local_addr()).unwrap();
        server.start();
    });
    let addr = rx.recv().unwrap();

    let mut client = TcpStream::connect(loopback(addr)).unwrap();
    client.write_all(b"one").unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"v1:one");

    client.write_all(b"two").unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"v2:two");
}

#[test]
fn concurrent_connections_echo_in_order_across_loops() {
    let server = start_echo_server(3, None, false);

    let mut clients = Vec::new();
    for client_id in 0..12 {
        let addr = server.addr;
        clients.push(thread::spawn(move || {
            let mut stream = TcpStream::connect(loopback(addr)).unwrap();
            for round in 0..25 {
                let message = format!("conn-{client_id}-round-{round}\n");
                stream.write_all(message.as_bytes()).unwrap();
                let mut echoed = vec![0u8; message.len()];
                stream.read_exact(&mut echoed).unwrap();
                assert_eq!(echoed, message.as_bytes());
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        server.handle.connection_count() == 0
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        server.closed.load(Ordering::SeqCst) == 12
    }));
}

#[test]
fn run_after_fires_on_the_base_loop() {
    let server = start_echo_server(1, None, false);
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        server.handle.run_after(1, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(4), || {
        fired.load(Ordering::SeqCst) == 1
    }));
}
