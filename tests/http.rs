//! End-to-end scenarios against the HTTP layer: keep-alive, pipelining,
//! routing, error pages, static files, and the oversize-line guard.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use eddy::http::HttpServer;
use eddy::ServerHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// The server binds 0.0.0.0; clients dial loopback at the bound port.
fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

/// Boots an HTTP server with a `/hello` route plus whatever `configure`
/// adds, and returns its address once it is accepting.
fn start_http_server(
    configure: impl FnOnce(&mut HttpServer) + Send + 'static,
) -> (SocketAddr, ServerHandle) {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server = HttpServer::new(0).expect("failed to bind http server");
        server.set_thread_num(2);
        server.get("/hello", |_req, rsp| {
            rsp.set_content("hello world", "text/plain");
        });
        configure(&mut server);
        tx.send((server.local_addr(), server.handle())).unwrap();
        server.listen();
    });
    rx.recv().unwrap()
}

/// Reads exactly one HTTP response (headers plus `Content-Length` body).
fn read_response(stream: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    let header_end;
    loop {
        stream.read_exact(&mut byte).expect("response headers");
        raw.push(byte[0]);
        if raw.ends_with(b"\r\n\r\n") {
            header_end = raw.len();
            break;
        }
    }
    let headers = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("response body");
    raw.extend_from_slice(&body);
    String::from_utf8_lossy(&raw).into_owned()
}

const KEEP_ALIVE_GET: &str =
    "GET /hello HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n";

#[test]
fn keep_alive_get_answers_twice_on_one_socket() {
    let (addr, _handle) = start_http_server(|_| {});
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client.write_all(KEEP_ALIVE_GET.as_bytes()).unwrap();
    let first = read_response(&mut client);
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{first}");
    assert!(first.contains("Connection: keep-alive"));
    assert!(first.ends_with("hello world"));

    client.write_all(KEEP_ALIVE_GET.as_bytes()).unwrap();
    let second = read_response(&mut client);
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(second.ends_with("hello world"));
}

#[test]
fn connection_without_keep_alive_is_closed_after_the_response() {
    let (addr, handle) = start_http_server(|_| {});
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client
        .write_all(b"GET /hello HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let mut everything = Vec::new();
    client.read_to_end(&mut everything).unwrap();
    let text = String::from_utf8_lossy(&everything);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: close"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.connection_count() != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(handle.connection_count(), 0);
}

#[test]
fn pipelined_requests_get_ordered_responses() {
    let (addr, _handle) = start_http_server(|_| {});
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    let burst = KEEP_ALIVE_GET.repeat(4);
    client.write_all(burst.as_bytes()).unwrap();
    for _ in 0..4 {
        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("hello world"));
    }
}

#[test]
fn oversize_request_line_is_rejected_with_414() {
    let (addr, _handle) = start_http_server(|_| {});
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client.write_all(&vec![b'a'; 10_000]).unwrap();
    let mut everything = Vec::new();
    client.read_to_end(&mut everything).unwrap();
    let text = String::from_utf8_lossy(&everything);
    assert!(text.starts_with("HTTP/1.1 414 "), "{text}");
    assert!(text.contains("Connection: close"));
}

#[test]
fn route_miss_gets_an_error_page() {
    let (addr, _handle) = start_http_server(|_| {});
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client
        .write_all(b"GET /nope HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let mut everything = Vec::new();
    client.read_to_end(&mut everything).unwrap();
    let text = String::from_utf8_lossy(&everything);
    assert!(text.starts_with("HTTP/1.1 404 "));
    assert!(text.contains("404 Not Found"));
    // Errors close regardless of the request's keep-alive wish.
    assert!(text.contains("Connection: close"));
}

#[test]
fn malformed_request_line_is_400() {
    let (addr, _handle) = start_http_server(|_| {});
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client.write_all(b"BOGUS /x HTTP/1.1\r\n\r\n").unwrap();
    let mut everything = Vec::new();
    client.read_to_end(&mut everything).unwrap();
    assert!(String::from_utf8_lossy(&everything).starts_with("HTTP/1.1 400 "));
}

#[test]
fn post_route_sees_the_body_and_captures() {
    let (addr, _handle) = start_http_server(|server| {
        server.post(r"/echo/(\w+)", |req, rsp| {
            let reply = format!("{}:{}", req.matches[1], req.body);
            rsp.set_content(reply, "text/plain");
        });
    });
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client
        .write_all(
            b"POST /echo/tag HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 7\r\n\r\npayload",
        )
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("tag:payload"));
}

#[test]
fn query_params_reach_the_handler() {
    let (addr, _handle) = start_http_server(|server| {
        server.get("/search", |req, rsp| {
            let word = req.param("word").unwrap_or("none").to_string();
            rsp.set_content(word, "text/plain");
        });
    });
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client
        .write_all(b"GET /search?word=reactor HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.ends_with("reactor"));
}

#[test]
fn static_files_are_served_with_their_mime_type() {
    let dir = std::env::temp_dir().join(format!("eddy-http-static-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("page.html"), "<h1>static</h1>").unwrap();
    fs::write(dir.join("index.html"), "<h1>home</h1>").unwrap();

    let static_dir = dir.clone();
    let (addr, _handle) = start_http_server(move |server| {
        server.set_base_path(static_dir);
    });
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client
        .write_all(b"GET /page.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/html"));
    assert!(response.ends_with("<h1>static</h1>"));

    // Directory requests fall back to index.html.
    client
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.ends_with("<h1>home</h1>"));

    // Path traversal never leaves the base directory.
    client
        .write_all(b"GET /../../etc/passwd HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 404 "));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn silent_keep_alive_connection_is_released_by_the_timeout() {
    let (addr, _handle) = start_http_server(|server| {
        server.set_timeout(2);
    });
    let mut client = TcpStream::connect(loopback(addr)).unwrap();

    client.write_all(KEEP_ALIVE_GET.as_bytes()).unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    // Stay silent; the server must hang up on its own.
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut byte = [0u8; 1];
    assert_eq!(client.read(&mut byte).unwrap(), 0);
}
