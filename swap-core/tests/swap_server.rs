//! End-to-end: a swap server on TCP loopback answering real clients.

use std::fs;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use swap_core::connection::Connection;
use swap_core::lifecycle::{StatusBus, SwapState, SwapStatus, SwapType};
use swap_core::protocol::{HttpishError, Method};
use swap_core::transport::{Listener, ServiceRecord};
use swap_core::{
    DownloadError, FileServer, RadioAdapter, RadioSwap, Request, ServerError, SoftRadio, SwapClient, SwapServer, TcpTransport,
    Transport,
};
use tempfile::TempDir;

fn web_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    fs::create_dir_all(dir.path().join("fdroid/repo")).unwrap();
    fs::write(dir.path().join("fdroid/repo/index.jar"), &data).unwrap();
    fs::write(dir.path().join("fdroid/repo/index.html"), b"<html>repo</html>").unwrap();
    fs::write(dir.path().join("hello.txt"), b"hello swap").unwrap();
    dir
}

fn loopback() -> Arc<dyn Transport> {
    Arc::new(TcpTransport::new("127.0.0.1:0".parse().unwrap()))
}

fn running_server(root: &TempDir) -> (SwapServer, String) {
    let mut server = SwapServer::new(loopback(), FileServer::new(root.path()));
    server.start().unwrap();
    let locator = server.local_locator().unwrap().to_string();
    (server, locator)
}

fn connect(locator: &str) -> Connection {
    loopback().connect(locator).unwrap()
}

#[test]
fn get_round_trip() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let resp = Request::get("/fdroid/repo/index.jar").send(&mut conn).unwrap();
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.header("Content-Length"), Some("1000"));
    let expected = fs::read(root.path().join("fdroid/repo/index.jar")).unwrap();
    assert_eq!(resp.read_body().unwrap(), expected);
}

#[test]
fn requests_on_one_connection_stay_in_order() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    for _ in 0..3 {
        let resp = Request::get("/hello.txt").send(&mut conn).unwrap();
        assert_eq!(resp.read_body().unwrap(), b"hello swap");
        let resp = Request::head("/fdroid/repo/index.jar").send(&mut conn).unwrap();
        assert_eq!(resp.file_details().file_size, 1000);
    }
}

#[test]
fn head_body_is_unsupported() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let mut resp = Request::head("/hello.txt").send(&mut conn).unwrap();
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.file_details().file_size, 10);
    assert!(resp.file_details().cache_tag.is_some());
    assert!(matches!(resp.content_stream(), Err(HttpishError::BodyUnsupported(Method::Head))));
}

#[test]
fn byte_range_is_partial_content() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let resp = Request::get("/fdroid/repo/index.jar")
        .with_header("Range", "bytes=500-699")
        .send(&mut conn)
        .unwrap();
    assert_eq!(resp.status_code(), 206);
    assert_eq!(resp.header("Content-Range"), Some("bytes 500-699/1000"));
    let body = resp.read_body().unwrap();
    assert_eq!(body.len(), 200);
    let expected = fs::read(root.path().join("fdroid/repo/index.jar")).unwrap();
    assert_eq!(body, &expected[500..700]);
}

#[test]
fn range_beyond_file_is_unsatisfiable() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let resp = Request::get("/fdroid/repo/index.jar")
        .with_header("Range", "bytes=2000-3000")
        .send(&mut conn)
        .unwrap();
    assert_eq!(resp.status_code(), 416);
    assert_eq!(resp.header("Content-Range"), Some("bytes 0-0/1000"));
}

#[test]
fn matching_etag_is_not_modified() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let etag = Request::head("/hello.txt")
        .send(&mut conn)
        .unwrap()
        .file_details()
        .cache_tag
        .unwrap();
    let resp = Request::get("/hello.txt")
        .with_header("If-None-Match", etag)
        .send(&mut conn)
        .unwrap();
    assert_eq!(resp.status_code(), 304);
    assert!(resp.read_body().unwrap().is_empty());
}

#[test]
fn traversal_and_redirect() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let resp = Request::get("/../../etc/passwd").send(&mut conn).unwrap();
    assert_eq!(resp.status_code(), 403);
    assert_eq!(resp.read_body().unwrap(), b"Forbidden");
    let resp = Request::get("/fdroid/repo").send(&mut conn).unwrap();
    assert_eq!(resp.status_code(), 302);
    assert_eq!(resp.header("Location"), Some("/fdroid/repo/"));
    assert!(resp.read_body().unwrap().is_empty());
    let resp = Request::get("/fdroid/repo/").send(&mut conn).unwrap();
    assert_eq!(resp.read_body().unwrap(), b"<html>repo</html>");
}

#[test]
fn request_line_is_exact_on_the_wire() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut raw = std::net::TcpStream::connect(&locator).unwrap();
    raw.write_all(b"GET /hello.txt\n\n").unwrap();
    let mut reply = Vec::new();
    let mut buf = [0u8; 512];
    while !reply.ends_with(b"hello swap") {
        let n = raw.read(&mut buf).unwrap();
        assert!(n > 0, "server closed early: {:?}", String::from_utf8_lossy(&reply));
        reply.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("HTTP(ish)/0.1 200 OK\n"));
    assert!(text.contains("\nContent-Length: 10\n"));
    assert!(text.contains("\nAccept-Ranges: bytes\n"));
}

#[test]
fn empty_request_line_closes_without_response() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let mut raw = std::net::TcpStream::connect(&locator).unwrap();
    raw.write_all(b"\n").unwrap();
    let mut reply = Vec::new();
    raw.read_to_end(&mut reply).unwrap();
    assert!(reply.is_empty());
}

#[test]
fn concurrent_clients_progress_independently() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    // An idle connection must not hold anybody up.
    let _idle = connect(&locator);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let locator = locator.clone();
            thread::spawn(move || {
                let mut conn = connect(&locator);
                for _ in 0..5 {
                    let path = if i % 2 == 0 { "/hello.txt" } else { "/fdroid/repo/index.jar" };
                    let resp = Request::get(path).send(&mut conn).unwrap();
                    assert_eq!(resp.status_code(), 200);
                    let len = resp.read_body().unwrap().len();
                    assert_eq!(len, if i % 2 == 0 { 10 } else { 1000 });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn stop_ends_idle_connections_and_refuses_new_ones() {
    let root = web_root();
    let (mut server, locator) = running_server(&root);
    let mut conn = connect(&locator);
    let resp = Request::get("/hello.txt").send(&mut conn).unwrap();
    assert_eq!(resp.read_body().unwrap(), b"hello swap");

    server.stop();
    assert!(!server.is_running());
    // The idle worker saw end of stream and closed its side.
    let mut rest = Vec::new();
    let n = conn.read_to_end(&mut rest).unwrap_or(0);
    assert_eq!(n, 0);
    thread::sleep(Duration::from_millis(50));
    assert!(loopback().connect(&locator).is_err());
}

struct RefusingTransport;

impl Transport for RefusingTransport {
    fn name(&self) -> &str {
        "refusing"
    }

    fn listen(&self, _service: &ServiceRecord) -> io::Result<Box<dyn Listener>> {
        Err(io::Error::new(io::ErrorKind::AddrInUse, "no channel"))
    }

    fn connect(&self, _locator: &str) -> io::Result<Connection> {
        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
    }
}

#[test]
fn bind_failure_is_reported_and_not_retried() {
    let root = web_root();
    let mut server = SwapServer::new(Arc::new(RefusingTransport), FileServer::new(root.path()));
    match server.start() {
        Err(ServerError::Bind { transport, .. }) => assert_eq!(transport, "refusing"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!server.is_running());
}

#[test]
fn radio_swap_bind_failure_drives_lifecycle_to_stopped() {
    let root = web_root();
    let bus = Arc::new(StatusBus::new());
    let rx = bus.subscribe();
    let radio = SoftRadio::new("Tablet", false);
    let swap = SwapType::new(
        RadioSwap::new(Arc::new(radio.clone()), Arc::new(RefusingTransport), FileServer::new(root.path())),
        bus,
    );
    assert!(swap.start().is_err());
    assert_eq!(swap.state(), SwapState::Stopped);
    let seen: Vec<_> = rx.try_iter().map(|e| e.status).collect();
    assert_eq!(seen, vec![SwapStatus::Starting, SwapStatus::Stopped]);
    assert!(!radio.is_enabled());
    assert_eq!(radio.name(), "Tablet");
}

#[test]
fn client_downloads_and_resumes() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let client = SwapClient::new(loopback(), locator);
    let expected = fs::read(root.path().join("fdroid/repo/index.jar")).unwrap();

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("index.jar");
    fs::write(&dest, &expected[..300]).unwrap();

    let mut last = None;
    let outcome = client
        .download("/fdroid/repo/index.jar", &dest, |p| last = Some(p))
        .unwrap();
    assert!(outcome.resumed);
    assert_eq!(outcome.bytes_received, 700);
    assert_eq!(fs::read(&dest).unwrap(), expected);
    let last = last.unwrap();
    assert_eq!(last.downloaded, 1000);
    assert_eq!(last.total, 1000);

    let again = client.download("/fdroid/repo/index.jar", &dest, |_| {}).unwrap();
    assert_eq!(again.bytes_received, 0);
    assert_eq!(fs::read(&dest).unwrap(), expected);
}

#[test]
fn client_change_detection() {
    let root = web_root();
    let (_server, locator) = running_server(&root);
    let client = SwapClient::new(loopback(), locator);
    let tag = client.head("/hello.txt").unwrap().cache_tag;
    assert!(!client.has_changed("/hello.txt", tag.as_deref()).unwrap());
    assert!(client.has_changed("/hello.txt", Some("stale")).unwrap());
    assert!(client.has_changed("/hello.txt", None).unwrap());
    assert_eq!(client.fetch("/hello.txt").unwrap(), b"hello swap");
    assert!(client.head("/missing").is_err());
}

/// A peer that promises 1000 bytes, sends three and hangs up.
fn dropping_peer(requests: usize) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let locator = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for _ in 0..requests {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\n\n") && stream.read(&mut byte).unwrap_or(0) == 1 {
                request.push(byte[0]);
            }
            let _ = stream.write_all(b"HTTP(ish)/0.1 200 OK\nContent-Length: 1000\n\nabc");
        }
    });
    locator
}

#[test]
fn peer_dropping_mid_transfer_is_an_error() {
    let client = SwapClient::new(loopback(), dropping_peer(2));
    match client.fetch("/fdroid/repo/index.jar") {
        Err(DownloadError::Protocol(HttpishError::Io(e))) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        other => panic!("unexpected {other:?}"),
    }

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("index.jar");
    assert!(client.download("/fdroid/repo/index.jar", &dest, |_| {}).is_err());
}
