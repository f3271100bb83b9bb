//! LAN HTTP/1.1 front for the file serving engine, used by the Wi-Fi swap.
//!
//! Plain HTTP clients on the LAN (browsers, other swap devices) get the same answers the
//! httpish server gives: ranges, validators, redirects, traversal rejection.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use swap_core::protocol::{header, status};
use swap_core::{FileServer, Headers, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const MAX_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
const BODY_CHUNK: usize = 64 * 1024;

/// Accept until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, files: Arc<FileServer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let files = files.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, files, shutdown).await {
                            tracing::debug!(peer = %peer, error = %e, "lan connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "lan accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("lan http front stopped");
}

/// Parsed request head.
#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    headers: Headers,
    keep_alive: bool,
    consumed: usize,
}

/// `Ok(None)` while the head is incomplete.
fn parse_head(buf: &[u8]) -> std::io::Result<Option<RequestHead>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
    };
    let mut headers = Headers::new();
    for h in req.headers.iter() {
        headers.insert(h.name, String::from_utf8_lossy(h.value).into_owned());
    }
    let connection = headers.get("Connection").map(|v| v.to_ascii_lowercase());
    let keep_alive = match req.version {
        Some(1) => connection.as_deref() != Some("close"),
        _ => connection.as_deref() == Some("keep-alive"),
    };
    Ok(Some(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or("/").to_string(),
        headers,
        keep_alive,
        consumed,
    }))
}

/// Percent-decoded path of a request target, query dropped. Bytes that do not decode to UTF-8
/// leave the path as sent.
fn decode_target(target: &str) -> String {
    let path = target.split_once('?').map_or(target, |(p, _)| p);
    match urlencoding::decode(path) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => path.to_string(),
    }
}

fn reason(code: u16) -> &'static str {
    match code {
        status::OK => "OK",
        status::PARTIAL_CONTENT => "Partial Content",
        status::REDIRECT => "Found",
        status::NOT_MODIFIED => "Not Modified",
        status::FORBIDDEN => "Forbidden",
        status::NOT_FOUND => "Not Found",
        405 => "Method Not Allowed",
        status::RANGE_NOT_SATISFIABLE => "Range Not Satisfiable",
        _ => "Internal Server Error",
    }
}

fn encode_head(response: &Response<'_>, keep_alive: bool) -> Vec<u8> {
    let code = response.status_code();
    let mut out = format!("HTTP/1.1 {} {}\r\n", code, reason(code));
    for (name, value) in response.headers().iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    });
    out.push_str("\r\n");
    out.into_bytes()
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    files: Arc<FileServer>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    loop {
        let head = loop {
            if let Some(head) = parse_head(&buf)? {
                break head;
            }
            if buf.len() >= MAX_HEAD {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large"));
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        buf.drain(..head.consumed);

        let is_head = head.method.eq_ignore_ascii_case("HEAD");
        let mut response = if is_head || head.method.eq_ignore_ascii_case("GET") {
            let path = decode_target(&head.path);
            let headers = head.headers.clone();
            let files = files.clone();
            tokio::task::block_in_place(move || files.serve(&path, &headers))
        } else {
            Response::new(405)
                .with_header("Allow", "GET, HEAD")
                .with_header(header::CONTENT_LENGTH, "0")
        };
        if is_head {
            response = response.into_head();
        }

        let sized = response.header(header::CONTENT_LENGTH).is_some();
        let keep_alive = head.keep_alive && (sized || is_head) && !*shutdown.borrow();
        stream.write_all(&encode_head(&response, keep_alive)).await?;
        if !is_head {
            if let Ok(body) = response.content_stream() {
                let mut chunk = vec![0u8; BODY_CHUNK];
                loop {
                    let n = tokio::task::block_in_place(|| body.read(&mut chunk))?;
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&chunk[..n]).await?;
                }
            }
        }
        stream.flush().await?;
        tracing::debug!(peer = %peer, method = %head.method, path = %head.path, status = response.status_code(), "lan request");
        if !keep_alive {
            return Ok(());
        }
    }
}
