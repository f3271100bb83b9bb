//! httpish responses: building, sending, and reading them back on the client.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

use crate::file_details::FileDetails;
use crate::protocol::{header, read_line, Headers, HttpishError, Method, PROTOCOL_VERSION, REASON_PHRASE};

/// A response body: read once, front to back.
pub type Body<'a> = Box<dyn Read + Send + 'a>;

pub struct Response<'a> {
    status_code: u16,
    headers: Headers,
    body: Option<Body<'a>>,
    head_only: bool,
}

/// Outcome of writing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// False when the body was streamed without a length; the peer reads to end of stream,
    /// so the connection has to be closed.
    pub keep_alive: bool,
    pub body_bytes: u64,
}

impl<'a> Response<'a> {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: None,
            head_only: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Read + Send + 'a) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// Short `text/plain` body with an explicit length.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        let text = text.into().into_bytes();
        self.with_header(header::CONTENT_TYPE, "text/plain")
            .with_header(header::CONTENT_LENGTH, text.len().to_string())
            .with_body(io::Cursor::new(text))
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn file_details(&self) -> FileDetails {
        FileDetails::from_headers(&self.headers)
    }

    /// The response to a HEAD request: same status and headers, no body.
    pub fn into_head(mut self) -> Self {
        self.body = None;
        self.head_only = true;
        self
    }

    /// Body stream. A GET response without a body yields an empty stream.
    pub fn content_stream(&mut self) -> Result<&mut (dyn Read + Send + 'a), HttpishError> {
        if self.head_only {
            return Err(HttpishError::BodyUnsupported(Method::Head));
        }
        let body = self
            .body
            .get_or_insert_with(|| -> Body<'a> { Box::new(io::empty()) });
        Ok(body.as_mut())
    }

    pub fn read_body(mut self) -> Result<Vec<u8>, HttpishError> {
        let mut buf = Vec::new();
        self.content_stream()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Write status line, headers and (for GET) the body.
    pub fn send<W: Write>(mut self, out: &mut W, method: Method) -> Result<Delivery, HttpishError> {
        let mut keep_alive = true;
        let body = match method {
            Method::Get => self.body.take(),
            Method::Head => None,
        };
        if method == Method::Get && !self.headers.contains(header::CONTENT_LENGTH) {
            if body.is_some() {
                keep_alive = false;
            } else {
                self.headers.insert(header::CONTENT_LENGTH, "0");
            }
        }

        let mut head = format!("{PROTOCOL_VERSION} {} {REASON_PHRASE}\n", self.status_code).into_bytes();
        self.headers.encode_into(&mut head);
        head.push(b'\n');
        out.write_all(&head)?;

        let mut body_bytes = 0;
        if let Some(mut body) = body {
            body_bytes = io::copy(&mut body, out)?;
        }
        out.flush()?;
        Ok(Delivery {
            keep_alive,
            body_bytes,
        })
    }

    /// Parse a response to a `method` request. For GET the body is bounded by `Content-Length`
    /// when present, otherwise it runs to end of stream.
    pub fn read_from<R: BufRead + Send + 'a>(mut reader: R, method: Method) -> Result<Self, HttpishError> {
        let line = read_line(&mut reader)?.ok_or(HttpishError::MissingResponse)?;
        let status_code = parse_status_line(&line)?;
        let headers = Headers::read_from(&mut reader)?;
        let mut response = Response {
            status_code,
            headers,
            body: None,
            head_only: method == Method::Head,
        };
        if method == Method::Get {
            let length = response
                .headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.parse::<u64>().ok());
            let body: Body<'a> = match length {
                Some(len) => Box::new(SizedBody {
                    inner: reader,
                    remaining: len,
                }),
                None => Box::new(reader),
            };
            response.body = Some(body);
        }
        Ok(response)
    }
}

/// Body bounded by `Content-Length`. Running out of bytes before the declared length is an
/// `UnexpectedEof` error, not end of body: the peer went away mid-transfer.
struct SizedBody<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for SizedBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended {} bytes short of its declared length", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn parse_status_line(line: &str) -> Result<u16, HttpishError> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP") {
        return Err(HttpishError::MalformedStatusLine(line.to_string()));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| HttpishError::MalformedStatusLine(line.to_string()))
}

impl fmt::Debug for Response<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status_code", &self.status_code)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("head_only", &self.head_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status;
    use std::io::Cursor;

    fn sent(resp: Response<'_>, method: Method) -> (Vec<u8>, Delivery) {
        let mut out = Vec::new();
        let delivery = resp.send(&mut out, method).unwrap();
        (out, delivery)
    }

    #[test]
    fn get_response_wire_form() {
        let resp = Response::new(status::OK)
            .with_header("Content-Length", "5")
            .with_body(Cursor::new(b"hello".to_vec()));
        let (out, delivery) = sent(resp, Method::Get);
        assert_eq!(out, b"HTTP(ish)/0.1 200 OK\nContent-Length: 5\n\nhello");
        assert!(delivery.keep_alive);
        assert_eq!(delivery.body_bytes, 5);
    }

    #[test]
    fn reason_phrase_is_ok_for_every_status() {
        let (out, _) = sent(Response::new(status::NOT_FOUND), Method::Head);
        assert!(out.starts_with(b"HTTP(ish)/0.1 404 OK\n"));
    }

    #[test]
    fn head_response_omits_body_but_keeps_length() {
        let resp = Response::new(status::OK)
            .with_header("Content-Length", "5")
            .with_body(Cursor::new(b"hello".to_vec()));
        let (out, _) = sent(resp, Method::Head);
        assert_eq!(out, b"HTTP(ish)/0.1 200 OK\nContent-Length: 5\n\n");
    }

    #[test]
    fn bodyless_get_gets_zero_length() {
        let (out, delivery) = sent(Response::new(status::NOT_MODIFIED), Method::Get);
        assert_eq!(out, b"HTTP(ish)/0.1 304 OK\nContent-Length: 0\n\n");
        assert!(delivery.keep_alive);
    }

    #[test]
    fn unsized_body_ends_connection() {
        let resp = Response::new(status::OK).with_body(Cursor::new(b"abc".to_vec()));
        let (_, delivery) = sent(resp, Method::Get);
        assert!(!delivery.keep_alive);
    }

    #[test]
    fn parsed_get_body_is_bounded_by_length() {
        let raw = b"HTTP(ish)/0.1 200 OK\nContent-Length: 3\nETag: t\n\nabcTRAILING".to_vec();
        let resp = Response::read_from(Cursor::new(raw), Method::Get).unwrap();
        assert_eq!(resp.status_code(), 200);
        let details = resp.file_details();
        assert_eq!(details.file_size, 3);
        assert_eq!(details.cache_tag.as_deref(), Some("t"));
        assert_eq!(resp.read_body().unwrap(), b"abc");
    }

    #[test]
    fn body_shorter_than_its_length_is_an_error() {
        let raw = b"HTTP(ish)/0.1 200 OK\nContent-Length: 1000\n\nabc".to_vec();
        let resp = Response::read_from(Cursor::new(raw), Method::Get).unwrap();
        match resp.read_body() {
            Err(HttpishError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parsed_get_body_without_length_reads_to_end() {
        let raw = b"HTTP(ish)/0.1 200 OK\n\nall of it".to_vec();
        let resp = Response::read_from(Cursor::new(raw), Method::Get).unwrap();
        assert_eq!(resp.read_body().unwrap(), b"all of it");
    }

    #[test]
    fn head_body_is_unsupported() {
        let raw = b"HTTP(ish)/0.1 200 OK\nContent-Length: 10\n\n".to_vec();
        let mut resp = Response::read_from(Cursor::new(raw), Method::Head).unwrap();
        assert_eq!(resp.file_details().file_size, 10);
        assert!(matches!(
            resp.content_stream(),
            Err(HttpishError::BodyUnsupported(Method::Head))
        ));
    }

    #[test]
    fn bad_status_lines_are_rejected() {
        for raw in [&b"garbage\n\n"[..], b"HTTP(ish)/0.1 abc OK\n\n", b"HTTP(ish)/0.1\n\n"] {
            assert!(matches!(
                Response::read_from(Cursor::new(raw.to_vec()), Method::Get),
                Err(HttpishError::MalformedStatusLine(_))
            ));
        }
        assert!(matches!(
            Response::read_from(Cursor::new(Vec::new()), Method::Get),
            Err(HttpishError::MissingResponse)
        ));
    }

    #[test]
    fn into_head_drops_body() {
        let resp = Response::new(status::OK)
            .with_text("body")
            .into_head();
        assert!(!resp.has_body());
        assert_eq!(resp.header("content-length"), Some("4"));
    }
}
