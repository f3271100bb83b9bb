//! httpish wire protocol: version, methods, status codes, headers and line framing.
//!
//! Requests are `"<METHOD> <path>\n"`, optional `Name: Value\n` lines, then a blank line.
//! Responses are `"HTTP(ish)/0.1 <status> OK\n"`, header lines, a blank line, and for GET the
//! raw body. The reason phrase is always the literal `OK`; receivers ignore it.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, Read};

/// Protocol token written at the start of every status line.
pub const PROTOCOL_VERSION: &str = "HTTP(ish)/0.1";

/// Reason phrase written on every status line, whatever the status code.
pub const REASON_PHRASE: &str = "OK";

/// Longest request, status or header line accepted.
pub const MAX_LINE_LEN: usize = 8 * 1024;

pub mod status {
    pub const OK: u16 = 200;
    pub const PARTIAL_CONTENT: u16 = 206;
    pub const REDIRECT: u16 = 302;
    pub const NOT_MODIFIED: u16 = 304;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RANGE_NOT_SATISFIABLE: u16 = 416;
    pub const INTERNAL_ERROR: u16 = 500;
}

pub mod header {
    pub const ACCEPT_RANGES: &str = "Accept-Ranges";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_RANGE: &str = "Content-Range";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const ETAG: &str = "ETag";
    pub const IF_NONE_MATCH: &str = "If-None-Match";
    pub const LOCATION: &str = "Location";
    pub const RANGE: &str = "Range";
}

/// The two request methods of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
        }
    }

    /// Parse a method token; case-insensitive.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header map: names kept as sent, looked up case-insensitively. Setting a name that is
/// already present (in any case) replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name as sent, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Split a `Name: Value` line on its first colon.
    pub fn parse_line(line: &str) -> Result<(String, String), HttpishError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpishError::MalformedHeader(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HttpishError::MalformedHeader(line.to_string()));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }

    /// Read header lines up to and including the blank terminator (or end of stream).
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self, HttpishError> {
        let mut headers = Headers::new();
        while let Some(line) = read_line(reader)? {
            if line.is_empty() {
                break;
            }
            let (name, value) = Headers::parse_line(&line)?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (n, v) in iter {
            headers.insert(n, v);
        }
        headers
    }
}

/// Errors reading or writing httpish messages.
#[derive(Debug, thiserror::Error)]
pub enum HttpishError {
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("connection closed before a response arrived")]
    MissingResponse,
    #[error("{0} responses carry no body")]
    BodyUnsupported(Method),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Read one line terminated by `\n` (a preceding `\r` is dropped too). `None` when the stream
/// ends before any byte of the line.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {MAX_LINE_LEN} bytes"),
        ));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
