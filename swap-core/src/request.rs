//! httpish requests: encoding, sending over a connection, and server-side parsing.

use std::io::{BufRead, Write};

use crate::connection::Connection;
use crate::protocol::{read_line, Headers, HttpishError, Method};
use crate::response::Response;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Headers::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::Head, path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Wire form: request line, header lines, blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.path.len() + 16);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.push(b'\n');
        self.headers.encode_into(&mut out);
        out.push(b'\n');
        out
    }

    /// Write this request and parse the reply. The returned response streams its body
    /// straight off `conn`.
    pub fn send<'c>(&self, conn: &'c mut Connection) -> Result<Response<'c>, HttpishError> {
        conn.write_all(&self.encode())?;
        conn.flush()?;
        tracing::trace!(peer = conn.peer(), method = %self.method, path = %self.path, "sent request");
        Response::read_from(conn, self.method)
    }

    /// Parse the next request. `Ok(None)` means there is none: end of stream, an empty request
    /// line, an unknown method or a missing path. The path is the first whitespace-separated
    /// token after the method, so a path containing spaces does not survive a round trip.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Option<Self>, HttpishError> {
        let Some(line) = read_line(reader)? else {
            return Ok(None);
        };
        let mut parts = line.split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };
        let Some(method) = Method::parse(method) else {
            tracing::debug!(method, "unsupported request method");
            return Ok(None);
        };
        let path = path.to_string();
        let headers = Headers::read_from(reader)?;
        Ok(Some(Self {
            method,
            path,
            headers,
        }))
    }

    /// Server side: wait for the next request on `conn`.
    pub fn listen(conn: &mut Connection) -> Result<Option<Self>, HttpishError> {
        Self::read_from(conn)
    }
}
