//! File serving engine: maps a request path under a web root to a response.
//!
//! Handles traversal rejection, directory redirects and index pages, single byte ranges and
//! `If-None-Match` revalidation against a weak validator. Every response it produces
//! carries `Accept-Ranges: bytes`.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::mime::{MimeRegistry, StaticMimeRegistry};
use crate::protocol::{header, status, Headers};
use crate::response::Response;

const INDEX_FILE: &str = "index.html";

/// Failures that are not the client's fault. `FileServer::serve` answers them with 500.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("cannot read metadata of {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot position {path} at byte {offset}: {source}")]
    Seek {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

/// Inclusive byte range requested by `Range: bytes=start-end`. `end` is `None` when open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// Parse a `Range` header value. Anything but a single well-formed `bytes=start-[end]`
/// range is `None`, which serves the whole file.
pub fn parse_range(value: &str) -> Option<ByteRange> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse::<u64>().ok()?),
    };
    if matches!(end, Some(e) if e < start) {
        return None;
    }
    Some(ByteRange { start, end })
}

/// Weak validator: hex of the first eight SHA-256 bytes over absolute path, mtime and length.
pub fn weak_validator(abs_path: &Path, metadata: &Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis());
    let mut hasher = Sha256::new();
    hasher.update(abs_path.to_string_lossy().as_bytes());
    hasher.update(mtime.to_string().as_bytes());
    hasher.update(metadata.len().to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Outcome of checking a request path before touching the filesystem.
enum Target {
    Forbidden,
    Relative(PathBuf),
}

fn resolve(request_path: &str) -> Target {
    if request_path.contains("../") {
        return Target::Forbidden;
    }
    let mut rel = PathBuf::new();
    for component in Path::new(request_path).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return Target::Forbidden,
        }
    }
    Target::Relative(rel)
}

/// Normalized request path: query stripped, `\` turned into `/`, surrounding whitespace trimmed.
pub fn normalize_request_path(raw: &str) -> String {
    let without_query = raw.split_once('?').map_or(raw, |(p, _)| p);
    without_query.replace('\\', "/").trim().to_string()
}

#[derive(Clone)]
pub struct FileServer {
    web_root: PathBuf,
    mime: Arc<dyn MimeRegistry>,
}

impl FileServer {
    pub fn new(web_root: impl Into<PathBuf>) -> Self {
        Self {
            web_root: web_root.into(),
            mime: Arc::new(StaticMimeRegistry),
        }
    }

    pub fn with_mime_registry(mut self, mime: Arc<dyn MimeRegistry>) -> Self {
        self.mime = mime;
        self
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    /// Always yields a response; internal failures become 500.
    pub fn serve(&self, request_path: &str, headers: &Headers) -> Response<'static> {
        finish(request_path, self.try_serve(request_path, headers))
    }

    pub fn try_serve(&self, request_path: &str, headers: &Headers) -> Result<Response<'static>, ServeError> {
        let path = normalize_request_path(request_path);
        let rel = match resolve(&path) {
            Target::Forbidden => {
                tracing::debug!(path = %path, "rejected path outside web root");
                return Ok(forbidden());
            }
            Target::Relative(rel) => rel,
        };
        let abs = self.web_root.join(&rel);
        if !abs.exists() {
            return Ok(not_found());
        }

        if abs.is_dir() {
            if !path.ends_with('/') {
                return Ok(Response::new(status::REDIRECT)
                    .with_header(header::LOCATION, format!("{path}/"))
                    .with_header(header::CONTENT_LENGTH, "0"));
            }
            let index = abs.join(INDEX_FILE);
            if index.is_file() {
                return self.serve_file(&index, headers);
            }
            return Ok(match fs::read_dir(&abs) {
                Ok(_) => not_found(),
                Err(_) => forbidden(),
            });
        }

        self.serve_file(&abs, headers)
    }

    fn serve_file(&self, abs: &Path, headers: &Headers) -> Result<Response<'static>, ServeError> {
        let metadata = fs::metadata(abs).map_err(|source| ServeError::Metadata {
            path: abs.to_path_buf(),
            source,
        })?;
        let absolute = fs::canonicalize(abs).unwrap_or_else(|_| abs.to_path_buf());
        let etag = weak_validator(&absolute, &metadata);
        let len = metadata.len();
        let mime = self.mime.mime_type_for(abs);

        if let Some(range) = headers.get(header::RANGE).and_then(parse_range) {
            if range.start >= len {
                return Ok(Response::new(status::RANGE_NOT_SATISFIABLE)
                    .with_header(header::CONTENT_RANGE, format!("bytes 0-0/{len}"))
                    .with_header(header::CONTENT_LENGTH, "0"));
            }
            let end = range.end.map_or(len - 1, |e| e.min(len - 1));
            let count = end - range.start + 1;
            let Ok(mut file) = File::open(abs) else {
                return Ok(forbidden());
            };
            file.seek(SeekFrom::Start(range.start))
                .map_err(|source| ServeError::Seek {
                    path: abs.to_path_buf(),
                    offset: range.start,
                    source,
                })?;
            let response = Response::new(status::PARTIAL_CONTENT)
                .with_header(header::CONTENT_RANGE, format!("bytes {}-{end}/{len}", range.start))
                .with_header(header::CONTENT_LENGTH, count.to_string())
                .with_header(header::ETAG, etag)
                .with_body(file.take(count));
            return Ok(with_mime(response, mime));
        }

        if headers.get(header::IF_NONE_MATCH) == Some(etag.as_str()) {
            return Ok(Response::new(status::NOT_MODIFIED).with_header(header::ETAG, etag));
        }

        let Ok(file) = File::open(abs) else {
            return Ok(forbidden());
        };
        let response = Response::new(status::OK)
            .with_header(header::CONTENT_LENGTH, len.to_string())
            .with_header(header::ETAG, etag)
            .with_body(file.take(len));
        Ok(with_mime(response, mime))
    }
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("web_root", &self.web_root)
            .finish_non_exhaustive()
    }
}

fn finish(request_path: &str, outcome: Result<Response<'static>, ServeError>) -> Response<'static> {
    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(path = request_path, error = %e, "serving failed");
            Response::new(status::INTERNAL_ERROR).with_text("Internal error")
        }
    };
    response.with_header(header::ACCEPT_RANGES, "bytes")
}

fn with_mime(response: Response<'static>, mime: Option<String>) -> Response<'static> {
    match mime {
        Some(mime) => response.with_header(header::CONTENT_TYPE, mime),
        None => response,
    }
}

fn forbidden() -> Response<'static> {
    Response::new(status::FORBIDDEN).with_text("Forbidden")
}

fn not_found() -> Response<'static> {
    Response::new(status::NOT_FOUND).with_text("Not found")
}
