//! Client side of the swap protocol: metadata probes and resumable downloads from a peer.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::connection::Connection;
use crate::file_details::FileDetails;
use crate::protocol::{header, status, HttpishError};
use crate::request::Request;
use crate::transport::Transport;

const COPY_BUFFER: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("cannot connect to {locator}: {source}")]
    Connect {
        locator: String,
        #[source]
        source: io::Error,
    },
    #[error("swap protocol error: {0}")]
    Protocol(#[from] HttpishError),
    #[error("{path}: peer answered status {status}")]
    Status { path: String, status: u16 },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reported after every chunk written. `total` is -1 when the peer sent no length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes received in this call; earlier partial content is not counted.
    pub bytes_received: u64,
    /// Final size of the destination file.
    pub file_size: u64,
    pub resumed: bool,
    pub cache_tag: Option<String>,
}

/// Talks to one peer, opening a fresh connection per operation.
#[derive(Clone)]
pub struct SwapClient {
    transport: Arc<dyn Transport>,
    locator: String,
}

impl SwapClient {
    pub fn new(transport: Arc<dyn Transport>, locator: impl Into<String>) -> Self {
        Self {
            transport,
            locator: locator.into(),
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn connect(&self) -> Result<Connection, DownloadError> {
        self.transport
            .connect(&self.locator)
            .map_err(|source| DownloadError::Connect {
                locator: self.locator.clone(),
                source,
            })
    }

    /// Size and cache tag of `path` without transferring it.
    pub fn head(&self, path: &str) -> Result<FileDetails, DownloadError> {
        let mut conn = self.connect()?;
        let response = Request::head(path).send(&mut conn)?;
        if response.status_code() != status::OK {
            return Err(DownloadError::Status {
                path: path.to_string(),
                status: response.status_code(),
            });
        }
        Ok(response.file_details())
    }

    /// False only when the peer's cache tag equals `cache_tag`.
    pub fn has_changed(&self, path: &str, cache_tag: Option<&str>) -> Result<bool, DownloadError> {
        let Some(known) = cache_tag else {
            return Ok(true);
        };
        let details = self.head(path)?;
        Ok(details.cache_tag.as_deref() != Some(known))
    }

    /// Whole body of `path` in memory.
    pub fn fetch(&self, path: &str) -> Result<Vec<u8>, DownloadError> {
        let mut conn = self.connect()?;
        let response = Request::get(path).send(&mut conn)?;
        if response.status_code() != status::OK {
            return Err(DownloadError::Status {
                path: path.to_string(),
                status: response.status_code(),
            });
        }
        Ok(response.read_body()?)
    }

    /// Download `path` into `dest`. A non-empty `dest` is resumed with a range request; the
    /// peer may ignore the range, in which case the file is rewritten from the start.
    pub fn download(
        &self,
        path: &str,
        dest: &Path,
        mut progress: impl FnMut(Progress),
    ) -> Result<DownloadOutcome, DownloadError> {
        let existing = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        let mut conn = self.connect()?;
        let mut request = Request::get(path);
        if existing > 0 {
            request = request.with_header(header::RANGE, format!("bytes={existing}-"));
        }
        let mut response = request.send(&mut conn)?;
        let details = response.file_details();

        let resumed = match response.status_code() {
            status::OK => false,
            status::PARTIAL_CONTENT if existing > 0 => true,
            status::RANGE_NOT_SATISFIABLE if existing > 0 => {
                let total = response.header(header::CONTENT_RANGE).and_then(range_total);
                drop(response);
                if total == Some(existing) {
                    tracing::debug!(path, size = existing, "download already complete");
                    return Ok(DownloadOutcome {
                        bytes_received: 0,
                        file_size: existing,
                        resumed: true,
                        cache_tag: None,
                    });
                }
                tracing::debug!(path, "local partial file does not match peer, restarting");
                truncate(dest)?;
                return self.download(path, dest, progress);
            }
            other => {
                return Err(DownloadError::Status {
                    path: path.to_string(),
                    status: other,
                })
            }
        };

        let mut file = open_destination(dest, resumed)?;
        let base = if resumed { existing } else { 0 };
        let total = if details.is_size_known() {
            details.file_size + base as i64
        } else {
            -1
        };
        let body = response.content_stream()?;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut received = 0u64;
        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HttpishError::Io(e).into()),
            };
            file.write_all(&buf[..n]).map_err(|source| DownloadError::Write {
                path: dest.to_path_buf(),
                source,
            })?;
            received += n as u64;
            progress(Progress {
                downloaded: base + received,
                total,
            });
        }
        file.flush().map_err(|source| DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        })?;
        tracing::info!(path, bytes = received, resumed, "download finished");
        Ok(DownloadOutcome {
            bytes_received: received,
            file_size: base + received,
            resumed,
            cache_tag: details.cache_tag,
        })
    }
}

impl std::fmt::Debug for SwapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapClient")
            .field("transport", &self.transport.name())
            .field("locator", &self.locator)
            .finish()
    }
}

/// Total length from `bytes a-b/total`.
fn range_total(content_range: &str) -> Option<u64> {
    content_range.rsplit_once('/')?.1.trim().parse().ok()
}

fn open_destination(dest: &Path, append: bool) -> Result<File, DownloadError> {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    options.open(dest).map_err(|source| DownloadError::Write {
        path: dest.to_path_buf(),
        source,
    })
}

fn truncate(dest: &Path) -> Result<(), DownloadError> {
    File::create(dest)
        .map(|_| ())
        .map_err(|source| DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        })
}
