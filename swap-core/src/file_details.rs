//! File metadata carried in response headers.

use serde::{Deserialize, Serialize};

use crate::protocol::Headers;

/// Size and cache tag of a remote file. `file_size` is -1 when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDetails {
    pub file_size: i64,
    pub cache_tag: Option<String>,
}

impl Default for FileDetails {
    fn default() -> Self {
        Self {
            file_size: -1,
            cache_tag: None,
        }
    }
}

type HeaderHandler = fn(&mut FileDetails, &str);

/// Lower-case header name to the field it fills. Headers not listed are ignored.
const HANDLERS: &[(&str, HeaderHandler)] = &[
    ("content-length", |details, value| {
        if let Ok(size) = value.trim().parse::<i64>() {
            details.file_size = size;
        }
    }),
    ("etag", |details, value| {
        details.cache_tag = Some(value.to_string());
    }),
];

impl FileDetails {
    pub fn from_headers(headers: &Headers) -> Self {
        let mut details = FileDetails::default();
        for (name, value) in headers.iter() {
            let name = name.to_ascii_lowercase();
            if let Some((_, handle)) = HANDLERS.iter().find(|(n, _)| *n == name) {
                handle(&mut details, value);
            }
        }
        details
    }

    pub fn is_size_known(&self) -> bool {
        self.file_size >= 0
    }
}
