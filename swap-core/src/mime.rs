//! Extension to MIME type lookup for served files.

use std::path::Path;

pub trait MimeRegistry: Send + Sync {
    /// `None` when the extension has no mapping; the response then carries no `Content-Type`.
    fn mime_type_for(&self, path: &Path) -> Option<String>;
}

/// Built-in table covering what a swap repository serves.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMimeRegistry;

const TYPES: &[(&str, &str)] = &[
    ("apk", "application/vnd.android.package-archive"),
    ("css", "text/css"),
    ("gif", "image/gif"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("ico", "image/x-icon"),
    ("jar", "application/java-archive"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("txt", "text/plain"),
    ("webp", "image/webp"),
    ("xml", "application/xml"),
    ("zip", "application/zip"),
];

impl MimeRegistry for StaticMimeRegistry {
    fn mime_type_for(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        TYPES
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, mime)| (*mime).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_map_case_insensitively() {
        let reg = StaticMimeRegistry;
        assert_eq!(
            reg.mime_type_for(Path::new("fdroid/repo/app.APK")).as_deref(),
            Some("application/vnd.android.package-archive")
        );
        assert_eq!(reg.mime_type_for(Path::new("index.html")).as_deref(), Some("text/html"));
    }

    #[test]
    fn unknown_or_missing_extension_has_no_type() {
        let reg = StaticMimeRegistry;
        assert_eq!(reg.mime_type_for(Path::new("blob.xyz")), None);
        assert_eq!(reg.mime_type_for(Path::new("README")), None);
    }
}
