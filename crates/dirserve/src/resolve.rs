//! Mapping of request URL paths onto a route's filesystem root.

use std::borrow::Cow;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

/// A URL prefix bound to one filesystem directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    url_prefix: String,
    root: PathBuf,
}

impl Route {
    /// Create a route. The prefix gains a leading and trailing `/` if missing.
    pub fn new(url_prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mut url_prefix = url_prefix.into();
        if !url_prefix.starts_with('/') {
            url_prefix.insert(0, '/');
        }
        if !url_prefix.ends_with('/') {
            url_prefix.push('/');
        }

        Self {
            url_prefix,
            root: root.into(),
        }
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a raw (percent-encoded) request path to a filesystem path.
    ///
    /// The route prefix is stripped (both `P` and `/P` are tolerated), the
    /// remainder is cleaned as a rooted path and only then joined onto the
    /// root, so `..` segments can never climb above it.
    pub fn resolve(&self, request_path: &str) -> PathBuf {
        let decoded = decode_path(request_path);

        let mut url_path: Cow<'_, str> = Cow::Borrowed(&decoded);
        if !url_path.starts_with('/') {
            url_path = Cow::Owned(format!("/{}", url_path));
        }

        let mut remainder: &str = &url_path;
        if let Some(stripped) = remainder.strip_prefix(self.url_prefix.as_str()) {
            remainder = stripped;
        }
        let doubled = format!("/{}", self.url_prefix);
        if let Some(stripped) = remainder.strip_prefix(doubled.as_str()) {
            remainder = stripped;
        }

        let mut resolved = self.root.clone();
        for segment in clean_segments(remainder) {
            resolved.push(segment);
        }
        resolved
    }
}

fn decode_path(raw: &str) -> Cow<'_, str> {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded,
        Err(_) => {
            let bytes = urlencoding::decode_binary(raw.as_bytes());
            Cow::Owned(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

/// Lexically clean a path as if it were rooted: empty and `.` segments are
/// dropped and `..` removes the previous segment, stopping at the root.
fn clean_segments(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();

    for segment in path.split(|c: char| c == '/' || c == MAIN_SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }

    segments
}
