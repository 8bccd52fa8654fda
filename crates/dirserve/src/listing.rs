//! HTML index of a single directory.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{MAIN_SEPARATOR, Path};

use axum::http::Uri;
use axum::response::Html;
use tokio::fs;

use crate::error::ServeError;

pub const TAR_GZ_KEY: &str = "tar.gz";
pub const ZIP_KEY: &str = "zip";
const FLAG_VALUE: &str = "true";

const STYLE: &str = "body{font-family: sans-serif;}td{padding:.5em;}a{display:block;}\
tbody tr:nth-child(odd){background:#eee;}.number{text-align:right}\
.text{text-align:left;word-break:break-all;}canvas,table{width:100%;max-width:100%;}";

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Display name; directories carry a trailing separator.
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub href: String,
}

/// Human-readable size: raw count below 1K, otherwise the rounded quotient
/// with a `K`, `M` or `G` suffix.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    let div_by = |unit: u64| (bytes as f64 / unit as f64).round() as u64;

    if bytes < KB {
        bytes.to_string()
    } else if bytes < MB {
        format!("{}K", div_by(KB))
    } else if bytes < GB {
        format!("{}M", div_by(MB))
    } else {
        format!("{}G", div_by(GB))
    }
}

/// Escape HTML entities
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Decode a raw query string into key/value pairs, in order.
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    match urlencoding::decode(&raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => {
            let bytes = urlencoding::decode_binary(raw.as_bytes());
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }
}

/// Whether the first value for `key` in the query is non-empty.
pub fn query_flag(query: Option<&str>, key: &str) -> bool {
    parse_query(query)
        .into_iter()
        .find(|(k, _)| k == key)
        .is_some_and(|(_, value)| !value.is_empty())
}

/// The current URL with `key=true` set in its query. Keys are sorted.
fn with_query_flag(uri: &Uri, key: &str) -> String {
    let mut pairs: Vec<(String, String)> = parse_query(uri.query())
        .into_iter()
        .filter(|(k, _)| k != key)
        .collect();
    pairs.push((key.to_string(), FLAG_VALUE.to_string()));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", uri.path(), query)
}

fn entry_href(uri: &Uri, name: &str, is_dir: bool) -> String {
    let mut href = format!(
        "{}/{}",
        uri.path().trim_end_matches('/'),
        urlencoding::encode(name)
    );
    if is_dir {
        href.push('/');
    }
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        href.push('?');
        href.push_str(query);
    }
    href
}

/// Read one level of `dir`, sorted by name.
pub async fn read_entries(uri: &Uri, dir: &Path) -> Result<Vec<DirectoryEntry>, ServeError> {
    let mut raw: Vec<(OsString, bool, u64)> = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        raw.push((entry.file_name(), metadata.is_dir(), metadata.len()));
    }
    raw.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(raw
        .into_iter()
        .map(|(file_name, is_dir, size)| {
            let file_name = file_name.to_string_lossy().to_string();
            let href = entry_href(uri, &file_name, is_dir);
            let name = if is_dir {
                format!("{}{}", file_name, MAIN_SEPARATOR)
            } else {
                file_name
            };
            DirectoryEntry {
                name,
                is_dir,
                size,
                href,
            }
        })
        .collect())
}

/// Listing title: the route root's base name joined with the directory's
/// path below it.
fn title(route_root: &Path, dir: &Path) -> String {
    let base = route_root
        .file_name()
        .map(Path::new)
        .unwrap_or(route_root);
    match dir.strip_prefix(route_root) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            base.join(relative).display().to_string()
        }
        _ => base.display().to_string(),
    }
}

/// Render the listing page for `dir`.
pub async fn render(
    uri: &Uri,
    route_root: &Path,
    dir: &Path,
    allow_upload: bool,
) -> Result<String, ServeError> {
    let entries = read_entries(uri, dir).await?;
    Ok(render_page(uri, &title(route_root, dir), &entries, allow_upload))
}

pub async fn listing_response(
    uri: &Uri,
    route_root: &Path,
    dir: &Path,
    allow_upload: bool,
) -> Result<Html<String>, ServeError> {
    render(uri, route_root, dir, allow_upload).await.map(Html)
}

fn render_page(uri: &Uri, title: &str, entries: &[DirectoryEntry], allow_upload: bool) -> String {
    let title = html_escape(title);
    let mut html = String::with_capacity(1024 + entries.len() * 160);

    html.push_str("<html>\n<meta name=\"google\" content=\"notranslate\"/>\n<head>\n");
    let _ = writeln!(html, "\t<title>{}</title>", title);
    html.push_str("\t<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    let _ = writeln!(html, "\t<style>{}</style>", STYLE);
    html.push_str("</head>\n<body>\n");
    let _ = writeln!(html, "<h1>{}</h1>", title);

    if !entries.is_empty() || allow_upload {
        html.push_str("<table>\n\t<thead>\n\t\t<th></th>\n");
        html.push_str("\t\t<th colspan=2 class=number>Size (bytes)</th>\n\t</thead>\n\t<tbody>\n");

        if !entries.is_empty() {
            let _ = writeln!(
                html,
                "\t<tr><td colspan=3><a href=\"{}\">.tar.gz of all files</a></td></tr>",
                html_escape(&with_query_flag(uri, TAR_GZ_KEY))
            );
            let _ = writeln!(
                html,
                "\t<tr><td colspan=3><a href=\"{}\">.zip of all files</a></td></tr>",
                html_escape(&with_query_flag(uri, ZIP_KEY))
            );
        }

        for entry in entries {
            let href = html_escape(&entry.href);
            let name = html_escape(&entry.name);
            if entry.is_dir {
                let _ = writeln!(
                    html,
                    "\t<tr><td colspan=3 class=text><a href=\"{}\">{}</a></td></tr>",
                    href, name
                );
            } else {
                let _ = writeln!(
                    html,
                    "\t<tr><td class=text><a href=\"{}\">{}</a></td><td class=number>{}</td><td class=number>({})</td></tr>",
                    href,
                    name,
                    format_size(entry.size),
                    entry.size
                );
            }
        }

        if allow_upload {
            html.push_str(
                "\t<tr><td colspan=3><form method=\"post\" enctype=\"multipart/form-data\">\
<input required name=\"file\" type=\"file\"/><input value=\"Upload\" type=\"submit\"/>\
</form></td></tr>\n",
            );
        }

        html.push_str("\t</tbody>\n</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}
