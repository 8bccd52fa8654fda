//! On-the-fly tar.gz and zip synthesis of a directory tree.
//!
//! The tree is walked once and every regular file is copied straight into the
//! archive as it is reached. Nothing is staged on disk or in memory: the
//! archive bytes flow through a bounded pipe into the response body, so a
//! slow or vanished client throttles (or aborts) the walk itself.

use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::fs;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::{SimpleFileOptions, StreamWriter};

use crate::error::ServeError;

const BUFFER_SIZE: usize = 64 * 1024;

pub const TAR_GZ_CONTENT_TYPE: &str = "application/x-tar+gzip";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => TAR_GZ_CONTENT_TYPE,
            ArchiveFormat::Zip => ZIP_CONTENT_TYPE,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// Header data for one file inside an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path relative to the archive root, always `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub mode: u32,
    pub modified: SystemTime,
}

impl ArchiveEntry {
    fn from_metadata(relative_path: String, metadata: &Metadata) -> Self {
        Self {
            relative_path,
            size: metadata.len(),
            mode: file_mode(metadata),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
        }
    }
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// A container format that file entries can be streamed into.
///
/// `append` writes the entry header, copies exactly `entry.size` bytes from
/// `contents` and closes the entry. `finish` writes the trailing structures
/// and flushes the underlying writer; it must be called even after a failed
/// `append`.
pub trait ArchiveWriter {
    fn append(&mut self, entry: &ArchiveEntry, contents: &mut dyn Read) -> io::Result<()>;

    fn finish(self) -> io::Result<()>;
}

/// Counts the bytes read through it.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// tar entries inside a gzip stream.
pub struct TarGzWriter<W: Write> {
    builder: tar::Builder<GzEncoder<W>>,
}

impl<W: Write> TarGzWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: tar::Builder::new(GzEncoder::new(writer, Compression::default())),
        }
    }
}

impl<W: Write> ArchiveWriter for TarGzWriter<W> {
    fn append(&mut self, entry: &ArchiveEntry, contents: &mut dyn Read) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.size);
        header.set_mode(entry.mode);
        header.set_mtime(unix_seconds(entry.modified));

        let mut reader = CountingReader::new(contents.take(entry.size));
        self.builder
            .append_data(&mut header, &entry.relative_path, &mut reader)?;

        // The header already promised `entry.size` bytes; anything less
        // misaligns every later entry.
        if reader.count != entry.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{}: expected {} bytes, read {}",
                    entry.relative_path, entry.size, reader.count
                ),
            ));
        }
        Ok(())
    }

    fn finish(self) -> io::Result<()> {
        let encoder = self.builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()
    }
}

/// Zip written in streaming mode: sizes and checksums follow each entry's
/// data, so the underlying writer never needs to seek.
pub struct ZipStreamWriter<W: Write> {
    zip: ZipWriter<StreamWriter<W>>,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            zip: ZipWriter::new_stream(writer),
        }
    }
}

impl<W: Write> ArchiveWriter for ZipStreamWriter<W> {
    fn append(&mut self, entry: &ArchiveEntry, contents: &mut dyn Read) -> io::Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(entry.mode)
            .large_file(entry.size >= u64::from(u32::MAX));

        self.zip
            .start_file(entry.relative_path.as_str(), options)
            .map_err(zip_error_to_io)?;
        io::copy(&mut contents.take(entry.size), &mut self.zip)?;
        Ok(())
    }

    fn finish(self) -> io::Result<()> {
        let stream = self.zip.finish().map_err(zip_error_to_io)?;
        let mut writer = stream.into_inner();
        writer.flush()
    }
}

fn zip_error_to_io(error: zip::result::ZipError) -> io::Error {
    match error {
        zip::result::ZipError::Io(err) => err,
        other => io::Error::other(other.to_string()),
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write an archive of `root` in `format` to `writer`.
///
/// Blocking. The first walk, read or write error aborts the walk; the archive
/// is finalized regardless and that first error is returned.
pub fn write_archive<W: Write>(writer: W, root: &Path, format: ArchiveFormat) -> io::Result<()> {
    match format {
        ArchiveFormat::TarGz => write_tree(TarGzWriter::new(writer), root),
        ArchiveFormat::Zip => write_tree(ZipStreamWriter::new(writer), root),
    }
}

fn write_tree<A: ArchiveWriter>(mut archive: A, root: &Path) -> io::Result<()> {
    let walked = append_tree(&mut archive, root);
    let finished = archive.finish();

    match walked {
        Ok(()) => finished,
        Err(err) => {
            if let Err(finish_err) = finished {
                debug!("Finalizing aborted archive failed: {}", finish_err);
            }
            Err(err)
        }
    }
}

fn append_tree<A: ArchiveWriter>(archive: &mut A, root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata()?;
        let mut relative_path = relative_name(root, entry.path());
        if relative_path.is_empty() {
            // `root` is itself a file
            relative_path = entry.file_name().to_string_lossy().to_string();
        }

        let archive_entry = ArchiveEntry::from_metadata(relative_path, &metadata);
        let mut file = File::open(entry.path())?;
        archive.append(&archive_entry, &mut file)?;
    }

    Ok(())
}

/// Relative path from `root` to `path`, joined with `/`.
fn relative_name(root: &Path, path: &Path) -> String {
    let Ok(relative) = path.strip_prefix(root) else {
        return String::new();
    };

    let mut parts = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().to_string());
        }
    }

    parts.join("/")
}

/// Build the streaming archive response for `root`.
///
/// Headers are committed as soon as this returns, so only a root that cannot
/// be opened at all still turns into an error status. Later failures truncate
/// the body and are logged.
pub async fn archive_response(
    root: PathBuf,
    is_dir: bool,
    format: ArchiveFormat,
) -> Result<Response, ServeError> {
    if is_dir {
        fs::read_dir(&root).await?;
    } else {
        fs::File::open(&root).await?;
    }

    let base_name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let file_name = format!("{}.{}", base_name, format.extension()).replace('"', "'");

    debug!("Streaming {} as {}", root.display(), file_name);

    let (reader, writer) = tokio::io::duplex(BUFFER_SIZE);
    tokio::task::spawn_blocking(move || {
        let writer = SyncIoBridge::new(writer);
        if let Err(err) = write_archive(writer, &root, format) {
            warn!("Archive of {} aborted: {}", root.display(), err);
        }
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("a.txt"), "hi").unwrap();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("b.txt"), "bye").unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        temp_dir
    }

    fn read_zip(bytes: Vec<u8>) -> BTreeMap<String, String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entries = BTreeMap::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            assert!(!file.is_dir(), "unexpected directory entry {}", file.name());
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            entries.insert(file.name().to_string(), content);
        }
        entries
    }

    fn read_tar_gz(bytes: Vec<u8>) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(Cursor::new(bytes)));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            assert_eq!(entry.header().entry_type(), tar::EntryType::Regular);
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            entries.insert(name, content);
        }
        entries
    }

    fn expected() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("a.txt".to_string(), "hi".to_string()),
            ("sub/b.txt".to_string(), "bye".to_string()),
        ])
    }

    #[test]
    fn test_zip_contains_only_files() {
        let tree = sample_tree();
        let mut bytes = Vec::new();
        write_archive(&mut bytes, tree.path(), ArchiveFormat::Zip).unwrap();

        assert_eq!(read_zip(bytes), expected());
    }

    #[test]
    fn test_tar_gz_contains_only_files() {
        let tree = sample_tree();
        let mut bytes = Vec::new();
        write_archive(&mut bytes, tree.path(), ArchiveFormat::TarGz).unwrap();

        assert_eq!(read_tar_gz(bytes), expected());
    }

    #[test]
    fn test_tar_gz_header_carries_size_and_mtime() {
        let tree = sample_tree();
        let mut bytes = Vec::new();
        write_archive(&mut bytes, &tree.path().join("sub"), ArchiveFormat::TarGz).unwrap();

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(Cursor::new(bytes)));
        let mut entries = archive.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "b.txt");
        assert_eq!(entry.header().size().unwrap(), 3);
        assert!(entry.header().mtime().unwrap() > 0);
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_empty_directory_yields_valid_empty_archives() {
        let temp_dir = TempDir::new().unwrap();

        let mut bytes = Vec::new();
        write_archive(&mut bytes, temp_dir.path(), ArchiveFormat::Zip).unwrap();
        assert!(read_zip(bytes).is_empty());

        let mut bytes = Vec::new();
        write_archive(&mut bytes, temp_dir.path(), ArchiveFormat::TarGz).unwrap();
        assert!(read_tar_gz(bytes).is_empty());
    }

    #[test]
    fn test_single_file_root_uses_file_name() {
        let tree = sample_tree();
        let mut bytes = Vec::new();
        write_archive(&mut bytes, &tree.path().join("a.txt"), ArchiveFormat::Zip).unwrap();

        assert_eq!(
            read_zip(bytes),
            BTreeMap::from([("a.txt".to_string(), "hi".to_string())])
        );
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut bytes = Vec::new();
        let result = write_archive(
            &mut bytes,
            &temp_dir.path().join("missing"),
            ArchiveFormat::TarGz,
        );
        assert!(result.is_err());
    }

    struct FailingWriter {
        budget: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_aborts_walk() {
        let temp_dir = TempDir::new().unwrap();
        // Incompressible payload so the output cannot fit in the writer's budget.
        let mut state = 0x2545_f491_u32;
        for i in 0..8 {
            let payload: Vec<u8> = (0..64 * 1024)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    state as u8
                })
                .collect();
            std::fs::write(temp_dir.path().join(format!("f{}.bin", i)), payload).unwrap();
        }

        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz] {
            let writer = FailingWriter { budget: 1024 };
            let err = write_archive(writer, temp_dir.path(), format).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        }
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk went away"))
        }
    }

    fn entry(name: &str, size: u64) -> ArchiveEntry {
        ArchiveEntry {
            relative_path: name.to_string(),
            size,
            mode: 0o644,
            modified: SystemTime::now(),
        }
    }

    #[test]
    fn test_tar_gz_is_finalized_after_failed_entry() {
        let mut bytes = Vec::new();
        let mut writer = TarGzWriter::new(&mut bytes);
        writer
            .append(&entry("first.txt", 5), &mut Cursor::new("first"))
            .unwrap();
        assert!(writer.append(&entry("second.txt", 10), &mut BrokenReader).is_err());
        writer.finish().unwrap();

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(Cursor::new(bytes)));
        let mut first = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = String::new();
        first.read_to_string(&mut content).unwrap();
        assert_eq!(content, "first");
    }

    #[test]
    fn test_tar_gz_short_read_fails_entry() {
        let mut bytes = Vec::new();
        let mut writer = TarGzWriter::new(&mut bytes);
        writer
            .append(&entry("first.txt", 5), &mut Cursor::new("first"))
            .unwrap();

        let err = writer
            .append(&entry("shrunk.txt", 600), &mut Cursor::new("short"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        writer.finish().unwrap();

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(Cursor::new(bytes)));
        let mut first = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = String::new();
        first.read_to_string(&mut content).unwrap();
        assert_eq!(content, "first");
    }

    #[test]
    fn test_zip_is_finalized_after_failed_entry() {
        let mut bytes = Vec::new();
        let mut writer = ZipStreamWriter::new(&mut bytes);
        writer
            .append(&entry("first.txt", 5), &mut Cursor::new("first"))
            .unwrap();
        assert!(writer.append(&entry("second.txt", 10), &mut BrokenReader).is_err());
        writer.finish().unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut content = String::new();
        archive
            .by_name("first.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "first");
    }

    #[test]
    fn test_copy_is_bounded_by_recorded_size() {
        let mut bytes = Vec::new();
        let mut writer = ZipStreamWriter::new(&mut bytes);
        writer
            .append(&entry("grown.txt", 4), &mut Cursor::new("grew after stat"))
            .unwrap();
        writer.finish().unwrap();

        let entries = read_zip(bytes);
        assert_eq!(entries["grown.txt"], "grew");
    }

    #[test]
    fn test_relative_name_uses_forward_slashes() {
        let root = Path::new("/srv/data");
        assert_eq!(
            relative_name(root, &root.join("a").join("b.txt")),
            "a/b.txt"
        );
        assert_eq!(relative_name(root, root), "");
    }

    #[tokio::test]
    async fn test_archive_response_headers() {
        let tree = sample_tree();
        let root = tree.path().join("sub");

        let response = archive_response(root, true, ArchiveFormat::TarGz)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            TAR_GZ_CONTENT_TYPE
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"sub.tar.gz\""
        );
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            read_tar_gz(body.to_vec()),
            BTreeMap::from([("b.txt".to_string(), "bye".to_string())])
        );
    }
}
