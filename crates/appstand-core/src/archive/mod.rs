//! Streaming walker over gzipped application archives.
//!
//! The walker reads a buffered archive twice. The first pass locates the
//! manifest (and an optional `package.json`), detects the application kind
//! from the manifest filename and computes the tar prefix. The second pass
//! runs once the manifest has told us which paths matter, and harvests the
//! icon and screenshot bytes as attachments.
//!
//! The tar prefix is the single top-level directory shared by every regular
//! file in the archive, or empty when the entries do not agree on one.

mod mime;

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use mime::mime_type;

use crate::error::RegistryError;

/// Content types that are unconditionally gunzipped before the tar walk.
const GZIP_CONTENT_TYPES: [&str; 4] = [
    "application/gzip",
    "application/x-gzip",
    "application/x-tgz",
    "application/tar+gzip",
];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Directory under which screenshots are filed in the attachment map.
pub const SCREENSHOTS_DIR: &str = "screenshots";

/// The kind of application, detected from the manifest filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Packaged web application, `manifest.webapp`.
    Webapp,
    /// Connector, `manifest.konnector`.
    Konnector,
}

impl AppKind {
    /// The kind name as stored in documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Webapp => "webapp",
            Self::Konnector => "konnector",
        }
    }

    /// The manifest filename announcing this kind.
    #[must_use]
    pub const fn manifest_filename(self) -> &'static str {
        match self {
            Self::Webapp => "manifest.webapp",
            Self::Konnector => "manifest.konnector",
        }
    }

    fn from_manifest_filename(basename: &str) -> Option<Self> {
        match basename {
            "manifest.webapp" => Some(Self::Webapp),
            "manifest.konnector" => Some(Self::Konnector),
            _ => None,
        }
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webapp" => Ok(Self::Webapp),
            "konnector" => Ok(Self::Konnector),
            _ => Err(RegistryError::AppInvalid("type".to_owned())),
        }
    }
}

/// Failures while reading the archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive ends mid-entry; usually the download hit the size cap.
    #[error("archive is truncated")]
    Truncated,

    /// Gzip or tar level failure.
    #[error("could not read archive: {0}")]
    Io(#[from] std::io::Error),

    /// A `package.json` file was present but not valid JSON.
    #[error("file package.json is not valid: {0}")]
    PackageJsonInvalid(#[source] serde_json::Error),
}

/// What the metadata pass found.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Application kind, from whichever manifest filename matched.
    pub kind: Option<AppKind>,
    /// Raw manifest bytes, if a manifest was present.
    pub manifest: Option<Vec<u8>>,
    /// The `version` field of an embedded `package.json`, if any.
    pub package_version: Option<String>,
    /// The shared top-level directory, without slashes, or empty.
    pub tar_prefix: String,
    /// Bytes consumed from the buffered download during the walk.
    pub consumed: u64,
}

/// One harvested attachment, hashed and typed, ready for storage.
#[derive(Debug, Clone)]
pub struct RawAttachment {
    /// Storage filename: `icon` or `screenshots/<basename>`.
    pub filename: String,
    /// Inferred MIME type.
    pub content_type: &'static str,
    /// Content length in bytes.
    pub size: u64,
    /// Lowercase hex sha-256 of the content.
    pub digest: String,
    /// The content itself.
    pub data: Vec<u8>,
}

/// Metadata pass: locate manifest and `package.json`, detect the kind and
/// the tar prefix, count consumed bytes.
///
/// # Errors
///
/// Fails on gzip/tar corruption, truncation, or an unreadable
/// `package.json`.
pub fn scan(data: &[u8], content_type: &str) -> Result<ScanOutcome, ArchiveError> {
    let mut outcome = ScanOutcome::default();
    let mut counter = CountingReader::new(data);
    {
        let mut archive = tar::Archive::new(reader_for(&mut counter, data, content_type));
        let mut has_prefix = true;

        for entry in archive.entries()? {
            let mut entry = entry.map_err(map_tar_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let fullname = clean_path(&String::from_utf8_lossy(&entry.path_bytes()));
            let (dirname, basename) = split_path(&fullname);

            if has_prefix && dirname != "/" {
                let root = dirname[1..].split('/').next().unwrap_or("");
                if outcome.tar_prefix.is_empty() {
                    outcome.tar_prefix = root.to_owned();
                } else if outcome.tar_prefix != root {
                    has_prefix = false;
                }
            } else {
                has_prefix = false;
            }

            if outcome.kind.is_none() {
                if let Some(kind) = AppKind::from_manifest_filename(basename) {
                    let mut content = Vec::new();
                    entry.read_to_end(&mut content).map_err(map_tar_err)?;
                    outcome.kind = Some(kind);
                    outcome.manifest = Some(content);
                    continue;
                }
            }

            if basename == "package.json" {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).map_err(map_tar_err)?;
                let pack: PackageJson = serde_json::from_slice(&content)
                    .map_err(ArchiveError::PackageJsonInvalid)?;
                if !pack.version.is_empty() {
                    outcome.package_version = Some(pack.version);
                }
            }
        }

        if !has_prefix {
            outcome.tar_prefix.clear();
        }
    }
    outcome.consumed = counter.count;
    Ok(outcome)
}

/// Attachment pass: re-walk the buffered archive and pull out the icon and
/// screenshot files. `icon_path` and `screenshot_paths` are normalised
/// absolute paths inside the archive (prefix not included); the detected
/// tar prefix is stripped from each entry before matching.
///
/// # Errors
///
/// Any failure aborts the pass; partially collected attachments are
/// discarded by the caller.
pub fn collect_attachments(
    data: &[u8],
    content_type: &str,
    tar_prefix: &str,
    icon_path: Option<&str>,
    screenshot_paths: &[String],
) -> Result<Vec<RawAttachment>, ArchiveError> {
    let mut attachments = Vec::new();
    if icon_path.is_none() && screenshot_paths.is_empty() {
        return Ok(attachments);
    }

    let mut archive = tar::Archive::new(reader_for(data, data, content_type));

    for entry in archive.entries()? {
        let mut entry = entry.map_err(map_tar_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let mut name = clean_path(&String::from_utf8_lossy(&entry.path_bytes()));
        if !tar_prefix.is_empty() {
            if let Some(stripped) = name.strip_prefix(&format!("/{tar_prefix}")) {
                name = clean_path(stripped);
            }
        }
        if name == "/" {
            continue;
        }

        let is_icon = icon_path == Some(name.as_str());
        let is_shot = !is_icon && screenshot_paths.iter().any(|p| p == &name);
        if !is_icon && !is_shot {
            continue;
        }

        let mut content = Vec::new();
        entry.read_to_end(&mut content).map_err(map_tar_err)?;

        let filename = if is_icon {
            "icon".to_owned()
        } else {
            let (_, basename) = split_path(&name);
            format!("{SCREENSHOTS_DIR}/{basename}")
        };

        attachments.push(RawAttachment {
            content_type: mime_type(&name, &content),
            size: content.len() as u64,
            digest: hex_digest(&content),
            data: content,
            filename,
        });
    }

    Ok(attachments)
}

/// Lowercase hex sha-256 over a byte slice.
#[must_use]
pub fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[derive(serde::Deserialize)]
struct PackageJson {
    #[serde(default)]
    version: String,
}

/// Picks the tar byte source for the declared content type: gzip types are
/// unconditionally gunzipped, `application/octet-stream` only when the
/// gzip magic is present, anything else is read as a bare tar.
fn reader_for<'a, R: Read + 'a>(reader: R, head: &[u8], content_type: &str) -> Box<dyn Read + 'a> {
    if GZIP_CONTENT_TYPES.contains(&content_type)
        || (content_type == "application/octet-stream" && head.starts_with(&GZIP_MAGIC))
    {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    }
}

fn map_tar_err(err: std::io::Error) -> ArchiveError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ArchiveError::Truncated
    } else {
        ArchiveError::Io(err)
    }
}

/// Joins a tar entry name to `/` and resolves `.` and `..` segments.
pub(crate) fn clean_path(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                parts.pop();
            },
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Dirname and basename of a cleaned path.
fn split_path(fullname: &str) -> (&str, &str) {
    match fullname.rfind('/') {
        Some(0) => ("/", &fullname[1..]),
        Some(idx) => (&fullname[..idx], &fullname[idx + 1..]),
        None => ("/", fullname),
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzipped(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    const MANIFEST: &[u8] = br#"{"editor":"acme","slug":"notes","version":"1.0.0"}"#;

    #[test]
    fn detects_kind_prefix_and_manifest() {
        let data = gzipped(&tarball(&[
            ("notes/manifest.webapp", MANIFEST),
            ("notes/icon.svg", b"<svg/>"),
            ("notes/assets/app.js", b"0"),
        ]));
        let outcome = scan(&data, "application/gzip").unwrap();
        assert_eq!(outcome.kind, Some(AppKind::Webapp));
        assert_eq!(outcome.tar_prefix, "notes");
        assert_eq!(outcome.manifest.as_deref(), Some(MANIFEST));
        assert!(outcome.consumed > 0);
    }

    #[test]
    fn no_shared_top_level_means_empty_prefix() {
        let data = gzipped(&tarball(&[
            ("notes/manifest.konnector", MANIFEST),
            ("other/icon.svg", b"<svg/>"),
        ]));
        let outcome = scan(&data, "application/gzip").unwrap();
        assert_eq!(outcome.kind, Some(AppKind::Konnector));
        assert_eq!(outcome.tar_prefix, "");
    }

    #[test]
    fn root_level_file_clears_the_prefix() {
        let data = gzipped(&tarball(&[
            ("manifest.webapp", MANIFEST),
            ("icon.svg", b"<svg/>"),
        ]));
        let outcome = scan(&data, "application/gzip").unwrap();
        assert_eq!(outcome.tar_prefix, "");
    }

    #[test]
    fn package_json_version_is_read() {
        let data = gzipped(&tarball(&[
            ("app/manifest.webapp", MANIFEST),
            ("app/package.json", br#"{"name":"notes","version":"1.0.0"}"#),
        ]));
        let outcome = scan(&data, "application/gzip").unwrap();
        assert_eq!(outcome.package_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn invalid_package_json_is_an_error() {
        let data = gzipped(&tarball(&[
            ("app/manifest.webapp", MANIFEST),
            ("app/package.json", b"not json"),
        ]));
        assert!(matches!(
            scan(&data, "application/gzip"),
            Err(ArchiveError::PackageJsonInvalid(_))
        ));
    }

    #[test]
    fn octet_stream_is_opportunistically_gunzipped() {
        let plain = tarball(&[("app/manifest.webapp", MANIFEST)]);
        let outcome = scan(&plain, "application/octet-stream").unwrap();
        assert_eq!(outcome.kind, Some(AppKind::Webapp));

        let compressed = gzipped(&plain);
        let outcome = scan(&compressed, "application/octet-stream").unwrap();
        assert_eq!(outcome.kind, Some(AppKind::Webapp));
    }

    #[test]
    fn bad_gzip_under_gzip_content_type_fails() {
        let plain = tarball(&[("app/manifest.webapp", MANIFEST)]);
        assert!(scan(&plain, "application/gzip").is_err());
    }

    #[test]
    fn collects_icon_and_screenshots_with_prefix_stripped() {
        let data = gzipped(&tarball(&[
            ("notes/manifest.webapp", MANIFEST),
            ("notes/icon.svg", b"<svg/>"),
            ("notes/shots/one.png", b"\x89PNG\r\n\x1a\npng-bytes"),
            ("notes/shots/two.png", b"\x89PNG\r\n\x1a\nmore-bytes"),
            ("notes/README.md", b"readme"),
        ]));
        let attachments = collect_attachments(
            &data,
            "application/gzip",
            "notes",
            Some("/icon.svg"),
            &["/shots/one.png".to_owned(), "/shots/two.png".to_owned()],
        )
        .unwrap();

        assert_eq!(attachments.len(), 3);
        let icon = &attachments[0];
        assert_eq!(icon.filename, "icon");
        assert_eq!(icon.content_type, "image/svg+xml");
        assert_eq!(icon.size, 6);
        assert_eq!(icon.digest, hex_digest(b"<svg/>"));

        let names: Vec<_> = attachments.iter().map(|a| a.filename.as_str()).collect();
        assert!(names.contains(&"screenshots/one.png"));
        assert!(names.contains(&"screenshots/two.png"));
    }

    #[test]
    fn nothing_requested_collects_nothing() {
        let data = gzipped(&tarball(&[("notes/manifest.webapp", MANIFEST)]));
        let attachments =
            collect_attachments(&data, "application/gzip", "notes", None, &[]).unwrap();
        assert!(attachments.is_empty());
    }

    #[test]
    fn clean_path_resolves_relative_segments() {
        assert_eq!(clean_path("a/b/c"), "/a/b/c");
        assert_eq!(clean_path("./a//b/"), "/a/b");
        assert_eq!(clean_path("a/../b"), "/b");
        assert_eq!(clean_path("../x"), "/x");
    }
}
