// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! GET and POST response production.
//!
//! Body consumption (POST) and file resolution (GET) are each a single
//! trait so the parser driver never hard-codes an image codec or a
//! filesystem call; [`ImageSink`] and [`FsSource`] are the defaults that
//! match the distilled server's behavior.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::ConnError;
use crate::mime;
use crate::parser::Status;

/// Acknowledgement body sent for every successful POST. The misspelling is
/// intentional: it matches the wire format of the server this one reimplements.
pub const POST_ACK_BODY: &[u8] = b"I have receiced this.";

/// Consumes a POST body. The default implementation ([`ImageSink`]) decodes
/// it as an image and writes `receive.bmp`; a malformed image is logged and
/// swallowed rather than failing the response, since the acknowledgement
/// has already been written to the client by the time decoding runs.
pub trait BodySink: Send + Sync {
    /// Accepts the full request body.
    fn accept(&self, body: &[u8]);
}

/// Decodes the body as an image of arbitrary format and writes it to
/// `receive.bmp` in the current working directory.
#[derive(Debug, Default)]
pub struct ImageSink;

impl BodySink for ImageSink {
    fn accept(&self, body: &[u8]) {
        match image::load_from_memory(body) {
            Ok(img) => {
                if let Err(err) = img.save_with_format("receive.bmp", image::ImageFormat::Bmp) {
                    tracing::warn!(error = %err, "failed to write receive.bmp");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to decode POST body as an image"),
        }
    }
}

/// A GET target resolved to a readable file beneath the server root.
pub struct ResolvedFile {
    /// Absolute path to the file.
    pub path: PathBuf,
    /// Size in bytes, as reported by `stat`.
    pub len: u64,
}

/// Resolves a request target to a file. The default implementation
/// ([`FsSource`]) rejects targets that would escape the server root.
pub trait BodySource: Send + Sync {
    /// Resolves `target` (already stripped of any query string) against `root`.
    fn resolve(&self, root: &Path, target: &str) -> Result<ResolvedFile, ConnError>;
}

/// Resolves GET targets against a server-rooted directory tree.
#[derive(Debug, Default)]
pub struct FsSource;

impl BodySource for FsSource {
    fn resolve(&self, root: &Path, target: &str) -> Result<ResolvedFile, ConnError> {
        let candidate = root.join(target.trim_start_matches('/'));
        let canonical_root = fs::canonicalize(root).map_err(|_| ConnError::NotFound)?;
        let canonical = fs::canonicalize(&candidate).map_err(|_| ConnError::NotFound)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(ConnError::NotFound);
        }
        let meta = fs::metadata(&canonical).map_err(|_| ConnError::NotFound)?;
        if !meta.is_file() {
            return Err(ConnError::NotFound);
        }
        Ok(ResolvedFile {
            path: canonical,
            len: meta.len(),
        })
    }
}

/// Memory-maps `resolved` and returns its bytes. Empty files map to an
/// empty slice rather than invoking `mmap` with a zero length, which is
/// rejected by the kernel.
pub fn map_file(resolved: &ResolvedFile) -> io::Result<Option<Mmap>> {
    if resolved.len == 0 {
        return Ok(None);
    }
    let file = fs::File::open(&resolved.path)?;
    // SAFETY: the file is opened read-only for the lifetime of this mapping
    // and is not concurrently truncated by this process.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(mmap))
}

/// Builds a `200 OK` status+header block for a GET response.
pub fn get_response_head(resolved: &ResolvedFile, keep_alive: bool, idle_timeout_ms: u64) -> Vec<u8> {
    let content_type = mime::lookup(&resolved.path);
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        Status::r#Ok.code(),
        Status::r#Ok.reason()
    );
    if keep_alive {
        head.push_str("Connection: keep-alive\r\n");
        head.push_str(&format!("Keep-Alive: timeout={}\r\n", idle_timeout_ms));
    }
    head.push_str(&format!("Content-type: {}\r\n", content_type));
    head.push_str(&format!("Content-length: {}\r\n\r\n", resolved.len));
    head.into_bytes()
}

/// Builds the full `404 Not Found!` response, header and body together.
pub fn not_found_response() -> Vec<u8> {
    let body = format!(
        "<html><title>TKeed Error</title><body bgcolor=\"ffffff\">{} {}<hr><em> My Web Server</em>\n</body></html>",
        Status::NotFound.code(),
        Status::NotFound.reason()
    );
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        Status::NotFound.code(),
        Status::NotFound.reason()
    );
    head.push_str("Content-type: text/html\r\n");
    head.push_str("Connection: close\r\n");
    head.push_str(&format!("Content-length: {}\r\n\r\n", body.len()));
    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Builds the full POST acknowledgement response, header and body together.
pub fn post_response(keep_alive: bool, idle_timeout_ms: u64) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        Status::r#Ok.code(),
        Status::r#Ok.reason()
    );
    if keep_alive {
        head.push_str("Connection: keep-alive\r\n");
        head.push_str(&format!("Keep-Alive: timeout={}\r\n", idle_timeout_ms));
    }
    head.push_str(&format!("Content-length: {}\r\n\r\n", POST_ACK_BODY.len()));
    let mut out = head.into_bytes();
    out.extend_from_slice(POST_ACK_BODY);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("hello.txt");
        fs::File::create(&file_path)
            .unwrap()
            .write_all(b"hi\n")
            .unwrap();

        let resolved = FsSource.resolve(dir.path(), "hello.txt").unwrap();
        assert_eq!(resolved.len, 3);
    }

    #[test]
    fn rejects_path_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsSource.resolve(dir.path(), "../etc/passwd");
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsSource.resolve(dir.path(), "nope.txt").is_err());
    }

    #[test]
    fn not_found_body_contains_expected_substring() {
        let resp = not_found_response();
        let text = String::from_utf8_lossy(&resp);
        assert!(text.contains("404 Not Found!"));
    }
}
