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

//! Suffix-based MIME type lookup for GET responses.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

const DEFAULT: &str = "text/html";

static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();

fn table() -> &'static HashMap<&'static str, &'static str> {
    TABLE.get_or_init(|| {
        HashMap::from([
            ("html", "text/html"),
            ("htm", "text/html"),
            ("avi", "video/x-msvideo"),
            ("bmp", "image/bmp"),
            ("c", "text/plain"),
            ("doc", "application/msword"),
            ("gif", "image/gif"),
            ("gz", "application/x-gzip"),
            ("ico", "application/x-ico"),
            ("jpg", "image/jpeg"),
            ("jpeg", "image/jpeg"),
            ("png", "image/png"),
            ("txt", "text/plain"),
            ("mp3", "audio/mp3"),
        ])
    })
}

/// Resolves the content type for a path by its extension, defaulting to
/// `text/html` when the extension is absent or unrecognized.
pub fn lookup(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| table().get(&ext.to_ascii_lowercase()[..]).copied())
        .unwrap_or(DEFAULT)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_suffix_resolves() {
        assert_eq!(lookup(Path::new("a/b.html")), "text/html");
        assert_eq!(lookup(Path::new("image.PNG")), "image/png");
        assert_eq!(lookup(Path::new("archive.gz")), "application/x-gzip");
    }

    #[test]
    fn unknown_or_missing_suffix_defaults() {
        assert_eq!(lookup(Path::new("no_extension")), DEFAULT);
        assert_eq!(lookup(Path::new("weird.xyz")), DEFAULT);
    }
}
