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

//! Incremental request-line and header parsing.
//!
//! Both parsers are pure functions/state machines over a byte buffer that
//! may not yet contain a full line: callers feed the same (growing) prefix
//! of the connection's read buffer on every call until a terminator shows
//! up, then strip the consumed bytes. This lets a single TCP segment be
//! split across arbitrarily many `read()`s without losing state.

use crate::error::ParseError;
use crate::parser::{Method, Version};

/// A fully parsed request line.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine {
    /// Request method (`GET` or `POST`; nothing else is supported).
    pub method: Method,
    /// Request target, `?query` stripped, `/` stripped, defaulting to
    /// `index.html` when the client asked for `/`.
    pub target: String,
    /// Declared protocol version.
    pub version: Version,
}

/// Attempts to parse a complete request line from the front of `buf`.
///
/// Returns `Ok(None)` when no `\r\n` has arrived yet — the caller should
/// leave `buf` untouched and wait for more bytes. Returns
/// `Ok(Some((line, consumed)))` when a full line parsed successfully;
/// `consumed` is the number of bytes (including the trailing `\r\n`) the
/// caller should drop from the front of its buffer.
pub fn parse_request_line(buf: &[u8]) -> Result<Option<(RequestLine, usize)>, ParseError> {
    let Some(crlf) = find(buf, b"\r\n") else {
        return Ok(None);
    };
    let line = &buf[..crlf];
    let consumed = crlf + 2;

    let (method, after_method) = if let Some(pos) = find(line, b"GET") {
        (Method::Get, pos + 3)
    } else if let Some(pos) = find(line, b"POST") {
        (Method::Post, pos + 4)
    } else {
        return Err(ParseError::Method);
    };

    let slash = find(&line[after_method..], b"/").ok_or(ParseError::Target)? + after_method;
    let space = find(&line[slash..], b" ").ok_or(ParseError::Target)? + slash;
    let target = if space > slash + 1 {
        let raw = &line[slash + 1..space];
        let raw = match find(raw, b"?") {
            Some(q) => &raw[..q],
            None => raw,
        };
        std::str::from_utf8(raw)
            .map_err(|_| ParseError::Target)?
            .to_owned()
    } else {
        "index.html".to_owned()
    };

    let rest = trim_leading_spaces(&line[space..]);
    let version = parse_version_token(rest)?;

    Ok(Some((
        RequestLine {
            method,
            target,
            version,
        },
        consumed,
    )))
}

fn parse_version_token(tok: &[u8]) -> Result<Version, ParseError> {
    match tok {
        b"HTTP/1.0" => Ok(Version::H1_0),
        b"HTTP/1.1" => Ok(Version::H1_1),
        _ => Err(ParseError::Version),
    }
}

fn trim_leading_spaces(buf: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < buf.len() && buf[i] == b' ' {
        i += 1;
    }
    &buf[i..]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Byte-wise states of the header parser, mirroring RFC 9112's informal
/// grammar for a `field-line` sequence terminated by an empty line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPhase {
    /// At the start of a header line, or just past the terminating CRLF.
    Start,
    /// Scanning the header name.
    Key,
    /// Just consumed the `:` after a name.
    Colon,
    /// Consuming OWS between `:` and the value.
    SpacesAfterColon,
    /// Scanning the header value.
    Value,
    /// Consumed `\r` while scanning a value; expects `\n` next.
    Cr,
    /// Just committed a `name: value` pair; deciding whether another
    /// header line follows or this is the blank-line terminator.
    Lf,
    /// Consumed the `\r` of the terminating blank line; expects `\n`.
    EndCr,
    /// Header section is fully parsed.
    EndLf,
}

const MAX_HEADER_VALUE_LEN: usize = 255;

/// Incremental header-section scanner.
///
/// A single instance is driven across as many calls to [`HeaderScanner::step`]
/// as it takes for the full header section to arrive. Indices held between
/// calls are always relative to the *current* buffer — the caller must
/// drop only the bytes [`HeaderScanner::step`] reports as consumed.
#[derive(Debug)]
pub struct HeaderScanner {
    phase: HeaderPhase,
    key_start: usize,
    key_end: usize,
    value_start: usize,
    value_end: usize,
    /// How far into the retained (undropped) buffer this scanner has
    /// already scanned. Bytes before a completed header line are dropped
    /// by the caller and everything else is rescanned each call — a
    /// partially-seen key or value must stay in the buffer so it can
    /// eventually be sliced out, so the scanner has to resume from where
    /// it left off instead of rewalking those bytes under a phase that's
    /// already moved past them.
    cursor: usize,
}

impl Default for HeaderScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one [`HeaderScanner::step`] call.
pub enum HeaderStep {
    /// The header section is not finished. The caller should drop the
    /// first `consumed` bytes from its buffer (bytes belonging to lines
    /// already folded into `headers`) and wait for more data.
    NeedMoreData {
        /// Bytes safe to discard from the front of the buffer.
        consumed: usize,
    },
    /// The blank line terminating the header section was found.
    Complete {
        /// Bytes to discard, up to and including the terminating `\r\n`.
        consumed: usize,
    },
}

impl HeaderScanner {
    /// Creates a scanner positioned at the start of a header section.
    pub fn new() -> Self {
        Self {
            phase: HeaderPhase::Start,
            key_start: 0,
            key_end: 0,
            value_start: 0,
            value_end: 0,
            cursor: 0,
        }
    }

    /// Feeds `buf` (the unconsumed prefix of the connection buffer) through
    /// the state machine, appending any completed `name: value` pairs to
    /// `headers`. `headers` uses last-write-wins semantics for duplicate
    /// names, matching a simple map.
    pub fn step(
        &mut self,
        buf: &[u8],
        headers: &mut Vec<(String, String)>,
    ) -> Result<HeaderStep, ParseError> {
        // `committed` is how many leading bytes of `buf` the caller may drop:
        // everything folded into a completed header line, or (once the
        // section is done) the whole blank-line terminator. `i` resumes from
        // `self.cursor` rather than 0 so bytes already scanned in a previous
        // call are never re-examined under a phase that has since moved on.
        let mut committed = 0usize;
        let mut i = self.cursor;

        while i < buf.len() {
            let b = buf[i];
            match self.phase {
                HeaderPhase::Start => {
                    if b == b'\r' {
                        self.phase = HeaderPhase::EndCr;
                    } else if b == b'\n' {
                        return Err(ParseError::HeaderName);
                    } else {
                        self.phase = HeaderPhase::Key;
                        self.key_start = i;
                        continue;
                    }
                }
                HeaderPhase::Key => {
                    if b == b':' {
                        self.key_end = i;
                        if self.key_end == self.key_start {
                            return Err(ParseError::HeaderName);
                        }
                        self.phase = HeaderPhase::Colon;
                    } else if b == b'\n' || b == b'\r' {
                        return Err(ParseError::HeaderName);
                    }
                }
                HeaderPhase::Colon => {
                    if b == b' ' {
                        self.phase = HeaderPhase::SpacesAfterColon;
                    } else {
                        return Err(ParseError::HeaderName);
                    }
                }
                HeaderPhase::SpacesAfterColon => {
                    self.phase = HeaderPhase::Value;
                    self.value_start = i;
                    continue;
                }
                HeaderPhase::Value => {
                    if b == b'\r' {
                        self.phase = HeaderPhase::Cr;
                        self.value_end = i;
                        if self.value_end == self.value_start {
                            return Err(ParseError::HeaderValue);
                        }
                    } else if i - self.value_start > MAX_HEADER_VALUE_LEN {
                        return Err(ParseError::HeaderValueTooLong);
                    }
                }
                HeaderPhase::Cr => {
                    if b == b'\n' {
                        self.phase = HeaderPhase::Lf;
                        let key = String::from_utf8_lossy(&buf[self.key_start..self.key_end])
                            .into_owned();
                        let value = String::from_utf8_lossy(&buf[self.value_start..self.value_end])
                            .into_owned();
                        if let Some(slot) = headers.iter_mut().find(|(k, _)| *k == key) {
                            slot.1 = value;
                        } else {
                            headers.push((key, value));
                        }
                        committed = i + 1;
                    } else {
                        return Err(ParseError::NewLine);
                    }
                }
                HeaderPhase::Lf => {
                    if b == b'\r' {
                        self.phase = HeaderPhase::EndCr;
                    } else {
                        self.key_start = i;
                        self.phase = HeaderPhase::Key;
                        continue;
                    }
                }
                HeaderPhase::EndCr => {
                    if b == b'\n' {
                        committed = i + 1;
                        self.phase = HeaderPhase::EndLf;
                    } else {
                        return Err(ParseError::NewLine);
                    }
                    break;
                }
                HeaderPhase::EndLf => break,
            }
            i += 1;
        }

        if self.phase == HeaderPhase::EndLf {
            self.cursor = 0;
            return Ok(HeaderStep::Complete { consumed: committed });
        }

        // Rebase indices so they stay valid once the caller drops
        // `buf[..committed]`; only bytes belonging to already-completed
        // header lines are ever safe to discard.
        self.key_start = self.key_start.saturating_sub(committed);
        self.key_end = self.key_end.saturating_sub(committed);
        self.value_start = self.value_start.saturating_sub(committed);
        self.value_end = self.value_end.saturating_sub(committed);
        self.cursor = i.saturating_sub(committed);

        Ok(HeaderStep::NeedMoreData { consumed: committed })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_line_with_query_strips_to_target() {
        let (line, consumed) =
            parse_request_line(b"GET /a/b?x=1 HTTP/1.1\r\nHost: h\r\n\r\n")
                .unwrap()
                .unwrap();
        assert_eq!(line.method, Method::Get);
        assert_eq!(line.target, "a/b");
        assert_eq!(line.version, Version::H1_1);
        assert_eq!(consumed, "GET /a/b?x=1 HTTP/1.1\r\n".len());
    }

    #[test]
    fn empty_target_defaults_to_index() {
        let (line, _) = parse_request_line(b"GET / HTTP/1.1\r\n").unwrap().unwrap();
        assert_eq!(line.target, "index.html");
    }

    #[test]
    fn incomplete_request_line_requests_more_data() {
        assert!(parse_request_line(b"GET /x HTTP/1.1").unwrap().is_none());
    }

    #[test]
    fn unsupported_method_is_rejected() {
        assert_eq!(
            parse_request_line(b"PUT /x HTTP/1.1\r\n").unwrap_err(),
            ParseError::Method
        );
    }

    #[test]
    fn unsupported_version_is_rejected() {
        assert_eq!(
            parse_request_line(b"GET /x HTTP/2.0\r\n").unwrap_err(),
            ParseError::Version
        );
    }

    #[test]
    fn headers_parsed_in_one_shot() {
        let mut scanner = HeaderScanner::new();
        let mut headers = Vec::new();
        let buf = b"Host: example\r\nContent-length: 5\r\n\r\n";
        match scanner.step(buf, &mut headers).unwrap() {
            HeaderStep::Complete { consumed } => assert_eq!(consumed, buf.len()),
            HeaderStep::NeedMoreData { .. } => panic!("expected completion"),
        }
        assert_eq!(
            headers,
            vec![
                ("Host".to_owned(), "example".to_owned()),
                ("Content-length".to_owned(), "5".to_owned()),
            ]
        );
    }

    #[test]
    fn headers_parsed_across_byte_boundaries() {
        let mut scanner = HeaderScanner::new();
        let mut headers = Vec::new();
        let full = b"Host: example\r\nX-A: 1\r\n\r\n";

        let mut buf = Vec::new();
        let mut done = false;
        for &byte in full {
            buf.push(byte);
            match scanner.step(&buf, &mut headers).unwrap() {
                HeaderStep::Complete { consumed } => {
                    buf.drain(..consumed);
                    done = true;
                    break;
                }
                HeaderStep::NeedMoreData { consumed } => {
                    buf.drain(..consumed);
                }
            }
        }
        assert!(done);
        assert_eq!(
            headers,
            vec![
                ("Host".to_owned(), "example".to_owned()),
                ("X-A".to_owned(), "1".to_owned()),
            ]
        );
    }

    #[test]
    fn duplicate_header_name_keeps_last_value() {
        let mut scanner = HeaderScanner::new();
        let mut headers = Vec::new();
        let buf = b"X-A: 1\r\nX-A: 2\r\n\r\n";
        scanner.step(buf, &mut headers).unwrap();
        assert_eq!(headers, vec![("X-A".to_owned(), "2".to_owned())]);
    }

    #[test]
    fn oversized_header_value_is_rejected() {
        let mut scanner = HeaderScanner::new();
        let mut headers = Vec::new();
        let mut buf = b"X-A: ".to_vec();
        buf.extend(std::iter::repeat(b'a').take(300));
        buf.extend(b"\r\n\r\n");
        assert_eq!(
            scanner.step(&buf, &mut headers).unwrap_err(),
            ParseError::HeaderValueTooLong
        );
    }
}
