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

//! Per-connection state and the incremental request driver.
//!
//! [`ConnectionState`] is the unit of work handed between the dispatcher
//! and the worker pool. [`ConnectionState::drive`] reads whatever is
//! available on the socket, advances as many parse phases as the buffered
//! bytes allow, and reports back what the caller should do next.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::error::{ConnError, ParseError};
use crate::handler::{self, BodySink, BodySource};
use crate::parser::{self, HeaderScanner, HeaderStep, Method, RequestLine};
use crate::timer::Tombstone;

const READ_CHUNK: usize = 4096;

/// Where a connection is in the request lifecycle. Mirrors the distilled
/// state machine: request line, then headers, then (POST only) body, then
/// handler dispatch, then completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    Body,
    Analyze,
    Finish,
}

/// What the worker should do with a connection after [`ConnectionState::drive`] returns.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Not enough data yet; re-arm the timer and re-register on the dispatcher.
    Again,
    /// One request/response cycle completed and the connection stays open.
    KeepAlive,
    /// The connection should be closed (non-keep-alive completion, or a
    /// strike-budget/EOF condition that isn't a hard error).
    Close,
}

/// Per-connection state: socket, buffer, and incremental parser cursors.
pub struct ConnectionState {
    stream: TcpStream,
    token: Token,
    peer: SocketAddr,
    root: Arc<PathBuf>,
    max_empty_reads: u32,
    idle_timeout_ms: u64,

    phase: Phase,
    buffer: Vec<u8>,
    header_scanner: HeaderScanner,
    request_line: Option<RequestLine>,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    keep_alive: bool,
    empty_read_count: u32,

    /// Tombstone for the timer entry currently armed for this connection.
    /// Flipped by the connection itself when it is about to be destroyed
    /// or re-armed with a fresh entry, never read by anyone but the timer
    /// set that owns the matching heap entry.
    pub tombstone: Tombstone,
}

impl ConnectionState {
    /// Wraps a freshly accepted, already-non-blocking stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        token: Token,
        peer: SocketAddr,
        root: Arc<PathBuf>,
        max_empty_reads: u32,
        idle_timeout_ms: u64,
        tombstone: Tombstone,
    ) -> Self {
        Self {
            stream,
            token,
            peer,
            root,
            max_empty_reads,
            idle_timeout_ms,
            phase: Phase::RequestLine,
            buffer: Vec::new(),
            header_scanner: HeaderScanner::new(),
            request_line: None,
            headers: Vec::new(),
            content_length: None,
            keep_alive: false,
            empty_read_count: 0,
            tombstone,
        }
    }

    /// This connection's slot token, stable for its whole lifetime.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address, used for logging.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Mutable access to the underlying stream, for dispatcher (re)registration.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn reset_for_next_request(&mut self) {
        self.phase = Phase::RequestLine;
        self.header_scanner = HeaderScanner::new();
        self.request_line = None;
        self.headers.clear();
        self.content_length = None;
        self.keep_alive = false;
        self.empty_read_count = 0;
    }

    fn fill_buffer(&mut self) -> Result<(), ConnError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(ConnError::IoFatal(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    )));
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.empty_read_count = 0;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.empty_read_count += 1;
                    if self.empty_read_count > self.max_empty_reads {
                        return Err(ConnError::TooManyEmptyReads);
                    }
                    return Ok(());
                }
                Err(e) => return Err(ConnError::IoFatal(e)),
            }
        }
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), ConnError> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(ConnError::IoFatal(io::Error::new(
                        ErrorKind::WriteZero,
                        "failed to write whole response",
                    )));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                    continue;
                }
                Err(e) => return Err(ConnError::IoFatal(e)),
            }
        }
        Ok(())
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn compute_keep_alive(&self) -> bool {
        self.header_value("Connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false)
    }

    /// Drives the state machine as far as the currently buffered bytes
    /// allow, first topping the buffer up with whatever is available on
    /// the socket. Returns the next action for the caller, or the error
    /// that should close the connection.
    pub fn drive(
        &mut self,
        source: &dyn BodySource,
        sink: &dyn BodySink,
    ) -> Result<Outcome, ConnError> {
        self.fill_buffer()?;

        loop {
            match self.phase {
                Phase::RequestLine => match parser::parse_request_line(&self.buffer) {
                    Ok(Some((line, consumed))) => {
                        self.request_line = Some(line);
                        self.buffer.drain(..consumed);
                        self.phase = Phase::Headers;
                    }
                    Ok(None) => return Ok(Outcome::Again),
                    Err(e) => return Err(ConnError::Malformed(e)),
                },
                Phase::Headers => {
                    match self.header_scanner.step(&self.buffer, &mut self.headers) {
                        Ok(HeaderStep::Complete { consumed }) => {
                            self.buffer.drain(..consumed);
                            let is_post = matches!(
                                self.request_line.as_ref().map(|l| l.method),
                                Some(Method::Post)
                            );
                            self.phase = if is_post { Phase::Body } else { Phase::Analyze };
                        }
                        Ok(HeaderStep::NeedMoreData { consumed }) => {
                            self.buffer.drain(..consumed);
                            return Ok(Outcome::Again);
                        }
                        Err(e) => return Err(ConnError::Malformed(e)),
                    }
                }
                Phase::Body => {
                    if self.content_length.is_none() {
                        let len = self
                            .header_value("Content-length")
                            .ok_or(ParseError::MissingContentLength)?
                            .trim()
                            .parse::<usize>()
                            .map_err(|_| ParseError::InvalidContentLength)?;
                        self.content_length = Some(len);
                    }
                    let needed = self.content_length.unwrap();
                    if self.buffer.len() < needed {
                        return Ok(Outcome::Again);
                    }
                    self.phase = Phase::Analyze;
                }
                Phase::Analyze => {
                    self.keep_alive = self.compute_keep_alive();
                    match self.request_line.as_ref().map(|l| l.method) {
                        Some(Method::Get) => self.analyze_get(source)?,
                        Some(Method::Post) => self.analyze_post(sink)?,
                        None => unreachable!("request line always set before Analyze"),
                    }
                    self.phase = Phase::Finish;
                }
                Phase::Finish => {
                    let keep_alive = self.keep_alive;
                    if keep_alive {
                        self.reset_for_next_request();
                        return Ok(Outcome::KeepAlive);
                    }
                    return Ok(Outcome::Close);
                }
            }
        }
    }

    fn analyze_get(&mut self, source: &dyn BodySource) -> Result<(), ConnError> {
        let target = self.request_line.as_ref().unwrap().target.clone();
        match source.resolve(&self.root, &target) {
            Ok(resolved) => {
                let head =
                    handler::get_response_head(&resolved, self.keep_alive, self.idle_timeout_ms);
                self.write_all(&head)?;
                if let Some(mmap) = handler::map_file(&resolved).map_err(ConnError::IoFatal)? {
                    self.write_all(&mmap)?;
                }
                tracing::debug!(target = %target, peer = %self.peer, "response sent");
                Ok(())
            }
            Err(ConnError::NotFound) => {
                self.keep_alive = false;
                let resp = handler::not_found_response();
                self.write_all(&resp)?;
                tracing::debug!(target = %target, peer = %self.peer, "404 not found");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn analyze_post(&mut self, sink: &dyn BodySink) -> Result<(), ConnError> {
        let resp = handler::post_response(self.keep_alive, self.idle_timeout_ms);
        self.write_all(&resp)?;
        let body_len = self.content_length.unwrap_or(0);
        let body = self.buffer[..body_len].to_vec();
        self.buffer.drain(..body_len);
        sink.accept(&body);
        tracing::debug!(peer = %self.peer, len = body_len, "post body accepted");
        Ok(())
    }
}
