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

//! Error types for startup and per-connection failures.

use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort the process before it starts serving traffic.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Port outside the accepted `[1024, 65535]` range.
    #[error("invalid port {0}: must be between 1024 and 65535")]
    InvalidPort(u16),
    /// Root directory missing or not a directory.
    #[error("root directory {0:?} does not exist or is not a directory")]
    InvalidRoot(PathBuf),
    /// Worker count of zero.
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    /// Bind/listen on the configured port failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
    /// The readiness multiplexer could not be created.
    #[error("failed to create I/O multiplexer: {0}")]
    Poll(#[source] std::io::Error),
    /// `chdir` into the server root failed.
    #[error("failed to change working directory into root: {0}")]
    Chdir(#[source] std::io::Error),
}

/// Failures produced while parsing an incoming request.
///
/// Every variant is terminal for the connection: none of them can be
/// recovered from by reading more bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Neither `GET` nor `POST` could be found in the request line.
    #[error("invalid or unsupported method")]
    Method,
    /// The request target was empty, malformed, or missing its terminator.
    #[error("invalid request target")]
    Target,
    /// The version token was not `HTTP/1.0` or `HTTP/1.1`.
    #[error("unsupported or invalid http version")]
    Version,
    /// A header line did not contain a valid `name:` prefix.
    #[error("invalid header name")]
    HeaderName,
    /// A header value was empty or unterminated.
    #[error("invalid header value")]
    HeaderValue,
    /// A header value exceeded the 255 byte cap.
    #[error("header value exceeds maximum length")]
    HeaderValueTooLong,
    /// A header line, or the terminating blank line, was malformed.
    #[error("invalid or missing line terminator")]
    NewLine,
    /// A POST request arrived without a `Content-length` header.
    #[error("missing content-length for request body")]
    MissingContentLength,
    /// `Content-length` was present but not a valid non-negative integer.
    #[error("invalid content-length")]
    InvalidContentLength,
}

/// Outcome of handing a readable connection to a worker.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The request could not be parsed; the connection is closed without a response.
    #[error(transparent)]
    Malformed(#[from] ParseError),
    /// A fatal, non-recoverable I/O error on the connection's socket.
    #[error("connection I/O error: {0}")]
    IoFatal(#[source] std::io::Error),
    /// The connection exceeded its empty-read strike budget.
    #[error("too many consecutive empty reads")]
    TooManyEmptyReads,
    /// GET target does not exist under the server root; handled as a 404, not a close.
    #[error("resource not found")]
    NotFound,
}
