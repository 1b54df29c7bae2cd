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

//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::error::StartupError;

/// Single-host HTTP/1.x server over a readiness-based multiplexer.
#[derive(Debug, Parser)]
#[command(name = "rhttpd", version, about)]
pub struct Config {
    /// Port to listen on, in `[1024, 65535]`.
    pub port: u16,

    /// Directory to serve files from and write uploads into. Becomes the
    /// process's working directory at startup.
    pub root: PathBuf,

    /// Number of worker threads driving the request parser.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Maximum number of connections allowed to wait for a free worker.
    #[arg(long, default_value_t = 65535)]
    pub queue_capacity: usize,

    /// Milliseconds a connection may stay idle before being reaped.
    #[arg(long, default_value_t = 500)]
    pub idle_timeout_ms: u64,

    /// Consecutive empty reads tolerated before a connection is closed.
    #[arg(long, default_value_t = 200)]
    pub max_empty_reads: u32,
}

impl Config {
    /// Validates the parsed arguments, returning the reason startup should
    /// abort if any are out of range.
    pub fn validate(&self) -> Result<(), StartupError> {
        if !(1024..=65535).contains(&self.port) {
            return Err(StartupError::InvalidPort(self.port));
        }
        if self.workers == 0 {
            return Err(StartupError::InvalidWorkerCount);
        }
        if !self.root.is_dir() {
            return Err(StartupError::InvalidRoot(self.root.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_out_of_range_port() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            port: 80,
            root: dir.path().to_path_buf(),
            workers: 4,
            queue_capacity: 1024,
            idle_timeout_ms: 500,
            max_empty_reads: 200,
        };
        assert!(matches!(cfg.validate(), Err(StartupError::InvalidPort(80))));
    }

    #[test]
    fn rejects_missing_root() {
        let cfg = Config {
            port: 8080,
            root: PathBuf::from("/does/not/exist/at/all"),
            workers: 4,
            queue_capacity: 1024,
            idle_timeout_ms: 500,
            max_empty_reads: 200,
        };
        assert!(matches!(cfg.validate(), Err(StartupError::InvalidRoot(_))));
    }

    #[test]
    fn accepts_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            port: 8080,
            root: dir.path().to_path_buf(),
            workers: 4,
            queue_capacity: 1024,
            idle_timeout_ms: 500,
            max_empty_reads: 200,
        };
        assert!(cfg.validate().is_ok());
    }
}
