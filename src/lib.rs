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

//! A single-host HTTP/1.x server built on a readiness-based multiplexer
//! ([`mio`]), a fixed worker pool, and a priority-ordered idle timer set.
//!
//! [`Server`] wires the pieces together: [`dispatcher::Dispatcher`] owns the
//! listening socket and the connection registry and is the only thing that
//! ever touches the `mio::Registry`; [`pool::WorkerPool`] runs the request
//! parser on worker threads; [`timer::TimerSet`] reaps connections that sit
//! idle past their allotted window.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod mime;
pub mod parser;
pub mod pool;
pub mod timer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::StartupError;
use crate::handler::{FsSource, ImageSink};
use crate::pool::WorkerPool;
use crate::timer::TimerSet;

/// A fully assembled, not-yet-running server.
pub struct Server {
    dispatcher: Dispatcher,
    // Never read after construction; kept alive so the worker threads are
    // not detached for the process's whole lifetime until `run` is called.
    #[allow(dead_code)]
    pool: WorkerPool,
}

impl Server {
    /// Binds the listener and wires the dispatcher, timer set, and worker
    /// pool together. Does not start serving traffic until [`Server::run`]
    /// is called.
    ///
    /// `root` must already be canonicalized; callers typically resolve it
    /// with [`canonical_root`] before changing into it with `chdir`, since
    /// resolving a relative root again after the process has already moved
    /// into it would resolve against the wrong directory.
    pub fn new(cfg: &Config, root: PathBuf) -> Result<Self, StartupError> {
        cfg.validate()?;

        let addr = format!("0.0.0.0:{}", cfg.port)
            .parse()
            .expect("formatted socket address is always valid");
        let listener = TcpListener::bind(addr).map_err(StartupError::Bind)?;

        let root = Arc::new(root);
        let timers = Arc::new(TimerSet::new(Duration::from_millis(cfg.idle_timeout_ms)));

        let (task_tx, task_rx) = crossbeam_channel::bounded(cfg.queue_capacity);
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();

        let dispatcher = Dispatcher::new(
            listener,
            task_tx,
            completed_rx,
            timers.clone(),
            root,
            cfg.max_empty_reads,
            cfg.idle_timeout_ms,
        )
        .map_err(StartupError::Poll)?;
        let waker = dispatcher.waker();

        let pool = WorkerPool::spawn(
            cfg.workers,
            task_rx,
            completed_tx,
            waker,
            timers,
            Arc::new(FsSource),
            Arc::new(ImageSink),
        );

        Ok(Self { dispatcher, pool })
    }

    /// Runs the dispatcher's event loop. Never returns under normal
    /// operation; `self` (and with it the worker pool) lives for as long as
    /// the process does, since this call never gives it back.
    pub fn run(mut self) -> ! {
        self.dispatcher.run()
    }
}

/// Convenience accessor used by `main` to know where the root ended up
/// after canonicalization, for the `chdir` call.
pub fn canonical_root(root: &std::path::Path) -> Result<PathBuf, StartupError> {
    root.canonicalize()
        .map_err(|_| StartupError::InvalidRoot(root.to_path_buf()))
}
