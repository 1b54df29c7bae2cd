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

//! Fixed-size worker pool. Workers are the only threads that ever drive a
//! connection's parser; the dispatcher thread never blocks on request
//! processing.
//!
//! A worker never touches the `mio::Registry` itself — see
//! [`crate::dispatcher`] for why. It only decides whether a connection
//! should be re-armed or closed, arms a fresh idle timer when keeping a
//! connection alive, and reports the outcome back over a channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use mio::Waker;

use crate::connection::Outcome;
use crate::dispatcher::{Completed, Task};
use crate::handler::{BodySink, BodySource};
use crate::timer::TimerSet;

/// A running pool of worker threads. Dropping this does not stop the
/// threads; call [`WorkerPool::join`] (which blocks) once the task and
/// completion channels have been closed.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads pulling from `tasks`.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        count: usize,
        tasks: Receiver<Task>,
        completed_tx: Sender<Completed>,
        waker: Arc<Waker>,
        timers: Arc<TimerSet>,
        source: Arc<dyn BodySource>,
        sink: Arc<dyn BodySink>,
    ) -> Self {
        let handles = (0..count)
            .map(|i| {
                let tasks = tasks.clone();
                let completed_tx = completed_tx.clone();
                let waker = waker.clone();
                let timers = timers.clone();
                let source = source.clone();
                let sink = sink.clone();
                thread::Builder::new()
                    .name(format!("rhttpd-worker-{i}"))
                    .spawn(move || worker_loop(tasks, completed_tx, waker, timers, source, sink))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { handles }
    }

    /// Blocks until every worker thread has exited. Workers exit once both
    /// their ends of the task channel are closed.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    tasks: Receiver<Task>,
    completed_tx: Sender<Completed>,
    waker: Arc<Waker>,
    timers: Arc<TimerSet>,
    source: Arc<dyn BodySource>,
    sink: Arc<dyn BodySink>,
) {
    while let Ok(task) = tasks.recv() {
        let (token, result) = {
            let mut connection = task.connection.lock().unwrap();
            let token = connection.token();
            let result = connection.drive(source.as_ref(), sink.as_ref());
            (token, result)
        };

        let closed = match result {
            Ok(Outcome::Again) | Ok(Outcome::KeepAlive) => {
                // Arm the new timer before the connection is handed back to
                // the dispatcher for reregistration: if the order were
                // reversed, a readable event could re-enter this same
                // connection before it has a live timer protecting it.
                let tombstone = timers.arm(token.0);
                task.connection.lock().unwrap().tombstone = tombstone;
                false
            }
            Ok(Outcome::Close) => true,
            Err(err) => {
                tracing::warn!(?token, error = %err, "closing connection");
                true
            }
        };

        if completed_tx.send(Completed { token, closed }).is_err() {
            return;
        }
        if waker.wake().is_err() {
            return;
        }
    }
}
