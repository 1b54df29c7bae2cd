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

//! The readiness dispatcher: owns the connection registry, accepts new
//! connections, hands readable ones to the worker pool, and reaps idle
//! connections between polls.
//!
//! This is the only thread that ever touches the `mio::Registry` directly.
//! Workers report completion on a channel; the dispatcher performs the
//! actual reregister/deregister, which keeps the registry table and the
//! kernel interest set changing together, in the same place, always.

use std::io::{ErrorKind, Result};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::ConnectionState;
use crate::timer::TimerSet;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// One unit of work handed to the worker pool: a connection ready to be
/// driven by the parser.
pub struct Task {
    /// Shared handle to the connection; the dispatcher keeps a clone in
    /// its registry for the duration of the task.
    pub connection: Arc<Mutex<ConnectionState>>,
}

/// Reported back by a worker once it is done driving a connection for
/// this round.
pub struct Completed {
    /// The connection's registry slot.
    pub token: Token,
    /// Whether the connection should be torn down.
    pub closed: bool,
}

/// Owns the listening socket, the connection registry, and the timer set.
pub struct Dispatcher {
    listener: TcpListener,
    poll: Poll,
    connections: Slab<Arc<Mutex<ConnectionState>>>,
    workers: Sender<Task>,
    completed_rx: Receiver<Completed>,
    waker: Arc<Waker>,
    timers: Arc<TimerSet>,
    root: Arc<std::path::PathBuf>,
    max_empty_reads: u32,
    idle_timeout_ms: u64,
}

impl Dispatcher {
    /// Builds a dispatcher around an already-bound, non-blocking listener.
    pub fn new(
        mut listener: TcpListener,
        workers: Sender<Task>,
        completed_rx: Receiver<Completed>,
        timers: Arc<TimerSet>,
        root: Arc<std::path::PathBuf>,
        max_empty_reads: u32,
        idle_timeout_ms: u64,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        Ok(Self {
            listener,
            poll,
            connections: Slab::new(),
            workers,
            completed_rx,
            waker,
            timers,
            root,
            max_empty_reads,
            idle_timeout_ms,
        })
    }

    /// A waker that must be triggered any time a [`Completed`] is placed on
    /// the completion channel, so the dispatcher's `poll` wakes up to drain it.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    fn accept(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key());

                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!(%peer, error = %err, "failed to register new connection");
                        continue;
                    }

                    let tombstone = self.timers.arm(token.0);
                    let conn = ConnectionState::new(
                        stream,
                        token,
                        peer,
                        self.root.clone(),
                        self.max_empty_reads,
                        self.idle_timeout_ms,
                        tombstone,
                    );
                    entry.insert(Arc::new(Mutex::new(conn)));
                    tracing::info!(%peer, "accepted connection");
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Detaches the connection's current timer and submits it to a worker.
    /// Detaching first means a timer popped concurrently can never reap a
    /// connection a worker is actively driving.
    fn dispatch_readable(&mut self, token: Token) {
        let Some(connection) = self.connections.get(token.0) else {
            return;
        };

        {
            let locked = connection.lock().unwrap();
            locked.tombstone.store(true, AtomicOrdering::Release);
        }

        match self.workers.try_send(Task {
            connection: connection.clone(),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(?token, "worker queue saturated, closing connection");
                let mut locked = connection.lock().unwrap();
                let _ = self.poll.registry().deregister(locked.stream_mut());
                drop(locked);
                self.connections.try_remove(token.0);
            }
        }
    }

    fn complete(&mut self, completed: Completed) {
        let Completed { token, closed } = completed;
        let mut drop_entry = closed;

        if let Some(connection) = self.connections.get(token.0) {
            let mut locked = connection.lock().unwrap();
            if closed {
                let _ = self.poll.registry().deregister(locked.stream_mut());
            } else {
                let interest = Interest::READABLE;
                if self
                    .poll
                    .registry()
                    .reregister(locked.stream_mut(), token, interest)
                    .is_err()
                {
                    drop_entry = true;
                }
            }
        } else {
            drop_entry = false;
        }

        if drop_entry {
            self.connections.try_remove(token.0);
        }
    }

    fn reap_idle(&mut self) {
        let mut expired = Vec::new();
        self.timers.reap_expired(|idx| expired.push(idx));

        for idx in expired {
            if let Some(connection) = self.connections.get(idx) {
                let mut locked = connection.lock().unwrap();
                let _ = self.poll.registry().deregister(locked.stream_mut());
                tracing::debug!(peer = %locked.peer(), "idle connection reaped");
            }
            self.connections.try_remove(idx);
        }
    }

    /// Runs the dispatcher's event loop. Never returns under normal operation.
    pub fn run(&mut self) -> ! {
        let mut events = Events::with_capacity(1024);
        let poll_timeout = Some(Duration::from_millis(
            (self.idle_timeout_ms / 2).clamp(10, 250),
        ));

        loop {
            match self.poll.poll(&mut events, poll_timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(error = %err, "poll failed");
                    continue;
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => {
                        if let Err(err) = self.accept() {
                            tracing::error!(error = %err, "accept loop failed");
                        }
                    }
                    WAKE_TOKEN => loop {
                        match self.completed_rx.try_recv() {
                            Ok(completed) => self.complete(completed),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => break,
                        }
                    },
                    token => self.dispatch_readable(token),
                }
            }

            self.reap_idle();
        }
    }
}
