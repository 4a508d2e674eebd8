// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Worker threads. Each worker owns a reactor, a slab of connections, the
//! spare-pipe pool, and a completion queue through which engines deliver
//! would-block completions. A connection is affine to its worker for its
//! whole life; nothing here is shared across workers.

use crate::connection::Connection;
use crate::connections::ConnInfo;
use crate::pool::{self, SparePipes};
use crate::{Shared, SharedRef, Signal, State, WAKER_TOKEN};

use config::WorkerConfig;
use crossbeam_queue::ArrayQueue;
use engine::{EngineResult, IoNotify};
use net::event::Event;
use net::{Events, Poll, Stream, Token, Waker};
use queues::Queues;

use std::io::Result;
use std::sync::Arc;
use std::time::Duration;

counter!(WORKER_EVENT_LOOP, "worker event loop iterations");
counter!(WORKER_EVENT_TOTAL, "events handled by workers");
counter!(WORKER_EVENT_ERROR, "error events on connections");
counter!(WORKER_IO_COMPLETIONS, "engine completions delivered to workers");
counter!(WORKER_SESSIONS_ACCEPTED, "sessions taken over from the listener");

/// The completion side of the engine interface: engines clone this through
/// the cookie and call back when a would-blocked operation finishes. The
/// completion lands on the queue of the worker owning the connection, which
/// is then woken.
struct IoCompletionQueue {
    queue: Arc<ArrayQueue<(usize, EngineResult<()>)>>,
    waker: Arc<Waker>,
}

impl IoNotify for IoCompletionQueue {
    fn notify_io_complete(&self, token: usize, status: EngineResult<()>) {
        if self.queue.push((token, status)).is_err() {
            error!("completion queue full, dropping completion for {}", token);
        }
        let _ = self.waker.wake();
    }
}

pub struct WorkerBuilder {
    nevent: usize,
    poll: Poll,
    timeout: Duration,
    waker: Arc<Waker>,
}

impl WorkerBuilder {
    pub fn new<T: WorkerConfig>(config: &T) -> Result<Self> {
        let config = config.worker();

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            nevent: config.nevent(),
            poll,
            timeout: Duration::from_millis(config.timeout() as u64),
            waker,
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn build(
        self,
        shared: SharedRef,
        session_queue: Queues<(), Stream>,
        signal_queue: Queues<(), Signal>,
    ) -> Worker {
        Worker {
            completions: Arc::new(ArrayQueue::new(crate::QUEUE_CAPACITY)),
            nevent: self.nevent,
            poll: self.poll,
            session_queue,
            sessions: slab::Slab::new(),
            shared,
            signal_queue,
            spares: SparePipes::default(),
            timeout: self.timeout,
            waker: self.waker,
        }
    }
}

pub struct Worker {
    completions: Arc<ArrayQueue<(usize, EngineResult<()>)>>,
    nevent: usize,
    poll: Poll,
    session_queue: Queues<(), Stream>,
    sessions: slab::Slab<Connection>,
    shared: Arc<Shared>,
    signal_queue: Queues<(), Signal>,
    spares: SparePipes,
    timeout: Duration,
    waker: Arc<Waker>,
}

impl Worker {
    fn notifier(&self) -> Arc<dyn IoNotify> {
        Arc::new(IoCompletionQueue {
            queue: self.completions.clone(),
            waker: self.waker.clone(),
        })
    }

    /// Handle a readiness event by running the connection's state machine,
    /// with the buffer pool loan around the run.
    fn handle_event(&mut self, token: Token, event: &Event) {
        let buf_size = self.shared.buf_size;
        let conn = match self.sessions.get_mut(token.0) {
            Some(conn) => conn,
            None => return,
        };

        if event.is_error() {
            WORKER_EVENT_ERROR.increment();
            conn.set_state(State::Closing);
        }

        conn.set_current_event(event.is_readable(), event.is_writable());
        let budget = conn.max_reqs_per_event();
        conn.set_num_events(budget);

        pool::loan_buffers(conn, &mut self.spares, buf_size);
        conn.run(self.poll.registry());
        pool::return_buffers(conn, &mut self.spares);
    }

    /// Resume connections whose engine operations completed.
    fn drain_completions(&mut self) {
        let buf_size = self.shared.buf_size;
        while let Some((token, status)) = self.completions.pop() {
            WORKER_IO_COMPLETIONS.increment();
            let conn = match self.sessions.get_mut(token) {
                Some(conn) => conn,
                None => {
                    // the connection went away while the engine was busy
                    debug!("dropping completion for stale token {}", token);
                    continue;
                }
            };

            conn.set_aiostat(status);
            conn.set_ewouldblock(false);
            let budget = conn.max_reqs_per_event();
            conn.set_num_events(budget);

            pool::loan_buffers(conn, &mut self.spares, buf_size);
            conn.run(self.poll.registry());
            pool::return_buffers(conn, &mut self.spares);
        }
    }

    /// Take over sessions dispatched by the listener.
    fn drain_sessions(&mut self) {
        while let Some(stream) = self.session_queue.try_recv().map(|v| v.into_inner()) {
            WORKER_SESSIONS_ACCEPTED.increment();
            self.add_session(stream);
        }
    }

    fn add_session(&mut self, stream: Stream) {
        let token = Token(self.sessions.vacant_key());
        let conn = Connection::new(stream, token, self.shared.clone(), self.notifier());

        self.shared.connections.register(
            ConnInfo {
                id: conn.id(),
                peer: conn.peername().to_string(),
                bucket: conn.bucket_name().to_string(),
            },
            conn.parent_port(),
        );
        debug!("{}: accepted connection {}", conn.id(), conn.description());

        let key = self.sessions.insert(conn);
        debug_assert_eq!(key, token.0);

        // run the machine once so the connection arms its first read
        let buf_size = self.shared.buf_size;
        let conn = self
            .sessions
            .get_mut(key)
            .expect("connection was just inserted");
        let budget = conn.max_reqs_per_event();
        conn.set_num_events(budget);
        pool::loan_buffers(conn, &mut self.spares, buf_size);
        conn.run(self.poll.registry());
        pool::return_buffers(conn, &mut self.spares);
    }

    /// Returns true when the worker should exit.
    fn drain_signals(&mut self) -> bool {
        while let Some(signal) = self.signal_queue.try_recv().map(|v| v.into_inner()) {
            match signal {
                Signal::ConfigReload => {
                    info!("worker reloading runtime tunables");
                }
                Signal::Shutdown => {
                    self.shutdown_connections();
                    return true;
                }
            }
        }
        false
    }

    /// Walk every connection and drive it through its close sequence.
    fn shutdown_connections(&mut self) {
        let keys: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in keys {
            if let Some(conn) = self.sessions.get_mut(key) {
                conn.initiate_shutdown();
                conn.run(self.poll.registry());
            }
        }
        self.sweep();
    }

    /// Release connections whose machines reached the terminal state. Runs
    /// at the end of each reactor tick.
    fn sweep(&mut self) {
        let done: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, conn)| conn.should_delete())
            .map(|(key, _)| key)
            .collect();
        for key in done {
            let conn = self.sessions.remove(key);
            trace!("{}: releasing connection", conn.id());
            drop(conn);
        }
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(self.nevent);

        loop {
            WORKER_EVENT_LOOP.increment();

            if self.poll.poll(&mut events, Some(self.timeout)).is_err() {
                error!("error polling worker");
            }

            WORKER_EVENT_TOTAL.add(events.iter().count() as u64);

            for event in events.iter() {
                let token = event.token();
                if token != WAKER_TOKEN {
                    self.handle_event(token, event);
                }
            }

            // queue-driven work runs every tick: wakeups are edge signals
            // and the queues may have filled while we were busy
            self.drain_completions();
            self.drain_sessions();
            if self.drain_signals() {
                return;
            }

            self.sweep();
        }
    }
}
