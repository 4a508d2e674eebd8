// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Wiring for the daemon: one listener thread, N worker threads, signal
//! fan-out, and the shared state they all hang off.

use crate::listener::ListenerBuilder;
use crate::worker::{Worker, WorkerBuilder};
use crate::{
    BucketRegistry, ConnectionRegistry, PlainAuthenticator, Shared, Signal, QUEUE_CAPACITY,
    THREAD_PREFIX, WAKER_TOKEN,
};

use config::{BufConfig, SaslConfig, ServerConfig, TlsConfig, WorkerConfig};
use net::{Poll, Stream, Waker};
use queues::Queues;

use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct ProcessBuilder {
    buckets: BucketRegistry,
    authenticator: PlainAuthenticator,
    buf_size: usize,
    max_reqs_per_event: usize,
    version: String,
    listener: ListenerBuilder,
    workers: Vec<WorkerBuilder>,
}

impl ProcessBuilder {
    pub fn new<T: ServerConfig + TlsConfig + WorkerConfig + BufConfig + SaslConfig>(
        config: &T,
        buckets: BucketRegistry,
    ) -> Result<Self> {
        let listener = ListenerBuilder::new(config)?;

        let threads = config.worker().threads();
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            workers.push(WorkerBuilder::new(config)?);
        }

        Ok(Self {
            buckets,
            authenticator: PlainAuthenticator::from_config(config),
            buf_size: config.buf().size(),
            max_reqs_per_event: config.worker().max_reqs_per_event(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listener,
            workers,
        })
    }

    pub fn version<T: Into<String>>(mut self, version: T) -> Self {
        self.version = version.into();
        self
    }

    /// The address the listener actually bound, for configurations using an
    /// ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> Process {
        let shared = Arc::new(Shared {
            buckets: self.buckets,
            connections: ConnectionRegistry::new(),
            authenticator: self.authenticator,
            buf_size: self.buf_size,
            max_reqs_per_event: self.max_reqs_per_event,
            version: self.version,
        });

        // the parent holds a private poll purely so the signal queues have a
        // waker for its side
        let control_poll = Poll::new().expect("failed to create control poll");
        let control_waker = Arc::new(
            Waker::new(control_poll.registry(), WAKER_TOKEN)
                .expect("failed to create control waker"),
        );

        let mut thread_wakers = vec![self.listener.waker()];
        for worker in &self.workers {
            thread_wakers.push(worker.waker());
        }

        // signals fan out from the parent to every thread
        let (mut signal_tx, mut signal_rx) =
            Queues::<Signal, ()>::new(vec![control_waker], thread_wakers, QUEUE_CAPACITY);
        let signal_tx = signal_tx.remove(0);

        // sessions flow from the listener to the workers
        let worker_wakers: Vec<Arc<Waker>> = self.workers.iter().map(|w| w.waker()).collect();
        let (mut listener_session_queues, mut worker_session_queues) =
            Queues::<Stream, ()>::new(vec![self.listener.waker()], worker_wakers, QUEUE_CAPACITY);

        let mut listener = self
            .listener
            .build(signal_rx.remove(0), listener_session_queues.remove(0));

        let mut workers: Vec<Worker> = self
            .workers
            .into_iter()
            .map(|builder| {
                builder.build(
                    shared.clone(),
                    worker_session_queues.remove(0),
                    signal_rx.remove(0),
                )
            })
            .collect();

        let listener_thread = std::thread::Builder::new()
            .name(format!("{}_listener", THREAD_PREFIX))
            .spawn(move || listener.run())
            .unwrap();

        let mut worker_threads = Vec::with_capacity(workers.len());
        for (id, mut worker) in workers.drain(..).enumerate() {
            worker_threads.push(
                std::thread::Builder::new()
                    .name(format!("{}_worker_{}", THREAD_PREFIX, id))
                    .spawn(move || worker.run())
                    .unwrap(),
            );
        }

        Process {
            _control_poll: control_poll,
            listener: listener_thread,
            signal_queue: signal_tx,
            workers: worker_threads,
        }
    }
}

pub struct Process {
    _control_poll: Poll,
    listener: JoinHandle<()>,
    signal_queue: Queues<Signal, ()>,
    workers: Vec<JoinHandle<()>>,
}

impl Process {
    /// Broadcast a configuration reload to all threads.
    pub fn reload_config(&mut self) {
        if self.signal_queue.try_send_all(Signal::ConfigReload).is_ok() {
            let _ = self.signal_queue.wake();
        }
    }

    /// Attempt a graceful shutdown: broadcast the signal, then join every
    /// thread. Each worker walks its connections and closes them
    /// cooperatively before exiting.
    pub fn shutdown(mut self) {
        if self.signal_queue.try_send_all(Signal::Shutdown).is_err() {
            error!("error sending shutdown signal to threads");
        }
        let _ = self.signal_queue.wake();

        self.wait()
    }

    /// Block until all threads terminate.
    pub fn wait(self) {
        for thread in self.workers {
            let _ = thread.join();
        }
        let _ = self.listener.join();
    }
}
