// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The dedicated accept thread. Accepted streams are dispatched to worker
//! threads in round-robin order over the waking queues; the listener never
//! touches a connection again after handoff.

use crate::{Signal, LISTENER_TOKEN, QUEUE_RETRIES, WAKER_TOKEN};

use common::ssl::tls_acceptor;
use config::{ServerConfig, TlsConfig};
use net::{Events, Interest, Poll, Stream, TcpListener, Waker};
use queues::Queues;

use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

counter!(LISTENER_ACCEPT, "connections accepted");
counter!(LISTENER_ACCEPT_EX, "exceptions while accepting");
counter!(LISTENER_DISPATCH_FAILED, "accepted sessions dropped, workers busy");

pub struct ListenerBuilder {
    listener: net::Listener,
    nevent: usize,
    poll: Poll,
    timeout: Duration,
    waker: Arc<Waker>,
}

impl ListenerBuilder {
    pub fn new<T: ServerConfig + TlsConfig>(config: &T) -> Result<Self> {
        let tls_config = config.tls();
        let config = config.server();

        let addr = config.socket_addr().map_err(|e| {
            error!("{}", e);
            Error::new(ErrorKind::Other, "bad listen address")
        })?;

        let tcp_listener = TcpListener::bind(addr)?;

        let mut listener = match tls_acceptor(tls_config)? {
            Some(acceptor) => net::Listener::from((tcp_listener, acceptor)),
            None => net::Listener::from(tcp_listener),
        };

        let poll = Poll::new()?;
        net::event::Source::register(
            &mut listener,
            poll.registry(),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            listener,
            nevent: config.nevent(),
            poll,
            timeout: Duration::from_millis(config.timeout() as u64),
            waker,
        })
    }

    /// The bound address, which differs from the configured one when an
    /// ephemeral port was requested.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn build(
        self,
        signal_queue: Queues<(), Signal>,
        session_queue: Queues<Stream, ()>,
    ) -> Listener {
        Listener {
            listener: self.listener,
            nevent: self.nevent,
            poll: self.poll,
            session_queue,
            signal_queue,
            timeout: self.timeout,
        }
    }
}

pub struct Listener {
    listener: net::Listener,
    nevent: usize,
    poll: Poll,
    session_queue: Queues<Stream, ()>,
    signal_queue: Queues<(), Signal>,
    timeout: Duration,
}

impl Listener {
    /// Accept until the socket would block, dispatching each stream to a
    /// worker.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    LISTENER_ACCEPT.increment();
                    self.dispatch(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    LISTENER_ACCEPT_EX.increment();
                    warn!("error accepting connection: {}", e);
                    break;
                }
            }
        }
        let _ = self.session_queue.wake();
    }

    fn dispatch(&mut self, stream: Stream) {
        let mut stream = stream;
        for _ in 0..QUEUE_RETRIES {
            match self.session_queue.try_send_any(stream) {
                Ok(()) => return,
                Err(rejected) => {
                    // the chosen worker's queue was full; nudge everyone and
                    // try the next one
                    let _ = self.session_queue.wake();
                    stream = rejected;
                }
            }
        }
        LISTENER_DISPATCH_FAILED.increment();
        warn!("all worker queues full, dropping accepted connection");
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(self.nevent);

        loop {
            if self.poll.poll(&mut events, Some(self.timeout)).is_err() {
                error!("error polling listener");
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept();
                }
            }

            while let Some(signal) = self.signal_queue.try_recv().map(|v| v.into_inner()) {
                match signal {
                    Signal::ConfigReload => {}
                    Signal::Shutdown => {
                        return;
                    }
                }
            }
        }
    }
}
