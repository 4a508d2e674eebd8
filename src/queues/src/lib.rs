// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Queue types for inter-thread communication between the event-loop threads.
//! Senders wrap bounded lock-free queues together with the receiver's event
//! loop waker, so a batch of sends can be followed by a single wakeup.

pub use net::Waker;

use crossbeam_queue::ArrayQueue;

use std::sync::Arc;

/// A struct for sending and receiving items with simple routing: to a
/// specific receiver, to receivers in round-robin order, or to all receivers.
/// Items are wrapped with the sender's identifier so a response can be routed
/// back to the thread that sent the original message.
pub struct Queues<T, U> {
    senders: Vec<WakingSender<TrackedItem<T>>>,
    receiver: Arc<ArrayQueue<TrackedItem<U>>>,
    id: usize,
    next: usize,
}

struct WakingSender<T> {
    inner: Arc<ArrayQueue<T>>,
    waker: Arc<Waker>,
    needs_wake: bool,
}

impl<T> Clone for WakingSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            waker: self.waker.clone(),
            needs_wake: false,
        }
    }
}

impl<T> WakingSender<T> {
    fn try_send(&mut self, item: T) -> Result<(), T> {
        let result = self.inner.push(item);
        if result.is_ok() {
            self.needs_wake = true;
        }
        result
    }

    fn wake(&mut self) -> Result<(), std::io::Error> {
        if self.needs_wake {
            let result = self.waker.wake();
            if result.is_ok() {
                self.needs_wake = false;
            }
            result
        } else {
            Ok(())
        }
    }
}

impl<T, U> Queues<T, U> {
    /// Construct queues for communicating between both sides: side `a` sends
    /// items of type `T` to side `b`, side `b` sends items of type `U` back.
    /// The wakers registered with each side's `Poll` must be passed in so
    /// receivers can be woken after a send. The returned vectors preserve the
    /// ordering of the provided wakers.
    pub fn new<A: AsRef<[Arc<Waker>]>, B: AsRef<[Arc<Waker>]>>(
        a_wakers: A,
        b_wakers: B,
        capacity: usize,
    ) -> (Vec<Queues<T, U>>, Vec<Queues<U, T>>) {
        let a_wakers = a_wakers.as_ref().to_vec();
        let b_wakers = b_wakers.as_ref().to_vec();

        let mut a_tx = Vec::<WakingSender<TrackedItem<T>>>::with_capacity(b_wakers.len());
        let mut b_rx = Vec::<Arc<ArrayQueue<TrackedItem<T>>>>::with_capacity(b_wakers.len());

        for waker in b_wakers {
            let q = Arc::new(ArrayQueue::new(capacity));
            a_tx.push(WakingSender {
                inner: q.clone(),
                waker,
                needs_wake: false,
            });
            b_rx.push(q);
        }

        let mut b_tx = Vec::<WakingSender<TrackedItem<U>>>::with_capacity(a_wakers.len());
        let mut a_rx = Vec::<Arc<ArrayQueue<TrackedItem<U>>>>::with_capacity(a_wakers.len());

        for waker in a_wakers {
            let q = Arc::new(ArrayQueue::new(capacity));
            b_tx.push(WakingSender {
                inner: q.clone(),
                waker,
                needs_wake: false,
            });
            a_rx.push(q);
        }

        let mut a = Vec::new();
        let mut b = Vec::new();

        for (id, receiver) in a_rx.drain(..).enumerate() {
            a.push(Queues {
                senders: a_tx.clone(),
                receiver,
                id,
                next: 0,
            })
        }

        for (id, receiver) in b_rx.drain(..).enumerate() {
            b.push(Queues {
                senders: b_tx.clone(),
                receiver,
                id,
                next: 0,
            })
        }

        (a, b)
    }

    /// Try to receive a single item. The `TrackedItem` records which sender
    /// sent it.
    pub fn try_recv(&self) -> Option<TrackedItem<U>> {
        self.receiver.pop()
    }

    /// Try to send a single item to the receiver specified by `id`. Used for
    /// targeted 1:1 communication, such as routing a response back to the
    /// thread which sent the request.
    pub fn try_send_to(&mut self, id: usize, item: T) -> Result<(), T> {
        self.senders[id]
            .try_send(TrackedItem {
                sender: self.id,
                inner: item,
            })
            .map_err(|e| e.into_inner())
    }

    /// Try to send a single item to any receiver, rotating through receivers
    /// in round-robin order so work spreads evenly. Used by the listener to
    /// dispatch accepted sessions across the worker threads.
    pub fn try_send_any(&mut self, item: T) -> Result<(), T> {
        let id = self.next;
        self.next = (self.next + 1) % self.senders.len();
        self.try_send_to(id, item)
    }

    /// Wake any remote receivers which have been sent items since the last
    /// call.
    pub fn wake(&mut self) -> Result<(), std::io::Error> {
        let mut result = Ok(());
        for sender in self.senders.iter_mut() {
            if let Err(e) = sender.wake() {
                result = Err(e);
            }
        }
        result
    }
}

impl<T: Clone, U> Queues<T, U> {
    /// Broadcast an item to all receivers on the other side.
    pub fn try_send_all(&mut self, item: T) -> Result<(), T> {
        let mut result = Ok(());
        for sender in self.senders.iter_mut() {
            if sender
                .try_send(TrackedItem {
                    sender: self.id,
                    inner: item.clone(),
                })
                .is_err()
            {
                result = Err(item.clone());
            }
        }
        result
    }
}

pub struct TrackedItem<T> {
    sender: usize,
    inner: T,
}

impl<T> TrackedItem<T> {
    pub fn sender(&self) -> usize {
        self.sender
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net::{Poll, Token};

    const WAKER_TOKEN: Token = Token(usize::MAX);

    #[test]
    fn send_and_receive() {
        let poll = Poll::new().expect("failed to create event loop");
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).expect("failed to create waker"));

        let (mut a, mut b) = Queues::<usize, String>::new(vec![waker.clone()], vec![waker], 1024);
        let mut a = a.remove(0);
        let mut b = b.remove(0);

        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());

        a.try_send_to(0, 1).expect("failed to send");
        assert_eq!(
            b.try_recv().map(|v| (v.sender(), v.into_inner())),
            Some((0, 1))
        );

        a.try_send_any(2).expect("failed to send");
        assert_eq!(b.try_recv().map(|v| v.into_inner()), Some(2));

        a.try_send_all(3).expect("failed to send");
        assert_eq!(b.try_recv().map(|v| v.into_inner()), Some(3));

        b.try_send_to(0, "apple".to_string()).expect("failed to send");
        assert_eq!(
            a.try_recv().map(|v| v.into_inner()),
            Some("apple".to_string())
        );
    }

    #[test]
    // round-robin rotation across two receivers
    fn rotation() {
        let poll = Poll::new().expect("failed to create event loop");
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).expect("failed to create waker"));

        let (mut a, b) =
            Queues::<usize, ()>::new(vec![waker.clone()], vec![waker.clone(), waker], 16);
        let mut a = a.remove(0);

        for i in 0..4 {
            a.try_send_any(i).expect("failed to send");
        }

        assert_eq!(b[0].try_recv().map(|v| v.into_inner()), Some(0));
        assert_eq!(b[0].try_recv().map(|v| v.into_inner()), Some(2));
        assert_eq!(b[1].try_recv().map(|v| v.into_inner()), Some(1));
        assert_eq!(b[1].try_recv().map(|v| v.into_inner()), Some(3));
    }
}
