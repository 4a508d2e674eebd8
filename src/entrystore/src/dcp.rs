// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The DCP side of the in-memory bucket: a producer which backfills a
//! snapshot of the bucket per stream request, and a consumer which applies
//! replicated mutations directly to the store. Per-connection stream state
//! lives in the connection's engine-storage slot.

use crate::*;

use engine::{
    dcp_flags, DcpEngine, DcpMessageProducers, EngineCookie, EngineError, EngineResult,
    EngineStorage, FailoverEntry, Item, StreamRequest,
};

use std::collections::VecDeque;

/// One queued outbound message.
enum Message {
    Marker {
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    },
    Mutation {
        vbucket: u16,
        key: Vec<u8>,
        item: Item,
        by_seqno: u64,
    },
    StreamEnd {
        vbucket: u16,
        flags: u32,
    },
}

struct Stream {
    opaque: u32,
    queue: VecDeque<Message>,
}

/// Per-connection DCP state. Created by `dcp_open` and carried in the
/// connection's engine-storage slot for the lifetime of the connection.
pub struct DcpConnState {
    name: String,
    flags: u32,
    streams: Vec<Stream>,
    controls: HashMap<String, String>,
    unacked_bytes: u64,
}

impl DcpConnState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_producer(&self) -> bool {
        self.flags & dcp_flags::PRODUCER != 0
    }
}

fn conn_state<'a>(storage: &'a mut EngineStorage) -> EngineResult<&'a mut DcpConnState> {
    storage
        .as_mut()
        .and_then(|any| any.downcast_mut::<DcpConnState>())
        .ok_or(EngineError::InvalidArguments)
}

impl DcpEngine for MemoryBucket {
    fn dcp_open(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _seqno: u32,
        flags: u32,
        name: &[u8],
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        let name = String::from_utf8_lossy(name).into_owned();
        info!(
            "dcp open: name={} producer={}",
            name,
            flags & dcp_flags::PRODUCER != 0
        );
        *storage = Some(Box::new(DcpConnState {
            name,
            flags,
            streams: Vec::new(),
            controls: HashMap::new(),
            unacked_bytes: 0,
        }));
        Ok(())
    }

    fn dcp_add_stream(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
        _flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        conn_state(storage).map(|_| ())
    }

    fn dcp_close_stream(
        &self,
        _cookie: &EngineCookie,
        opaque: u32,
        _vbucket: u16,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        let state = conn_state(storage)?;
        let before = state.streams.len();
        state.streams.retain(|s| s.opaque != opaque);
        if state.streams.len() == before {
            return Err(EngineError::KeyNotFound);
        }
        Ok(())
    }

    fn dcp_stream_req(
        &self,
        _cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        request: StreamRequest,
        storage: &mut EngineStorage,
    ) -> EngineResult<Vec<FailoverEntry>> {
        // snapshot the bucket before borrowing the connection state
        let mut items: Vec<(Vec<u8>, Item)> = {
            let data = self.data.lock().unwrap();
            let now = unix_now();
            data.iter()
                .filter(|(_, stored)| !stored.is_expired(now))
                .filter(|(_, stored)| {
                    stored.item.seqno > request.start_seqno
                        && stored.item.seqno <= request.end_seqno
                })
                .map(|(key, stored)| (key.clone(), stored.item.clone()))
                .collect()
        };
        items.sort_by_key(|(_, item)| item.seqno);

        let state = conn_state(storage)?;
        if !state.is_producer() {
            return Err(EngineError::NotSupported);
        }
        if state.streams.iter().any(|s| s.opaque == opaque) {
            return Err(EngineError::KeyExists);
        }

        let snapshot_end = items.last().map(|(_, i)| i.seqno).unwrap_or(request.start_seqno);

        let mut queue = VecDeque::with_capacity(items.len() + 2);
        queue.push_back(Message::Marker {
            vbucket,
            start_seqno: request.start_seqno,
            end_seqno: snapshot_end,
            flags: 0,
        });
        for (key, item) in items {
            let by_seqno = item.seqno;
            queue.push_back(Message::Mutation {
                vbucket,
                key,
                item,
                by_seqno,
            });
        }
        if request.end_seqno != u64::MAX {
            // a bounded stream ends once the backfill drains
            queue.push_back(Message::StreamEnd { vbucket, flags: 0 });
        }

        state.streams.push(Stream { opaque, queue });

        Ok(self.failover.lock().unwrap().clone())
    }

    fn dcp_get_failover_log(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
    ) -> EngineResult<Vec<FailoverEntry>> {
        Ok(self.failover.lock().unwrap().clone())
    }

    fn dcp_stream_end(
        &self,
        _cookie: &EngineCookie,
        opaque: u32,
        _vbucket: u16,
        _flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        let state = conn_state(storage)?;
        state.streams.retain(|s| s.opaque != opaque);
        Ok(())
    }

    fn dcp_snapshot_marker(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
        _start_seqno: u64,
        _end_seqno: u64,
        _flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        conn_state(storage).map(|_| ())
    }

    fn dcp_mutation(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
        key: &[u8],
        mut item: Item,
        by_seqno: u64,
        _rev_seqno: u64,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        conn_state(storage)?;
        // replicated mutations keep their origin seqno and cas
        item.seqno = by_seqno;
        if item.cas == 0 {
            item.cas = self.next_cas();
        }
        let mut data = self.data.lock().unwrap();
        data.insert(
            key.to_vec(),
            Stored {
                item,
                locked_until: 0,
            },
        );
        Ok(())
    }

    fn dcp_deletion(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
        key: &[u8],
        _cas: u64,
        _by_seqno: u64,
        _rev_seqno: u64,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        conn_state(storage)?;
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn dcp_expiration(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.dcp_deletion(cookie, opaque, vbucket, key, cas, by_seqno, rev_seqno, storage)
    }

    fn dcp_flush(&self, cookie: &EngineCookie, _opaque: u32, _vbucket: u16) -> EngineResult<()> {
        use engine::KvEngine;
        self.flush(cookie)
    }

    fn dcp_set_vbucket_state(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
        state: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        conn_state(storage)?;
        self.vbucket_state.store(u64::from(state), Ordering::Relaxed);
        Ok(())
    }

    fn dcp_noop(&self, _cookie: &EngineCookie, _opaque: u32) -> EngineResult<()> {
        Ok(())
    }

    fn dcp_buffer_acknowledgement(
        &self,
        _cookie: &EngineCookie,
        _opaque: u32,
        _vbucket: u16,
        acked_bytes: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        let state = conn_state(storage)?;
        state.unacked_bytes = state.unacked_bytes.saturating_sub(u64::from(acked_bytes));
        Ok(())
    }

    fn dcp_control(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        value: &[u8],
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        let state = conn_state(storage)?;
        state.controls.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
        Ok(())
    }

    fn dcp_step(
        &self,
        _cookie: &EngineCookie,
        storage: &mut EngineStorage,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<bool> {
        let state = conn_state(storage)?;

        let stream = match state.streams.iter_mut().find(|s| !s.queue.is_empty()) {
            Some(stream) => stream,
            None => return Err(EngineError::WouldBlock),
        };
        let opaque = stream.opaque;

        let message = stream.queue.pop_front().unwrap();
        let ended = stream.queue.is_empty();

        match message {
            Message::Marker {
                vbucket,
                start_seqno,
                end_seqno,
                flags,
            } => producers.marker(opaque, vbucket, start_seqno, end_seqno, flags)?,
            Message::Mutation {
                vbucket,
                key,
                item,
                by_seqno,
            } => producers.mutation(opaque, vbucket, &key, &item, by_seqno, 1)?,
            Message::StreamEnd { vbucket, flags } => {
                producers.stream_end(opaque, vbucket, flags)?;
                if ended {
                    state.streams.retain(|s| s.opaque != opaque);
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{IoNotify, KvEngine, StoreSemantics};
    use bytes::Bytes;
    use std::sync::Arc;

    struct NullNotify;

    impl IoNotify for NullNotify {
        fn notify_io_complete(&self, _token: usize, _status: EngineResult<()>) {}
    }

    fn cookie() -> EngineCookie {
        EngineCookie::new(0, Arc::new(NullNotify))
    }

    #[derive(Default)]
    struct Recorder {
        markers: usize,
        mutations: Vec<Vec<u8>>,
        stream_ends: usize,
    }

    impl DcpMessageProducers for Recorder {
        fn marker(&mut self, _: u32, _: u16, _: u64, _: u64, _: u32) -> EngineResult<()> {
            self.markers += 1;
            Ok(())
        }

        fn mutation(
            &mut self,
            _: u32,
            _: u16,
            key: &[u8],
            _: &Item,
            _: u64,
            _: u64,
        ) -> EngineResult<()> {
            self.mutations.push(key.to_vec());
            Ok(())
        }

        fn deletion(&mut self, _: u32, _: u16, _: &[u8], _: u64, _: u64, _: u64) -> EngineResult<()> {
            Ok(())
        }

        fn expiration(
            &mut self,
            _: u32,
            _: u16,
            _: &[u8],
            _: u64,
            _: u64,
            _: u64,
        ) -> EngineResult<()> {
            Ok(())
        }

        fn stream_end(&mut self, _: u32, _: u16, _: u32) -> EngineResult<()> {
            self.stream_ends += 1;
            Ok(())
        }

        fn noop(&mut self, _: u32) -> EngineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn backfill_stream() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        for key in [&b"a"[..], b"b", b"c"] {
            bucket
                .store(
                    &c,
                    key,
                    0,
                    Item::new(Bytes::from_static(b"v"), 0, 0, 0),
                    0,
                    StoreSemantics::Set,
                )
                .unwrap();
        }

        let mut storage: EngineStorage = None;
        bucket
            .dcp_open(&c, 0, 0, dcp_flags::PRODUCER, b"replica", &mut storage)
            .unwrap();

        let request = StreamRequest {
            flags: 0,
            start_seqno: 0,
            end_seqno: u64::MAX - 1,
            vbucket_uuid: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
        };
        let failover = bucket
            .dcp_stream_req(&c, 0xab, 0, request, &mut storage)
            .unwrap();
        assert!(!failover.is_empty());

        let mut recorder = Recorder::default();
        // marker + three mutations + stream end
        for _ in 0..5 {
            assert_eq!(
                bucket.dcp_step(&c, &mut storage, &mut recorder).unwrap(),
                true
            );
        }
        assert_eq!(
            bucket.dcp_step(&c, &mut storage, &mut recorder),
            Err(EngineError::WouldBlock)
        );

        assert_eq!(recorder.markers, 1);
        assert_eq!(recorder.stream_ends, 1);
        // mutations arrive in seqno order
        assert_eq!(recorder.mutations, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn stream_req_requires_open() {
        let bucket = MemoryBucket::new("default");
        let mut storage: EngineStorage = None;
        let request = StreamRequest {
            flags: 0,
            start_seqno: 0,
            end_seqno: u64::MAX,
            vbucket_uuid: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
        };
        assert_eq!(
            bucket
                .dcp_stream_req(&cookie(), 1, 0, request, &mut storage)
                .err(),
            Some(EngineError::InvalidArguments)
        );
    }
}
