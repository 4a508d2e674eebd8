// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::collections::HashMap;
use std::sync::Mutex;

gauge!(CONN_CURR, "connections currently registered");
counter!(CONN_TOTAL, "connections accepted since start");
counter!(CONN_CLOSED, "connections closed since start");

/// A snapshot of one connection, as reported by STAT.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    pub id: u32,
    pub peer: String,
    pub bucket: String,
}

/// The global connection registry. Guarded by a single mutex and touched only
/// at accept, close, and stats time, never on the request hot path. The
/// per-port counters live behind their own (stats) mutex.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u32, ConnInfo>>,
    port_conns: Mutex<HashMap<u16, usize>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            port_conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, info: ConnInfo, port: u16) {
        CONN_TOTAL.increment();
        CONN_CURR.increment();
        self.connections.lock().unwrap().insert(info.id, info);
        *self.port_conns.lock().unwrap().entry(port).or_insert(0) += 1;
    }

    pub fn deregister(&self, id: u32, port: u16) {
        CONN_CLOSED.increment();
        CONN_CURR.decrement();
        self.connections.lock().unwrap().remove(&id);
        let mut ports = self.port_conns.lock().unwrap();
        if let Some(count) = ports.get_mut(&port) {
            *count = count.saturating_sub(1);
        }
    }

    /// Update the bucket recorded for a connection (SELECT_BUCKET).
    pub fn set_bucket(&self, id: u32, bucket: &str) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(&id) {
            info.bucket = bucket.to_string();
        }
    }

    pub fn port_count(&self, port: u16) -> usize {
        *self.port_conns.lock().unwrap().get(&port).unwrap_or(&0)
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
