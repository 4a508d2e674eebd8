// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use engine::Engine;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const DEFAULT_BUCKET: &str = "default";

/// The buckets this node serves, each backed by its own engine handle. The
/// map is consulted at accept time and on SELECT_BUCKET, never per-command:
/// connections hold their engine handle directly.
pub struct BucketRegistry {
    buckets: Mutex<HashMap<String, Arc<dyn Engine>>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert<T: Into<String>>(&self, name: T, engine: Arc<dyn Engine>) {
        self.buckets.lock().unwrap().insert(name.into(), engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Engine>> {
        self.buckets.lock().unwrap().get(name).cloned()
    }

    /// The bucket new connections are associated with.
    pub fn default_bucket(&self) -> Option<Arc<dyn Engine>> {
        self.get(DEFAULT_BUCKET)
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
