// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Static metrics. Counters and gauges are declared at module scope with the
//! `counter!` / `gauge!` macros and updated with relaxed atomics, so the hot
//! path never takes a lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing event counter.
pub struct Counter {
    inner: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, amt: u64) {
        self.inner.fetch_add(amt, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.inner.store(0, Ordering::Relaxed);
    }
}

/// A gauge tracking a value which may move in both directions, such as the
/// current number of connections or buffered bytes.
pub struct Gauge {
    inner: AtomicI64,
}

impl Gauge {
    pub const fn new() -> Self {
        Self {
            inner: AtomicI64::new(0),
        }
    }

    pub fn add(&self, amt: i64) {
        self.inner.fetch_add(amt, Ordering::Relaxed);
    }

    pub fn sub(&self, amt: i64) {
        self.inner.fetch_sub(amt, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.inner.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.sub(1);
    }

    pub fn value(&self) -> i64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Declare a static counter, optionally with a description.
#[macro_export]
macro_rules! counter {
    ($name:ident) => {
        pub static $name: $crate::Counter = $crate::Counter::new();
    };
    ($name:ident, $description:tt) => {
        #[doc = $description]
        pub static $name: $crate::Counter = $crate::Counter::new();
    };
}

/// Declare a static gauge, optionally with a description.
#[macro_export]
macro_rules! gauge {
    ($name:ident) => {
        pub static $name: $crate::Gauge = $crate::Gauge::new();
    };
    ($name:ident, $description:tt) => {
        #[doc = $description]
        pub static $name: $crate::Gauge = $crate::Gauge::new();
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    counter!(TEST_COUNTER, "a counter for the tests below");
    gauge!(TEST_GAUGE);

    #[test]
    fn counter_ops() {
        TEST_COUNTER.increment();
        TEST_COUNTER.add(41);
        assert_eq!(TEST_COUNTER.value(), 42);
        TEST_COUNTER.reset();
        assert_eq!(TEST_COUNTER.value(), 0);
    }

    #[test]
    fn gauge_ops() {
        TEST_GAUGE.set(10);
        TEST_GAUGE.add(5);
        TEST_GAUGE.sub(7);
        assert_eq!(TEST_GAUGE.value(), 8);
    }
}
