// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Skua is a Couchbase-style memcached data node daemon. It speaks the
//! memcached binary protocol, including the DCP change-feed family, over an
//! event-driven worker pool, and serves an in-memory default bucket.
//!
//! Running this binary is the primary way of using skua.

#[macro_use]
extern crate log;

use backtrace::Backtrace;
use clap::{App, Arg};
use config::{DebugConfig, SkuaConfig};
use entrystore::MemoryBucket;
use logger::Logger;
use server::{BucketRegistry, ProcessBuilder};

use std::sync::Arc;

/// The entry point into the running daemon. Parses the command line, loads
/// the configuration, and launches the listener and worker threads.
fn main() {
    // custom panic hook to terminate the whole process after unwinding:
    // programming invariants in the core are fatal by design
    std::panic::set_hook(Box::new(|s| {
        error!("{}", s);
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // parse command line options
    let matches = App::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .version_short("v")
        .long_about(
            "A data node daemon speaking the memcached binary protocol, \
            with full-duplex change feeds, driven by an event-based worker \
            pool with a per-connection state machine.",
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("Server configuration file")
                .index(1),
        )
        .arg(
            Arg::with_name("print-config")
                .help("List all options in config")
                .long("config")
                .short("c"),
        )
        .get_matches();

    // load config from file
    let config = if let Some(file) = matches.value_of("CONFIG") {
        match SkuaConfig::load(file) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("unable to load config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Default::default()
    };

    if matches.is_present("print-config") {
        config.print();
        std::process::exit(0);
    }

    Logger::new()
        .label("skua")
        .level(config.debug().log_level())
        .init()
        .expect("failed to initialize logger");

    // every node serves a default bucket; additional buckets come from the
    // cluster manager, which is out of scope for the data node itself
    let buckets = BucketRegistry::new();
    buckets.insert("default", Arc::new(MemoryBucket::new("default")));

    match ProcessBuilder::new(&config, buckets) {
        Ok(builder) => {
            let builder = builder.version(env!("CARGO_PKG_VERSION"));
            match builder.local_addr() {
                Ok(addr) => info!("listening on {}", addr),
                Err(_) => info!("listening"),
            }
            let process = builder.spawn();
            process.wait();
        }
        Err(e) => {
            error!("failed to launch: {}", e);
            std::process::exit(1);
        }
    }
}
