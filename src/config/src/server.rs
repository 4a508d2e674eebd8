// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

// constants to define default values
const SERVER_HOST: &str = "0.0.0.0";
const SERVER_PORT: &str = "11210";
const SERVER_TIMEOUT: usize = 100;
const SERVER_NEVENT: usize = 1024;

// helper functions
fn host() -> String {
    SERVER_HOST.to_string()
}

fn port() -> String {
    SERVER_PORT.to_string()
}

fn timeout() -> usize {
    SERVER_TIMEOUT
}

fn nevent() -> usize {
    SERVER_NEVENT
}

// struct definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Server {
    #[serde(default = "host")]
    host: String,
    #[serde(default = "port")]
    port: String,
    /// poll timeout for the listener thread, in milliseconds
    #[serde(default = "timeout")]
    timeout: usize,
    /// maximum events returned by a single poll
    #[serde(default = "nevent")]
    nevent: usize,
}

// implementation
impl Server {
    pub fn host(&self) -> String {
        self.host.clone()
    }

    pub fn port(&self) -> String {
        self.port.clone()
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::io::Error> {
        format!("{}:{}", self.host(), self.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "could not resolve socket address",
                )
            })
    }

    pub fn timeout(&self) -> usize {
        self.timeout
    }

    pub fn nevent(&self) -> usize {
        self.nevent
    }
}

// trait implementations
impl Default for Server {
    fn default() -> Self {
        Self {
            host: host(),
            port: port(),
            timeout: timeout(),
            nevent: nevent(),
        }
    }
}

// trait definitions
pub trait ServerConfig {
    fn server(&self) -> &Server;
}
