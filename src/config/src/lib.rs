// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Configuration for the skua daemon. Each concern has its own section struct
//! with serde-derived defaults and a matching accessor trait, so a thread can
//! be built from any configuration carrying the section it needs.

#[macro_use]
extern crate log;

mod buf;
mod debug;
mod sasl;
mod server;
mod skua;
mod tls;
mod worker;

pub use buf::{Buf, BufConfig};
pub use debug::{Debug, DebugConfig};
pub use sasl::{Sasl, SaslConfig};
pub use server::{Server, ServerConfig};
pub use skua::SkuaConfig;
pub use tls::{Tls, TlsConfig};
pub use worker::{Worker, WorkerConfig};

mod units {
    pub const KB: usize = 1024;
}
