// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

fn log_level() -> String {
    "info".to_string()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Debug {
    #[serde(default = "log_level")]
    log_level: String,
}

impl Debug {
    pub fn log_level(&self) -> log::Level {
        match self.log_level.as_str() {
            "error" => log::Level::Error,
            "warn" => log::Level::Warn,
            "debug" => log::Level::Debug,
            "trace" => log::Level::Trace,
            _ => log::Level::Info,
        }
    }
}

impl Default for Debug {
    fn default() -> Self {
        Self {
            log_level: log_level(),
        }
    }
}

pub trait DebugConfig {
    fn debug(&self) -> &Debug;
}
