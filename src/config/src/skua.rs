// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use serde::{Deserialize, Serialize};

use std::io::Read;

/// The complete daemon configuration, loadable from a TOML file. Any section
/// or field which is absent takes its default.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct SkuaConfig {
    #[serde(default)]
    buf: Buf,
    #[serde(default)]
    debug: Debug,
    #[serde(default)]
    sasl: Sasl,
    #[serde(default)]
    server: Server,
    #[serde(default)]
    tls: Tls,
    #[serde(default)]
    worker: Worker,
}

impl SkuaConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config = toml::from_str(&content).map_err(|e| {
            error!("{}", e);
            std::io::Error::new(std::io::ErrorKind::Other, "error parsing config")
        })?;
        Ok(config)
    }

    pub fn print(&self) {
        match toml::to_string_pretty(self) {
            Ok(contents) => println!("{}", contents),
            Err(e) => error!("failed to serialize config: {}", e),
        }
    }
}

impl BufConfig for SkuaConfig {
    fn buf(&self) -> &Buf {
        &self.buf
    }
}

impl DebugConfig for SkuaConfig {
    fn debug(&self) -> &Debug {
        &self.debug
    }
}

impl SaslConfig for SkuaConfig {
    fn sasl(&self) -> &Sasl {
        &self.sasl
    }
}

impl ServerConfig for SkuaConfig {
    fn server(&self) -> &Server {
        &self.server
    }
}

impl TlsConfig for SkuaConfig {
    fn tls(&self) -> &Tls {
        &self.tls
    }
}

impl WorkerConfig for SkuaConfig {
    fn worker(&self) -> &Worker {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SkuaConfig::default();
        assert_eq!(config.worker().threads(), 4);
        assert_eq!(config.worker().max_reqs_per_event(), 20);
        assert_eq!(config.buf().size(), 2048);
        assert!(config.tls().certificate_chain().is_none());
    }

    #[test]
    fn parse_partial() {
        let config: SkuaConfig = toml::from_str(
            "[server]\nport = \"12345\"\n[worker]\nthreads = 2\n",
        )
        .unwrap();
        assert_eq!(config.server().port(), "12345");
        assert_eq!(config.worker().threads(), 2);
        // unspecified fields take defaults
        assert_eq!(config.worker().nevent(), 1024);
    }
}
