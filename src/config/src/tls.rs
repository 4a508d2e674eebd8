// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

/// TLS is enabled by providing both a certificate chain and a private key.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Tls {
    #[serde(default)]
    certificate_chain: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
}

impl Tls {
    pub fn certificate_chain(&self) -> Option<&str> {
        self.certificate_chain.as_deref()
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }
}

pub trait TlsConfig {
    fn tls(&self) -> &Tls;
}
