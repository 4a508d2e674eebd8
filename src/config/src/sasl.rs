// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

/// Credentials for the PLAIN mechanism. When no username is configured any
/// authentication attempt is accepted, which is the mode used for local
/// development and the integration tests.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Sasl {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl Sasl {
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

pub trait SaslConfig {
    fn sasl(&self) -> &Sasl;
}
