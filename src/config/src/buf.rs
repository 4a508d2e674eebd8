// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::units::KB;

use serde::{Deserialize, Serialize};

// constants to define default values
const BUF_DEFAULT_SIZE: usize = 2 * KB;

// helper functions
fn size() -> usize {
    BUF_DEFAULT_SIZE
}

// struct definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Buf {
    /// Target size for connection read/write pipes. Pipes grow past this for
    /// large packets and shrink back between commands.
    #[serde(default = "size")]
    size: usize,
}

// implementation
impl Buf {
    pub fn size(&self) -> usize {
        self.size
    }
}

// trait implementations
impl Default for Buf {
    fn default() -> Self {
        Self { size: size() }
    }
}

// trait definitions
pub trait BufConfig {
    fn buf(&self) -> &Buf;
}
