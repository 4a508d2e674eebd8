// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Signals fanned out from the parent process to the sibling threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Re-read runtime tunables from the configuration file.
    ConfigReload,
    /// Begin cooperative shutdown: each worker walks its connections and
    /// initiates their close sequence before the thread exits.
    Shutdown,
}
