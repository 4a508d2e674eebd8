// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-opcode thresholds for slow-operation diagnostics. When a command takes
//! longer than its threshold between arrival and response framing, the core
//! logs a slow-command record.

use crate::ClientOpcode;

use core::time::Duration;

const DEFAULT_MS: u64 = 500;

/// The slow-operation threshold for an opcode.
pub fn slow_op_threshold(opcode: ClientOpcode) -> Duration {
    let ms = match opcode {
        // full-bucket walks are expected to take a while
        ClientOpcode::Flush => 5_000,
        ClientOpcode::Stat => 1_000,
        // persistence waits are bounded by disk, not by us
        ClientOpcode::SeqnoPersistence => 30_000,
        ClientOpcode::CollectionsSetManifest => 1_000,
        _ => DEFAULT_MS,
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        assert_eq!(
            slow_op_threshold(ClientOpcode::Get),
            Duration::from_millis(500)
        );
        assert!(slow_op_threshold(ClientOpcode::Flush) > slow_op_threshold(ClientOpcode::Get));
    }
}
