// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

use std::time::Duration;

/// The knobs applications may turn.
///
/// Gossip, probe and timeout durations are derived from observed RTT
/// (see [`crate::rtt`]) and intentionally absent here.
#[derive(Clone, Debug)]
pub struct Config {
    /// Consecutive failed probes before a peer is suspected.
    pub suspicion_threshold: u32,
    /// Failed probes before a suspected peer is marked unreachable.
    /// Must exceed `suspicion_threshold`.
    pub unreachable_threshold: u32,
    /// How many relays an indirect probe fans out to.
    pub indirect_fanout: usize,
    /// Unreachable peers are still probed, every this-many rounds.
    pub unreachable_probe_interval: u32,
    /// Gossip rounds are skipped while the transport reports more than
    /// this many pending sends.
    pub congestion_threshold: u32,
    /// Width of the sliding window for per-peer traffic accounting.
    pub traffic_window: Duration,
    /// How many inbound frames to buffer while paused before dropping.
    pub inbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suspicion_threshold: 3,
            unreachable_threshold: 6,
            indirect_fanout: 3,
            unreachable_probe_interval: 3,
            congestion_threshold: 10,
            traffic_window: Duration::from_secs(60),
            inbound_buffer: 1024,
        }
    }
}
