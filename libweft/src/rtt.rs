// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! RTT estimation and the adaptive timings derived from it.
//!
//! Per-peer and global EWMA estimators with the classic α = 1/8,
//! β = 1/4 gains. The derived gossip/probe/timeout durations are
//! clamped to hard bounds and deliberately not configurable: they track
//! the transport (BLE vs. WiFi) instead of a config file.

use std::{collections::BTreeMap, time::Duration};

use crate::ident::NodeId;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;

const MIN_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_GOSSIP_INTERVAL: Duration = Duration::from_millis(100);
const MAX_GOSSIP_INTERVAL: Duration = Duration::from_secs(5);

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Smoothed RTT and variance for one target (or globally).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimate {
    srtt_ms: f64,
    var_ms: f64,
    samples: u64,
}

impl Default for Estimate {
    /// Neutral prior for both BLE and WiFi: 1 s smoothed, 500 ms
    /// variance. Replaced wholesale by the first real sample.
    fn default() -> Self {
        Self {
            srtt_ms: 1_000.0,
            var_ms: 500.0,
            samples: 0,
        }
    }
}

impl Estimate {
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt_ms / 1_000.0)
    }

    pub fn var(&self) -> Duration {
        Duration::from_secs_f64(self.var_ms / 1_000.0)
    }

    pub fn observe(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1_000.0;
        if self.samples == 0 {
            self.srtt_ms = sample_ms;
            self.var_ms = sample_ms / 2.0;
        } else {
            self.srtt_ms = (1.0 - ALPHA) * self.srtt_ms + ALPHA * sample_ms;
            self.var_ms = (1.0 - BETA) * self.var_ms + BETA * (sample_ms - self.srtt_ms).abs();
        }
        self.samples += 1;
    }

    /// `srtt + 4·var`, clamped to [200 ms, 10 s].
    pub fn suggested_timeout(&self) -> Duration {
        let raw = Duration::from_secs_f64((self.srtt_ms + 4.0 * self.var_ms) / 1_000.0);
        raw.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
    }
}

/// Effective timings derived from the global estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub gossip_interval: Duration,
    pub probe_interval: Duration,
    pub ping_timeout: Duration,
}

/// EWMA tracker over RTT samples, per peer and global.
#[derive(Clone, Debug, Default)]
pub struct Tracker {
    global: Estimate,
    peers: BTreeMap<NodeId, Estimate>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, peer: &NodeId, rtt: Duration) {
        self.global.observe(rtt);
        self.peers.entry(peer.clone()).or_default().observe(rtt);
    }

    pub fn forget(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    pub fn global(&self) -> &Estimate {
        &self.global
    }

    /// The peer's estimate, or the global one for peers never sampled.
    pub fn peer(&self, peer: &NodeId) -> &Estimate {
        self.peers.get(peer).unwrap_or(&self.global)
    }

    pub fn ping_timeout(&self, peer: &NodeId) -> Duration {
        self.peer(peer).suggested_timeout()
    }

    pub fn timings(&self) -> Timings {
        let srtt = self.global.srtt();
        Timings {
            gossip_interval: (2 * srtt).clamp(MIN_GOSSIP_INTERVAL, MAX_GOSSIP_INTERVAL),
            probe_interval: (3 * srtt).clamp(MIN_PROBE_INTERVAL, MAX_PROBE_INTERVAL),
            ping_timeout: self.global.suggested_timeout(),
        }
    }
}
