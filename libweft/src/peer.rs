// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Peer state and the in-memory peer registry.
//!
//! The registry never contains the local node and holds exactly one
//! entry per peer. The failure detector only ever changes a peer's
//! status; removal is an explicit application decision.

use std::{collections::BTreeMap, fmt};

use thiserror::Error;

use crate::{config::Config, ident::NodeId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The local node must never appear in its own registry.
    #[error("cannot register the local node as a peer")]
    Local,
}

/// Reachability as seen by the local failure detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Reachable,
    Suspected,
    Unreachable,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Reachable => f.write_str("reachable"),
            Self::Suspected => f.write_str("suspected"),
            Self::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// A status change, emitted so the application can observe lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub peer: NodeId,
    pub old: Status,
    pub new: Status,
}

/// Byte counter over a sliding time window.
#[derive(Clone, Debug, Default)]
struct Window {
    samples: Vec<(u64, u64)>,
}

impl Window {
    fn record(&mut self, now_ms: u64, bytes: u64, width_ms: u64) {
        self.prune(now_ms, width_ms);
        self.samples.push((now_ms, bytes));
    }

    fn total(&mut self, now_ms: u64, width_ms: u64) -> u64 {
        self.prune(now_ms, width_ms);
        self.samples.iter().map(|(_, b)| b).sum()
    }

    fn prune(&mut self, now_ms: u64, width_ms: u64) {
        let cutoff = now_ms.saturating_sub(width_ms);
        self.samples.retain(|(at, _)| *at >= cutoff);
    }
}

#[derive(Clone, Debug)]
pub struct Peer {
    pub id: NodeId,
    pub display_name: Option<String>,
    pub status: Status,
    /// The peer's incarnation as last heard from the peer itself (or via
    /// suspicions about it).
    pub incarnation: u64,
    pub failed_probes: u32,
    pub last_contact_ms: Option<u64>,
    pub last_anti_entropy_ms: Option<u64>,
    /// Smoothed RTT in milliseconds, mirrored from the RTT tracker.
    pub rtt_ms: Option<u64>,
    sent: Window,
    received: Window,
}

impl Peer {
    pub fn new(id: NodeId, display_name: Option<String>) -> Self {
        Self {
            id,
            display_name,
            status: Status::Reachable,
            incarnation: 0,
            failed_probes: 0,
            last_contact_ms: None,
            last_anti_entropy_ms: None,
            rtt_ms: None,
            sent: Window::default(),
            received: Window::default(),
        }
    }
}

/// Traffic totals over the configured window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Traffic {
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

/// In-memory state for every known peer, plus the local incarnation.
pub struct Registry {
    local: NodeId,
    local_incarnation: u64,
    peers: BTreeMap<NodeId, Peer>,
}

impl Registry {
    pub fn new(local: NodeId, local_incarnation: u64) -> Self {
        Self {
            local,
            local_incarnation,
            peers: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn local_incarnation(&self) -> u64 {
        self.local_incarnation
    }

    /// Returns `false` when the peer was already known (display name is
    /// refreshed either way).
    pub fn add(&mut self, id: NodeId, display_name: Option<String>) -> Result<bool, Error> {
        use std::collections::btree_map::Entry::*;

        if id == self.local {
            return Err(Error::Local);
        }

        match self.peers.entry(id.clone()) {
            Occupied(mut known) => {
                if display_name.is_some() {
                    known.get_mut().display_name = display_name;
                }
                Ok(false)
            },
            Vacant(slot) => {
                slot.insert(Peer::new(id, display_name));
                Ok(true)
            },
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn count_by_status(&self, status: Status) -> usize {
        self.peers.values().filter(|p| p.status == status).count()
    }

    /// Any message from a peer proves it is alive: reset the probe
    /// failure count, stamp contact, and reinstate it if it was
    /// suspected or unreachable.
    pub fn record_contact(&mut self, id: &NodeId, now_ms: u64) -> Option<Transition> {
        let peer = self.peers.get_mut(id)?;
        peer.last_contact_ms = Some(now_ms);
        peer.failed_probes = 0;
        transition(peer, Status::Reachable)
    }

    /// Stamp the peer's incarnation from a message it authored. Returns
    /// the reinstatement transition when the incarnation refutes an
    /// open suspicion.
    pub fn observe_incarnation(&mut self, id: &NodeId, incarnation: u64) -> Option<Transition> {
        let peer = self.peers.get_mut(id)?;
        if incarnation < peer.incarnation {
            return None;
        }
        peer.incarnation = incarnation;
        if peer.status == Status::Reachable {
            None
        } else {
            peer.failed_probes = 0;
            transition(peer, Status::Reachable)
        }
    }

    pub fn record_anti_entropy(&mut self, id: &NodeId, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_anti_entropy_ms = Some(now_ms);
        }
    }

    pub fn record_sent(&mut self, id: &NodeId, bytes: u64, now_ms: u64, window_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.sent.record(now_ms, bytes, window_ms);
        }
    }

    pub fn record_received(&mut self, id: &NodeId, bytes: u64, now_ms: u64, window_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.received.record(now_ms, bytes, window_ms);
        }
    }

    pub fn traffic(&mut self, id: &NodeId, now_ms: u64, window_ms: u64) -> Traffic {
        match self.peers.get_mut(id) {
            None => Traffic::default(),
            Some(peer) => Traffic {
                sent_bytes: peer.sent.total(now_ms, window_ms),
                received_bytes: peer.received.total(now_ms, window_ms),
            },
        }
    }

    /// Account one fully-failed probe and advance the status machine:
    /// `suspicion_threshold` consecutive failures suspect the peer,
    /// `unreachable_threshold` failures in total write it off.
    pub fn probe_failed(&mut self, id: &NodeId, config: &Config) -> Option<Transition> {
        let peer = self.peers.get_mut(id)?;
        peer.failed_probes = peer.failed_probes.saturating_add(1);

        let target = if peer.failed_probes >= config.unreachable_threshold {
            Status::Unreachable
        } else if peer.failed_probes >= config.suspicion_threshold {
            Status::Suspected
        } else {
            peer.status
        };
        transition(peer, target)
    }

    /// Adopt a third-party suspicion unless the peer has already refuted
    /// it with a newer incarnation.
    pub fn suspect(&mut self, id: &NodeId, incarnation: u64) -> Option<Transition> {
        let peer = self.peers.get_mut(id)?;
        if peer.status != Status::Reachable || incarnation < peer.incarnation {
            return None;
        }
        peer.incarnation = incarnation;
        transition(peer, Status::Suspected)
    }

    /// Handle a suspicion about the local node: bump our incarnation
    /// past the suspected one. Returns the new incarnation, which the
    /// caller must persist and gossip.
    pub fn refute(&mut self, suspected_incarnation: u64) -> Option<u64> {
        if suspected_incarnation < self.local_incarnation {
            return None;
        }
        self.local_incarnation = suspected_incarnation + 1;
        Some(self.local_incarnation)
    }
}

fn transition(peer: &mut Peer, new: Status) -> Option<Transition> {
    if peer.status == new {
        return None;
    }
    let old = std::mem::replace(&mut peer.status, new);
    Some(Transition {
        peer: peer.id.clone(),
        old,
        new,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn registry() -> Registry {
        let mut reg = Registry::new(node("me"), 0);
        reg.add(node("them"), None).unwrap();
        reg
    }

    #[test]
    fn local_node_never_registers() {
        let mut reg = Registry::new(node("me"), 0);
        assert_eq!(reg.add(node("me"), None), Err(Error::Local));
        assert!(reg.is_empty());
    }

    #[test]
    fn add_is_idempotent() {
        let mut reg = registry();
        assert!(!reg.add(node("them"), Some("Them".into())).unwrap());
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.get(&node("them")).unwrap().display_name.as_deref(),
            Some("Them")
        );
    }

    #[test]
    fn failures_walk_reachable_suspected_unreachable() {
        let mut reg = registry();
        let config = Config::default();
        let them = node("them");

        for _ in 0..config.suspicion_threshold - 1 {
            assert_eq!(reg.probe_failed(&them, &config), None);
        }
        assert_matches!(
            reg.probe_failed(&them, &config),
            Some(Transition {
                old: Status::Reachable,
                new: Status::Suspected,
                ..
            })
        );
        for _ in config.suspicion_threshold..config.unreachable_threshold - 1 {
            assert_eq!(reg.probe_failed(&them, &config), None);
        }
        assert_matches!(
            reg.probe_failed(&them, &config),
            Some(Transition {
                old: Status::Suspected,
                new: Status::Unreachable,
                ..
            })
        );
        // never deleted, only marked
        assert!(reg.get(&them).is_some());
    }

    #[test]
    fn contact_reinstates_and_resets_failures() {
        let mut reg = registry();
        let config = Config::default();
        let them = node("them");

        for _ in 0..config.suspicion_threshold {
            reg.probe_failed(&them, &config);
        }
        assert_eq!(reg.get(&them).unwrap().status, Status::Suspected);

        let t = reg.record_contact(&them, 42).unwrap();
        assert_eq!(t.new, Status::Reachable);
        let peer = reg.get(&them).unwrap();
        assert_eq!(peer.failed_probes, 0);
        assert_eq!(peer.last_contact_ms, Some(42));
    }

    #[test]
    fn newer_incarnation_refutes_suspicion() {
        let mut reg = registry();
        let them = node("them");

        reg.suspect(&them, 3).unwrap();
        assert_eq!(reg.observe_incarnation(&them, 2), None);
        let t = reg.observe_incarnation(&them, 4).unwrap();
        assert_eq!(t.new, Status::Reachable);
        assert_eq!(reg.get(&them).unwrap().incarnation, 4);
    }

    #[test]
    fn stale_suspicion_is_ignored() {
        let mut reg = registry();
        let them = node("them");

        reg.observe_incarnation(&them, 5);
        assert_eq!(reg.suspect(&them, 4), None);
        assert_eq!(reg.get(&them).unwrap().status, Status::Reachable);
    }

    #[test]
    fn local_refutation_bumps_past_suspicion() {
        let mut reg = registry();
        assert_eq!(reg.refute(0), Some(1));
        assert_eq!(reg.refute(0), None);
        assert_eq!(reg.refute(7), Some(8));
        assert_eq!(reg.local_incarnation(), 8);
    }

    #[test]
    fn traffic_window_slides() {
        let mut reg = registry();
        let them = node("them");
        let window = 1_000;

        reg.record_sent(&them, 100, 0, window);
        reg.record_sent(&them, 50, 900, window);
        assert_eq!(
            reg.traffic(&them, 900, window),
            Traffic {
                sent_bytes: 150,
                received_bytes: 0
            }
        );
        assert_eq!(
            reg.traffic(&them, 2_000, window).sent_bytes,
            0,
            "samples older than the window are dropped"
        );
    }
}
