// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! SWIM-style failure detection as a pure state machine.
//!
//! The detector consumes [`Input`]s (probe rounds, wire frames, timer
//! expiries) and yields status [`Transition`]s plus [`Tock`]s: sends
//! and timer arms the coordinator interprets. Timing itself lives
//! outside: a timer armed here comes back as [`Input::Expired`].
//!
//! Probe lifecycle: direct ping → on timeout, indirect ping via up to
//! `indirect_fanout` relays → on timeout, one failed probe is charged
//! and the peer walks reachable → suspected → unreachable per the
//! configured thresholds.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use rand::seq::IteratorRandom as _;

use crate::{
    config::Config,
    ident::NodeId,
    net::{codec::Message, transport::Priority},
    peer::{Registry, Status, Transition},
    rtt::Tracker,
};

#[derive(Clone, Debug)]
pub enum Input {
    /// One probe round is due.
    Round { now_ms: u64 },
    /// `Ping` frame received.
    Ping {
        from: NodeId,
        seq: u32,
        incarnation: u64,
        now_ms: u64,
    },
    /// `Ack` frame received.
    Ack {
        from: NodeId,
        seq: u32,
        incarnation: u64,
        now_ms: u64,
    },
    /// `PingReq` frame received: probe `target` on behalf of `from`.
    PingReq {
        from: NodeId,
        seq: u32,
        target: NodeId,
        now_ms: u64,
    },
    /// `Suspicion` frame received.
    Suspicion {
        from: NodeId,
        about: NodeId,
        incarnation: u64,
        now_ms: u64,
    },
    /// A timer armed via [`Tock::Arm`] fired. Ignored when the probe
    /// already settled.
    Expired { seq: u32, now_ms: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Tock {
    Send {
        to: NodeId,
        message: Message,
        priority: Priority,
    },
    /// Deliver [`Input::Expired`] with this `seq` after `after`.
    Arm { seq: u32, after: Duration },
    /// The local incarnation changed; write it through.
    PersistIncarnation { incarnation: u64 },
}

/// Return type of [`Detector::apply`]: transitions to publish and
/// tocks to interpret.
#[derive(Debug, Default)]
#[must_use = "transitions must be published and tocks interpreted"]
pub struct Output {
    pub transitions: Vec<Transition>,
    pub tocks: Vec<Tock>,
}

impl Output {
    fn transition(&mut self, t: impl IntoIterator<Item = Transition>) {
        self.transitions.extend(t);
    }

    fn send(&mut self, to: NodeId, message: Message, priority: Priority) {
        self.tocks.push(Tock::Send {
            to,
            message,
            priority,
        });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Direct,
    Indirect,
}

#[derive(Debug)]
struct Probe {
    target: NodeId,
    phase: Phase,
    sent_at_ms: u64,
}

#[derive(Debug)]
struct Relay {
    origin: NodeId,
    origin_seq: u32,
}

/// The failure detector for one coordinator.
pub struct Detector<R> {
    rng: R,
    round: u64,
    seq: u32,
    /// Peers probed in the current cycle; cleared when exhausted.
    probed: BTreeSet<NodeId>,
    /// Our outstanding probes, by probe sequence.
    probes: HashMap<u32, Probe>,
    /// Pings we forwarded on behalf of other probers.
    relays: HashMap<u32, Relay>,
}

impl<R> Detector<R>
where
    R: rand::Rng,
{
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            round: 0,
            seq: 0,
            probed: BTreeSet::new(),
            probes: HashMap::new(),
            relays: HashMap::new(),
        }
    }

    /// Drop all in-flight probe and relay state.
    ///
    /// Called on pause/stop: timers were cancelled, and a cancelled
    /// probe must not advance any failure count.
    pub fn reset(&mut self) {
        self.probes.clear();
        self.relays.clear();
        self.probed.clear();
    }

    #[tracing::instrument(level = "debug", skip(self, registry, rtt, config))]
    pub fn apply(
        &mut self,
        registry: &mut Registry,
        rtt: &mut Tracker,
        config: &Config,
        input: Input,
    ) -> Output {
        let mut out = Output::default();

        match input {
            Input::Round { now_ms } => self.start_probe(registry, rtt, config, now_ms, &mut out),

            Input::Ping {
                from,
                seq,
                incarnation,
                now_ms,
            } => {
                out.transition(registry.record_contact(&from, now_ms));
                out.transition(registry.observe_incarnation(&from, incarnation));
                out.send(
                    from,
                    Message::Ack {
                        seq,
                        incarnation: registry.local_incarnation(),
                    },
                    Priority::High,
                );
            },

            Input::Ack {
                from,
                seq,
                incarnation,
                now_ms,
            } => {
                out.transition(registry.record_contact(&from, now_ms));
                out.transition(registry.observe_incarnation(&from, incarnation));

                if let Some(probe) = self.probes.remove(&seq) {
                    out.transition(registry.record_contact(&probe.target, now_ms));
                    if probe.phase == Phase::Direct && from == probe.target {
                        let sample = Duration::from_millis(now_ms.saturating_sub(probe.sent_at_ms));
                        rtt.sample(&probe.target, sample);
                        let srtt_ms = rtt.peer(&probe.target).srtt().as_millis() as u64;
                        if let Some(peer) = registry.get_mut(&probe.target) {
                            peer.rtt_ms = Some(srtt_ms);
                        }
                    }
                } else if let Some(relay) = self.relays.remove(&seq) {
                    // The target answered our forwarded ping: let the
                    // original prober know.
                    out.send(
                        relay.origin,
                        Message::Ack {
                            seq: relay.origin_seq,
                            incarnation: registry.local_incarnation(),
                        },
                        Priority::High,
                    );
                }
            },

            Input::PingReq {
                from,
                seq,
                target,
                now_ms,
            } => {
                out.transition(registry.record_contact(&from, now_ms));

                let relay_seq = self.next_seq();
                self.relays.insert(
                    relay_seq,
                    Relay {
                        origin: from,
                        origin_seq: seq,
                    },
                );
                let timeout = rtt.ping_timeout(&target);
                out.send(
                    target,
                    Message::Ping {
                        seq: relay_seq,
                        incarnation: registry.local_incarnation(),
                    },
                    Priority::High,
                );
                out.tocks.push(Tock::Arm {
                    seq: relay_seq,
                    after: timeout,
                });
            },

            Input::Suspicion {
                from,
                about,
                incarnation,
                now_ms,
            } => {
                out.transition(registry.record_contact(&from, now_ms));

                if about == *registry.local_id() {
                    if let Some(new_incarnation) = registry.refute(incarnation) {
                        tracing::debug!(incarnation = new_incarnation, "refuting suspicion");
                        out.tocks.push(Tock::PersistIncarnation {
                            incarnation: new_incarnation,
                        });
                        out.send(
                            from,
                            Message::Ack {
                                seq: 0,
                                incarnation: new_incarnation,
                            },
                            Priority::High,
                        );
                    }
                } else {
                    out.transition(registry.suspect(&about, incarnation));
                }
            },

            Input::Expired { seq, now_ms } => {
                if let Some(probe) = self.probes.remove(&seq) {
                    match probe.phase {
                        Phase::Direct => {
                            self.go_indirect(registry, rtt, config, probe, now_ms, &mut out)
                        },
                        Phase::Indirect => self.fail_probe(registry, config, &probe.target, &mut out),
                    }
                } else {
                    // Either the probe settled, or a forwarded ping went
                    // unanswered; the origin runs its own timer.
                    self.relays.remove(&seq);
                }
            },
        }

        out
    }

    fn start_probe(
        &mut self,
        registry: &mut Registry,
        rtt: &Tracker,
        config: &Config,
        now_ms: u64,
        out: &mut Output,
    ) {
        self.round += 1;

        let target = match self.select_target(registry, config) {
            None => return,
            Some(target) => target,
        };
        self.probed.insert(target.clone());

        let seq = self.next_seq();
        let timeout = rtt.ping_timeout(&target);
        self.probes.insert(
            seq,
            Probe {
                target: target.clone(),
                phase: Phase::Direct,
                sent_at_ms: now_ms,
            },
        );

        tracing::debug!(target = %target, seq, "probing");
        out.send(
            target,
            Message::Ping {
                seq,
                incarnation: registry.local_incarnation(),
            },
            Priority::High,
        );
        out.tocks.push(Tock::Arm { seq, after: timeout });
    }

    /// Pick one peer not probed this cycle. Reachable and suspected
    /// peers take turns; unreachable peers are sampled every
    /// `unreachable_probe_interval`-th round only.
    fn select_target(&mut self, registry: &Registry, config: &Config) -> Option<NodeId> {
        let sample_unreachable =
            self.round % u64::from(config.unreachable_probe_interval.max(1)) == 0;

        for attempt in 0..2 {
            if attempt == 1 {
                // cycle exhausted, start over
                self.probed.clear();
            }

            if sample_unreachable {
                let unreachable = registry
                    .iter()
                    .filter(|p| p.status == Status::Unreachable && !self.probed.contains(&p.id))
                    .map(|p| p.id.clone())
                    .choose(&mut self.rng);
                if let Some(target) = unreachable {
                    return Some(target);
                }
            }

            let live = registry
                .iter()
                .filter(|p| p.status != Status::Unreachable && !self.probed.contains(&p.id))
                .map(|p| p.id.clone())
                .choose(&mut self.rng);
            if live.is_some() {
                return live;
            }

            if registry.is_empty() {
                return None;
            }
        }

        None
    }

    fn go_indirect(
        &mut self,
        registry: &mut Registry,
        rtt: &Tracker,
        config: &Config,
        probe: Probe,
        now_ms: u64,
        out: &mut Output,
    ) {
        let relays = registry
            .iter()
            .filter(|p| p.status == Status::Reachable && p.id != probe.target)
            .map(|p| p.id.clone())
            .choose_multiple(&mut self.rng, config.indirect_fanout);

        if relays.is_empty() {
            self.fail_probe(registry, config, &probe.target, out);
            return;
        }

        let seq = self.next_seq();
        let timeout = rtt.ping_timeout(&probe.target);
        tracing::debug!(target = %probe.target, relays = relays.len(), seq, "probing indirectly");
        self.probes.insert(
            seq,
            Probe {
                target: probe.target.clone(),
                phase: Phase::Indirect,
                sent_at_ms: now_ms,
            },
        );

        for relay in relays {
            out.send(
                relay,
                Message::PingReq {
                    seq,
                    target: probe.target.clone(),
                },
                Priority::High,
            );
        }
        out.tocks.push(Tock::Arm { seq, after: timeout });
    }

    fn fail_probe(
        &mut self,
        registry: &mut Registry,
        config: &Config,
        target: &NodeId,
        out: &mut Output,
    ) {
        let transition = match registry.probe_failed(target, config) {
            None => return,
            Some(t) => t,
        };

        if transition.new == Status::Suspected {
            let incarnation = registry.get(target).map(|p| p.incarnation).unwrap_or(0);
            let message = Message::Suspicion {
                about: target.clone(),
                incarnation,
            };

            // Tell the suspect itself (it may still hear us even if we
            // cannot hear it) and every reachable peer.
            out.send(target.clone(), message.clone(), Priority::Normal);
            let reachable = registry
                .iter()
                .filter(|p| p.status == Status::Reachable && p.id != *target)
                .map(|p| p.id.clone())
                .collect::<Vec<_>>();
            for to in reachable {
                out.send(to, message.clone(), Priority::Normal);
            }
        }

        tracing::info!(peer = %transition.peer, old = %transition.old, new = %transition.new, "peer status changed");
        out.transitions.push(transition);
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            // 0 is reserved for unsolicited acks (refutations)
            self.seq = 1;
        }
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    struct Fixture {
        detector: Detector<Pcg64Mcg>,
        registry: Registry,
        rtt: Tracker,
        config: Config,
    }

    impl Fixture {
        fn new(peers: &[&str]) -> Self {
            let mut registry = Registry::new(node("me"), 0);
            for p in peers {
                registry.add(node(p), None).unwrap();
            }
            Self {
                detector: Detector::new(Pcg64Mcg::new(0xcafe)),
                registry,
                rtt: Tracker::new(),
                config: Config::default(),
            }
        }

        fn apply(&mut self, input: Input) -> Output {
            self.detector
                .apply(&mut self.registry, &mut self.rtt, &self.config, input)
        }

        /// Issue rounds until `target` is probed (acking probes of
        /// anyone else), then drive that probe through direct and
        /// indirect timeouts into one full failure. Returns the output
        /// of the failing step.
        fn fail_target(&mut self, target: &NodeId, now_ms: u64) -> Output {
            loop {
                let out = self.apply(Input::Round { now_ms });
                let seq = armed_seq(&out).expect("round should arm a timer");
                let to = sends(&out).next().expect("round should ping someone").0.clone();

                if to == *target {
                    let out = self.apply(Input::Expired { seq, now_ms });
                    return match armed_seq(&out) {
                        Some(seq) => self.apply(Input::Expired { seq, now_ms }),
                        None => out,
                    };
                }

                let _ = self.apply(Input::Ack {
                    from: to,
                    seq,
                    incarnation: 0,
                    now_ms,
                });
            }
        }
    }

    fn armed_seq(out: &Output) -> Option<u32> {
        out.tocks.iter().find_map(|t| match t {
            Tock::Arm { seq, .. } => Some(*seq),
            _ => None,
        })
    }

    fn sends<'a>(out: &'a Output) -> impl Iterator<Item = (&'a NodeId, &'a Message)> {
        out.tocks.iter().filter_map(|t| match t {
            Tock::Send { to, message, .. } => Some((to, message)),
            _ => None,
        })
    }

    #[test]
    fn round_pings_a_peer_and_arms_a_timer() {
        let mut fx = Fixture::new(&["them"]);
        let out = fx.apply(Input::Round { now_ms: 0 });

        let (to, message) = sends(&out).next().unwrap();
        assert_eq!(to, &node("them"));
        assert_matches!(message, Message::Ping { .. });
        assert!(armed_seq(&out).is_some());
    }

    #[test]
    fn responsive_peer_stays_reachable_with_zero_failures() {
        let mut fx = Fixture::new(&["them"]);

        for now_ms in 0..20 {
            let out = fx.apply(Input::Round { now_ms });
            let seq = armed_seq(&out).unwrap();
            let out = fx.apply(Input::Ack {
                from: node("them"),
                seq,
                incarnation: 0,
                now_ms: now_ms + 1,
            });
            assert!(out.transitions.is_empty());
            // late timer fire is a no-op
            let out = fx.apply(Input::Expired {
                seq,
                now_ms: now_ms + 10,
            });
            assert!(out.transitions.is_empty() && out.tocks.is_empty());
        }

        let peer = fx.registry.get(&node("them")).unwrap();
        assert_eq!(peer.status, Status::Reachable);
        assert_eq!(peer.failed_probes, 0);
        assert!(peer.rtt_ms.is_some());
    }

    #[test]
    fn direct_timeout_fans_out_ping_reqs() {
        let mut fx = Fixture::new(&["target", "r1", "r2", "r3", "r4"]);

        // force the round to probe "target"
        let target = node("target");
        for p in ["r1", "r2", "r3", "r4"] {
            fx.detector.probed.insert(node(p));
        }
        let out = fx.apply(Input::Round { now_ms: 0 });
        assert_eq!(sends(&out).next().unwrap().0, &target);
        let seq = armed_seq(&out).unwrap();

        let out = fx.apply(Input::Expired { seq, now_ms: 1_000 });
        let ping_reqs: Vec<_> = sends(&out)
            .filter(|(_, m)| matches!(m, Message::PingReq { target: t, .. } if *t == target))
            .collect();
        assert_eq!(ping_reqs.len(), fx.config.indirect_fanout);
        assert!(ping_reqs.iter().all(|(to, _)| **to != target));
    }

    #[test]
    fn relay_forwards_ping_and_ack() {
        let mut fx = Fixture::new(&["origin", "target"]);

        let out = fx.apply(Input::PingReq {
            from: node("origin"),
            seq: 77,
            target: node("target"),
            now_ms: 0,
        });
        let (to, message) = sends(&out).next().unwrap();
        assert_eq!(to, &node("target"));
        let relay_seq = assert_matches!(message, Message::Ping { seq, .. } => *seq);

        let out = fx.apply(Input::Ack {
            from: node("target"),
            seq: relay_seq,
            incarnation: 0,
            now_ms: 5,
        });
        let back: Vec<_> = sends(&out).collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].0, &node("origin"));
        assert_matches!(back[0].1, Message::Ack { seq: 77, .. });
    }

    #[test]
    fn repeated_failures_suspect_then_write_off() {
        let mut fx = Fixture::new(&["them"]);
        let them = node("them");

        for _ in 0..fx.config.suspicion_threshold {
            let _ = fx.fail_target(&them, 0);
        }
        assert_eq!(fx.registry.get(&them).unwrap().status, Status::Suspected);

        for _ in fx.config.suspicion_threshold..fx.config.unreachable_threshold {
            let _ = fx.fail_target(&them, 0);
        }
        assert_eq!(fx.registry.get(&them).unwrap().status, Status::Unreachable);
        // still known, never deleted
        assert!(fx.registry.get(&them).is_some());
    }

    #[test]
    fn suspicion_transition_broadcasts_to_suspect_and_reachable_peers() {
        let mut fx = Fixture::new(&["target", "witness"]);
        let target = node("target");

        let mut suspicion_recipients = Vec::new();
        for _ in 0..fx.config.suspicion_threshold {
            let out = fx.fail_target(&target, 0);
            suspicion_recipients.extend(
                sends(&out)
                    .filter(|(_, m)| matches!(m, Message::Suspicion { .. }))
                    .map(|(to, _)| to.clone()),
            );
        }

        assert!(suspicion_recipients.contains(&target));
        assert!(suspicion_recipients.contains(&node("witness")));
    }

    #[test]
    fn local_suspicion_is_refuted_with_bumped_incarnation() {
        let mut fx = Fixture::new(&["accuser"]);

        let out = fx.apply(Input::Suspicion {
            from: node("accuser"),
            about: node("me"),
            incarnation: 4,
            now_ms: 0,
        });

        assert_eq!(fx.registry.local_incarnation(), 5);
        assert!(out
            .tocks
            .iter()
            .any(|t| matches!(t, Tock::PersistIncarnation { incarnation: 5 })));
        let (to, message) = sends(&out).next().unwrap();
        assert_eq!(to, &node("accuser"));
        assert_matches!(message, Message::Ack { seq: 0, incarnation: 5 });
    }

    #[test]
    fn stale_local_suspicion_is_ignored() {
        let mut fx = Fixture::new(&["accuser"]);
        fx.registry.refute(9); // incarnation now 10

        let out = fx.apply(Input::Suspicion {
            from: node("accuser"),
            about: node("me"),
            incarnation: 3,
            now_ms: 0,
        });
        assert!(sends(&out).next().is_none());
        assert_eq!(fx.registry.local_incarnation(), 10);
    }

    #[test]
    fn third_party_suspicion_is_adopted_and_refutable() {
        let mut fx = Fixture::new(&["gossiper", "victim"]);

        let out = fx.apply(Input::Suspicion {
            from: node("gossiper"),
            about: node("victim"),
            incarnation: 2,
            now_ms: 0,
        });
        assert_matches!(
            out.transitions.as_slice(),
            [Transition {
                new: Status::Suspected,
                ..
            }]
        );

        // a message from the victim with incarnation >= 2 reinstates it
        let out = fx.apply(Input::Ack {
            from: node("victim"),
            seq: 0,
            incarnation: 3,
            now_ms: 1,
        });
        assert!(out
            .transitions
            .iter()
            .any(|t| t.peer == node("victim") && t.new == Status::Reachable));
    }

    #[test]
    fn ping_is_answered_with_local_incarnation() {
        let mut fx = Fixture::new(&["them"]);
        fx.registry.refute(6); // incarnation 7

        let out = fx.apply(Input::Ping {
            from: node("them"),
            seq: 3,
            incarnation: 0,
            now_ms: 0,
        });
        let (to, message) = sends(&out).next().unwrap();
        assert_eq!(to, &node("them"));
        assert_matches!(message, Message::Ack { seq: 3, incarnation: 7 });
    }

    #[test]
    fn unreachable_peers_are_sampled_on_schedule() {
        let mut fx = Fixture::new(&["gone", "alive"]);
        let gone = node("gone");

        for _ in 0..fx.config.unreachable_threshold {
            let _ = fx.fail_target(&gone, 0);
        }
        assert_eq!(fx.registry.get(&gone).unwrap().status, Status::Unreachable);

        fx.detector.probed.clear();
        let interval = u64::from(fx.config.unreachable_probe_interval);
        let mut probed_gone = 0;
        for _ in 0..(interval * 2) {
            let out = fx.apply(Input::Round { now_ms: 0 });
            let (to, _) = sends(&out).next().unwrap();
            if *to == gone {
                probed_gone += 1;
            }
            let seq = armed_seq(&out).unwrap();
            let from = to.clone();
            let _ = fx.apply(Input::Ack {
                from,
                seq,
                incarnation: 0,
                now_ms: 0,
            });
        }
        assert!(probed_gone >= 1, "unreachable peer was never sampled");
    }

    #[test]
    fn reset_forgets_outstanding_probes() {
        let mut fx = Fixture::new(&["them"]);
        let out = fx.apply(Input::Round { now_ms: 0 });
        let seq = armed_seq(&out).unwrap();

        fx.detector.reset();
        let out = fx.apply(Input::Expired { seq, now_ms: 99 });
        assert!(out.transitions.is_empty());
        assert_eq!(fx.registry.get(&node("them")).unwrap().failed_probes, 0);
    }
}
