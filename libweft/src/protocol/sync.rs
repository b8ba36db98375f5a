// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Anti-entropy reconciliation.
//!
//! A gossip round sends a [`Digest`] (per-stream version vectors) to
//! one peer. The receiver answers with a [`Delta`]: the entries the
//! digest shows the sender lacks, plus the receiver's own version
//! vectors so the sender can tell whether it is still behind and keep
//! the exchange going with a follow-up digest. Either side may
//! initiate; convergence needs both to take turns, which the gossip
//! scheduler guarantees.
//!
//! Everything here is pure over the channel map and entry store; the
//! coordinator holds the locks and does the sending.

use std::collections::BTreeMap;

use crate::{
    channel::Channel,
    clock::Clock,
    ident::{ChannelId, NodeId, StreamId},
    log::Entry,
    net::codec::{ChannelDelta, ChannelDigest, Delta, Digest, StreamDelta, StreamDigest},
    protocol::{error::SyncError, event::Event},
    store::{EntryStore, PutOutcome},
};

pub type Channels = BTreeMap<ChannelId, Channel>;

/// What applying a [`Delta`] produced.
#[derive(Debug, Default)]
#[must_use = "events must be emitted and appended entries mirrored"]
pub struct MergeOutcome {
    pub events: Vec<Event>,
    pub errors: Vec<SyncError>,
    /// Entries actually appended, for the storage mirror.
    pub appended: Vec<(ChannelId, StreamId, Entry)>,
    /// Set when the sender still has entries we lack.
    pub follow_up: Option<Digest>,
}

/// Summarize everything we have, one version vector per stream.
pub fn build_digest(channels: &Channels) -> Digest {
    Digest {
        channels: channels
            .values()
            .map(|channel| ChannelDigest {
                channel: channel.id().clone(),
                streams: channel
                    .streams
                    .values()
                    .map(|stream| StreamDigest {
                        stream: stream.id().clone(),
                        version: stream.version.clone(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Answer a digest with the entries its sender lacks.
///
/// Only `(channel, stream)` pairs known locally are considered;
/// unknown channels are not ours to serve (membership is advisory, but
/// entries for unknown channels are never requested or volunteered).
pub fn handle_digest(channels: &Channels, store: &EntryStore, digest: &Digest) -> Delta {
    let mut out = Vec::new();

    for channel_digest in &digest.channels {
        let channel = match channels.get(&channel_digest.channel) {
            None => {
                tracing::debug!(channel = %channel_digest.channel, "ignoring digest for unknown channel");
                continue;
            },
            Some(channel) => channel,
        };

        let mut streams = Vec::new();
        for stream_digest in &channel_digest.streams {
            let stream = match channel.stream(&stream_digest.stream) {
                None => continue,
                Some(stream) => stream,
            };

            let mut entries = Vec::new();
            for (author, local_seq) in stream.version.iter() {
                let remote_seq = stream_digest.version.get(author);
                if local_seq > remote_seq {
                    entries.extend(store.entries_from(
                        channel.id(),
                        stream.id(),
                        author,
                        remote_seq + 1,
                    ));
                }
            }

            // Send the stream even when we have nothing new: our
            // version vector tells the peer what we still need.
            streams.push(StreamDelta {
                stream: stream.id().clone(),
                version: stream.version.clone(),
                entries,
            });
        }

        if !streams.is_empty() {
            out.push(ChannelDelta {
                channel: channel.id().clone(),
                streams,
            });
        }
    }

    Delta { channels: out }
}

/// Apply a delta: validate, append idempotently, advance clocks and
/// version vectors, run retention, and work out whether the sender is
/// still ahead of us.
pub fn handle_delta(
    channels: &mut Channels,
    store: &mut EntryStore,
    clock: &Clock,
    from: &NodeId,
    delta: Delta,
    now_ms: u64,
) -> MergeOutcome {
    let mut out = MergeOutcome::default();
    let mut behind: Vec<(ChannelId, StreamDigest)> = Vec::new();

    for channel_delta in delta.channels {
        let channel = match channels.get_mut(&channel_delta.channel) {
            None => {
                out.errors.push(SyncError::Channel {
                    occurred_at_ms: now_ms,
                    channel: channel_delta.channel.clone(),
                    message: format!("delta from {from} references unknown channel"),
                });
                continue;
            },
            Some(channel) => channel,
        };
        let channel_id = channel.id().clone();
        let members = channel.members.clone();

        for stream_delta in channel_delta.streams {
            let stream = match channel.stream_mut(&stream_delta.stream) {
                None => {
                    out.errors.push(SyncError::Channel {
                        occurred_at_ms: now_ms,
                        channel: channel_id.clone(),
                        message: format!(
                            "delta from {from} references unknown stream {}",
                            stream_delta.stream
                        ),
                    });
                    continue;
                },
                Some(stream) => stream,
            };
            let stream_id = stream.id().clone();

            let mut merged = Vec::new();
            let mut outsiders: BTreeMap<NodeId, usize> = BTreeMap::new();

            for entry in stream_delta.entries {
                match store.append(&channel_id, &stream_id, entry.clone()) {
                    Err(e) => {
                        out.errors.push(SyncError::Channel {
                            occurred_at_ms: now_ms,
                            channel: channel_id.clone(),
                            message: format!("invalid entry from {from}: {e}"),
                        });
                        continue;
                    },

                    Ok(PutOutcome::Duplicate) => continue,

                    Ok(PutOutcome::Conflicting) => {
                        out.errors.push(SyncError::Channel {
                            occurred_at_ms: now_ms,
                            channel: channel_id.clone(),
                            message: format!(
                                "conflicting payload for {}#{} in stream {stream_id}, keeping first write",
                                entry.author, entry.sequence
                            ),
                        });
                        continue;
                    },

                    Ok(PutOutcome::Appended) => {
                        stream.version.observe(&entry.author, entry.sequence);
                        if let Err(e) = clock.observe(entry.timestamp) {
                            out.errors.push(SyncError::Peer {
                                occurred_at_ms: now_ms,
                                peer: from.clone(),
                                message: format!("clock skew merging entry: {e}"),
                            });
                        }
                        if !members.contains(&entry.author) {
                            *outsiders.entry(entry.author.clone()).or_default() += 1;
                        }
                        out.appended
                            .push((channel_id.clone(), stream_id.clone(), entry.clone()));
                        merged.push(entry);
                    },
                }
            }

            if !merged.is_empty() {
                tracing::debug!(
                    channel = %channel_id,
                    stream = %stream_id,
                    count = merged.len(),
                    "merged entries"
                );
                out.events.push(Event::EntriesMerged {
                    channel: channel_id.clone(),
                    stream: stream_id.clone(),
                    entries: merged,
                });
            }
            for (author, count) in outsiders {
                out.events.push(Event::NonMemberEntriesRejected {
                    channel: channel_id.clone(),
                    stream: stream_id.clone(),
                    author,
                    count,
                });
            }

            let stream = channel.stream_mut(&stream_id).expect("stream just used");
            let removed = store.compact(&channel_id, &stream_id, &stream.retention, now_ms);
            if removed > 0 {
                out.events.push(Event::StreamCompacted {
                    channel: channel_id.clone(),
                    stream: stream_id.clone(),
                    removed,
                });
            }

            if !stream.version.dominates(&stream_delta.version) {
                behind.push((
                    channel_id.clone(),
                    StreamDigest {
                        stream: stream_id,
                        version: stream.version.clone(),
                    },
                ));
            }
        }
    }

    if !behind.is_empty() {
        let mut digest = Digest::default();
        for (channel, stream) in behind {
            match digest.channels.iter_mut().find(|c| c.channel == channel) {
                Some(c) => c.streams.push(stream),
                None => digest.channels.push(ChannelDigest {
                    channel,
                    streams: vec![stream],
                }),
            }
        }
        out.follow_up = Some(digest);
    }

    out
}
