// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! In-memory append-only entry store.
//!
//! Logs are keyed by `(channel, stream, author)` and kept sorted by
//! sequence. Sequences per author are strictly increasing from 1; gaps
//! may exist while a sync is in flight and close as deltas arrive.

use std::collections::BTreeMap;

use crate::{
    channel::Retention,
    ident::{ChannelId, NodeId, StreamId},
    log::{self, Entry},
};

/// Result of applying one entry to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry was new and is now stored.
    Appended,
    /// An identical entry was already stored; no-op.
    Duplicate,
    /// An entry with the same `(author, sequence)` but different payload
    /// or timestamp exists. First write wins; the caller reports this as
    /// an integrity error.
    Conflicting,
}

#[derive(Clone, Debug, Default)]
struct Log {
    by_author: BTreeMap<NodeId, Vec<Entry>>,
}

/// All logs of one coordinator.
#[derive(Clone, Debug, Default)]
pub struct EntryStore {
    logs: BTreeMap<(ChannelId, StreamId), Log>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        entry: Entry,
    ) -> Result<PutOutcome, log::Error> {
        if entry.sequence == 0 {
            return Err(log::Error::ZeroSequence);
        }

        let log = self
            .logs
            .entry((channel.clone(), stream.clone()))
            .or_default();
        let entries = log.by_author.entry(entry.author.clone()).or_default();

        match entries.binary_search_by_key(&entry.sequence, |e| e.sequence) {
            Ok(at) => {
                let stored = &entries[at];
                if stored.payload == entry.payload && stored.timestamp == entry.timestamp {
                    Ok(PutOutcome::Duplicate)
                } else {
                    Ok(PutOutcome::Conflicting)
                }
            },
            Err(at) => {
                entries.insert(at, entry);
                Ok(PutOutcome::Appended)
            },
        }
    }

    /// All entries of a stream in read order `(timestamp, author,
    /// sequence)`.
    pub fn entries(&self, channel: &ChannelId, stream: &StreamId) -> Vec<Entry> {
        let mut out = match self.logs.get(&(channel.clone(), stream.clone())) {
            None => return Vec::new(),
            Some(log) => log
                .by_author
                .values()
                .flatten()
                .cloned()
                .collect::<Vec<_>>(),
        };
        out.sort();
        out
    }

    /// Entries by `author` with sequence ≥ `from`, in sequence order.
    pub fn entries_from(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        author: &NodeId,
        from: u32,
    ) -> Vec<Entry> {
        self.logs
            .get(&(channel.clone(), stream.clone()))
            .and_then(|log| log.by_author.get(author))
            .map(|entries| {
                let at = entries.partition_point(|e| e.sequence < from);
                entries[at..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn latest_sequence(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        author: &NodeId,
    ) -> u32 {
        self.logs
            .get(&(channel.clone(), stream.clone()))
            .and_then(|log| log.by_author.get(author))
            .and_then(|entries| entries.last())
            .map(|e| e.sequence)
            .unwrap_or(0)
    }

    /// Drop all logs of a channel, returning how many entries went.
    pub fn clear_channel(&mut self, channel: &ChannelId) -> usize {
        let mut removed = 0;
        self.logs.retain(|(ch, _), log| {
            if ch == channel {
                removed += log.by_author.values().map(Vec::len).sum::<usize>();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Apply a retention policy in place, returning the removed count.
    pub fn compact(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        retention: &Retention,
        now_ms: u64,
    ) -> usize {
        let log = match self.logs.get_mut(&(channel.clone(), stream.clone())) {
            None => return 0,
            Some(log) => log,
        };

        match retention {
            Retention::KeepAll => 0,

            Retention::MaxAge(age) => {
                let cutoff = now_ms.saturating_sub(age.as_millis() as u64);
                let mut removed = 0;
                for entries in log.by_author.values_mut() {
                    let before = entries.len();
                    entries.retain(|e| e.timestamp.physical_ms() >= cutoff);
                    removed += before - entries.len();
                }
                log.by_author.retain(|_, entries| !entries.is_empty());
                removed
            },

            Retention::MaxEntries(max) => {
                let total: usize = log.by_author.values().map(Vec::len).sum();
                if total <= *max {
                    return 0;
                }

                // Oldest in read order go first.
                let mut ids = log
                    .by_author
                    .values()
                    .flatten()
                    .map(|e| (e.timestamp, e.author.clone(), e.sequence))
                    .collect::<Vec<_>>();
                ids.sort();
                let excess = total - max;

                for (_, author, sequence) in &ids[..excess] {
                    if let Some(entries) = log.by_author.get_mut(author) {
                        entries.retain(|e| e.sequence != *sequence);
                    }
                }
                log.by_author.retain(|_, entries| !entries.is_empty());
                excess
            },
        }
    }

    /// Entry and payload-byte totals, for resource accounting.
    pub fn usage(&self) -> (usize, u64) {
        let mut entries = 0;
        let mut bytes = 0u64;
        for log in self.logs.values() {
            for per_author in log.by_author.values() {
                entries += per_author.len();
                bytes += per_author.iter().map(|e| e.payload.len() as u64).sum::<u64>();
            }
        }
        (entries, bytes)
    }
}
