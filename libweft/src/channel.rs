// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Channel aggregates: membership plus named streams.
//!
//! Membership is advisory: it steers gossip peer selection and flags
//! entries from outsiders, but it is not enforced at the wire.

use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use crate::{
    ident::{ChannelId, NodeId, StreamId},
    log::{Entry, VersionVector},
};

/// What a stream keeps around after append/merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Never drop anything.
    KeepAll,
    /// Drop entries whose physical timestamp is older than the duration.
    MaxAge(Duration),
    /// Drop oldest (by read order) until at most this many remain.
    MaxEntries(usize),
}

/// Derived state produced by a [`Materializer`]; downcast by the caller.
pub type State = Arc<dyn Any + Send + Sync>;

/// Fold function producing derived application state from entries.
///
/// Must be deterministic and total. Never persisted: re-register after
/// reload.
pub type Materializer = Arc<
    dyn Fn(Option<State>, &Entry) -> Result<State, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// A named, ordered log of entries within a channel; the unit of
/// synchronization.
#[derive(Clone)]
pub struct Stream {
    id: StreamId,
    pub retention: Retention,
    pub version: VersionVector,
    materializer: Option<Materializer>,
}

impl Stream {
    pub fn new(id: StreamId, retention: Retention) -> Self {
        Self {
            id,
            retention,
            version: VersionVector::new(),
            materializer: None,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn set_materializer(&mut self, materializer: Materializer) {
        self.materializer = Some(materializer);
    }

    /// Fold the materializer over `entries` (already in read order).
    ///
    /// `Ok(None)` when no materializer is registered.
    pub fn materialize<'a, I>(
        &self,
        entries: I,
    ) -> Result<Option<State>, Box<dyn std::error::Error + Send + Sync>>
    where
        I: IntoIterator<Item = &'a Entry>,
    {
        let fold = match &self.materializer {
            None => return Ok(None),
            Some(fold) => fold,
        };

        let mut state = None;
        for entry in entries {
            state = Some(fold(state, entry)?);
        }
        Ok(state)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("retention", &self.retention)
            .field("version", &self.version)
            .field("materializer", &self.materializer.is_some())
            .finish()
    }
}

/// A channel: advisory membership set plus its streams.
#[derive(Clone, Debug)]
pub struct Channel {
    id: ChannelId,
    pub members: BTreeSet<NodeId>,
    pub streams: BTreeMap<StreamId, Stream>,
}

impl Channel {
    /// A fresh channel always contains the local node as a member.
    pub fn new(id: ChannelId, local: NodeId) -> Self {
        Self {
            id,
            members: BTreeSet::from([local]),
            streams: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// Returns `false` when the member was already present.
    pub fn add_member(&mut self, node: NodeId) -> bool {
        self.members.insert(node)
    }

    pub fn remove_member(&mut self, node: &NodeId) -> bool {
        self.members.remove(node)
    }

    pub fn stream(&self, id: &StreamId) -> Option<&Stream> {
        self.streams.get(id)
    }

    pub fn stream_mut(&mut self, id: &StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(id)
    }

    /// Create a stream if absent; returns `false` when it already
    /// existed (idempotent, retention unchanged).
    pub fn create_stream(&mut self, id: StreamId, retention: Retention) -> bool {
        use std::collections::btree_map::Entry::*;

        match self.streams.entry(id.clone()) {
            Occupied(_) => false,
            Vacant(slot) => {
                slot.insert(Stream::new(id, retention));
                true
            },
        }
    }
}
