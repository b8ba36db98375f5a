// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Log entries and version vectors, the replication domain model.

use std::{cmp::Ordering, collections::BTreeMap};

use bytes::Bytes;
use thiserror::Error;

use crate::{clock::Hlc, ident::NodeId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Sequences start at 1; zero is reserved for "nothing observed".
    #[error("entry sequence must be at least 1")]
    ZeroSequence,
}

/// One immutable record in a stream's append-only log.
///
/// Identity is `(author, sequence)`; the total order used for reads is
/// `(timestamp, author, sequence)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub author: NodeId,
    pub sequence: u32,
    pub timestamp: Hlc,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(
        author: NodeId,
        sequence: u32,
        timestamp: Hlc,
        payload: Bytes,
    ) -> Result<Self, Error> {
        if sequence == 0 {
            return Err(Error::ZeroSequence);
        }
        Ok(Self {
            author,
            sequence,
            timestamp,
            payload,
        })
    }

    /// The entry's identity within its stream.
    pub fn id(&self) -> (&NodeId, u32) {
        (&self.author, self.sequence)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.author.cmp(&other.author))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Map from author to the highest sequence observed; absence means 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionVector(BTreeMap<NodeId, u32>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &NodeId) -> u32 {
        self.0.get(node).copied().unwrap_or(0)
    }

    pub fn set(&mut self, node: NodeId, sequence: u32) {
        if sequence == 0 {
            self.0.remove(&node);
        } else {
            self.0.insert(node, sequence);
        }
    }

    /// Record that `sequence` from `node` has been seen; keeps the max.
    pub fn observe(&mut self, node: &NodeId, sequence: u32) {
        if sequence > self.get(node) {
            self.0.insert(node.clone(), sequence);
        }
    }

    /// Advance `node` by one, returning the new sequence.
    pub fn increment(&mut self, node: &NodeId) -> u32 {
        let next = self.get(node) + 1;
        self.0.insert(node.clone(), next);
        next
    }

    /// Pointwise max, in place.
    pub fn merge(&mut self, other: &Self) {
        for (node, sequence) in &other.0 {
            self.observe(node, *sequence);
        }
    }

    /// The entries of `other` strictly greater than this vector.
    pub fn diff(&self, other: &Self) -> Self {
        Self(
            other
                .0
                .iter()
                .filter(|(node, sequence)| **sequence > self.get(node))
                .map(|(node, sequence)| (node.clone(), *sequence))
                .collect(),
        )
    }

    /// `true` iff this vector is pointwise ≥ `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        other
            .0
            .iter()
            .all(|(node, sequence)| self.get(node) >= *sequence)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u32)> {
        self.0.iter().map(|(node, sequence)| (node, *sequence))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(NodeId, u32)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (NodeId, u32)>>(iter: I) -> Self {
        let mut vv = Self::new();
        for (node, sequence) in iter {
            vv.observe(&node, sequence);
        }
        vv
    }
}
