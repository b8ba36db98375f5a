// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Persistence ports.
//!
//! All repositories are optional; a coordinator without them runs fully
//! in memory. When present they act as a write-through mirror: the
//! in-memory state stays authoritative and storage failures surface on
//! the errors stream rather than failing the operation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    channel::Channel,
    ident::{ChannelId, NodeId, StreamId},
    log::Entry,
    peer::Peer,
};

/// Opaque storage failure, as produced by a backend.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<dyn std::error::Error + Send + Sync + 'static>);

impl Error {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self(source.into())
    }
}

/// Durable local identity: node id and incarnation.
#[async_trait]
pub trait LocalIdentityStorage: Send + Sync {
    /// Return the persisted node id, generating and persisting one on
    /// first call. Must be stable across restarts.
    async fn resolve_node_id(&self) -> Result<NodeId, Error>;

    async fn save_incarnation(&self, incarnation: u64) -> Result<(), Error>;

    async fn load_incarnation(&self) -> Result<u64, Error>;
}

/// Channel metadata mirror.
///
/// Materializers are runtime-only closures and are never serialized;
/// a loaded [`Channel`] comes back without them.
#[async_trait]
pub trait ChannelStorage: Send + Sync {
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<Channel>, Error>;

    async fn save(&self, channel: &Channel) -> Result<(), Error>;

    async fn delete(&self, id: &ChannelId) -> Result<(), Error>;
}

/// Peer mirror (incarnation and display name are worth surviving a
/// restart; live status is not and may be reset on load).
#[async_trait]
pub trait PeerStorage: Send + Sync {
    async fn find_by_id(&self, id: &NodeId) -> Result<Option<Peer>, Error>;

    async fn save(&self, peer: &Peer) -> Result<(), Error>;

    async fn delete(&self, id: &NodeId) -> Result<(), Error>;
}

/// Entry log mirror.
#[async_trait]
pub trait EntryStorage: Send + Sync {
    async fn append(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        entry: &Entry,
    ) -> Result<(), Error>;

    async fn get_all(&self, channel: &ChannelId, stream: &StreamId)
        -> Result<Vec<Entry>, Error>;

    async fn latest_sequence(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        author: &NodeId,
    ) -> Result<u32, Error>;

    async fn clear_channel(&self, channel: &ChannelId) -> Result<(), Error>;
}

/// The bundle of optional repositories handed to a coordinator.
#[derive(Clone, Default)]
pub struct Storage {
    pub local: Option<Arc<dyn LocalIdentityStorage>>,
    pub channels: Option<Arc<dyn ChannelStorage>>,
    pub peers: Option<Arc<dyn PeerStorage>>,
    pub entries: Option<Arc<dyn EntryStorage>>,
}

impl Storage {
    /// No persistence at all; everything lives in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }
}
