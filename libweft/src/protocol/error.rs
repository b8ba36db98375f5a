// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! The errors stream.
//!
//! Everything here is recoverable: the coordinator keeps running and
//! the application decides whether to care. Fatal conditions (disposed
//! reuse, invariant violations) are returned to the caller instead, see
//! [`crate::coordinator::Error`].

use thiserror::Error;

use crate::ident::{ChannelId, NodeId};

#[derive(Clone, Debug, Error)]
pub enum SyncError {
    #[error("peer {peer}: {message}")]
    Peer {
        occurred_at_ms: u64,
        peer: NodeId,
        message: String,
    },

    #[error("channel {channel}: {message}")]
    Channel {
        occurred_at_ms: u64,
        channel: ChannelId,
        message: String,
    },

    #[error("storage: {message}")]
    Storage { occurred_at_ms: u64, message: String },

    #[error("transform: {message}")]
    Transform { occurred_at_ms: u64, message: String },

    #[error("inbound buffer overflow, {dropped} frame(s) dropped")]
    BufferOverflow { occurred_at_ms: u64, dropped: usize },
}

impl SyncError {
    /// Short stable tag for logs and dashboards.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Peer { .. } => "peer",
            Self::Channel { .. } => "channel",
            Self::Storage { .. } => "storage",
            Self::Transform { .. } => "transform",
            Self::BufferOverflow { .. } => "buffer-overflow",
        }
    }

    pub fn occurred_at_ms(&self) -> u64 {
        match self {
            Self::Peer { occurred_at_ms, .. }
            | Self::Channel { occurred_at_ms, .. }
            | Self::Storage { occurred_at_ms, .. }
            | Self::Transform { occurred_at_ms, .. }
            | Self::BufferOverflow { occurred_at_ms, .. } => *occurred_at_ms,
        }
    }
}
