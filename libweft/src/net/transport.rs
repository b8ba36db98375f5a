// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! The message transport port.
//!
//! Concrete transports (BLE bridges, Nearby Connections, sockets, test
//! hubs) live outside the engine and plug in here. The contract:
//! message boundaries are preserved (one `send` is at most one
//! [`Inbound`] on the peer), delivery is best-effort, and frames up to
//! at least 32 KiB must pass.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::ident::NodeId;

/// Send priority; probes and refutations go out `High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

/// One frame delivered by the transport.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub peer: NodeId,
    pub frame: Bytes,
    pub received_at_ms: u64,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Best-effort send. Must not error toward the caller: a frame to
    /// an unreachable peer simply disappears, and the failure detector
    /// notices.
    async fn send(&self, to: &NodeId, frame: Bytes, priority: Priority);

    /// The inbound frame feed. The coordinator is the sole subscriber
    /// and calls this exactly once.
    fn incoming(&self) -> BoxStream<'static, Inbound>;

    /// Frames queued for `peer` but not yet on the wire. Transports
    /// that cannot tell report 0 (no backpressure).
    fn pending_send_count(&self, peer: &NodeId) -> u32 {
        let _ = peer;
        0
    }

    /// Total queued frames across all peers.
    fn total_pending_send_count(&self) -> u32 {
        0
    }

    async fn close(&self) {}
}
