// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Domain events observable by the application.

use crate::{
    ident::{ChannelId, NodeId, StreamId},
    log::Entry,
    peer::{Status, Transition},
    protocol::error::SyncError,
};

#[derive(Clone, Debug)]
pub enum Event {
    PeerAdded(NodeId),
    PeerRemoved(NodeId),
    PeerStatusChanged {
        peer: NodeId,
        old: Status,
        new: Status,
    },
    ChannelCreated(ChannelId),
    ChannelRemoved(ChannelId),
    MemberAdded {
        channel: ChannelId,
        member: NodeId,
    },
    MemberRemoved {
        channel: ChannelId,
        member: NodeId,
    },
    StreamCreated {
        channel: ChannelId,
        stream: StreamId,
    },
    EntryAppended {
        channel: ChannelId,
        stream: StreamId,
        entry: Entry,
    },
    EntriesMerged {
        channel: ChannelId,
        stream: StreamId,
        entries: Vec<Entry>,
    },
    StreamCompacted {
        channel: ChannelId,
        stream: StreamId,
        removed: usize,
    },
    BufferOverflowOccurred {
        dropped: usize,
    },
    /// Entries from an author outside the channel's member set were
    /// merged anyway (membership is advisory) and flagged here.
    NonMemberEntriesRejected {
        channel: ChannelId,
        stream: StreamId,
        author: NodeId,
        count: usize,
    },
    SyncErrorOccurred(SyncError),
}

impl From<Transition> for Event {
    fn from(t: Transition) -> Self {
        Self::PeerStatusChanged {
            peer: t.peer,
            old: t.old,
            new: t.new,
        }
    }
}
