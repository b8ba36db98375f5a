// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Fanout of events and errors to application subscribers.
//!
//! Broadcast channels, lossy by design: a subscriber that stops polling
//! observes `Lagged` and misses events rather than stalling the engine.

use tokio::sync::broadcast;

use super::{error::SyncError, event::Event};

const CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Phone {
    events: broadcast::Sender<Event>,
    errors: broadcast::Sender<SyncError>,
}

impl Phone {
    pub fn new() -> Self {
        Self {
            events: broadcast::channel(CAPACITY).0,
            errors: broadcast::channel(CAPACITY).0,
        }
    }

    /// Emit a domain event. No subscribers is fine.
    pub fn emit(&self, event: impl Into<Event>) {
        self.events.send(event.into()).ok();
    }

    /// Emit on the errors stream, mirrored onto the events stream as
    /// `SyncErrorOccurred`.
    pub fn emit_error(&self, error: SyncError) {
        tracing::debug!(kind = error.kind(), err = %error, "sync error");
        self.errors.send(error.clone()).ok();
        self.events.send(Event::SyncErrorOccurred(error)).ok();
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<SyncError> {
        self.errors.subscribe()
    }
}

impl Default for Phone {
    fn default() -> Self {
        Self::new()
    }
}
