// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

use std::{
    future::Future,
    panic,
    pin::Pin,
    task::{Context, Poll},
};

use futures::FutureExt as _;
use thiserror::Error;
use tracing::Instrument as _;

#[derive(Debug, Error)]
#[error("task cancelled")]
pub struct Cancelled;

/// Wrapper around an async runtime handle.
///
/// Tasks spawned through a [`Spawner`] run in the [`tracing::Span`] active
/// at the call site.
#[derive(Clone)]
pub struct Spawner {
    handle: tokio::runtime::Handle,
}

impl Spawner {
    /// Obtain a [`Spawner`] from the ambient async context.
    ///
    /// Returns `None` when called outside a runtime.
    pub fn from_current() -> Option<Self> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| Self { handle })
    }

    /// Spawn `fut` onto the runtime, returning a handle to it.
    ///
    /// Dropping the returned [`Task`] cancels the future at the next yield
    /// point, unless [`Task::detach`] was called.
    pub fn spawn<F>(&self, fut: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Task {
            join: self.handle.spawn(fut.in_current_span()),
            detached: false,
        }
    }
}

/// Handle to a spawned task.
///
/// The task is cancelled when the handle is dropped. `.await`ing the handle
/// yields the task's output, or [`Cancelled`] if it was cancelled before
/// completing.
#[derive(Debug)]
pub struct Task<T> {
    join: tokio::task::JoinHandle<T>,
    detached: bool,
}

impl<T> Task<T> {
    /// Let the task continue running in the background.
    ///
    /// The output can no longer be retrieved.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// Cancel the task at its next yield point.
    pub fn cancel(self) {
        self.join.abort();
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join.abort();
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.join.poll_unpin(cx).map(|res| match res {
            Ok(t) => Ok(t),
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(_) => Err(Cancelled),
        })
    }
}
