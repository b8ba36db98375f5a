// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt as _, Stream};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("timeout elapsed")]
pub struct Elapsed;

/// Wait until `duration` has elapsed.
///
/// # Cancellation
///
/// A sleep is cancelled by dropping its future.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Require a [`Future`] to complete within `after`.
///
/// The inner future is dropped when the deadline is reached; it is the
/// caller's responsibility to ensure it is cancellation-safe.
pub async fn timeout<F, T>(after: Duration, fut: F) -> Result<T, Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(after, fut).await.map_err(|_| Elapsed)
}

/// The [`Stream`] created by [`interval`].
pub struct Interval {
    snooze: Pin<Box<tokio::time::Sleep>>,
    period: Duration,
    jitter: Duration,
}

/// Create a [`Stream`] which yields roughly every `period`.
///
/// After each tick the next period is perturbed by a duration in
/// `[-jitter, +jitter]`, so that fleets of nodes started together do not
/// beat in lockstep. Jitter granularity is one millisecond, since periods
/// in this crate's callers go down to 100 ms.
///
/// # Cancellation
///
/// An interval is cancelled by dropping it.
pub fn interval(period: Duration, jitter: Duration) -> Interval {
    Interval {
        snooze: Box::pin(tokio::time::sleep(period)),
        period,
        jitter,
    }
}

impl Stream for Interval {
    type Item = ();

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        use rand::Rng as _;

        self.snooze.poll_unpin(cx).map(|()| {
            let jitter_ms = self.jitter.as_millis() as u64;
            let delay = if jitter_ms == 0 {
                self.period
            } else {
                let mut rng = rand::thread_rng();
                let jitter = Duration::from_millis(rng.gen_range(0..=jitter_ms));
                if rng.gen() {
                    self.period.saturating_add(jitter)
                } else {
                    self.period.saturating_sub(jitter)
                }
            };
            let deadline = tokio::time::Instant::now() + delay;
            self.snooze.as_mut().reset(deadline);

            Some(())
        })
    }
}
