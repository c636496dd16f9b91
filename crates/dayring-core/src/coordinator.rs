//! Generation-counted recompute coordinator.
//!
//! Every request bumps a monotonically increasing generation counter and runs
//! its computation without holding any lock. When the computation finishes,
//! its result is published only if no newer request has started in the
//! meantime. Superseded results are dropped, never merged, so a slow stale
//! computation can never overwrite a fresher one that finished first.
//!
//! Failed computations publish nothing and leave the last-known-good value
//! in place.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::debug;

use crate::error::EngineError;

/// A value together with the generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Published<T> {
    pub generation: u64,
    pub value: T,
}

/// Outcome of a single recompute request.
#[derive(Debug, Clone, PartialEq)]
pub enum Recomputed<T> {
    /// The result became the published value.
    Published(T),
    /// A newer request started while this one was in flight.
    Discarded { generation: u64, latest: u64 },
}

impl<T> Recomputed<T> {
    pub fn is_published(&self) -> bool {
        matches!(self, Recomputed::Published(_))
    }

    /// The published value, or `RaceDiscarded` for a superseded run.
    pub fn into_result(self) -> Result<T, EngineError> {
        match self {
            Recomputed::Published(value) => Ok(value),
            Recomputed::Discarded { generation, latest } => {
                Err(EngineError::RaceDiscarded { generation, latest })
            }
        }
    }
}

pub struct RecomputeCoordinator<T> {
    generation: AtomicU64,
    published: watch::Sender<Option<Published<T>>>,
}

impl<T: Clone + Send + Sync + 'static> RecomputeCoordinator<T> {
    pub fn new() -> Self {
        let (published, _) = watch::channel(None);
        Self {
            generation: AtomicU64::new(0),
            published,
        }
    }

    /// Run `compute` as the newest generation and publish its result if it
    /// is still the newest when it finishes.
    ///
    /// # Errors
    ///
    /// Returns the computation's own error; nothing is published in that case.
    pub async fn request_recompute<F, Fut, E>(&self, compute: F) -> Result<Recomputed<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let local = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let value = compute().await?;
        Ok(self.publish(local, value))
    }

    fn publish(&self, local: u64, value: T) -> Recomputed<T> {
        let mut latest_seen = local;

        // The check runs under the channel's write lock, so two finishing
        // generations can't interleave between compare and store.
        let published = self.published.send_if_modified(|slot| {
            let latest = self.generation.load(Ordering::Acquire);
            latest_seen = latest;
            if latest != local || slot.as_ref().is_some_and(|p| p.generation >= local) {
                return false;
            }
            *slot = Some(Published {
                generation: local,
                value: value.clone(),
            });
            true
        });

        if published {
            debug!(generation = local, "published recompute result");
            Recomputed::Published(value)
        } else {
            debug!(
                generation = local,
                latest = latest_seen,
                "discarding superseded recompute result"
            );
            Recomputed::Discarded {
                generation: local,
                latest: latest_seen,
            }
        }
    }

    /// Last published value, without waiting for anything in flight.
    pub fn latest(&self) -> Option<T> {
        self.published.borrow().as_ref().map(|p| p.value.clone())
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Option<Published<T>> {
        self.published.borrow().clone()
    }

    /// Receiver that observes every published generation.
    pub fn subscribe(&self) -> watch::Receiver<Option<Published<T>>> {
        self.published.subscribe()
    }

    /// Newest generation requested so far (not necessarily published).
    #[cfg(test)]
    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RecomputeCoordinator<T> {
    fn default() -> Self {
        Self::new()
    }
}
