//! Single-flight handoff: one leader does the work, any number of followers
//! await its outcome.

use tokio::sync::watch;

use crate::error::EngineError;

pub(crate) type Outcome<T> = Result<T, EngineError>;

/// Follower side. Cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct Flight<T> {
    rx: watch::Receiver<Option<Outcome<T>>>,
}

/// Leader side. Dropping it without landing fails every follower.
#[derive(Debug)]
pub(crate) struct FlightLeader<T> {
    tx: watch::Sender<Option<Outcome<T>>>,
}

pub(crate) fn start<T>() -> (FlightLeader<T>, Flight<T>) {
    let (tx, rx) = watch::channel(None);
    (FlightLeader { tx }, Flight { rx })
}

impl<T> FlightLeader<T> {
    pub(crate) fn land(self, outcome: Outcome<T>) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<T: Clone> Flight<T> {
    /// Wait for the leader's outcome; `abandoned` is returned if the leader
    /// went away without landing.
    pub(crate) async fn wait(mut self, abandoned: impl FnOnce() -> EngineError) -> Outcome<T> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone().unwrap_or_else(|| Err(abandoned()));
            }
        }
    }
}
