//! Shared lock state machinery
//!
//! Every backend lock runs the same outer state machine: an acquisition
//! loop drives the state between `Unknown`, `Acquired` and `Error`, and
//! callers wait for a state they care about. `StateCell` holds that state
//! in a `tokio::sync::watch` channel so every transition wakes all
//! waiters and each waiter re-checks its predicate against a consistent
//! snapshot.
//!
//! The loss signal is a replace-on-arm watch channel: a fresh channel is
//! armed for each acquisition, fired at most once, and handles taken
//! while the previous acquisition was live keep observing that firing.

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::LockError;

/// Lock acquisition state as seen by callers.
///
/// `Error` is transient: the loop keeps retrying, so `lock()` waits
/// through it while `try_lock()` reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unknown,
    Acquired,
    Error,
}

/// A consistent snapshot of a lock's observable state.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub state: LockState,
    /// Last error observed while not holding the lock; only meaningful
    /// outside `Acquired`.
    pub last_err: Option<LockError>,
    /// Whether the acquisition loop is currently running.
    pub loop_running: bool,
}

/// Sender side of the loss signal. Fired at most once per armed channel.
pub struct LostSignal {
    tx: watch::Sender<bool>,
}

impl LostSignal {
    pub fn armed() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> LostWatch {
        LostWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Caller handle observing involuntary loss of an acquired lock.
///
/// Obtained from a lock after acquisition; resolves when that
/// acquisition is lost (or the lock is released). A handle bound to a
/// signal that is retired without firing never resolves.
pub struct LostWatch {
    rx: watch::Receiver<bool>,
}

impl LostWatch {
    /// A handle that never fires, for locks with no running loop.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_lost(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the lock this handle was taken from is lost.
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                if *self.rx.borrow() {
                    return;
                }
                // signal retired unfired: this acquisition was never lost
                std::future::pending::<()>().await;
            }
        }
    }
}

/// State holder shared between a lock's public surface and its loop.
pub struct StateCell {
    tx: watch::Sender<StateSnapshot>,
    lost: Mutex<Option<LostSignal>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StateSnapshot {
            state: LockState::Unknown,
            last_err: None,
            loop_running: false,
        });
        Self {
            tx,
            lost: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.tx.borrow().clone()
    }

    pub fn loop_running(&self) -> bool {
        self.tx.borrow().loop_running
    }

    /// Marks the loop started and arms a fresh loss signal.
    pub fn start_loop(&self) {
        *self.lost.lock() = Some(LostSignal::armed());
        self.tx.send_modify(|s| s.loop_running = true);
    }

    /// Transition into `Acquired`, re-arming the loss signal if the
    /// previous one has fired.
    pub fn set_acquired(&self) {
        {
            let mut lost = self.lost.lock();
            if lost.as_ref().map(LostSignal::fired).unwrap_or(true) {
                *lost = Some(LostSignal::armed());
            }
        }
        self.tx.send_modify(|s| {
            s.state = LockState::Acquired;
            s.last_err = None;
        });
    }

    /// Record a (typically transient) error without firing the loss
    /// signal; used while the loop is still between acquisitions.
    pub fn set_error(&self, err: LockError) {
        self.tx.send_modify(|s| {
            s.state = LockState::Error;
            s.last_err = Some(err);
        });
    }

    /// Involuntary loss of an acquired lock: fire the loss signal and
    /// record the cause.
    pub fn lose(&self, cause: LockError) {
        self.fire_lost();
        self.set_error(cause);
    }

    /// Fire the current loss signal without a state change; release
    /// paths use this so dependent tasks stop.
    pub fn fire_lost(&self) {
        if let Some(sig) = &*self.lost.lock() {
            sig.fire();
        }
    }

    /// Loop teardown: back to the initial state.
    pub fn reset(&self) {
        self.tx.send_modify(|s| {
            s.state = LockState::Unknown;
            s.last_err = None;
            s.loop_running = false;
        });
    }

    pub fn lost(&self) -> LostWatch {
        match &*self.lost.lock() {
            Some(sig) => sig.watch(),
            None => LostWatch::never(),
        }
    }

    /// Blocks until the lock is acquired or its loop has stopped.
    /// Transient `Error` states are waited through.
    pub async fn wait_acquired(&self) -> Result<(), LockError> {
        self.wait_for(|s| match s.state {
            LockState::Acquired => Some(Ok(())),
            _ if !s.loop_running => Some(Err(LockError::Cancelled)),
            _ => None,
        })
        .await
    }

    /// Like [`wait_acquired`](Self::wait_acquired) but additionally
    /// returns the last error as soon as the state is `Error`.
    pub async fn wait_acquired_or_err(&self) -> Result<(), LockError> {
        self.wait_for(|s| match s.state {
            LockState::Acquired => Some(Ok(())),
            _ if !s.loop_running => Some(Err(LockError::Cancelled)),
            LockState::Error => Some(Err(s
                .last_err
                .clone()
                .unwrap_or(LockError::SessionUnavailable))),
            _ => None,
        })
        .await
    }

    async fn wait_for<T>(
        &self,
        matcher: impl Fn(&StateSnapshot) -> Option<Result<T, LockError>>,
    ) -> Result<T, LockError> {
        let mut rx = self.tx.subscribe();
        loop {
            let decided = {
                let snap = rx.borrow_and_update();
                matcher(&snap)
            };
            if let Some(result) = decided {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(LockError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_acquired_wakes_on_transition() {
        let cell = Arc::new(StateCell::new());
        cell.start_loop();

        let waiter = cell.clone();
        let handle = tokio::spawn(async move { waiter.wait_acquired().await });

        // transient errors must not wake a plain lock() waiter
        cell.set_error(LockError::LockUnavailable);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        cell.set_acquired();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_acquired_or_err_returns_last_error() {
        let cell = StateCell::new();
        cell.start_loop();
        cell.set_error(LockError::LockUnavailable);

        let result = cell.wait_acquired_or_err().await;
        assert_eq!(result, Err(LockError::LockUnavailable));
    }

    #[tokio::test]
    async fn test_stopped_loop_cancels_waiters() {
        let cell = Arc::new(StateCell::new());
        cell.start_loop();

        let waiter = cell.clone();
        let handle = tokio::spawn(async move { waiter.wait_acquired().await });

        cell.reset();
        assert_eq!(handle.await.unwrap(), Err(LockError::Cancelled));
    }

    #[tokio::test]
    async fn test_lost_fires_exactly_once_per_acquisition() {
        let cell = StateCell::new();
        cell.start_loop();
        cell.set_acquired();

        let early = cell.lost();
        let late = cell.lost();
        assert!(!early.is_lost());

        cell.lose(LockError::LockUnavailable);

        timeout(Duration::from_secs(1), early.wait()).await.unwrap();
        timeout(Duration::from_secs(1), late.wait()).await.unwrap();

        // a new acquisition arms a fresh, unfired signal
        cell.set_acquired();
        let fresh = cell.lost();
        assert!(!fresh.is_lost());
        assert!(
            timeout(Duration::from_millis(50), fresh.wait())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_lost_without_loop_never_fires() {
        let cell = StateCell::new();
        let watch = cell.lost();
        assert!(!watch.is_lost());
        assert!(
            timeout(Duration::from_millis(50), watch.wait())
                .await
                .is_err()
        );
    }
}
