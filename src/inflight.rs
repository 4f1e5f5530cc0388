//! Tracking of the objects currently being sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A multiset of SOP instance UIDs currently being sent.
///
/// The same UID can be in flight more than once, e.g. for the frames of a multi-frame
/// object. While anything is in flight, the association must not be closed.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    counts: Mutex<HashMap<String, usize>>,
    cleared: Notify,
}

/// Outcome of [InFlightTracker::wait_until_idle] when it was not cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Nothing is in flight.
    Idle,
    /// Gave up waiting: transfers are still in flight.
    GaveUp,
}

/// The wait for pending transfers was cancelled.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Cancelled while waiting for pending transfers")]
pub struct WaitCancelled;

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_in_flight(&self, sop_instance_uid: &str) {
        *self
            .lock()
            .entry(sop_instance_uid.to_string())
            .or_insert(0) += 1;
    }

    /// Decrement the count of `sop_instance_uid`. Unknown UIDs are ignored.
    pub fn clear_in_flight(&self, sop_instance_uid: &str) {
        {
            let mut counts = self.lock();
            match counts.get_mut(sop_instance_uid) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(sop_instance_uid);
                }
                None => return,
            }
        }
        self.cleared.notify_waiters();
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    /// How many times `sop_instance_uid` is currently in flight.
    pub fn count(&self, sop_instance_uid: &str) -> usize {
        self.lock().get(sop_instance_uid).copied().unwrap_or(0)
    }

    /// Mark `sop_instance_uid` in flight until the returned guard is released or dropped.
    pub fn guard(self: &Arc<Self>, sop_instance_uid: &str) -> InFlightGuard {
        self.mark_in_flight(sop_instance_uid);
        InFlightGuard {
            tracker: Arc::clone(self),
            sop_instance_uid: Some(sop_instance_uid.to_string()),
        }
    }

    /// Wait for everything in flight to be cleared.
    ///
    /// Checks at most `max_loops` times, sleeping up to `interval` between checks and
    /// waking up early whenever a transfer is cleared. Gives up (returning
    /// [Drained::GaveUp]) rather than waiting forever.
    pub async fn wait_until_idle(
        &self,
        interval: Duration,
        max_loops: u32,
        cancel: &CancellationToken,
    ) -> Result<Drained, WaitCancelled> {
        for _ in 0..max_loops {
            let cleared = self.cleared.notified();
            tokio::pin!(cleared);
            cleared.as_mut().enable();
            if !self.has_pending() {
                return Ok(Drained::Idle);
            }
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitCancelled),
                _ = &mut cleared => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if self.has_pending() {
            Ok(Drained::GaveUp)
        } else {
            Ok(Drained::Idle)
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // counts are always left consistent, so a poisoned lock is still usable
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a SOP instance UID in flight. Clears it exactly once.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    sop_instance_uid: Option<String>,
}

impl InFlightGuard {
    /// Clear the in-flight mark now. Subsequent calls do nothing.
    pub fn release(&mut self) {
        if let Some(uid) = self.sop_instance_uid.take() {
            self.tracker.clear_in_flight(&uid);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release()
    }
}
