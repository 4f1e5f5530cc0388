//! Status and sub-operation counters of a forwarding session.

use crate::association::StoreResponse;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Category of a DIMSE response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Warning,
    Pending,
    Cancel,
    Failure,
}

impl From<u16> for StatusKind {
    fn from(status: u16) -> Self {
        match status {
            0x0000 => StatusKind::Success,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusKind::Warning,
            0xFF00 | 0xFF01 => StatusKind::Pending,
            0xFE00 => StatusKind::Cancel,
            _ => StatusKind::Failure,
        }
    }
}

/// A snapshot of the progress, as sent to listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Last DIMSE status received, `None` before the first response.
    pub status: Option<u16>,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
    pub remaining: u32,
    pub last_sop_instance_uid: Option<String>,
    pub last_sop_class_uid: Option<String>,
}

/// Receives responses and keeps count of sub-operations.
///
/// Listeners subscribe to snapshots with [ProgressState::subscribe].
/// Setting the cancelled flag asks in-flight work to stop early.
#[derive(Debug)]
pub struct ProgressState {
    current: Mutex<Progress>,
    sender: watch::Sender<Progress>,
    cancelled: CancellationToken,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Progress::default());
        Self {
            current: Mutex::new(Progress::default()),
            sender,
            cancelled: CancellationToken::new(),
        }
    }

    /// Announce that `n` more sub-operations are expected.
    pub fn add_remaining(&self, n: u32) {
        self.update(|p| p.remaining = p.remaining.saturating_add(n));
    }

    /// Record one response.
    ///
    /// Pending responses only update the status. Final responses count as completed,
    /// warning or failed, and decrement the remaining count (never below zero).
    pub fn on_response(&self, response: &StoreResponse) {
        self.update(|p| {
            p.status = Some(response.status);
            p.last_sop_instance_uid = Some(response.affected_sop_instance_uid.clone());
            p.last_sop_class_uid = Some(response.affected_sop_class_uid.clone());
            match StatusKind::from(response.status) {
                StatusKind::Pending => return,
                StatusKind::Success => p.completed += 1,
                StatusKind::Warning => p.warning += 1,
                StatusKind::Cancel | StatusKind::Failure => p.failed += 1,
            }
            p.remaining = p.remaining.saturating_sub(1);
        });
    }

    /// Record a C-STORE which failed without a response from the peer.
    pub fn on_failure(&self) {
        self.update(|p| {
            p.failed += 1;
            p.remaining = p.remaining.saturating_sub(1);
        });
    }

    pub fn snapshot(&self) -> Progress {
        self.lock().clone()
    }

    pub fn status(&self) -> Option<u16> {
        self.lock().status
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.sender.subscribe()
    }

    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Completes once [ProgressState::cancel] has been called.
    pub async fn cancelled(&self) {
        self.cancelled.cancelled().await
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let snapshot = {
            let mut current = self.lock();
            f(&mut current);
            current.clone()
        };
        self.sender.send_replace(snapshot);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
