use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single deferred action which can be re-armed and called off.
///
/// [IdleCloseScheduler::arm] raises the countdown flag and schedules the action.
/// Arming again replaces the previous timer instead of stacking another one.
/// The flag is checked when the timer fires, so [IdleCloseScheduler::reset]
/// called in the meantime prevents the action from running.
#[derive(Debug, Default)]
pub struct IdleCloseScheduler {
    countdown: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl IdleCloseScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay` unless [IdleCloseScheduler::reset] or
    /// [IdleCloseScheduler::cancel] is called first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.countdown.store(true, Ordering::SeqCst);
        let countdown = Arc::clone(&self.countdown);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if countdown.swap(false, Ordering::SeqCst) {
                // detached so that re-arming does not abort the action half-way
                tokio::spawn(action);
            }
        });
        if let Some(previous) = self.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Lower the countdown flag: the armed action, if any, will not run.
    pub fn reset(&self) {
        self.countdown.store(false, Ordering::SeqCst);
    }

    /// Lower the countdown flag and stop the timer.
    pub fn cancel(&self) {
        self.reset();
        if let Some(timer) = self.lock().take() {
            timer.abort();
        }
    }

    pub fn is_counting_down(&self) -> bool {
        self.countdown.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for IdleCloseScheduler {
    fn drop(&mut self) {
        self.cancel()
    }
}
