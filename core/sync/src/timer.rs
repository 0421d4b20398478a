//! Single outstanding delayed flush per owner.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
    due_in: Option<Duration>,
}

/// Debounce/backoff timer that keeps at most one pending callback.
///
/// Scheduling again replaces the pending callback. Once a callback starts
/// running it is detached from the slot, so rescheduling from inside the
/// callback never cancels the callback itself.
pub struct FlushTimer {
    slot: Arc<Mutex<TimerSlot>>,
    stopped: AtomicBool,
}

impl FlushTimer {
    /// Create an idle timer.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(TimerSlot::default())),
            stopped: AtomicBool::new(false),
        }
    }

    fn lock(slot: &Mutex<TimerSlot>) -> MutexGuard<'_, TimerSlot> {
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `task` after `delay`, replacing any pending callback.
    ///
    /// Does nothing once the timer has been stopped.
    pub fn schedule<F, Fut>(&self, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut slot = Self::lock(&self.slot);
        slot.generation += 1;
        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut slot = Self::lock(&shared);
                if slot.generation != generation {
                    return;
                }
                slot.handle = None;
                slot.due_in = None;
            }
            task().await;
        });

        if let Some(previous) = slot.handle.replace(handle) {
            previous.abort();
        }
        slot.due_in = Some(delay);
        debug!("Flush scheduled in {:?}", delay);
    }

    /// Cancel the pending callback, if any.
    pub fn cancel(&self) {
        let mut slot = Self::lock(&self.slot);
        slot.generation += 1;
        slot.due_in = None;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }

    /// Cancel the pending callback and refuse further scheduling.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel();
    }

    /// Whether a callback is waiting to fire.
    pub fn is_pending(&self) -> bool {
        Self::lock(&self.slot).handle.is_some()
    }

    /// Delay the pending callback was scheduled with.
    pub fn pending_delay(&self) -> Option<Duration> {
        Self::lock(&self.slot).due_in
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for FlushTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_task(count: &Arc<AtomicU32>) -> impl FnOnce() -> futures::future::Ready<()> {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = FlushTimer::new();
        let count = Arc::new(AtomicU32::new(0));

        timer.schedule(Duration::from_millis(500), counter_task(&count));
        assert!(timer.is_pending());
        assert_eq!(timer.pending_delay(), Some(Duration::from_millis(500)));

        sleep(Duration::from_millis(499)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_debounces() {
        let timer = FlushTimer::new();
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            timer.schedule(Duration::from_millis(500), counter_task(&count));
            sleep(Duration::from_millis(100)).await;
        }
        sleep(Duration::from_secs(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_blocks() {
        let timer = FlushTimer::new();
        let count = Arc::new(AtomicU32::new(0));

        timer.schedule(Duration::from_millis(100), counter_task(&count));
        timer.stop();
        timer.schedule(Duration::from_millis(100), counter_task(&count));
        sleep(Duration::from_secs(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_stopped());
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let count = Arc::new(AtomicU32::new(0));
        {
            let timer = FlushTimer::new();
            timer.schedule(Duration::from_millis(100), counter_task(&count));
        }
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
