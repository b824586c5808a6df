//! Single-slot delayed callback used for reconnects.
//!
//! At most one callback is pending at a time: arming again aborts the one
//! already waiting. Once closed the timer never fires again.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Default)]
struct Slot {
    pending: Option<JoinHandle<()>>,
    closed: bool,
}

#[derive(Default)]
pub struct ReconnectTimer {
    slot: Mutex<Slot>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `on_fire` after `delay`, replacing any pending callback.
    /// Returns `false` if the timer is closed.
    pub fn arm<F>(&self, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.slot();
        if slot.closed {
            return false;
        }
        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }
        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
        true
    }

    /// Drop the pending callback, if any. Returns whether one was waiting.
    pub fn cancel(&self) -> bool {
        match self.slot().pending.take() {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }

    /// Cancel and refuse every later `arm`.
    pub fn close(&self) {
        let mut slot = self.slot();
        slot.closed = true;
        if let Some(handle) = slot.pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot()
            .pending
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let make = move || {
            let f = Arc::clone(&f);
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending() {
        let timer = ReconnectTimer::new();
        let (fired, make) = counter();

        assert!(timer.arm(Duration::from_secs(10), make()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(timer.arm(Duration::from_secs(10), make()));
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let timer = ReconnectTimer::new();
        let (fired, make) = counter();

        timer.arm(Duration::from_secs(10), make());
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_timer_never_fires() {
        let timer = ReconnectTimer::new();
        let (fired, make) = counter();

        timer.arm(Duration::from_secs(10), make());
        timer.close();
        assert!(!timer.arm(Duration::from_secs(1), make()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_pending());
    }
}
