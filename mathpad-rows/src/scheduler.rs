//! Debounce scheduler
//!
//! One timer per `(row, purpose)`. Scheduling again replaces the pending
//! timer, so only the last trigger in a burst fires. Timers run on tokio
//! time, which tests pause and advance.

use crate::models::RowId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a timer triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Ocr,
    Validation,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Ocr => "ocr",
            Purpose::Validation => "validation",
        }
    }
}

struct Timer {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct Timers {
    pending: HashMap<(RowId, Purpose), Timer>,
    next_generation: u64,
}

/// Keyed debounce timers
#[derive(Clone, Default)]
pub struct Scheduler {
    timers: Arc<Mutex<Timers>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `action` after `delay` unless rescheduled or cancelled first
    pub fn schedule<F, Fut>(&self, row_id: RowId, purpose: Purpose, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = (row_id, purpose);
        let token = CancellationToken::new();
        let generation = {
            let mut timers = self.timers();
            timers.next_generation += 1;
            let generation = timers.next_generation;
            if let Some(previous) = timers.pending.insert(
                key,
                Timer {
                    token: token.clone(),
                    generation,
                },
            ) {
                previous.token.cancel();
            }
            generation
        };

        debug!(
            row_id = %row_id,
            purpose = purpose.as_str(),
            delay_ms = delay.as_millis() as u64,
            "Debounce timer armed"
        );

        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
                // Replaced between wake-up and lock
                if timers.pending.get(&key).map(|t| t.generation) != Some(generation) {
                    return;
                }
                timers.pending.remove(&key);
            }

            debug!(row_id = %row_id, purpose = purpose.as_str(), "Debounce timer fired");
            action().await;
        });
    }

    /// Drop a pending timer; returns whether one was pending
    pub fn cancel(&self, row_id: RowId, purpose: Purpose) -> bool {
        match self.timers().pending.remove(&(row_id, purpose)) {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop every pending timer of a row
    pub fn cancel_row(&self, row_id: RowId) {
        self.cancel(row_id, Purpose::Ocr);
        self.cancel(row_id, Purpose::Validation);
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers();
        for (_, timer) in timers.pending.drain() {
            timer.token.cancel();
        }
    }

    pub fn is_pending(&self, row_id: RowId, purpose: Purpose) -> bool {
        self.timers().pending.contains_key(&(row_id, purpose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn counter_action(
        counter: &Arc<AtomicU32>,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler.schedule(RowId(0), Purpose::Ocr, ms(500), counter_action(&fired));
        assert!(scheduler.is_pending(RowId(0), Purpose::Ocr));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending(RowId(0), Purpose::Ocr));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_restarts_the_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            scheduler.schedule(RowId(1), Purpose::Validation, ms(500), counter_action(&fired));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_per_key() {
        let scheduler = Scheduler::new();
        let ocr = Arc::new(AtomicU32::new(0));
        let validation = Arc::new(AtomicU32::new(0));
        let other_row = Arc::new(AtomicU32::new(0));

        scheduler.schedule(RowId(2), Purpose::Ocr, ms(100), counter_action(&ocr));
        scheduler.schedule(RowId(2), Purpose::Validation, ms(100), counter_action(&validation));
        scheduler.schedule(RowId(3), Purpose::Ocr, ms(100), counter_action(&other_row));

        assert!(scheduler.cancel(RowId(2), Purpose::Ocr));
        assert!(!scheduler.cancel(RowId(2), Purpose::Ocr));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ocr.load(Ordering::SeqCst), 0);
        assert_eq!(validation.load(Ordering::SeqCst), 1);
        assert_eq!(other_row.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_row_drops_both_purposes() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler.schedule(RowId(4), Purpose::Ocr, ms(50), counter_action(&fired));
        scheduler.schedule(RowId(4), Purpose::Validation, ms(50), counter_action(&fired));
        scheduler.cancel_row(RowId(4));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
