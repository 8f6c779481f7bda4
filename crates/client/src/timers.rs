//! Arena of pending retry waits, keyed by queue id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::types::QueueId;

#[derive(Debug, Default)]
pub struct RetryTimers {
    timers: Mutex<HashMap<QueueId, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl RetryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `delay` for item `id`. Returns `false` if the wait was cut short by
    /// `cancel_all`, `cancel(id)` or `parent`.
    pub async fn sleep(&self, id: QueueId, delay: Duration, parent: &CancellationToken) -> bool {
        if delay.is_zero() {
            return !parent.is_cancelled();
        }

        let token = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut timers) = self.timers.lock() {
            if let Some((_, previous)) = timers.insert(id, (generation, token.clone())) {
                previous.cancel();
            }
        }

        let elapsed = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };

        if let Ok(mut timers) = self.timers.lock() {
            // A newer wait for the same id may have replaced ours.
            if timers.get(&id).is_some_and(|(g, _)| *g == generation) {
                timers.remove(&id);
            }
        }
        elapsed
    }

    pub fn cancel(&self, id: QueueId) -> bool {
        match self.timers.lock() {
            Ok(mut timers) => timers.remove(&id).map(|(_, t)| t.cancel()).is_some(),
            Err(_) => false,
        }
    }

    /// Cancel every scheduled wait. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let Ok(mut timers) = self.timers.lock() else {
            return 0;
        };
        let count = timers.len();
        for (_, (_, token)) in timers.drain() {
            token.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
