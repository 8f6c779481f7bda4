//! Background purge of expired ledger records.
//!
//! Expired records are already ignored by lookups; the sweep only reclaims space.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::LedgerStore;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn a task that calls [`LedgerStore::purge_expired`] every `interval`
/// until `cancel` fires.
pub fn spawn_expiry_sweeper<S>(
    store: S,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: LedgerStore + 'static,
{
    let interval = interval.max(MIN_SWEEP_INTERVAL);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match store.purge_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "purged expired idempotency records"),
                        Err(e) => warn!(error = %e, "idempotency ledger sweep failed"),
                    }
                }
            }
        }

        info!("idempotency ledger sweeper stopped");
    })
}
