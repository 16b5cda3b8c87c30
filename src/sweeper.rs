//! Periodic task expiring stale pending invoices.

use crate::error::WalletError;
use crate::models::pending_invoice::PendingInvoice;
use crate::models::DbPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub struct ExpirySweeper {
    db_pool: DbPool,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(db_pool: DbPool, interval: Duration) -> Self {
        Self { db_pool, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        log::error!("expiry sweep failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("expiry sweeper stopped");
    }

    /// Transition every pending invoice past its expiry to `expired`,
    /// releasing its share of the owner's pending counter.
    pub fn sweep(&self) -> Result<usize, WalletError> {
        let mut conn = self.db_pool.get()?;
        let swept = PendingInvoice::prune_expired(&mut conn, chrono::Utc::now().timestamp())?;
        if !swept.is_empty() {
            log::info!("expired {} pending invoices", swept.len());
        }
        Ok(swept.len())
    }
}
