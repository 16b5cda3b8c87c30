//! Settlement correlator: binds upstream payment records back to pending
//! ledger entries and applies credits atomically.
//!
//! Runs on its own task fed by a channel. Both upstream `payment_received`
//! notifications and lookup results that came back settled are submitted
//! here, so settlement never executes inside a request handler.

use crate::error::WalletError;
use crate::models::pending_invoice::{InvoiceState, PendingInvoice};
use crate::models::DbPool;
use crate::registry::WalletRegistry;
use crate::upstream::{TransactionKind, UpstreamTransaction};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Clonable submission side of the correlator channel.
#[derive(Clone)]
pub struct SettlementHandle {
    tx: mpsc::Sender<UpstreamTransaction>,
}

impl SettlementHandle {
    pub async fn submit(&self, transaction: UpstreamTransaction) {
        if self.tx.send(transaction).await.is_err() {
            log::error!("settlement correlator is gone, dropping settlement event");
        }
    }
}

pub fn channel(buffer: usize) -> (SettlementHandle, mpsc::Receiver<UpstreamTransaction>) {
    let (tx, rx) = mpsc::channel(buffer);
    (SettlementHandle { tx }, rx)
}

pub struct SettlementCorrelator {
    db_pool: DbPool,
    registry: Arc<WalletRegistry>,
}

impl SettlementCorrelator {
    pub fn new(db_pool: DbPool, registry: Arc<WalletRegistry>) -> Self {
        Self { db_pool, registry }
    }

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<UpstreamTransaction>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(transaction) => {
                        if let Err(e) = self.correlate(transaction).await {
                            log::error!("settlement correlation failed: {e}");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("settlement correlator stopped");
    }

    /// Match one upstream record against the ledger and settle it.
    ///
    /// Unknown invoices are a no-op (the upstream may settle invoices the
    /// multiplexer never issued); terminal matches only log, so replaying a
    /// notification cannot double-credit.
    pub async fn correlate(
        &self,
        transaction: UpstreamTransaction,
    ) -> Result<Option<PendingInvoice>, WalletError> {
        if transaction.kind != TransactionKind::Incoming {
            return Ok(None);
        }

        let query = transaction.ledger_query();
        if query.is_empty() {
            log::debug!("settlement event carries no invoice identifiers, skipping");
            return Ok(None);
        }

        let mut conn = self.db_pool.get()?;
        let Some(matched) = PendingInvoice::find_matching(&mut conn, &query)? else {
            log::debug!(
                "no pending invoice matches settlement for payment_hash {:?}",
                query.payment_hash
            );
            return Ok(None);
        };

        if matched.state() != InvoiceState::Pending {
            log::info!(
                "invoice {} already {}, ignoring duplicate settlement",
                matched.id,
                matched.state()
            );
            return Ok(None);
        }

        let credited = if transaction.amount > 0 {
            Some(transaction.amount)
        } else {
            None
        };
        let settled_at = transaction
            .settled_at
            .and_then(|s| chrono::NaiveDateTime::from_timestamp_opt(s, 0));

        let (settled, account) =
            PendingInvoice::settle(&mut conn, &matched.id, credited, settled_at)?;
        log::info!(
            "settled invoice {} for sub-wallet {}: +{} msats (balance {})",
            settled.id,
            settled.sub_account_id,
            credited.unwrap_or_else(|| settled.amount_msats()),
            account.balance_msats()
        );
        drop(conn);

        // after commit, relay the notification to the sub-wallet's client
        if let Some(endpoint) = self.registry.endpoint_for_id(&settled.sub_account_id) {
            let payload = serde_json::to_value(&transaction).unwrap_or_default();
            if let Err(e) = endpoint.notify_payment_received(payload).await {
                log::warn!(
                    "failed to relay payment_received for sub-wallet {}: {e:#}",
                    settled.sub_account_id
                );
            }
        }

        Ok(Some(settled))
    }
}
