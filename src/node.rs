//! Node wiring: builds the shared context and runs the background tasks.

use crate::admin::AdminApi;
use crate::config::Config;
use crate::models::pending_invoice::PendingInvoice;
use crate::models::DbPool;
use crate::registry::WalletRegistry;
use crate::router::RequestRouter;
use crate::settlement::{self, SettlementCorrelator, SettlementHandle};
use crate::sweeper::ExpirySweeper;
use crate::transport::RelayPool;
use crate::upstream::{UpstreamHandle, UpstreamWallet};
use crate::vault::Vault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

const SETTLEMENT_QUEUE_DEPTH: usize = 64;

/// One running multiplexer: the process-wide resources, initialized once and
/// threaded to every component.
#[derive(Clone)]
pub struct Node {
    pub config: Config,
    pub db_pool: DbPool,
    pub vault: Arc<Vault>,
    pub registry: Arc<WalletRegistry>,
    pub admin: AdminApi,
    pub settlement: SettlementHandle,
    stop: Arc<AtomicBool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Node {
    pub async fn new(
        config: Config,
        db_pool: DbPool,
        transport: Arc<dyn RelayPool>,
        upstream_wallet: Arc<dyn UpstreamWallet>,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<Node> {
        let master_key = config.master_key()?;
        let vault = Arc::new(Vault::new(&master_key));

        let upstream = Arc::new(UpstreamHandle::new(
            upstream_wallet,
            config.upstream_timeouts(),
        ));

        // recovery: expire stale invoices once before serving anything
        {
            let mut conn = db_pool.get()?;
            let swept = PendingInvoice::prune_expired(&mut conn, chrono::Utc::now().timestamp())?;
            if !swept.is_empty() {
                log::info!("startup sweep expired {} pending invoices", swept.len());
            }
        }

        let (settlement, settlement_rx) = settlement::channel(SETTLEMENT_QUEUE_DEPTH);
        let registry = WalletRegistry::load(
            db_pool.clone(),
            vault.clone(),
            upstream.clone(),
            transport.clone(),
            settlement.clone(),
        )?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let correlator = SettlementCorrelator::new(db_pool.clone(), registry.clone());
        tokio::spawn(correlator.run(settlement_rx, shutdown_rx.clone()));

        if upstream.supports_notifications() {
            let mut notifications = upstream.notifications().await?;
            let handle = settlement.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe = notifications.recv() => match maybe {
                            Some(transaction) => handle.submit(transaction).await,
                            None => {
                                log::warn!("upstream notification stream closed");
                                break;
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            });
        } else {
            log::info!("upstream wallet has no notification stream, relying on lookups");
        }

        let router = RequestRouter::new(transport.clone(), registry.clone());
        let router_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = router.run(router_shutdown).await {
                log::error!("request router exited: {e:#}");
            }
        });

        let sweeper = ExpirySweeper::new(db_pool.clone(), config.sweep_interval());
        tokio::spawn(sweeper.run(shutdown_rx));

        let admin = AdminApi::new(
            db_pool.clone(),
            vault.clone(),
            registry.clone(),
            config.relays.clone(),
        );

        Ok(Node {
            config,
            db_pool,
            vault,
            registry,
            admin,
            settlement,
            stop,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    /// Signal every background task to stop. In-flight handlers finish;
    /// nothing is re-queued.
    pub fn stop(&self) {
        log::info!("shutting down");
        self.stop.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}
