//! Request router: one relay subscription demultiplexed into per-sub-wallet
//! serial queues.
//!
//! A single demux task reads the subscription and routes each event onto a
//! bounded channel keyed by service pubkey; one worker task per key drains
//! its channel in order. Per sub-wallet, handlers run in arrival order;
//! across sub-wallets they run in parallel, bounded by the per-key channel
//! capacity. When the registry's key set changes the demux task swaps its
//! subscription and drains the old one before dropping it.

use crate::registry::WalletRegistry;
use crate::transport::{RelayPool, TransportEvent, KIND_WALLET_REQUEST};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const WORKER_QUEUE_DEPTH: usize = 64;

pub struct RequestRouter {
    transport: Arc<dyn RelayPool>,
    registry: Arc<WalletRegistry>,
}

impl RequestRouter {
    pub fn new(transport: Arc<dyn RelayPool>, registry: Arc<WalletRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut keyset_rx = self.registry.watch_keyset();
        let initial_keys = keyset_rx.borrow_and_update().clone();
        let mut subscription = self.transport.subscribe(initial_keys).await?;
        let mut workers: HashMap<String, mpsc::Sender<TransportEvent>> = HashMap::new();

        log::info!("request router started");
        loop {
            tokio::select! {
                changed = keyset_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let keys = keyset_rx.borrow_and_update().clone();
                    log::info!("service key set changed, resubscribing with {} keys", keys.len());
                    let mut old = std::mem::replace(
                        &mut subscription,
                        self.transport.subscribe(keys).await?,
                    );
                    // drain events already delivered on the old subscription
                    while let Ok(event) = old.try_recv() {
                        self.route(event, &mut workers).await;
                    }
                }
                maybe_event = subscription.recv() => match maybe_event {
                    Some(event) => self.route(event, &mut workers).await,
                    None => {
                        log::warn!("relay subscription closed, router stopping");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        // closing the worker channels lets in-flight handlers finish
        workers.clear();
        log::info!("request router stopped");
        Ok(())
    }

    async fn route(
        &self,
        event: TransportEvent,
        workers: &mut HashMap<String, mpsc::Sender<TransportEvent>>,
    ) {
        if event.kind != KIND_WALLET_REQUEST {
            return;
        }
        let Some(recipient) = event.tagged_recipient() else {
            log::debug!("dropping event {} with no tagged recipient", event.id);
            return;
        };
        let recipient = recipient.to_string();
        if self
            .registry
            .endpoint_for_service_pubkey(&recipient)
            .is_none()
        {
            log::debug!(
                "dropping event {} for unknown service pubkey {recipient}",
                event.id
            );
            return;
        }

        let sender = workers
            .entry(recipient.clone())
            .or_insert_with(|| spawn_worker(recipient.clone(), self.registry.clone()));

        if let Err(send_err) = sender.send(event).await {
            // worker died; replace it and retry once
            log::warn!("worker for {recipient} is gone, respawning");
            let sender = spawn_worker(recipient.clone(), self.registry.clone());
            let _ = sender.send(send_err.0).await;
            workers.insert(recipient, sender);
        }
    }
}

/// One serial queue per sub-wallet: the next request begins only after the
/// previous one completed.
fn spawn_worker(
    service_pubkey: String,
    registry: Arc<WalletRegistry>,
) -> mpsc::Sender<TransportEvent> {
    let (tx, mut rx) = mpsc::channel::<TransportEvent>(WORKER_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(endpoint) = registry.endpoint_for_service_pubkey(&service_pubkey) else {
                log::debug!("sub-wallet {service_pubkey} disappeared, dropping queued event");
                continue;
            };
            if let Err(e) = endpoint.handle_event(event).await {
                // a failed handler never tears down the queue
                log::error!("handler failed for sub-wallet {service_pubkey}: {e:#}");
            }
        }
    });
    tx
}
