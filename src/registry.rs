//! In-memory index of live sub-wallets.
//!
//! Rebuilt from the ledger on start, mutated on create/remove. The registry
//! is the only component that constructs [`Endpoint`]s, and it publishes the
//! current service-pubkey set on a watch channel the router's subscription
//! follows.

use crate::endpoint::Endpoint;
use crate::error::WalletError;
use crate::models::sub_account::SubAccount;
use crate::models::DbPool;
use crate::settlement::SettlementHandle;
use crate::transport::RelayPool;
use crate::upstream::UpstreamHandle;
use crate::vault::Vault;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

#[derive(Default)]
struct RegistryIndex {
    by_id: HashMap<String, Arc<Endpoint>>,
    by_service_pubkey: HashMap<String, Arc<Endpoint>>,
}

pub struct WalletRegistry {
    db_pool: DbPool,
    vault: Arc<Vault>,
    upstream: Arc<UpstreamHandle>,
    transport: Arc<dyn RelayPool>,
    settlement: SettlementHandle,
    index: RwLock<RegistryIndex>,
    keyset_tx: watch::Sender<Vec<String>>,
}

impl WalletRegistry {
    /// Load every sub-wallet from the ledger and build its endpoint eagerly.
    pub fn load(
        db_pool: DbPool,
        vault: Arc<Vault>,
        upstream: Arc<UpstreamHandle>,
        transport: Arc<dyn RelayPool>,
        settlement: SettlementHandle,
    ) -> anyhow::Result<Arc<Self>> {
        let (keyset_tx, _) = watch::channel(Vec::new());
        let registry = Arc::new(Self {
            db_pool,
            vault,
            upstream,
            transport,
            settlement,
            index: RwLock::new(RegistryIndex::default()),
            keyset_tx,
        });

        let accounts = {
            let mut conn = registry.db_pool.get()?;
            SubAccount::find_all(&mut conn)?
        };
        for account in &accounts {
            registry.register(account)?;
        }
        log::info!("registry loaded {} sub-wallets", accounts.len());

        Ok(registry)
    }

    fn build_endpoint(&self, account: &SubAccount) -> Result<Arc<Endpoint>, WalletError> {
        let service_keys = account.service_keys(&self.vault)?;
        let client_keys = account.client_keys(&self.vault)?;
        Ok(Arc::new(Endpoint::new(
            account.id.clone(),
            service_keys,
            client_keys,
            self.db_pool.clone(),
            self.upstream.clone(),
            self.transport.clone(),
            self.settlement.clone(),
        )))
    }

    /// Index a sub-wallet and refresh the advertised key set.
    pub fn register(&self, account: &SubAccount) -> Result<Arc<Endpoint>, WalletError> {
        let endpoint = self.build_endpoint(account)?;
        {
            let mut index = self.index.write().expect("registry lock poisoned");
            index.by_id.insert(account.id.clone(), endpoint.clone());
            index
                .by_service_pubkey
                .insert(account.service_pubkey.clone(), endpoint.clone());
        }
        self.publish_keyset();
        Ok(endpoint)
    }

    /// Drop a sub-wallet from the index and refresh the advertised key set.
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut index = self.index.write().expect("registry lock poisoned");
            if let Some(endpoint) = index.by_id.remove(id) {
                index.by_service_pubkey.remove(&endpoint.service_pubkey());
                true
            } else {
                false
            }
        };
        if removed {
            self.publish_keyset();
        }
    }

    pub fn endpoint_for_id(&self, id: &str) -> Option<Arc<Endpoint>> {
        let cached = {
            let index = self.index.read().expect("registry lock poisoned");
            index.by_id.get(id).cloned()
        };
        if cached.is_some() {
            return cached;
        }
        self.load_missing(|conn| SubAccount::find_by_id(conn, id))
    }

    pub fn endpoint_for_service_pubkey(&self, service_pubkey: &str) -> Option<Arc<Endpoint>> {
        let cached = {
            let index = self.index.read().expect("registry lock poisoned");
            index.by_service_pubkey.get(service_pubkey).cloned()
        };
        if cached.is_some() {
            return cached;
        }
        self.load_missing(|conn| SubAccount::find_by_service_pubkey(conn, service_pubkey))
    }

    /// Lazy path: a sub-wallet present in the ledger but not yet indexed
    /// gets its endpoint built on first use.
    fn load_missing<F>(&self, find: F) -> Option<Arc<Endpoint>>
    where
        F: FnOnce(&mut diesel::SqliteConnection) -> Result<Option<SubAccount>, WalletError>,
    {
        let mut conn = self.db_pool.get().ok()?;
        let account = match find(&mut conn) {
            Ok(Some(account)) => account,
            Ok(None) => return None,
            Err(e) => {
                log::error!("registry lookup failed: {e}");
                return None;
            }
        };
        match self.register(&account) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                log::error!("could not build endpoint for sub-wallet {}: {e}", account.id);
                None
            }
        }
    }

    pub fn service_pubkeys(&self) -> Vec<String> {
        let index = self.index.read().expect("registry lock poisoned");
        let mut keys: Vec<String> = index.by_service_pubkey.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The router follows this channel to keep its subscription filter in
    /// sync with the live key set.
    pub fn watch_keyset(&self) -> watch::Receiver<Vec<String>> {
        self.keyset_tx.subscribe()
    }

    fn publish_keyset(&self) {
        self.keyset_tx.send_replace(self.service_pubkeys());
    }
}
