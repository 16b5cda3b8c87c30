//! Operator façade consumed by the excluded front-ends (CLI, HTTP admin).
//!
//! Sub-wallets are created here, never by client requests.

use crate::error::WalletError;
use crate::keys::connect_uri;
use crate::models::pending_invoice::PendingInvoice;
use crate::models::sub_account::{CreateSubAccount, SubAccount};
use crate::models::DbPool;
use crate::registry::WalletRegistry;
use crate::vault::Vault;
use std::sync::Arc;

/// Everything the operator gets back from a create: the record, the connect
/// URI to hand to the client, and the plaintext secrets, returned exactly
/// once.
#[derive(Debug, Clone)]
pub struct CreatedSubAccount {
    pub record: SubAccount,
    pub connect_uri: String,
    pub client_secret: String,
    pub service_secret: String,
}

#[derive(Clone)]
pub struct AdminApi {
    db_pool: DbPool,
    vault: Arc<Vault>,
    registry: Arc<WalletRegistry>,
    default_relays: Vec<String>,
}

impl AdminApi {
    pub fn new(
        db_pool: DbPool,
        vault: Arc<Vault>,
        registry: Arc<WalletRegistry>,
        default_relays: Vec<String>,
    ) -> Self {
        Self {
            db_pool,
            vault,
            registry,
            default_relays,
        }
    }

    pub async fn create_sub_account(
        &self,
        mut input: CreateSubAccount,
    ) -> Result<CreatedSubAccount, WalletError> {
        if input.label.trim().is_empty() {
            return Err(WalletError::InvalidInput("label is required".to_string()));
        }
        if input.relays.is_empty() {
            input.relays = self.default_relays.clone();
        }

        let mut conn = self.db_pool.get()?;
        let (record, secrets) = SubAccount::create(&mut conn, &self.vault, input)?;
        drop(conn);

        let endpoint = self.registry.register(&record)?;
        if let Err(e) = endpoint.publish_info_event().await {
            log::warn!(
                "could not publish capability event for sub-wallet {}: {e:#}",
                record.id
            );
        }

        log::info!("created sub-wallet {} ({})", record.id, record.label);
        let uri = connect_uri(
            &record.service_pubkey,
            &record.relays(),
            &secrets.client.secret_hex(),
        );
        Ok(CreatedSubAccount {
            connect_uri: uri,
            client_secret: secrets.client.secret_hex(),
            service_secret: secrets.service.secret_hex(),
            record,
        })
    }

    pub fn list_sub_accounts(&self) -> Result<Vec<SubAccount>, WalletError> {
        let mut conn = self.db_pool.get()?;
        SubAccount::find_all(&mut conn)
    }

    pub fn list_pending_invoices(
        &self,
        sub_account_id: &str,
    ) -> Result<Vec<PendingInvoice>, WalletError> {
        let mut conn = self.db_pool.get()?;
        SubAccount::find_by_id(&mut conn, sub_account_id)?
            .ok_or_else(|| WalletError::UnknownSubAccount(sub_account_id.to_string()))?;
        PendingInvoice::find_for_sub_account(&mut conn, sub_account_id)
    }

    /// Rebuild the connect URI for an existing sub-wallet.
    pub fn get_connect_uri(&self, sub_account_id: &str) -> Result<String, WalletError> {
        let mut conn = self.db_pool.get()?;
        let account = SubAccount::find_by_id(&mut conn, sub_account_id)?
            .ok_or_else(|| WalletError::UnknownSubAccount(sub_account_id.to_string()))?;
        let client = account.client_keys(&self.vault)?;
        Ok(connect_uri(
            &account.service_pubkey,
            &account.relays(),
            &client.secret_hex(),
        ))
    }

    /// Privileged removal: deletes the sub-wallet and its pending invoices,
    /// and withdraws its key from the router's subscription.
    pub fn remove_sub_account(&self, sub_account_id: &str) -> Result<(), WalletError> {
        let mut conn = self.db_pool.get()?;
        SubAccount::remove(&mut conn, sub_account_id)?;
        self.registry.remove(sub_account_id);
        log::info!("removed sub-wallet {sub_account_id}");
        Ok(())
    }
}
