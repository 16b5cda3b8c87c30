//! Per-sub-wallet service endpoint: authenticate, decrypt, dispatch, respond.

use crate::error::WalletError;
use crate::keys::WalletKeys;
use crate::models::pending_invoice::{InvoiceQuery, PendingInvoice, RegisterPendingInvoice};
use crate::models::sub_account::SubAccount;
use crate::models::DbPool;
use crate::protocol::{
    LookupInvoiceParams, MakeInvoiceParams, PayInvoiceParams, WalletNotification, WalletRequest,
    WalletResponse, METHOD_GET_BALANCE, METHOD_GET_INFO, METHOD_LOOKUP_INVOICE,
    METHOD_MAKE_INVOICE, METHOD_PAY_INVOICE, SUPPORTED_METHODS,
};
use crate::settlement::SettlementHandle;
use crate::transport::{
    decrypt_content, encrypt_content, OutgoingEvent, RelayPool, TransportEvent,
    KIND_WALLET_INFO, KIND_WALLET_NOTIFICATION, KIND_WALLET_RESPONSE,
};
use crate::upstream::UpstreamHandle;
use bitcoin::secp256k1::PublicKey;
use lightning_invoice::Bolt11Invoice;
use std::str::FromStr;
use std::sync::Arc;

/// One live sub-wallet: holds the decrypted service keys and serves the
/// request set for exactly one authorized client. Created only by the
/// registry.
pub struct Endpoint {
    sub_account_id: String,
    service_keys: WalletKeys,
    client_pubkey: PublicKey,
    client_pubkey_hex: String,
    db_pool: DbPool,
    upstream: Arc<UpstreamHandle>,
    transport: Arc<dyn RelayPool>,
    settlement: SettlementHandle,
}

impl Endpoint {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sub_account_id: String,
        service_keys: WalletKeys,
        client_keys: WalletKeys,
        db_pool: DbPool,
        upstream: Arc<UpstreamHandle>,
        transport: Arc<dyn RelayPool>,
        settlement: SettlementHandle,
    ) -> Self {
        Self {
            sub_account_id,
            service_keys,
            client_pubkey: client_keys.public,
            client_pubkey_hex: client_keys.public_hex(),
            db_pool,
            upstream,
            transport,
            settlement,
        }
    }

    pub fn sub_account_id(&self) -> &str {
        &self.sub_account_id
    }

    pub fn service_pubkey(&self) -> String {
        self.service_keys.public_hex()
    }

    /// Handle one request event end to end.
    ///
    /// Authentication and decryption failures drop the event with a log
    /// line; handler failures are answered with protocol error responses.
    pub async fn handle_event(&self, event: TransportEvent) -> anyhow::Result<()> {
        if event.pubkey != self.client_pubkey_hex {
            log::warn!(
                "dropping request from unauthorized sender {} for sub-wallet {}",
                event.pubkey,
                self.sub_account_id
            );
            return Ok(());
        }

        let plaintext =
            match decrypt_content(&self.service_keys.secret, &self.client_pubkey, &event.content) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    log::warn!(
                        "dropping undecryptable request {} for sub-wallet {}: {e}",
                        event.id,
                        self.sub_account_id
                    );
                    return Ok(());
                }
            };

        let request = match WalletRequest::from_slice(&plaintext) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("dropping unparseable request {}: {e}", event.id);
                return Ok(());
            }
        };

        log::debug!(
            "sub-wallet {} handling {} (event {})",
            self.sub_account_id,
            request.method,
            event.id
        );

        let outcome = self.dispatch(&request).await;
        let response = match &outcome {
            Ok(result) => WalletResponse::ok(&request.method, result.clone()),
            Err(e) => {
                log::info!(
                    "sub-wallet {} request {} failed: {e}",
                    self.sub_account_id,
                    request.method
                );
                WalletResponse::err(&request.method, e)
            }
        };

        // the client retries on a lost response; usage metadata is updated
        // either way
        if let Err(e) = self
            .publish(KIND_WALLET_RESPONSE, Some(event.id), &serde_json::to_vec(&response)?)
            .await
        {
            log::warn!(
                "failed to publish response for sub-wallet {}: {e:#}",
                self.sub_account_id
            );
        }

        match self.db_pool.get() {
            Ok(mut conn) => {
                if let Err(e) = SubAccount::touch(&mut conn, &self.sub_account_id, true, true) {
                    log::error!("failed to touch sub-wallet {}: {e}", self.sub_account_id);
                }
            }
            Err(e) => log::error!(
                "no ledger connection to touch sub-wallet {}: {e}",
                self.sub_account_id
            ),
        }

        Ok(())
    }

    async fn dispatch(&self, request: &WalletRequest) -> Result<serde_json::Value, WalletError> {
        match request.method.as_str() {
            METHOD_GET_BALANCE => self.get_balance(),
            METHOD_GET_INFO => self.get_info().await,
            METHOD_MAKE_INVOICE => self.make_invoice(request.params()?).await,
            METHOD_PAY_INVOICE => self.pay_invoice(request.params()?).await,
            METHOD_LOOKUP_INVOICE => self.lookup_invoice(request.params()?).await,
            other => Err(WalletError::Unsupported(other.to_string())),
        }
    }

    fn get_balance(&self) -> Result<serde_json::Value, WalletError> {
        let mut conn = self.db_pool.get()?;
        let account = SubAccount::find_by_id(&mut conn, &self.sub_account_id)?
            .ok_or_else(|| WalletError::UnknownSubAccount(self.sub_account_id.clone()))?;
        Ok(serde_json::json!({ "balance": account.balance_msats() }))
    }

    async fn get_info(&self) -> Result<serde_json::Value, WalletError> {
        let info = self.upstream.get_info().await?;
        if info.raw.is_null() {
            Ok(serde_json::to_value(&info).unwrap_or_default())
        } else {
            Ok(info.raw)
        }
    }

    async fn make_invoice(
        &self,
        params: MakeInvoiceParams,
    ) -> Result<serde_json::Value, WalletError> {
        if params.amount == 0 {
            return Err(WalletError::InvalidInput(
                "invoice amount must be positive".to_string(),
            ));
        }

        let expiry = params.expiry;
        let tx = self.upstream.make_invoice(params.clone()).await?;

        let amount_msats = if tx.amount > 0 { tx.amount } else { params.amount };
        let expires_at = tx
            .expires_at
            .or_else(|| expiry.map(|e| chrono::Utc::now().timestamp() + e as i64));

        let mut conn = self.db_pool.get()?;
        let registered = PendingInvoice::register(
            &mut conn,
            RegisterPendingInvoice {
                sub_account_id: self.sub_account_id.clone(),
                invoice: tx.invoice.clone(),
                payment_hash: tx.payment_hash.clone(),
                description_hash: tx.description_hash.clone(),
                amount_msats,
                expires_at,
                raw: if tx.raw.is_null() {
                    serde_json::to_value(&tx).ok()
                } else {
                    Some(tx.raw.clone())
                },
            },
        )?;
        log::info!(
            "sub-wallet {} issued invoice {} for {} msats",
            self.sub_account_id,
            registered.id,
            registered.amount_msats()
        );

        Ok(tx.to_client_json())
    }

    async fn pay_invoice(&self, params: PayInvoiceParams) -> Result<serde_json::Value, WalletError> {
        let bolt11 = Bolt11Invoice::from_str(&params.invoice)
            .map_err(|e| WalletError::InvalidInput(format!("invalid invoice: {e}")))?;
        let amount_msats = bolt11
            .amount_milli_satoshis()
            .or(params.amount)
            .ok_or(WalletError::InvoiceAmountMissing)?;

        let mut conn = self.db_pool.get()?;
        let account = SubAccount::find_by_id(&mut conn, &self.sub_account_id)?
            .ok_or_else(|| WalletError::UnknownSubAccount(self.sub_account_id.clone()))?;
        if account.balance_msats() < amount_msats {
            return Err(WalletError::InsufficientBalance {
                available: account.balance_msats(),
                required: amount_msats,
            });
        }
        drop(conn);

        // amount override only travels upstream for amountless invoices
        let override_msats = if bolt11.amount_milli_satoshis().is_none() {
            Some(amount_msats)
        } else {
            None
        };
        let receipt = self
            .upstream
            .pay_invoice(&params.invoice, override_msats)
            .await?;

        // upstream accepted: debit exactly once; a failure above leaves the
        // ledger untouched
        let mut conn = self.db_pool.get()?;
        SubAccount::adjust_balance(&mut conn, &self.sub_account_id, -(amount_msats as i64))?;
        log::info!(
            "sub-wallet {} paid {} msats (fees {:?})",
            self.sub_account_id,
            amount_msats,
            receipt.fees_paid
        );

        Ok(serde_json::json!({
            "preimage": receipt.preimage,
            "fees_paid": receipt.fees_paid.unwrap_or(0),
        }))
    }

    async fn lookup_invoice(
        &self,
        params: LookupInvoiceParams,
    ) -> Result<serde_json::Value, WalletError> {
        let query = InvoiceQuery {
            payment_hash: params.payment_hash,
            invoice: params.invoice,
            description_hash: None,
        };
        if query.is_empty() {
            return Err(WalletError::InvalidInput(
                "lookup_invoice needs a payment_hash or invoice".to_string(),
            ));
        }

        let tx = self
            .upstream
            .lookup_invoice(query)
            .await?
            .ok_or_else(|| WalletError::NotFound("invoice not known upstream".to_string()))?;

        if tx.is_settled() {
            // settlement must not run inside the handler; hand off to the
            // correlator task and let it reconcile after we return
            self.settlement.submit(tx.clone()).await;
        }

        Ok(tx.to_client_json())
    }

    /// Relay a settled payment to the sub-wallet's client.
    pub async fn notify_payment_received(
        &self,
        transaction: serde_json::Value,
    ) -> anyhow::Result<()> {
        let notification = WalletNotification::payment_received(transaction);
        self.publish(
            KIND_WALLET_NOTIFICATION,
            None,
            &serde_json::to_vec(&notification)?,
        )
        .await
    }

    /// Publish this sub-wallet's capability event (plaintext method list).
    pub async fn publish_info_event(&self) -> anyhow::Result<()> {
        self.transport
            .publish(OutgoingEvent {
                kind: KIND_WALLET_INFO,
                sender: self.service_pubkey(),
                recipient: None,
                in_reply_to: None,
                content: SUPPORTED_METHODS.join(" "),
            })
            .await
    }

    async fn publish(
        &self,
        kind: u16,
        in_reply_to: Option<String>,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let content = encrypt_content(&self.service_keys.secret, &self.client_pubkey, payload);
        self.transport
            .publish(OutgoingEvent {
                kind,
                sender: self.service_pubkey(),
                recipient: Some(self.client_pubkey_hex.clone()),
                in_reply_to,
                content,
            })
            .await
    }
}
