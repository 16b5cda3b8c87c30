//! Façade over the single upstream wallet.
//!
//! The concrete client (transport, reconnection, auth) is external; the core
//! programs against [`UpstreamWallet`] and always goes through
//! [`UpstreamHandle`], which adds per-operation timeouts and serializes
//! calls unless the adapter declares itself safe for concurrent use.

use crate::error::WalletError;
use crate::models::pending_invoice::InvoiceQuery;
use crate::protocol::{
    MakeInvoiceParams, METHOD_GET_INFO, METHOD_LOOKUP_INVOICE, METHOD_MAKE_INVOICE,
    METHOD_PAY_INVOICE,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Settled,
    Failed,
    Expired,
}

/// One upstream transaction record: invoice creation result, lookup result,
/// or payment-received notification. Fields the core understands are typed;
/// everything else rides along in `raw` for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTransaction {
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransactionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    /// Millisatoshis.
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees_paid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
    /// The upstream's original response, verbatim.
    #[serde(default, skip_serializing)]
    pub raw: serde_json::Value,
}

impl UpstreamTransaction {
    pub fn is_settled(&self) -> bool {
        self.state == Some(TransactionState::Settled) || self.settled_at.is_some()
    }

    pub fn ledger_query(&self) -> InvoiceQuery {
        InvoiceQuery {
            payment_hash: self.payment_hash.clone(),
            invoice: self.invoice.clone(),
            description_hash: self.description_hash.clone(),
        }
    }

    /// What the client sees: the original upstream response when retained,
    /// the typed view otherwise.
    pub fn to_client_json(&self) -> serde_json::Value {
        if self.raw.is_null() {
            serde_json::to_value(self).unwrap_or_default()
        } else {
            self.raw.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub preimage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees_paid: Option<u64>,
    #[serde(default, skip_serializing)]
    pub raw: serde_json::Value,
}

/// What the core requires of the external upstream client.
#[async_trait]
pub trait UpstreamWallet: Send + Sync + 'static {
    async fn get_info(&self) -> anyhow::Result<WalletInfo>;

    async fn make_invoice(&self, params: MakeInvoiceParams) -> anyhow::Result<UpstreamTransaction>;

    async fn pay_invoice(
        &self,
        invoice: &str,
        amount_msats: Option<u64>,
    ) -> anyhow::Result<PaymentReceipt>;

    async fn lookup_invoice(
        &self,
        query: InvoiceQuery,
    ) -> anyhow::Result<Option<UpstreamTransaction>>;

    /// Whether a `payment_received` stream is available.
    fn supports_notifications(&self) -> bool {
        false
    }

    async fn notifications(&self) -> anyhow::Result<mpsc::Receiver<UpstreamTransaction>> {
        anyhow::bail!("upstream wallet does not support notifications")
    }

    /// Whether the adapter tolerates concurrent calls. When false the handle
    /// serializes access with a mutex.
    fn concurrent_safe(&self) -> bool {
        false
    }
}

/// Per-operation timeout budgets.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    pub info: Duration,
    pub invoice: Duration,
    pub pay: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            info: Duration::from_secs(15),
            invoice: Duration::from_secs(20),
            pay: Duration::from_secs(60),
        }
    }
}

pub struct UpstreamHandle {
    inner: Arc<dyn UpstreamWallet>,
    serialize: Option<Mutex<()>>,
    timeouts: UpstreamTimeouts,
}

impl UpstreamHandle {
    pub fn new(inner: Arc<dyn UpstreamWallet>, timeouts: UpstreamTimeouts) -> Self {
        let serialize = if inner.concurrent_safe() {
            None
        } else {
            Some(Mutex::new(()))
        };
        Self {
            inner,
            serialize,
            timeouts,
        }
    }

    async fn guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.serialize {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    pub async fn get_info(&self) -> Result<WalletInfo, WalletError> {
        let _guard = self.guard().await;
        match timeout(self.timeouts.info, self.inner.get_info()).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(e)) => Err(WalletError::Upstream {
                op: METHOD_GET_INFO,
                message: e.to_string(),
            }),
            Err(_) => Err(WalletError::Timeout(self.timeouts.info.as_secs())),
        }
    }

    pub async fn make_invoice(
        &self,
        params: MakeInvoiceParams,
    ) -> Result<UpstreamTransaction, WalletError> {
        let _guard = self.guard().await;
        match timeout(self.timeouts.invoice, self.inner.make_invoice(params)).await {
            Ok(Ok(tx)) => Ok(tx),
            Ok(Err(e)) => Err(WalletError::Upstream {
                op: METHOD_MAKE_INVOICE,
                message: e.to_string(),
            }),
            Err(_) => Err(WalletError::Timeout(self.timeouts.invoice.as_secs())),
        }
    }

    pub async fn pay_invoice(
        &self,
        invoice: &str,
        amount_msats: Option<u64>,
    ) -> Result<PaymentReceipt, WalletError> {
        let _guard = self.guard().await;
        match timeout(self.timeouts.pay, self.inner.pay_invoice(invoice, amount_msats)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => Err(WalletError::Upstream {
                op: METHOD_PAY_INVOICE,
                message: e.to_string(),
            }),
            Err(_) => Err(WalletError::Timeout(self.timeouts.pay.as_secs())),
        }
    }

    pub async fn lookup_invoice(
        &self,
        query: InvoiceQuery,
    ) -> Result<Option<UpstreamTransaction>, WalletError> {
        let _guard = self.guard().await;
        match timeout(self.timeouts.invoice, self.inner.lookup_invoice(query)).await {
            Ok(Ok(tx)) => Ok(tx),
            Ok(Err(e)) => Err(WalletError::Upstream {
                op: METHOD_LOOKUP_INVOICE,
                message: e.to_string(),
            }),
            Err(_) => Err(WalletError::Timeout(self.timeouts.invoice.as_secs())),
        }
    }

    pub fn supports_notifications(&self) -> bool {
        self.inner.supports_notifications()
    }

    pub async fn notifications(&self) -> anyhow::Result<mpsc::Receiver<UpstreamTransaction>> {
        self.inner.notifications().await
    }
}
