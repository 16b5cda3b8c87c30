use crate::models::pending_invoice::InvoiceState;
use crate::vault::VaultError;

/// Errors surfaced by the ledger, handlers, and the upstream adapter.
///
/// Handler-level errors are mapped onto wallet-protocol error codes and sent
/// back to the client; infrastructure errors stay internal and are logged.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown sub-wallet: {0}")]
    UnknownSubAccount(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("insufficient balance: {available} msats available, {required} msats required")]
    InsufficientBalance { available: u64, required: u64 },
    #[error("invalid invoice state transition: {from} -> {to}")]
    InvalidTransition { from: InvoiceState, to: InvoiceState },
    #[error("invoice carries no amount and none was supplied")]
    InvoiceAmountMissing,
    #[error("unsupported method: {0}")]
    Unsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream {op} failure: {message}")]
    Upstream { op: &'static str, message: String },
    #[error("operation timed out after {0}s")]
    Timeout(u64),
    #[error("credential failure: {0}")]
    Auth(#[from] VaultError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
}

impl WalletError {
    /// Wallet-protocol error code sent to the client in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidInput(_) => "OTHER",
            WalletError::UnknownSubAccount(_) => "UNAUTHORIZED",
            WalletError::DuplicateKey(_) => "OTHER",
            WalletError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            WalletError::InvalidTransition { .. } => "INTERNAL",
            WalletError::InvoiceAmountMissing => "OTHER",
            WalletError::Unsupported(_) => "NOT_IMPLEMENTED",
            WalletError::NotFound(_) => "NOT_FOUND",
            // only a failed pay is a payment failure to the client; other
            // upstream operations failing is an internal condition
            WalletError::Upstream { op, .. } => {
                if *op == crate::protocol::METHOD_PAY_INVOICE {
                    "PAYMENT_FAILED"
                } else {
                    "INTERNAL"
                }
            }
            WalletError::Timeout(_) => "INTERNAL",
            WalletError::Auth(_) => "UNAUTHORIZED",
            WalletError::Database(_) | WalletError::Pool(_) => "INTERNAL",
        }
    }

    /// Transient serialization failures that warrant a transaction retry.
    pub fn is_transient(&self) -> bool {
        match self {
            WalletError::Database(diesel::result::Error::DatabaseError(_, info)) => {
                let msg = info.message();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
