//! Wallet-protocol payloads carried in encrypted event content.
//!
//! Requests arrive as `{"method": ..., "params": {...}}`; responses go back
//! as `{"result_type": ..., "error": ..., "result": ...}`. Params stay loose
//! (`serde_json::Value`) until the method is known, then deserialize into
//! the typed structs below.

use crate::error::WalletError;
use serde::{Deserialize, Serialize};

pub const METHOD_GET_BALANCE: &str = "get_balance";
pub const METHOD_GET_INFO: &str = "get_info";
pub const METHOD_MAKE_INVOICE: &str = "make_invoice";
pub const METHOD_PAY_INVOICE: &str = "pay_invoice";
pub const METHOD_LOOKUP_INVOICE: &str = "lookup_invoice";

/// Methods advertised in each sub-wallet's capability event.
pub const SUPPORTED_METHODS: [&str; 5] = [
    METHOD_GET_BALANCE,
    METHOD_GET_INFO,
    METHOD_MAKE_INVOICE,
    METHOD_PAY_INVOICE,
    METHOD_LOOKUP_INVOICE,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRequest {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl WalletRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WalletError> {
        serde_json::from_slice(bytes)
            .map_err(|e| WalletError::InvalidInput(format!("malformed request: {e}")))
    }

    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, WalletError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| WalletError::InvalidInput(format!("bad {} params: {e}", self.method)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MakeInvoiceParams {
    /// Millisatoshis.
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    /// Seconds until expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PayInvoiceParams {
    pub invoice: String,
    /// Millisatoshis; required only when the invoice itself has no amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LookupInvoiceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletResponse {
    pub result_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl WalletResponse {
    pub fn ok(method: &str, result: serde_json::Value) -> Self {
        Self {
            result_type: method.to_string(),
            error: None,
            result: Some(result),
        }
    }

    pub fn err(method: &str, error: &WalletError) -> Self {
        Self {
            result_type: method.to_string(),
            error: Some(ProtocolError {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
            result: None,
        }
    }
}

/// Async notification relayed to a sub-wallet's client after settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletNotification {
    pub notification_type: String,
    pub notification: serde_json::Value,
}

impl WalletNotification {
    pub fn payment_received(transaction: serde_json::Value) -> Self {
        Self {
            notification_type: "payment_received".to_string(),
            notification: transaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_params() {
        let req = WalletRequest::from_slice(
            br#"{"method":"pay_invoice","params":{"invoice":"lnbc1...","amount":21000}}"#,
        )
        .unwrap();
        assert_eq!(req.method, METHOD_PAY_INVOICE);
        let params: PayInvoiceParams = req.params().unwrap();
        assert_eq!(params.invoice, "lnbc1...");
        assert_eq!(params.amount, Some(21000));
    }

    #[test]
    fn parses_request_without_params() {
        let req = WalletRequest::from_slice(br#"{"method":"get_balance"}"#).unwrap();
        assert_eq!(req.method, METHOD_GET_BALANCE);
        assert!(req.params.is_null());
    }

    #[test]
    fn rejects_malformed_request() {
        assert!(matches!(
            WalletRequest::from_slice(b"not json"),
            Err(WalletError::InvalidInput(_))
        ));
    }

    #[test]
    fn error_response_carries_protocol_code() {
        let err = WalletError::InsufficientBalance {
            available: 0,
            required: 1000,
        };
        let resp = WalletResponse::err(METHOD_PAY_INVOICE, &err);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result_type"], "pay_invoice");
        assert_eq!(json["error"]["code"], "INSUFFICIENT_BALANCE");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn upstream_failure_code_depends_on_operation() {
        let pay = WalletError::Upstream {
            op: METHOD_PAY_INVOICE,
            message: "no route".to_string(),
        };
        let resp = WalletResponse::err(METHOD_PAY_INVOICE, &pay);
        assert_eq!(resp.error.unwrap().code, "PAYMENT_FAILED");

        let info = WalletError::Upstream {
            op: METHOD_GET_INFO,
            message: "connection refused".to_string(),
        };
        let resp = WalletResponse::err(METHOD_GET_INFO, &info);
        assert_eq!(resp.error.unwrap().code, "INTERNAL");

        let make = WalletError::Upstream {
            op: METHOD_MAKE_INVOICE,
            message: "connection refused".to_string(),
        };
        let resp = WalletResponse::err(METHOD_MAKE_INVOICE, &make);
        assert_eq!(resp.error.unwrap().code, "INTERNAL");
    }

    #[test]
    fn ok_response_has_no_error() {
        let resp = WalletResponse::ok(METHOD_GET_BALANCE, serde_json::json!({"balance": 42}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result"]["balance"], 42);
        assert!(json.get("error").is_none());
    }
}
