//! Narrow interface to the relay transport, plus the content cipher.
//!
//! The concrete relay client (connection management, signing, retries) lives
//! outside the core; the core sees inbound events on a channel and publishes
//! outbound events through [`RelayPool`]. Event content is end-to-end
//! encrypted between the client key pair and the service key pair using the
//! ECDH conversation key and the same envelope as the vault, base64 on the
//! wire.

use crate::error::WalletError;
use crate::keys::conversation_key;
use crate::vault::{self, VaultError};
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capability/info event for one sub-wallet.
pub const KIND_WALLET_INFO: u16 = 13194;
/// Client request addressed to a service pubkey.
pub const KIND_WALLET_REQUEST: u16 = 23194;
/// Response addressed back to the requesting client.
pub const KIND_WALLET_RESPONSE: u16 = 23195;
/// Async notification (payment_received) to a client.
pub const KIND_WALLET_NOTIFICATION: u16 = 23196;

/// An inbound event observed on the relay subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEvent {
    pub id: String,
    pub kind: u16,
    /// Author pubkey, 33-byte compressed hex. The transport has already
    /// verified the event signature against it.
    pub pubkey: String,
    pub created_at: i64,
    pub tags: Vec<Vec<String>>,
    /// base64 envelope.
    pub content: String,
}

impl TransportEvent {
    /// The addressed service pubkey: first `p` tag, if any.
    pub fn tagged_recipient(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == "p")
            .map(|t| t[1].as_str())
    }
}

/// An outbound event for the transport to sign (with the sender's service
/// key) and publish.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub kind: u16,
    /// Service pubkey the event is published as.
    pub sender: String,
    /// Client pubkey tagged as recipient; absent on capability events.
    pub recipient: Option<String>,
    /// Request event id this correlates with, when responding.
    pub in_reply_to: Option<String>,
    pub content: String,
}

/// The subscription/publish surface the core needs from the relay pool.
///
/// `subscribe` replaces any previous subscription with one filtered to
/// wallet-request events addressed to `service_pubkeys`; the old receiver
/// keeps yielding already-buffered events until drained.
#[async_trait]
pub trait RelayPool: Send + Sync + 'static {
    async fn subscribe(
        &self,
        service_pubkeys: Vec<String>,
    ) -> anyhow::Result<mpsc::Receiver<TransportEvent>>;

    async fn publish(&self, event: OutgoingEvent) -> anyhow::Result<()>;
}

/// Encrypt a payload for the peer, base64 for the wire.
pub fn encrypt_content(secret: &SecretKey, peer: &PublicKey, plaintext: &[u8]) -> String {
    let key = conversation_key(secret, peer);
    base64::encode(vault::seal(&key, plaintext))
}

/// Decrypt wire content from the peer.
pub fn decrypt_content(
    secret: &SecretKey,
    peer: &PublicKey,
    content: &str,
) -> Result<Vec<u8>, WalletError> {
    let envelope = base64::decode(content)
        .map_err(|_| WalletError::Auth(VaultError::AuthFailure))?;
    let key = conversation_key(secret, peer);
    Ok(vault::open(&key, &envelope)?)
}
