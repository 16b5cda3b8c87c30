//! Key material for sub-wallet identities.
//!
//! Each sub-wallet carries two secp256k1 key pairs: the service pair is the
//! address clients send requests to, the client pair authorizes one client
//! to act on the sub-wallet. Public keys travel as 33-byte compressed hex.

use crate::error::WalletError;
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};

/// URI scheme carried by client connect strings.
pub const CONNECT_SCHEME: &str = "nostr+walletconnect";

/// One generated or recovered key pair.
#[derive(Debug, Clone, Copy)]
pub struct WalletKeys {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl WalletKeys {
    pub fn generate<C: Signing>(secp: &Secp256k1<C>) -> Self {
        let secret = SecretKey::new(&mut OsRng);
        let public = PublicKey::from_secret_key(secp, &secret);
        Self { secret, public }
    }

    /// Recover a pair from a 32-byte hex secret, e.g. an operator-supplied one.
    pub fn from_secret_hex<C: Signing>(
        secp: &Secp256k1<C>,
        hex_secret: &str,
    ) -> Result<Self, WalletError> {
        let secret = parse_secret_hex(hex_secret)?;
        let public = PublicKey::from_secret_key(secp, &secret);
        Ok(Self { secret, public })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }
}

pub fn parse_secret_hex(hex_secret: &str) -> Result<SecretKey, WalletError> {
    let bytes = hex::decode(hex_secret)
        .map_err(|_| WalletError::InvalidInput("secret is not valid hex".to_string()))?;
    if bytes.len() != 32 {
        return Err(WalletError::InvalidInput(format!(
            "secret must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    SecretKey::from_slice(&bytes)
        .map_err(|_| WalletError::InvalidInput("secret is not a valid scalar".to_string()))
}

pub fn parse_pubkey_hex(hex_pubkey: &str) -> Result<PublicKey, WalletError> {
    let bytes = hex::decode(hex_pubkey)
        .map_err(|_| WalletError::InvalidInput("pubkey is not valid hex".to_string()))?;
    PublicKey::from_slice(&bytes)
        .map_err(|_| WalletError::InvalidInput("pubkey is not a valid curve point".to_string()))
}

/// Symmetric key for one (service, client) conversation, from ECDH.
pub fn conversation_key(secret: &SecretKey, peer: &PublicKey) -> [u8; 32] {
    SharedSecret::new(peer, secret).secret_bytes()
}

/// Build the connect URI handed to the client once at creation.
///
/// `<scheme>://<service_pubkey>?relay=<url>&secret=<client_secret_hex>`
pub fn connect_uri(service_pubkey: &str, relays: &[String], client_secret_hex: &str) -> String {
    let mut uri = format!("{CONNECT_SCHEME}://{service_pubkey}?");
    for relay in relays {
        uri.push_str("relay=");
        uri.push_str(relay);
        uri.push('&');
    }
    uri.push_str("secret=");
    uri.push_str(client_secret_hex);
    uri
}
