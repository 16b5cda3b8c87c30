//! Symmetric authenticated encryption for secrets at rest.
//!
//! Every 32-byte sub-wallet secret is stored as a versioned, self-describing
//! envelope so key-rotation migrations can coexist in one column:
//!
//! ```text
//! byte  0     : version (currently 0x01)
//! byte  1     : iv length (currently 12)
//! bytes 2..14 : iv
//! bytes 14..30: auth tag
//! bytes 30..  : ciphertext
//! ```
//!
//! The cipher is AES-256-GCM. The same envelope is used on the wire for
//! request/response content, keyed by the ECDH conversation key instead of
//! the master key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::rand::RngCore;

pub const ENVELOPE_VERSION: u8 = 0x01;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 2 + IV_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("unknown envelope version {0:#04x}")]
    BadVersion(u8),
    #[error("unexpected iv length {0}")]
    BadIvLength(u8),
    #[error("envelope too short: {0} bytes")]
    Truncated(usize),
    #[error("authentication failed")]
    AuthFailure,
}

/// Process-global credential vault, keyed once from the operator master key.
pub struct Vault {
    key: [u8; 32],
}

impl Vault {
    /// Derive the vault key from the operator-supplied master key.
    ///
    /// 64 lowercase-hex chars decode to the key directly; a base64 string
    /// decoding to 32 bytes is used as-is; anything else is hashed.
    pub fn new(master_key: &str) -> Self {
        Self {
            key: derive_key(master_key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        seal(&self.key, plaintext)
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, VaultError> {
        open(&self.key, envelope)
    }
}

fn derive_key(master_key: &str) -> [u8; 32] {
    if master_key.len() == 64 && master_key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        if let Ok(bytes) = hex::decode(master_key) {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return key;
        }
    }

    if let Ok(bytes) = base64::decode(master_key) {
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return key;
        }
    }

    sha256::Hash::hash(master_key.as_bytes()).to_byte_array()
}

/// Encrypt `plaintext` under `key` into a fresh envelope.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    // aes-gcm appends the tag to the ciphertext; the envelope wants it up front
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .expect("aes-gcm encryption is infallible for in-memory buffers");
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    let mut envelope = Vec::with_capacity(HEADER_LEN + sealed.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.push(IV_LEN as u8);
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&tag);
    envelope.extend_from_slice(&sealed);
    envelope
}

/// Decrypt an envelope produced by [`seal`].
pub fn open(key: &[u8; 32], envelope: &[u8]) -> Result<Vec<u8>, VaultError> {
    if envelope.len() < HEADER_LEN {
        return Err(VaultError::Truncated(envelope.len()));
    }
    if envelope[0] != ENVELOPE_VERSION {
        return Err(VaultError::BadVersion(envelope[0]));
    }
    if envelope[1] as usize != IV_LEN {
        return Err(VaultError::BadIvLength(envelope[1]));
    }

    let iv = &envelope[2..2 + IV_LEN];
    let tag = &envelope[2 + IV_LEN..HEADER_LEN];
    let ciphertext = &envelope[HEADER_LEN..];

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_slice())
        .map_err(|_| VaultError::AuthFailure)
}
