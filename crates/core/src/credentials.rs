//! At-rest protection for the third-party API key attached to a batch.
//!
//! Keys are sealed with AES-256-GCM under a process-wide master key. Each
//! seal uses a fresh random 96-bit nonce. Opened plaintext is returned as
//! [`Zeroizing`] so it is wiped as soon as the caller drops it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential key must be {KEY_LEN} bytes, got {0}")]
    MalformedKey(usize),

    #[error("Credential key is not valid hex")]
    InvalidKeyEncoding,

    #[error("Credential nonce must be {NONCE_LEN} bytes, got {0}")]
    MalformedNonce(usize),

    /// Tag verification failed: wrong key, or ciphertext/nonce was altered.
    #[error("Credential authentication failed")]
    Authentication,

    #[error("Credential encryption failed")]
    Encryption,

    #[error("Credential plaintext is not valid UTF-8")]
    Encoding,
}

// ---------------------------------------------------------------------------
// Sealed credential
// ---------------------------------------------------------------------------

/// An encrypted API key plus the nonce it was sealed with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredential {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl std::fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedCredential")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("nonce_len", &self.nonce.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Seals and opens batch credentials with a single master key.
#[derive(Clone)]
pub struct CredentialVault {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault { .. }")
    }
}

impl CredentialVault {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Build a vault from a 64-character hex master key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CredentialError> {
        let bytes = Zeroizing::new(hex::decode(hex_key.trim())?);
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CredentialError::MalformedKey(bytes.len()))?;
        Ok(Self::new(key))
    }

    /// Seal `plaintext` under the vault key with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedCredential, CredentialError> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|_| CredentialError::MalformedKey(self.key.len()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CredentialError::Encryption)?;

        Ok(SealedCredential {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    /// Open a credential sealed by this vault.
    pub fn open(&self, sealed: &SealedCredential) -> Result<Zeroizing<String>, CredentialError> {
        Self::decrypt(&sealed.ciphertext, &sealed.nonce, self.key.as_slice())
    }

    /// Decrypt with an explicit key.
    ///
    /// Fails with [`CredentialError::Authentication`] when the GCM tag does
    /// not verify, which covers both a wrong key and any mutation of the
    /// ciphertext or nonce.
    pub fn decrypt(
        ciphertext: &[u8],
        nonce: &[u8],
        key: &[u8],
    ) -> Result<Zeroizing<String>, CredentialError> {
        if key.len() != KEY_LEN {
            return Err(CredentialError::MalformedKey(key.len()));
        }
        if nonce.len() != NONCE_LEN {
            return Err(CredentialError::MalformedNonce(nonce.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CredentialError::MalformedKey(key.len()))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CredentialError::Authentication)?,
        );

        match std::str::from_utf8(&plaintext) {
            Ok(text) => Ok(Zeroizing::new(text.to_owned())),
            Err(_) => Err(CredentialError::Encoding),
        }
    }
}

// ---------------------------------------------------------------------------
// hex decoding helper (no extra dep)
// ---------------------------------------------------------------------------

mod hex {
    use super::CredentialError;

    /// Decode a hex string (either case) into bytes.
    pub fn decode(input: &str) -> Result<Vec<u8>, CredentialError> {
        if input.len() % 2 != 0 {
            return Err(CredentialError::InvalidKeyEncoding);
        }
        input
            .as_bytes()
            .chunks(2)
            .map(|pair| -> Result<u8, CredentialError> {
                Ok((nibble(pair[0])? << 4) | nibble(pair[1])?)
            })
            .collect()
    }

    fn nibble(c: u8) -> Result<u8, CredentialError> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(CredentialError::InvalidKeyEncoding),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
