//! Secret Sealing with Authenticated Encryption
//!
//! Every secret the wallet persists (HD seed, private keys, the passphrase
//! challenge) is sealed with:
//! - Argon2id to stretch the passphrase into a key-encryption key
//! - AES-256-GCM with a fresh random nonce per secret
//!
//! The Argon2 salt and cost parameters live once in the wallet file, so an
//! operation stretches the passphrase a single time and then opens as many
//! secrets as it needs.

#![allow(deprecated)] // GenericArray::from_slice deprecated in generic-array 1.x

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{WalletError, WalletResult};

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Key derivation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Time cost (iterations)
    pub time_cost: u32,
    /// Parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // 64 MiB memory, 3 iterations, 4 parallel lanes
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Minimal cost parameters; only for tests and throwaway regtest wallets.
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 64,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Wallet-wide KDF settings stored next to the sealed secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfSettings {
    /// Salt (32 bytes, base64)
    pub salt: String,
    pub params: KdfParams,
}

impl KdfSettings {
    pub fn generate(params: KdfParams) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            salt: base64_encode(&salt),
            params,
        }
    }
}

/// A secret sealed under a key-encryption key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Nonce used for encryption (12 bytes, base64)
    pub nonce: String,
    /// Encrypted data (ciphertext + auth tag, base64)
    pub ciphertext: String,
}

/// Passphrase-derived AES-256 key. Zeroized on drop.
pub struct KeyEncryptionKey {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyEncryptionKey([REDACTED])")
    }
}

impl KeyEncryptionKey {
    /// Stretch a passphrase with the wallet's salt. CPU and memory heavy;
    /// callers run this before taking the wallet lock.
    pub fn derive(passphrase: &SecretString, settings: &KdfSettings) -> WalletResult<Self> {
        let salt = base64_decode(&settings.salt)?;
        if salt.len() != SALT_LEN {
            return Err(WalletError::invalid_input("Invalid KDF salt length"));
        }
        let key = derive_key(passphrase.expose_secret(), &salt, &settings.params)?;
        Ok(Self { key })
    }

    /// Seal plaintext with a fresh random nonce
    pub fn seal(&self, plaintext: &[u8]) -> WalletResult<SealedSecret> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| WalletError::crypto_error(format!("Failed to create cipher: {}", e)))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| WalletError::crypto_error(format!("Encryption failed: {}", e)))?;

        Ok(SealedSecret {
            nonce: base64_encode(&nonce_bytes),
            ciphertext: base64_encode(&ciphertext),
        })
    }

    /// Open a sealed secret. A wrong passphrase fails the GCM tag check and
    /// never yields plaintext.
    pub fn open(&self, sealed: &SealedSecret) -> WalletResult<Zeroizing<Vec<u8>>> {
        let nonce_bytes = base64_decode(&sealed.nonce)?;
        let ciphertext = base64_decode(&sealed.ciphertext)?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(WalletError::decryption_failed("Invalid nonce length"));
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| WalletError::crypto_error(format!("Failed to create cipher: {}", e)))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| WalletError::wrong_passphrase())?;

        Ok(Zeroizing::new(plaintext))
    }
}

/// Derive encryption key from passphrase using Argon2id
fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> WalletResult<Zeroizing<[u8; 32]>> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let argon2_params = Params::new(params.memory_cost, params.time_cost, params.parallelism, Some(32))
        .map_err(|e| WalletError::crypto_error(format!("Invalid KDF params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| WalletError::crypto_error(format!("Key derivation failed: {}", e)))?;

    Ok(key)
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(s: &str) -> WalletResult<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| WalletError::parse_error(format!("Invalid base64: {}", e)))
}
