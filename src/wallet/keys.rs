//! Encrypted key material
//!
//! Private keys never touch disk in the clear. A `KeyMaterial` holds the
//! compressed public key plus the AES-GCM sealed secret; opening it requires
//! the key-encryption key derived from the wallet passphrase.

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{CompressedPublicKey, NetworkKind, PrivateKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::derivation::HdPath;
use crate::error::{WalletError, WalletResult};
use crate::utils::secret_box::{KeyEncryptionKey, SealedSecret};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMaterialKind {
    Hd,
    Generated,
    Imported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub kind: KeyMaterialKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd_path: Option<HdPath>,
    /// Compressed public key (hex)
    pub public_key: String,
    pub encrypted_private_key: SealedSecret,
    pub created_utc: i64,
}

impl KeyMaterial {
    pub fn seal(
        kind: KeyMaterialKind,
        hd_path: Option<HdPath>,
        secret: &SecretKey,
        kek: &KeyEncryptionKey,
    ) -> WalletResult<Self> {
        let secp = Secp256k1::signing_only();
        let public_key = CompressedPublicKey(secret.public_key(&secp));
        let secret_bytes = Zeroizing::new(secret.secret_bytes());
        Ok(Self {
            kind,
            hd_path,
            public_key: hex::encode(public_key.to_bytes()),
            encrypted_private_key: kek.seal(secret_bytes.as_ref())?,
            created_utc: chrono::Utc::now().timestamp(),
        })
    }

    pub fn public_key(&self) -> WalletResult<CompressedPublicKey> {
        let bytes = hex::decode(&self.public_key)?;
        Ok(CompressedPublicKey::from_slice(&bytes)?)
    }

    /// Open the sealed private key and check it still matches the public key
    pub fn decrypt(&self, kek: &KeyEncryptionKey) -> WalletResult<SecretKey> {
        let plaintext = kek.open(&self.encrypted_private_key)?;
        if plaintext.len() != 32 {
            return Err(WalletError::decryption_failed("Decrypted key has wrong length"));
        }
        let secret = SecretKey::from_slice(&plaintext)?;

        let secp = Secp256k1::signing_only();
        if CompressedPublicKey(secret.public_key(&secp)) != self.public_key()? {
            return Err(WalletError::inconsistent("Decrypted key does not match stored public key"));
        }
        Ok(secret)
    }

    pub fn to_wif(&self, kek: &KeyEncryptionKey, network: NetworkKind) -> WalletResult<Zeroizing<String>> {
        let secret = self.decrypt(kek)?;
        Ok(Zeroizing::new(PrivateKey::new(secret, network).to_wif()))
    }

    pub fn path_string(&self) -> Option<String> {
        self.hd_path.as_ref().map(|p| p.to_string())
    }
}
