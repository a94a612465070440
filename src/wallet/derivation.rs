//! HD Key Derivation
//!
//! Paths follow `m/purpose'/coin_type'/account'/change/index`. Plain key-hash
//! keys use the baseline purpose with non-hardened change and index; every
//! script purpose is derived fully hardened so a leaked child key cannot be
//! combined with an xpub to walk the script chains.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{Secp256k1, SecretKey, Signing};
use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{WalletError, WalletResult};

/// Purpose codes per key role
pub mod purposes {
    pub const PUB_KEY_HASH: u32 = 84;
    pub const MULTI_SIG: u32 = 94;
    pub const COLD_STAKING_HOT: u32 = 104;
    pub const COLD_STAKING_COLD: u32 = 114;
}

/// BIP-39 seed length
pub const SEED_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    PubKeyHash,
    MultiSig,
    ColdStakingHot,
    ColdStakingCold,
}

impl KeyPurpose {
    pub fn code(&self) -> u32 {
        match self {
            KeyPurpose::PubKeyHash => purposes::PUB_KEY_HASH,
            KeyPurpose::MultiSig => purposes::MULTI_SIG,
            KeyPurpose::ColdStakingHot => purposes::COLD_STAKING_HOT,
            KeyPurpose::ColdStakingCold => purposes::COLD_STAKING_COLD,
        }
    }

    /// Script purposes always derive hardened
    pub fn always_hardened(&self) -> bool {
        !matches!(self, KeyPurpose::PubKeyHash)
    }
}

/// Provenance of an HD key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdPath {
    pub purpose: KeyPurpose,
    pub coin_type: u32,
    pub account: u32,
    /// 0 = external, 1 = change
    pub change: u32,
    pub index: u32,
    pub hardened: bool,
}

impl HdPath {
    pub fn new(purpose: KeyPurpose, coin_type: u32, account: u32, change: u32, index: u32) -> Self {
        Self {
            purpose,
            coin_type,
            account,
            change,
            index,
            hardened: purpose.always_hardened(),
        }
    }

    pub fn is_change(&self) -> bool {
        self.change == 1
    }

    pub fn to_derivation_path(&self) -> WalletResult<DerivationPath> {
        let tail = |i: u32| {
            if self.hardened {
                ChildNumber::from_hardened_idx(i)
            } else {
                ChildNumber::from_normal_idx(i)
            }
        };
        let components = vec![
            ChildNumber::from_hardened_idx(self.purpose.code())?,
            ChildNumber::from_hardened_idx(self.coin_type)?,
            ChildNumber::from_hardened_idx(self.account)?,
            tail(self.change)?,
            tail(self.index)?,
        ];
        Ok(DerivationPath::from(components))
    }
}

impl fmt::Display for HdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.hardened { "'" } else { "" };
        write!(
            f,
            "m/{}'/{}'/{}'/{}{}/{}{}",
            self.purpose.code(),
            self.coin_type,
            self.account,
            self.change,
            mark,
            self.index,
            mark
        )
    }
}

/// Reject seeds that cannot have come from a real mnemonic
pub fn validate_seed(seed: &[u8]) -> WalletResult<()> {
    if seed.len() != SEED_LEN {
        return Err(WalletError::decryption_failed(format!(
            "Decrypted seed has {} bytes, expected {}",
            seed.len(),
            SEED_LEN
        )));
    }
    let first = seed[0];
    if seed.iter().all(|b| *b == first) {
        return Err(WalletError::decryption_failed("Decrypted seed is degenerate"));
    }
    Ok(())
}

pub fn master_from_seed(seed: &[u8], network: NetworkKind) -> WalletResult<Xpriv> {
    validate_seed(seed)?;
    Ok(Xpriv::new_master(network, seed)?)
}

pub fn derive_secret_key<C: Signing>(
    secp: &Secp256k1<C>,
    master: &Xpriv,
    path: &HdPath,
) -> WalletResult<SecretKey> {
    let child = master.derive_priv(secp, &path.to_derivation_path()?)?;
    Ok(child.private_key)
}
