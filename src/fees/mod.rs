//! Fee Module
//!
//! Fee rates, virtual-size estimation with witness placeholders, and the
//! dust threshold derived from the minimum possible fee.

use bitcoin::{Script, Transaction, Witness};
use serde::{Deserialize, Serialize};

use crate::error::{WalletError, WalletResult};
use crate::wallet::address::parse_multisig_redeem_script;

/// vsize of the smallest useful transaction: one P2WPKH input, one P2WPKH output
pub const MIN_TX_VSIZE: u64 = 110;

/// Placeholder DER signature with sighash byte (worst case)
pub const SIGNATURE_PLACEHOLDER_LEN: usize = 73;

/// Compressed public key length
pub const PUBKEY_LEN: usize = 33;

/// Highest fee rate a request may ask for (sat/vB)
pub const MAX_FEE_RATE: u64 = 100_000;

/// Fee rate in satoshis per virtual byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeRate(u64);

impl FeeRate {
    pub const MIN: FeeRate = FeeRate(1);

    pub fn from_sat_per_vb(rate: u64) -> WalletResult<Self> {
        if rate == 0 {
            return Err(WalletError::invalid_input("Fee rate must be at least 1 sat/vB"));
        }
        if rate > MAX_FEE_RATE {
            return Err(WalletError::invalid_input(format!(
                "Fee rate {} sat/vB exceeds the limit of {}",
                rate, MAX_FEE_RATE
            )));
        }
        Ok(Self(rate))
    }

    pub fn sat_per_vb(&self) -> u64 {
        self.0
    }

    pub fn fee_for(&self, vsize: u64) -> WalletResult<u64> {
        self.0
            .checked_mul(vsize)
            .ok_or_else(|| WalletError::invalid_input(format!("Fee for {} vbytes at {} sat/vB overflows", vsize, self.0)))
    }

    pub fn minimum_possible_fee(&self) -> WalletResult<u64> {
        self.fee_for(MIN_TX_VSIZE)
    }

    /// Change below this is folded into the fee
    pub fn dust_threshold(&self, multiplier: u64) -> WalletResult<u64> {
        self.minimum_possible_fee()?
            .checked_mul(multiplier)
            .ok_or_else(|| WalletError::invalid_input("Dust threshold overflows"))
    }
}

/// Witness layout an input will carry once signed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputShape {
    /// `[sig, pubkey]`
    P2wpkh,
    /// `[<empty>, sig x signatures, redeem_script]`
    P2wsh { redeem_script_len: usize, signatures: usize },
}

impl InputShape {
    pub fn for_redeem_script(redeem_script: Option<&Script>) -> WalletResult<Self> {
        match redeem_script {
            None => Ok(InputShape::P2wpkh),
            Some(script) => {
                let (required, _) = parse_multisig_redeem_script(script)?;
                Ok(InputShape::P2wsh {
                    redeem_script_len: script.len(),
                    signatures: required,
                })
            }
        }
    }

    fn placeholder(&self) -> Witness {
        let mut witness = Witness::new();
        match self {
            InputShape::P2wpkh => {
                witness.push(vec![0u8; SIGNATURE_PLACEHOLDER_LEN]);
                witness.push(vec![0u8; PUBKEY_LEN]);
            }
            InputShape::P2wsh {
                redeem_script_len,
                signatures,
            } => {
                witness.push(Vec::<u8>::new());
                for _ in 0..*signatures {
                    witness.push(vec![0u8; SIGNATURE_PLACEHOLDER_LEN]);
                }
                witness.push(vec![0u8; *redeem_script_len]);
            }
        }
        witness
    }
}

/// Virtual size of `tx` once every input carries a worst-case witness
pub fn estimate_vsize(tx: &Transaction, shapes: &[InputShape]) -> WalletResult<u64> {
    if tx.input.len() != shapes.len() {
        return Err(WalletError::internal("Input shape count does not match inputs"));
    }
    let mut sized = tx.clone();
    for (input, shape) in sized.input.iter_mut().zip(shapes) {
        input.witness = shape.placeholder();
    }
    Ok(sized.vsize() as u64)
}
