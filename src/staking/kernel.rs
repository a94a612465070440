//! Proof-of-stake kernel arithmetic
//!
//! A coin wins a slot when
//!
//! ```text
//! sha256d(modifier || [legacy_time] || prevout_txid || prevout_index || slot_time)
//!     <= target * value
//! ```
//!
//! with the hash read as a little-endian 256-bit integer and the product
//! held in 320 bits.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::pow::Target;
use bitcoin::{OutPoint, Txid};

use crate::utils::ChainParams;

/// `sha256d(kernel || previous_modifier)`
pub fn stake_modifier(kernel: &[u8; 32], previous_modifier: &[u8; 32]) -> [u8; 32] {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(kernel);
    data[32..].copy_from_slice(previous_modifier);
    sha256d::Hash::hash(&data).to_byte_array()
}

/// Kernel hash of one coin for one slot.
///
/// `legacy_time` is the funding transaction's recorded time. It is only
/// present for coins funded by the legacy transaction version, where the
/// consensus rules still mix it into the hash.
pub fn kernel_hash(modifier: &[u8; 32], legacy_time: Option<u32>, prevout: &OutPoint, slot_time: u32) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + 4 + 32 + 4 + 4);
    data.extend_from_slice(modifier);
    if let Some(time) = legacy_time {
        data.extend_from_slice(&time.to_le_bytes());
    }
    data.extend_from_slice(&prevout.txid.to_byte_array());
    data.extend_from_slice(&prevout.vout.to_le_bytes());
    data.extend_from_slice(&slot_time.to_le_bytes());
    sha256d::Hash::hash(&data).to_byte_array()
}

/// Kernel hash for a coin funded by a transaction of `tx_version`.
///
/// Coins funded by the legacy version hash in the funding transaction's
/// recorded time from the node's coin view; without one the coin cannot
/// stake and this returns `None`.
pub fn coin_kernel_hash(
    params: &ChainParams,
    modifier: &[u8; 32],
    tx_version: i32,
    prevout: &OutPoint,
    slot_time: u32,
    coin_time: impl Fn(&Txid) -> Option<u32>,
) -> Option<[u8; 32]> {
    let legacy_time = if params.legacy_kernel_time_tx_version == Some(tx_version) {
        Some(coin_time(&prevout.txid)?)
    } else {
        None
    };
    Some(kernel_hash(modifier, legacy_time, prevout, slot_time))
}

/// `hash <= target * value` without overflow
pub fn check_kernel(hash: &[u8; 32], target: &Target, value: u64) -> bool {
    let hash = limbs(hash);
    let weighted = mul_u64(&limbs(&target.to_le_bytes()), value);
    if weighted[4] != 0 {
        return true;
    }
    for i in (0..4).rev() {
        if hash[i] != weighted[i] {
            return hash[i] < weighted[i];
        }
    }
    true
}

/// Total stake, in satoshis, that finds one block per target spacing on
/// average: `2^256 / target * slot_length / spacing`
pub fn network_weight(params: &ChainParams, target: &Target) -> f64 {
    let target = to_f64(&limbs(&target.to_le_bytes()));
    if target <= 0.0 {
        return 0.0;
    }
    2f64.powi(256) / target * params.slot_length() as f64 / params.target_spacing_secs as f64
}

/// Expected seconds until this wallet stakes, or `None` without weight
pub fn expected_time_to_stake(params: &ChainParams, network_weight: f64, own_weight: u64) -> Option<u64> {
    if own_weight == 0 || network_weight <= 0.0 {
        return None;
    }
    Some((params.target_spacing_secs as f64 * network_weight / own_weight as f64).round() as u64)
}

fn limbs(le: &[u8; 32]) -> [u64; 4] {
    let mut out = [0u64; 4];
    for (i, chunk) in le.chunks_exact(8).enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        out[i] = u64::from_le_bytes(word);
    }
    out
}

fn mul_u64(a: &[u64; 4], b: u64) -> [u64; 5] {
    let mut out = [0u64; 5];
    let mut carry = 0u128;
    for i in 0..4 {
        let product = a[i] as u128 * b as u128 + carry;
        out[i] = product as u64;
        carry = product >> 64;
    }
    out[4] = carry as u64;
    out
}

fn to_f64(limbs: &[u64; 4]) -> f64 {
    limbs
        .iter()
        .enumerate()
        .map(|(i, &limb)| limb as f64 * 2f64.powi(64 * i as i32))
        .sum()
}
