//! Balance Aggregation
//!
//! Folds the scanned ledger and the unconfirmed pool into totals and the
//! spendable / stakable coin sets. Always recomputed from scratch.

use bitcoin::{OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::WalletResult;
use crate::ledger::{MetadataFile, TxType, UtxoMetadata};
use crate::utils::ChainParams;
use crate::wallet::{AddressKind, KeyMaterial, WalletFile};

// =============================================================================
// Types
// =============================================================================

/// A confirmed unspent output bound to its owning address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegWitCoin {
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: String,
    pub kind: AddressKind,
    pub script_pubkey: ScriptBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<ScriptBuf>,
    pub height: u32,
    pub tx_type: TxType,
}

/// A stakable coin plus what the kernel hash and coinstake need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingCoin {
    pub coin: SegWitCoin,
    /// Version of the funding transaction
    pub tx_version: i32,
    pub block_height: u32,
    pub block_time: u32,
    /// Still sealed; decrypted only if this coin wins a slot
    pub staking_key: KeyMaterial,
}

/// Restrict aggregation to one address and/or one address kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub kind: Option<AddressKind>,
}

impl BalanceFilter {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            kind: None,
        }
    }

    pub fn kind(kind: AddressKind) -> Self {
        Self {
            address: None,
            kind: Some(kind),
        }
    }

    fn matches(&self, address: &str, kind: AddressKind) -> bool {
        self.address.as_deref().map_or(true, |a| a == address) && self.kind.map_or(true, |k| k == kind)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub total_received: u64,
    pub total_spent: u64,
    pub total_received_pending: u64,
    pub total_spent_pending: u64,
    /// `total_received - total_spent`
    pub confirmed: i64,
    /// Unconfirmed delta; negative while a send is pending
    pub pending: i64,
    /// `confirmed + pending`
    pub total: i64,
    pub spendable: u64,
    pub stakable: u64,
    pub spendable_coins: BTreeMap<String, SegWitCoin>,
    #[serde(skip)]
    pub stakable_coins: BTreeMap<String, StakingCoin>,
}

impl Balance {
    pub fn stakable_count(&self) -> usize {
        self.stakable_coins.len()
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Aggregate the ledger as seen at `tip_height`.
///
/// Confirmed blocks oldest to newest, then the mempool in arrival order, then
/// every spent key is removed from both coin sets.
pub fn compute_balance(
    params: &ChainParams,
    wallet: &WalletFile,
    metadata: &MetadataFile,
    tip_height: Option<u32>,
    filter: &BalanceFilter,
) -> WalletResult<Balance> {
    let mut balance = Balance::default();
    let mut candidates: BTreeMap<String, (SegWitCoin, i32, u32)> = BTreeMap::new();
    let mut spent_keys: HashSet<String> = HashSet::new();

    let kind_of = |utxo: &UtxoMetadata| wallet.find_address(&utxo.address).map(|a| a.kind());

    for (height, block) in &metadata.blocks {
        for tx in &block.transactions {
            for utxo in tx.received.values() {
                let Some(address) = wallet.find_address(&utxo.address) else {
                    continue;
                };
                if !filter.matches(&utxo.address, address.kind()) {
                    continue;
                }
                balance.total_received += utxo.satoshis;
                let coin = SegWitCoin {
                    outpoint: utxo.outpoint(),
                    value: utxo.satoshis,
                    address: utxo.address.clone(),
                    kind: address.kind(),
                    script_pubkey: address.script_pubkey().to_owned(),
                    redeem_script: address.redeem_script().map(|s| s.to_owned()),
                    height: *height,
                    tx_type: tx.tx_type,
                };
                candidates.insert(utxo.key(), (coin, tx.tx_version, block.time));
            }
            for utxo in tx.spent.values() {
                if kind_of(utxo).map_or(false, |k| filter.matches(&utxo.address, k)) {
                    balance.total_spent += utxo.satoshis;
                    spent_keys.insert(utxo.key());
                }
            }
        }
    }

    for entry in metadata.memory_pool.iter().filter(|e| e.counts_toward_balance()) {
        for utxo in entry.transaction.received.values() {
            if kind_of(utxo).map_or(false, |k| filter.matches(&utxo.address, k)) {
                balance.total_received_pending += utxo.satoshis;
            }
        }
        for utxo in entry.transaction.spent.values() {
            if kind_of(utxo).map_or(false, |k| filter.matches(&utxo.address, k)) {
                balance.total_spent_pending += utxo.satoshis;
                spent_keys.insert(utxo.key());
            }
        }
    }

    balance.confirmed = balance.total_received as i64 - balance.total_spent as i64;
    balance.pending = balance.total_received_pending as i64 - balance.total_spent_pending as i64;
    balance.total = balance.confirmed + balance.pending;

    for key in &spent_keys {
        candidates.remove(key);
    }

    for (key, (coin, tx_version, block_time)) in candidates {
        let confirmations = confirmations(tip_height, coin.height);
        if !is_spendable(params, coin.tx_type, confirmations) {
            continue;
        }

        if confirmations >= params.stake_min_confirmations {
            let staking_key = wallet
                .find_address(&coin.address)
                .and_then(|a| a.staking_key().cloned());
            if let Some(staking_key) = staking_key {
                balance.stakable += coin.value;
                balance.stakable_coins.insert(
                    key.clone(),
                    StakingCoin {
                        coin: coin.clone(),
                        tx_version,
                        block_height: coin.height,
                        block_time,
                        staking_key,
                    },
                );
            }
        }

        balance.spendable += coin.value;
        balance.spendable_coins.insert(key, coin);
    }

    Ok(balance)
}

/// Depth of a block at `height` when the tip is `tip_height`
pub fn confirmations(tip_height: Option<u32>, height: u32) -> u32 {
    match tip_height {
        Some(tip) if tip >= height => tip - height + 1,
        _ => 0,
    }
}

/// Confirmed, and past coinbase maturity for reward outputs
pub fn is_spendable(params: &ChainParams, tx_type: TxType, confirmations: u32) -> bool {
    confirmations > 0 && (!tx_type.is_reward() || confirmations >= params.coinbase_maturity)
}

// =============================================================================
// Tests
// =============================================================================
