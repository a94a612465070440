//! Ledger Module
//!
//! The wallet-relevant view of the chain: one `BlockMetadata` per block that
//! touched the wallet, plus the unconfirmed pool and the sync checkpoint.
//! Persisted next to the wallet file as `<name>.<ticker>wallet.metadata.json`.

pub mod mempool;
pub mod scanner;

pub use mempool::{BroadcastState, MemoryPool, MemoryPoolEntry};
pub use scanner::ChainScanner;

use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{WalletError, WalletResult};
use crate::utils::ChainParams;
use crate::wallet::wallet_file::write_json_atomic;
use crate::wallet::WalletFile;
use crate::{log_debug, log_warn};

pub const METADATA_FILE_VERSION: u32 = 1;

/// `"<txid>-<index>"`
pub fn utxo_key(txid: &Txid, index: u32) -> String {
    format!("{}-{}", txid, index)
}

/// PoS coinstake shape: not coinbase, first output is the empty marker
pub fn is_coinstake(tx: &Transaction) -> bool {
    !tx.is_coinbase()
        && !tx.input.is_empty()
        && tx.output.len() >= 2
        && tx.output[0].value.to_sat() == 0
        && tx.output[0].script_pubkey.is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoMetadata {
    pub address: String,
    pub hash: Txid,
    pub index: u32,
    pub satoshis: u64,
}

impl UtxoMetadata {
    pub fn key(&self) -> String {
        utxo_key(&self.hash, self.index)
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.hash, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Coinbase,
    Coinstake,
    /// Coinstake spending a cold-staking output
    ColdCoinstake,
    Receive,
    Spend,
    SpendWithoutChange,
    WithinWallet,
}

impl TxType {
    /// Outputs of these need `coinbase_maturity` confirmations to spend
    pub fn is_reward(&self) -> bool {
        matches!(self, TxType::Coinbase | TxType::Coinstake | TxType::ColdCoinstake)
    }

    /// Fixed decision table over what the scan found
    pub fn classify(
        is_coinbase: bool,
        is_coinstake: bool,
        spends_cold_staking: bool,
        has_received: bool,
        has_spent: bool,
        has_unowned_outputs: bool,
    ) -> WalletResult<TxType> {
        if !has_received && !has_spent {
            return Err(WalletError::inconsistent(
                "Transaction has neither received nor spent wallet outputs",
            ));
        }
        if is_coinbase {
            return Ok(TxType::Coinbase);
        }
        if is_coinstake {
            return Ok(if spends_cold_staking {
                TxType::ColdCoinstake
            } else {
                TxType::Coinstake
            });
        }
        Ok(match (has_received, has_spent, has_unowned_outputs) {
            (true, false, _) => TxType::Receive,
            (true, true, false) => TxType::WithinWallet,
            (true, true, true) => TxType::Spend,
            _ => TxType::SpendWithoutChange,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub hash: Txid,
    pub tx_type: TxType,
    pub tx_version: i32,
    #[serde(default)]
    pub received: BTreeMap<String, UtxoMetadata>,
    #[serde(default)]
    pub spent: BTreeMap<String, UtxoMetadata>,
    /// Unowned outputs of transactions the wallet paid into
    #[serde(default)]
    pub destinations: BTreeMap<String, UtxoMetadata>,
}

impl TransactionMetadata {
    pub fn total_received(&self) -> u64 {
        self.received.values().map(|u| u.satoshis).sum()
    }

    pub fn total_spent(&self) -> u64 {
        self.spent.values().map(|u| u.satoshis).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u32,
    pub transactions: Vec<TransactionMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFile {
    pub version: u32,
    pub wallet_name: String,
    pub wallet_id: String,
    #[serde(default)]
    pub sync_height: Option<u32>,
    #[serde(default)]
    pub sync_hash: Option<BlockHash>,
    #[serde(default)]
    pub blocks: BTreeMap<u32, BlockMetadata>,
    #[serde(default)]
    pub memory_pool: MemoryPool,
}

impl MetadataFile {
    pub fn new(wallet: &WalletFile) -> Self {
        Self {
            version: METADATA_FILE_VERSION,
            wallet_name: wallet.wallet_name.clone(),
            wallet_id: wallet.wallet_id.clone(),
            sync_height: None,
            sync_hash: None,
            blocks: BTreeMap::new(),
            memory_pool: MemoryPool::default(),
        }
    }

    /// Height the next sync should fetch
    pub fn next_height(&self) -> u32 {
        self.sync_height.map(|h| h + 1).unwrap_or(0)
    }

    /// Store a scanned block and advance the checkpoint. Mempool entries that
    /// confirmed, or that spend an outpoint this block spent, are dropped.
    pub fn apply_block(&mut self, block: &Block, height: u32, scanned: Option<BlockMetadata>) {
        let confirmed: HashSet<Txid> = block.txdata.iter().map(|tx| tx.compute_txid()).collect();
        let spent: HashSet<OutPoint> = block
            .txdata
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
            .collect();
        let dropped = self.memory_pool.remove_confirmed(&confirmed, &spent);
        if dropped > 0 {
            log_debug!("ledger", "Mempool entries settled", height = height, dropped = dropped);
        }

        if let Some(meta) = scanned {
            self.blocks.insert(height, meta);
        }
        self.sync_height = Some(height);
        self.sync_hash = Some(block.block_hash());
    }

    /// Drop everything above `height` and move the checkpoint back
    pub fn rewind_to(&mut self, height: Option<u32>, hash: Option<BlockHash>) {
        let removed = match height {
            Some(h) => self.blocks.split_off(&(h + 1)).len(),
            None => std::mem::take(&mut self.blocks).len(),
        };
        self.sync_height = height;
        self.sync_hash = hash;
        log_warn!(
            "ledger",
            "Ledger rewound",
            height = height.map(|h| h.to_string()).unwrap_or_else(|| "genesis".to_string()),
            removed_blocks = removed
        );
    }

    /// Forget all scanned state so the next sync rescans from genesis
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.sync_height = None;
        self.sync_hash = None;
    }

    pub fn transaction(&self, txid: &Txid) -> Option<&TransactionMetadata> {
        self.blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|t| t.hash == *txid)
            .or_else(|| self.memory_pool.get(txid).map(|e| &e.transaction))
    }

    pub fn file_name(params: &ChainParams, name: &str) -> String {
        format!("{}.{}.metadata.json", name, params.wallet_extension())
    }

    pub fn path(dir: &Path, params: &ChainParams, name: &str) -> PathBuf {
        dir.join(Self::file_name(params, name))
    }

    pub fn save(&self, dir: &Path, params: &ChainParams) -> WalletResult<PathBuf> {
        let path = Self::path(dir, params, &self.wallet_name);
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Load the companion file, or start empty if it does not exist yet.
    /// A file belonging to another wallet is refused.
    pub fn load_or_new(dir: &Path, params: &ChainParams, wallet: &WalletFile) -> WalletResult<Self> {
        let path = Self::path(dir, params, &wallet.wallet_name);
        if !path.exists() {
            return Ok(Self::new(wallet));
        }
        let meta: Self = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if meta.wallet_name != wallet.wallet_name || meta.wallet_id != wallet.wallet_id {
            return Err(WalletError::wallet_file_mismatch(format!(
                "Metadata file {} belongs to another wallet",
                path.display()
            )));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        use TxType::*;
        assert_eq!(TxType::classify(false, false, false, true, false, false).unwrap(), Receive);
        assert_eq!(TxType::classify(false, false, false, true, false, true).unwrap(), Receive);
        assert_eq!(TxType::classify(false, false, false, true, true, false).unwrap(), WithinWallet);
        assert_eq!(TxType::classify(false, false, false, true, true, true).unwrap(), Spend);
        assert_eq!(TxType::classify(false, false, false, false, true, true).unwrap(), SpendWithoutChange);
        assert_eq!(TxType::classify(true, false, false, true, false, false).unwrap(), Coinbase);
        assert_eq!(TxType::classify(false, true, false, true, true, false).unwrap(), Coinstake);
        assert_eq!(TxType::classify(false, true, true, true, true, false).unwrap(), ColdCoinstake);
    }

    #[test]
    fn test_neither_is_consistency_error() {
        let err = TxType::classify(false, false, false, false, false, true).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Consistency);
    }

    #[test]
    fn test_utxo_key_format() {
        let txid: Txid = "0000000000000000000000000000000000000000000000000000000000000001".parse().unwrap();
        assert_eq!(
            utxo_key(&txid, 3),
            "0000000000000000000000000000000000000000000000000000000000000001-3"
        );
    }
}
