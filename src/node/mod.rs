//! Consensus Node Interface
//!
//! Everything the wallet consumes from the full node: chain tip, block
//! templates, fee policy, the coin-time view used by the legacy kernel
//! branch, block submission and transaction broadcast.

pub mod memory;

pub use memory::InMemoryNode;

use bitcoin::pow::CompactTarget;
use bitcoin::{Block, BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{WalletError, WalletResult};
use crate::fees::FeeRate;

/// Tip of the active chain plus the inputs of the next stake modifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u32,
    /// Kernel of the tip block: the staked prevout txid, or the block hash
    /// for blocks without a coinstake
    pub kernel: [u8; 32],
    /// Stake modifier in force before the tip
    pub previous_stake_modifier: [u8; 32],
}

/// Work for the next block
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub height: u32,
    pub previous_block_hash: BlockHash,
    pub bits: CompactTarget,
    pub block_version: i32,
    /// Transactions to include after the coinstake
    pub transactions: Vec<Transaction>,
    pub total_fees: u64,
    pub stake_reward: u64,
}

/// A PoS block and the staker's signature over its hash
#[derive(Debug, Clone)]
pub struct StakedBlock {
    pub block: Block,
    /// DER signature by the key published in the coinstake
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockRejection {
    /// Another block already claimed this slot
    #[error("Block time {time} is not after the tip time {tip_time}")]
    TimeTooEarly { time: u32, tip_time: u32 },

    #[error("Block not accepted: {0}")]
    NotAccepted(String),

    #[error("Consensus error: {0}")]
    Consensus(String),
}

impl From<BlockRejection> for WalletError {
    fn from(e: BlockRejection) -> Self {
        WalletError::consensus_rejected(e.to_string())
    }
}

/// Synchronous boundary to the consensus engine
pub trait ChainNode: Send + Sync {
    fn chain_tip(&self) -> WalletResult<ChainTip>;

    /// Block on the active chain at `height`, if any
    fn block_at(&self, height: u32) -> WalletResult<Option<Block>>;

    fn block_template(&self) -> WalletResult<BlockTemplate>;

    /// Fee-rate policy for wallet transactions
    fn minimum_fee_rate(&self) -> WalletResult<FeeRate>;

    /// Network-adjusted unix time
    fn adjusted_time(&self) -> u32;

    /// Recorded time of a confirmed transaction, from the coin view
    fn coin_time(&self, txid: &Txid) -> Option<u32>;

    fn submit_block(&self, block: StakedBlock) -> Result<BlockHash, BlockRejection>;

    /// Relay a signed transaction. Policy failures come back as
    /// `ConsensusRejected`.
    fn broadcast(&self, tx: &Transaction) -> WalletResult<Txid>;

    /// Directory holding wallet and metadata files
    fn wallet_dir(&self) -> PathBuf;
}
