//! Shared types for stakewallet
//!
//! Requests and results that cross the command boundary. Everything here is
//! plain serde data; secrets travel as strings only for as long as the
//! command takes and are zeroized with the value.

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::balances::Balance;
use crate::error::WalletError;
use crate::ledger::{BroadcastState, TxType, UtxoMetadata};
use crate::staking::StakingStatus;
use crate::tx::{Burn, ChangeOutput, Payment, SpendFrom};

// =============================================================================
// Requests
// =============================================================================

/// A send from one of the three address kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub from: SpendFrom,
    #[serde(default)]
    pub recipients: Vec<Payment>,
    #[serde(default)]
    pub burns: Vec<Burn>,
    /// sat/vB; the node's minimum is used when absent or lower
    #[serde(default)]
    pub fee_rate: Option<u64>,
    #[serde(default)]
    pub sign: bool,
    #[serde(default)]
    pub broadcast: bool,
}

// =============================================================================
// Results
// =============================================================================

/// Returned once by wallet creation; the mnemonic is never stored in clear
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CreatedWallet {
    pub wallet_name: String,
    pub wallet_id: String,
    pub mnemonic: String,
    pub receive_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressCounts {
    pub pub_key_hash: usize,
    pub multi_sig: usize,
    pub cold_staking: usize,
    pub unused_change: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInfo {
    pub wallet_name: String,
    pub wallet_id: String,
    pub network: String,
    pub sync_height: Option<u32>,
    pub sync_hash: Option<BlockHash>,
    pub addresses: AddressCounts,
    pub balance: Balance,
    pub staking: StakingStatus,
}

/// One wallet transaction, newest first in history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub tx_type: TxType,
    /// `None` while unconfirmed
    pub height: Option<u32>,
    pub time: Option<i64>,
    pub received: u64,
    pub spent: u64,
    /// `received - spent`
    pub net: i64,
    pub destinations: Vec<UtxoMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_state: Option<BroadcastState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub fee: u64,
    pub fee_rate: u64,
    pub virtual_size: u64,
    pub total_send: u64,
    pub input_count: usize,
    pub change: Option<ChangeOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltTransaction {
    pub txid: Txid,
    pub hex: String,
    pub fee: u64,
    pub fee_rate: u64,
    pub virtual_size: u64,
    pub total_send: u64,
    pub change: Option<ChangeOutput>,
    pub signed: bool,
    /// False when a multisig input still needs co-signer signatures
    pub complete: bool,
    pub broadcast: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub from_height: u32,
    pub tip_height: u32,
    pub blocks_scanned: u32,
    pub relevant_blocks: u32,
    /// Checkpoint the ledger was rewound to after a reorg
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewound_to: Option<u32>,
}

// =============================================================================
// Response envelope
// =============================================================================

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<WalletError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: WalletError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"data":null,"error":{"code":"internal","message":"Serialization failed"}}"#.to_string()
        })
    }
}
