//! Chain Parameters
//!
//! Immutable per-network constants. One `Arc<ChainParams>` is built at
//! startup and handed to every component; nothing reads network constants
//! from global state.

use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};

use crate::error::{WalletError, WalletResult};

/// Consensus and encoding constants for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Network name: "main", "test" or "regtest"
    pub network: String,
    /// Coin ticker; lower-cased it forms the wallet file extension
    pub coin_ticker: String,
    /// Human-readable part of Bech32 addresses
    pub bech32_hrp: String,
    /// SLIP-44 coin type used as the second HD path component
    pub coin_type: u32,
    /// WIF prefix family (mainnet or test)
    pub wif_mainnet: bool,
    /// Version stamped on wallet-built transactions
    pub tx_version: i32,
    /// Confirmations before coinbase/coinstake outputs can be spent
    pub coinbase_maturity: u32,
    /// Confirmations before any output may stake; also the reorg-safety margin
    pub stake_min_confirmations: u32,
    /// Target block spacing in seconds
    pub target_spacing_secs: u32,
    /// Mask applied to timestamps to quantize staking slots (2^n - 1)
    pub stake_timestamp_mask: u32,
    /// Funding-transaction version whose recorded time enters the kernel
    /// hash. `None` disables the legacy branch.
    pub legacy_kernel_time_tx_version: Option<i32>,
    /// Dust threshold as a multiple of the minimum possible fee
    pub dust_multiplier: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            network: "main".to_string(),
            coin_ticker: "STK".to_string(),
            bech32_hrp: "stk".to_string(),
            coin_type: 105,
            wif_mainnet: true,
            tx_version: 2,
            coinbase_maturity: 50,
            stake_min_confirmations: 500,
            target_spacing_secs: 64,
            stake_timestamp_mask: 15,
            legacy_kernel_time_tx_version: Some(1),
            dust_multiplier: 5,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: "test".to_string(),
            coin_ticker: "TSTK".to_string(),
            bech32_hrp: "tstk".to_string(),
            coin_type: 1,
            wif_mainnet: false,
            coinbase_maturity: 10,
            stake_min_confirmations: 20,
            ..Self::mainnet()
        }
    }

    /// Short maturities so a few hundred blocks exercise every rule
    pub fn regtest() -> Self {
        Self {
            network: "regtest".to_string(),
            coin_ticker: "RSTK".to_string(),
            bech32_hrp: "rstk".to_string(),
            coin_type: 1,
            wif_mainnet: false,
            coinbase_maturity: 5,
            stake_min_confirmations: 10,
            ..Self::mainnet()
        }
    }

    pub fn for_network(network: &str) -> WalletResult<Self> {
        match network.to_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::mainnet()),
            "test" | "testnet" => Ok(Self::testnet()),
            "regtest" => Ok(Self::regtest()),
            other => Err(WalletError::invalid_input(format!("Unknown network: {}", other))),
        }
    }

    /// Parse overrides; omitted fields take mainnet values
    pub fn from_json(json: &str) -> WalletResult<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.bech32_hrp.is_empty() || self.bech32_hrp.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(WalletError::invalid_input("bech32_hrp must be non-empty lower case"));
        }
        if self.coin_ticker.is_empty() {
            return Err(WalletError::invalid_input("coin_ticker must not be empty"));
        }
        if (self.stake_timestamp_mask & (self.stake_timestamp_mask.wrapping_add(1))) != 0 {
            return Err(WalletError::invalid_input("stake_timestamp_mask must be 2^n - 1"));
        }
        if self.target_spacing_secs == 0 {
            return Err(WalletError::invalid_input("target_spacing_secs must be positive"));
        }
        Ok(())
    }

    pub fn network_kind(&self) -> NetworkKind {
        if self.wif_mainnet {
            NetworkKind::Main
        } else {
            NetworkKind::Test
        }
    }

    /// Extension embedded in wallet file names, e.g. `rstkwallet`
    pub fn wallet_extension(&self) -> String {
        format!("{}wallet", self.coin_ticker.to_lowercase())
    }

    /// Floor a timestamp to the start of its staking slot
    pub fn slot_time(&self, time: u32) -> u32 {
        time & !self.stake_timestamp_mask
    }

    /// Length of one staking slot in seconds
    pub fn slot_length(&self) -> u32 {
        self.stake_timestamp_mask + 1
    }
}
