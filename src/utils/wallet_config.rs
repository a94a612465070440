//! Wallet behaviour settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::secret_box::KdfParams;
use crate::error::{WalletError, WalletResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSettings {
    /// Addresses pre-derived per chain at creation and the change buffer's
    /// high-water mark
    pub gap_limit: u32,
    /// Refill the change buffer when fewer unused change addresses remain
    pub change_buffer_low: u32,
    /// Hard cap on addresses per (purpose, account, change) chain
    pub max_addresses_per_chain: u32,
    pub kdf: KdfParams,
    /// Staking loop wait between slot checks
    pub staking_poll_interval_ms: u64,
    /// Upper bound on fee fixed-point iterations
    pub fee_loop_max_iterations: u32,
    /// Re-sign every transaction with the reference signer and compare
    pub verify_signatures: bool,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            gap_limit: 20,
            change_buffer_low: 5,
            max_addresses_per_chain: 10_000,
            kdf: KdfParams::default(),
            staking_poll_interval_ms: 1_000,
            fee_loop_max_iterations: 32,
            verify_signatures: true,
        }
    }
}

impl WalletSettings {
    /// Cheap KDF and a fast poll; never for real funds.
    pub fn for_tests() -> Self {
        Self {
            gap_limit: 5,
            change_buffer_low: 2,
            max_addresses_per_chain: 1_000,
            kdf: KdfParams::insecure_fast(),
            staking_poll_interval_ms: 20,
            fee_loop_max_iterations: 32,
            verify_signatures: true,
        }
    }

    pub fn from_json(json: &str) -> WalletResult<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.gap_limit == 0 {
            return Err(WalletError::invalid_input("gap_limit must be positive"));
        }
        if self.change_buffer_low > self.gap_limit {
            return Err(WalletError::invalid_input("change_buffer_low must not exceed gap_limit"));
        }
        if self.max_addresses_per_chain < self.gap_limit {
            return Err(WalletError::invalid_input("max_addresses_per_chain must be at least gap_limit"));
        }
        if self.fee_loop_max_iterations == 0 {
            return Err(WalletError::invalid_input("fee_loop_max_iterations must be positive"));
        }
        Ok(())
    }

    pub fn staking_poll_interval(&self) -> Duration {
        Duration::from_millis(self.staking_poll_interval_ms)
    }
}
