//! Utilities Module
//!
//! Configuration, logging and secret sealing shared across the crate.

pub mod chain_params;
pub mod logging;
pub mod secret_box;
pub mod wallet_config;

pub use chain_params::ChainParams;
pub use secret_box::{KdfParams, KdfSettings, KeyEncryptionKey, SealedSecret};
pub use wallet_config::WalletSettings;
