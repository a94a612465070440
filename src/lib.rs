//! stakewallet
//!
//! Wallet core for a segwit proof-of-stake chain.
//!
//! # Architecture
//!
//! This crate provides:
//! - **wallet**: HD keys, the three address kinds and the encrypted wallet file
//! - **ledger**: chain scanning into the per-wallet metadata file
//! - **balances**: confirmed, pending, spendable and stakable aggregation
//! - **fees** / **tx**: fee estimation, coin selection and the fee loop
//! - **signing**: segwit v0 signing with a reference cross-check
//! - **staking**: kernel search, coinstake assembly and the staking thread
//! - **node**: the chain collaborator trait and an in-memory regtest node
//! - **service** / **commands**: per-wallet operations and JSON dispatch
//!
//! # Security
//!
//! Seeds and private keys are only ever held sealed under a passphrase-derived
//! key. Decrypted material lives in `zeroize` buffers and is wiped on drop.
//!
//! # Example
//!
//! ```rust,ignore
//! use stakewallet::{ChainParams, InMemoryNode, WalletManager, WalletSettings};
//!
//! let params = Arc::new(ChainParams::regtest());
//! let node = Arc::new(InMemoryNode::new(params.clone(), "/tmp/wallets"));
//! let manager = WalletManager::new(params, WalletSettings::default(), node)?;
//! let created = manager.create_wallet("savings", &passphrase, None)?;
//! ```

pub mod balances;
pub mod commands;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod node;
pub mod service;
pub mod signing;
pub mod staking;
pub mod tx;
pub mod types;
pub mod utils;
pub mod wallet;

pub use error::{ErrorCategory, ErrorCode, WalletError, WalletResult};
pub use types::*;

pub use balances::{compute_balance, Balance, BalanceFilter, SegWitCoin, StakingCoin};
pub use commands::dispatch;
pub use fees::FeeRate;
pub use node::{ChainNode, InMemoryNode};
pub use service::{WalletManager, WalletService};
pub use signing::{ReferenceSigner, SigningService};
pub use staking::{StakingEngine, StakingState, StakingStatus};
pub use tx::{Burn, Payment, SpendFrom};
pub use utils::{ChainParams, WalletSettings};
pub use wallet::{AddressKind, ReceiveAddressRequest, WalletFile};
