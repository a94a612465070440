//! Wallet Module
//!
//! Key derivation, encrypted key material, the three address kinds and the
//! persisted wallet file.

pub mod address;
pub mod derivation;
pub mod keys;
pub mod wallet_file;

pub use address::{
    decode_address, encode_address, AddressKind, AddressRef, ColdStakingAddress, MultiSigAddress,
    PubKeyHashAddress,
};
pub use derivation::{HdPath, KeyPurpose};
pub use keys::{KeyMaterial, KeyMaterialKind};
pub use wallet_file::{validate_wallet_name, ExportedKey, ReceiveAddressRequest, WalletFile};
