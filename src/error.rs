//! Unified error types for the wallet core
//!
//! All errors flow through this module so the command layer can hand a
//! typed, serializable error back to its caller.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for all wallet operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Missing amount in satoshis for insufficient-funds errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<u64>,
}

impl WalletError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            shortfall: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    // Convenience constructors
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, msg)
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidAddress, msg)
    }

    pub fn invalid_script(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidScript, msg)
    }

    pub fn missing_wallet_name() -> Self {
        Self::new(ErrorCode::MissingWalletName, "Wallet name is required")
    }

    pub fn duplicate_label(label: &str) -> Self {
        Self::new(ErrorCode::DuplicateLabel, format!("Label '{}' is already in use", label))
    }

    pub fn wrong_passphrase() -> Self {
        Self::new(
            ErrorCode::WrongPassphrase,
            "Decryption failed - incorrect passphrase or corrupted data",
        )
    }

    pub fn decryption_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DecryptionFailed, msg)
    }

    /// Insufficient funds, carrying the computed shortfall
    pub fn insufficient_funds(required: u64, available: u64) -> Self {
        let mut err = Self::new(
            ErrorCode::InsufficientFunds,
            format!("Insufficient spendable balance: need {} sats, have {} sats", required, available),
        )
        .with_details(format!("required={} available={}", required, available));
        err.shortfall = Some(required.saturating_sub(available));
        err
    }

    pub fn address_buffer_exhausted(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::AddressBufferExhausted, msg)
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InconsistentState, msg)
    }

    pub fn redeem_script_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::RedeemScriptMismatch, msg)
    }

    pub fn consensus_rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConsensusRejected, msg)
    }

    pub fn wallet_not_found(name: &str) -> Self {
        Self::new(ErrorCode::WalletNotFound, format!("Wallet '{}' not found", name))
    }

    pub fn wallet_exists(name: &str) -> Self {
        Self::new(ErrorCode::WalletExists, format!("Wallet '{}' already exists", name))
    }

    pub fn wallet_file_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::WalletFileMismatch, msg)
    }

    pub fn crypto_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::CryptoError, msg)
    }

    pub fn signing_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::SigningFailed, msg)
    }

    pub fn node_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NodeError, msg)
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for WalletError {}

/// Error codes for categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Validation errors
    InvalidInput,
    InvalidAddress,
    InvalidScript,
    MissingWalletName,
    DuplicateLabel,
    WalletNotFound,
    WalletExists,
    WalletFileMismatch,

    // Passphrase errors
    WrongPassphrase,
    DecryptionFailed,

    // Resource errors
    InsufficientFunds,
    AddressBufferExhausted,

    // Consistency errors
    InconsistentState,
    RedeemScriptMismatch,

    // Consensus errors
    ConsensusRejected,
    NodeError,

    // Crypto errors
    CryptoError,
    SigningFailed,

    // Parse errors
    ParseError,
    JsonError,
    HexError,

    // Internal
    Io,
    Internal,
}

/// Coarse error classes a caller can branch on without reading messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Passphrase,
    Resource,
    Consistency,
    Consensus,
    Io,
    Internal,
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidInput
            | ErrorCode::InvalidAddress
            | ErrorCode::InvalidScript
            | ErrorCode::MissingWalletName
            | ErrorCode::DuplicateLabel
            | ErrorCode::WalletNotFound
            | ErrorCode::WalletExists
            | ErrorCode::WalletFileMismatch
            | ErrorCode::ParseError
            | ErrorCode::JsonError
            | ErrorCode::HexError => ErrorCategory::Validation,
            ErrorCode::WrongPassphrase | ErrorCode::DecryptionFailed => ErrorCategory::Passphrase,
            ErrorCode::InsufficientFunds | ErrorCode::AddressBufferExhausted => ErrorCategory::Resource,
            ErrorCode::InconsistentState
            | ErrorCode::RedeemScriptMismatch
            | ErrorCode::SigningFailed => ErrorCategory::Consistency,
            ErrorCode::ConsensusRejected | ErrorCode::NodeError => ErrorCategory::Consensus,
            ErrorCode::Io => ErrorCategory::Io,
            ErrorCode::CryptoError | ErrorCode::Internal => ErrorCategory::Internal,
        }
    }
}

/// Result type alias for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;

// Conversions from common error types

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::new(ErrorCode::JsonError, e.to_string())
    }
}

impl From<hex::FromHexError> for WalletError {
    fn from(e: hex::FromHexError) -> Self {
        WalletError::new(ErrorCode::HexError, e.to_string())
    }
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        WalletError::new(ErrorCode::Io, e.to_string())
    }
}

impl From<bitcoin::bip32::Error> for WalletError {
    fn from(e: bitcoin::bip32::Error) -> Self {
        WalletError::new(ErrorCode::CryptoError, format!("BIP32 error: {}", e))
    }
}

impl From<bitcoin::secp256k1::Error> for WalletError {
    fn from(e: bitcoin::secp256k1::Error) -> Self {
        WalletError::new(ErrorCode::CryptoError, format!("Secp256k1 error: {}", e))
    }
}

impl From<bitcoin::key::FromWifError> for WalletError {
    fn from(e: bitcoin::key::FromWifError) -> Self {
        WalletError::new(ErrorCode::InvalidInput, format!("Invalid WIF: {}", e))
    }
}

impl From<bip39::Error> for WalletError {
    fn from(e: bip39::Error) -> Self {
        WalletError::new(ErrorCode::InvalidInput, format!("BIP39 error: {}", e))
    }
}
