//! Address kinds and witness-program encoding
//!
//! Three record types share one identity space (the Bech32 string).
//! `AddressRef` is the tagged view every lookup returns; callers match on it
//! exhaustively instead of downcasting.

use bech32::{self, FromBase32, ToBase32, Variant};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{CompressedPublicKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::keys::KeyMaterial;
use crate::error::{WalletError, WalletResult};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    PubKeyHash,
    MultiSig,
    ColdStaking,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::PubKeyHash => write!(f, "pub_key_hash"),
            AddressKind::MultiSig => write!(f, "multi_sig"),
            AddressKind::ColdStaking => write!(f, "cold_staking"),
        }
    }
}

/// Single-key P2WPKH address. The only change-eligible kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeyHashAddress {
    pub address: String,
    pub key: KeyMaterial,
    pub script_pubkey: ScriptBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Set once an output to this address is seen on chain
    #[serde(default)]
    pub first_seen_utc: Option<i64>,
}

impl PubKeyHashAddress {
    pub fn is_change(&self) -> bool {
        self.key.hd_path.map(|p| p.is_change()).unwrap_or(false)
    }

    pub fn is_used(&self) -> bool {
        self.first_seen_utc.is_some()
    }
}

/// m-of-n P2WSH address where the wallet holds one of the keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigAddress {
    pub address: String,
    pub own_key: KeyMaterial,
    /// Co-signer compressed public keys (hex)
    pub other_public_keys: Vec<String>,
    pub signatures_required: u8,
    pub redeem_script: ScriptBuf,
    pub script_pubkey: ScriptBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Hot/cold P2WSH address: the hot key stakes, the cold key spends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdStakingAddress {
    pub address: String,
    pub hot_key: KeyMaterial,
    pub cold_key: KeyMaterial,
    pub redeem_script: ScriptBuf,
    pub script_pubkey: ScriptBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum AddressRef<'a> {
    PubKeyHash(&'a PubKeyHashAddress),
    MultiSig(&'a MultiSigAddress),
    ColdStaking(&'a ColdStakingAddress),
}

impl<'a> AddressRef<'a> {
    pub fn address(&self) -> &'a str {
        match self {
            AddressRef::PubKeyHash(a) => &a.address,
            AddressRef::MultiSig(a) => &a.address,
            AddressRef::ColdStaking(a) => &a.address,
        }
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            AddressRef::PubKeyHash(_) => AddressKind::PubKeyHash,
            AddressRef::MultiSig(_) => AddressKind::MultiSig,
            AddressRef::ColdStaking(_) => AddressKind::ColdStaking,
        }
    }

    pub fn script_pubkey(&self) -> &'a Script {
        match self {
            AddressRef::PubKeyHash(a) => &a.script_pubkey,
            AddressRef::MultiSig(a) => &a.script_pubkey,
            AddressRef::ColdStaking(a) => &a.script_pubkey,
        }
    }

    pub fn redeem_script(&self) -> Option<&'a Script> {
        match self {
            AddressRef::PubKeyHash(_) => None,
            AddressRef::MultiSig(a) => Some(&a.redeem_script),
            AddressRef::ColdStaking(a) => Some(&a.redeem_script),
        }
    }

    pub fn label(&self) -> Option<&'a str> {
        match self {
            AddressRef::PubKeyHash(a) => a.label.as_deref(),
            AddressRef::MultiSig(a) => a.label.as_deref(),
            AddressRef::ColdStaking(a) => a.label.as_deref(),
        }
    }

    /// Key used when the wallet spends from this address
    pub fn spending_key(&self) -> &'a KeyMaterial {
        match self {
            AddressRef::PubKeyHash(a) => &a.key,
            AddressRef::MultiSig(a) => &a.own_key,
            AddressRef::ColdStaking(a) => &a.cold_key,
        }
    }

    /// Key that signs coinstakes, if the wallet can stake this address alone
    pub fn staking_key(&self) -> Option<&'a KeyMaterial> {
        match self {
            AddressRef::PubKeyHash(a) => Some(&a.key),
            AddressRef::MultiSig(a) if a.signatures_required == 1 => Some(&a.own_key),
            AddressRef::MultiSig(_) => None,
            AddressRef::ColdStaking(a) => Some(&a.hot_key),
        }
    }

    pub fn signatures_required(&self) -> usize {
        match self {
            AddressRef::MultiSig(a) => a.signatures_required as usize,
            _ => 1,
        }
    }
}

// ============================================================================
// Scripts
// ============================================================================

pub fn p2wpkh_script(public_key: &CompressedPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash())
}

pub fn p2wsh_script(redeem_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeem_script.wscript_hash())
}

/// `OP_m <key>... OP_n OP_CHECKMULTISIG`
pub fn multisig_redeem_script(required: u8, keys: &[CompressedPublicKey]) -> WalletResult<ScriptBuf> {
    if keys.is_empty() || keys.len() > 16 {
        return Err(WalletError::invalid_script(format!("{} keys is outside 1..=16", keys.len())));
    }
    if required == 0 || required as usize > keys.len() {
        return Err(WalletError::invalid_script(format!(
            "{} signatures required of {} keys",
            required,
            keys.len()
        )));
    }
    let mut builder = Builder::new().push_int(required as i64);
    for key in keys {
        let push = PushBytesBuf::try_from(key.to_bytes().to_vec())
            .map_err(|_| WalletError::invalid_script("Public key push too large"))?;
        builder = builder.push_slice(push);
    }
    Ok(builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Either key satisfies the script: 1-of-2 over (hot, cold)
pub fn cold_staking_redeem_script(hot: &CompressedPublicKey, cold: &CompressedPublicKey) -> WalletResult<ScriptBuf> {
    multisig_redeem_script(1, &[*hot, *cold])
}

/// Decode a bare multisig redeem script into (required, keys)
pub fn parse_multisig_redeem_script(script: &Script) -> WalletResult<(usize, Vec<CompressedPublicKey>)> {
    let bad = || WalletError::invalid_script("Not a multisig redeem script");
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad())?;
    if instructions.len() < 4 {
        return Err(bad());
    }

    let small_int = |ins: &Instruction| match ins {
        Instruction::Op(op) => match op.to_u8() {
            n @ 0x51..=0x60 => Some((n - 0x50) as usize),
            _ => None,
        },
        _ => None,
    };

    let required = small_int(&instructions[0]).ok_or_else(bad)?;
    let total = small_int(&instructions[instructions.len() - 2]).ok_or_else(bad)?;
    match instructions[instructions.len() - 1] {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
        _ => return Err(bad()),
    }

    let mut keys = Vec::with_capacity(total);
    for ins in &instructions[1..instructions.len() - 2] {
        match ins {
            Instruction::PushBytes(bytes) => {
                let key = CompressedPublicKey::from_slice(bytes.as_bytes()).map_err(|_| bad())?;
                keys.push(key);
            }
            _ => return Err(bad()),
        }
    }
    if keys.len() != total || required == 0 || required > total {
        return Err(bad());
    }
    Ok((required, keys))
}

/// Check that `script_pubkey` is the P2WSH program committing to `redeem_script`
pub fn commits_to_redeem_script(script_pubkey: &Script, redeem_script: &Script) -> bool {
    script_pubkey.is_p2wsh() && script_pubkey == p2wsh_script(redeem_script).as_script()
}

// ============================================================================
// Bech32
// ============================================================================

/// Encode a witness v0 output script as a Bech32 address
pub fn encode_address(hrp: &str, script_pubkey: &Script) -> WalletResult<String> {
    if !(script_pubkey.is_p2wpkh() || script_pubkey.is_p2wsh()) {
        return Err(WalletError::invalid_script("Only witness v0 key-hash and script-hash outputs have addresses"));
    }
    let program = &script_pubkey.as_bytes()[2..];

    let version = bech32::u5::try_from_u8(0)
        .map_err(|e| WalletError::crypto_error(format!("Bech32 error: {}", e)))?;
    let mut data = Vec::with_capacity(1 + (program.len() * 8 + 4) / 5);
    data.push(version);
    data.extend(program.to_base32());

    bech32::encode(hrp, data, Variant::Bech32)
        .map_err(|e| WalletError::crypto_error(format!("Bech32 error: {}", e)))
}

/// Decode a Bech32 address into its output script, validating network and shape
pub fn decode_address(hrp: &str, address: &str) -> WalletResult<ScriptBuf> {
    let (decoded_hrp, data, variant) = bech32::decode(address)
        .map_err(|e| WalletError::invalid_address(format!("Invalid bech32 address: {}", e)))?;
    if decoded_hrp != hrp {
        return Err(WalletError::invalid_address(format!(
            "Address prefix '{}' does not match network prefix '{}'",
            decoded_hrp, hrp
        )));
    }
    if variant != Variant::Bech32 {
        return Err(WalletError::invalid_address("Witness v0 addresses use the bech32 variant"));
    }
    let (version, program) = data
        .split_first()
        .ok_or_else(|| WalletError::invalid_address("Empty witness program"))?;
    if version.to_u8() != 0 {
        return Err(WalletError::invalid_address(format!("Unsupported witness version {}", version.to_u8())));
    }
    let program = Vec::<u8>::from_base32(program)
        .map_err(|e| WalletError::invalid_address(format!("Invalid witness program: {}", e)))?;
    if program.len() != 20 && program.len() != 32 {
        return Err(WalletError::invalid_address(format!(
            "Witness program length {} is neither 20 nor 32",
            program.len()
        )));
    }

    let mut script = Vec::with_capacity(2 + program.len());
    script.push(0x00);
    script.push(program.len() as u8);
    script.extend_from_slice(&program);
    Ok(ScriptBuf::from_bytes(script))
}

pub fn parse_public_key(hex_key: &str) -> WalletResult<CompressedPublicKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| WalletError::invalid_input(format!("Invalid public key hex: {}", e)))?;
    CompressedPublicKey::from_slice(&bytes)
        .map_err(|e| WalletError::invalid_input(format!("Invalid compressed public key: {}", e)))
}
