//! Wallet file: key material and the three address maps
//!
//! The address string is the identity key across all three maps combined.
//! Nothing in this file is ever stored unencrypted; every derivation opens
//! the sealed seed with a caller-supplied `KeyEncryptionKey`.

use bip39::{Language, Mnemonic};
use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{PrivateKey, Script};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::address::{
    cold_staking_redeem_script, encode_address, multisig_redeem_script, p2wpkh_script, p2wsh_script,
    parse_public_key, AddressKind, AddressRef, ColdStakingAddress, MultiSigAddress, PubKeyHashAddress,
};
use super::derivation::{self, HdPath, KeyPurpose};
use super::keys::{KeyMaterial, KeyMaterialKind};
use crate::error::{WalletError, WalletResult};
use crate::utils::secret_box::{KdfSettings, KeyEncryptionKey, SealedSecret};
use crate::utils::{ChainParams, WalletSettings};
use crate::{log_debug, log_info};

pub const WALLET_FILE_VERSION: u32 = 1;
const MAX_NAME_LEN: usize = 64;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletFile {
    pub version: u32,
    pub wallet_name: String,
    /// Stable identifier shared with the companion metadata file
    pub wallet_id: String,
    pub coin_ticker: String,
    pub coin_type: u32,
    pub kdf: KdfSettings,
    pub encrypted_seed: SealedSecret,
    pub passphrase_challenge: SealedSecret,
    pub created_utc: i64,
    #[serde(default)]
    pub pub_key_hash_addresses: BTreeMap<String, PubKeyHashAddress>,
    #[serde(default)]
    pub multi_sig_addresses: BTreeMap<String, MultiSigAddress>,
    #[serde(default)]
    pub cold_staking_addresses: BTreeMap<String, ColdStakingAddress>,
}

/// Caller request for a new labelled receive address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiveAddressRequest {
    PubKeyHash {
        label: String,
    },
    MultiSig {
        label: String,
        #[serde(default)]
        account: u32,
        other_public_keys: Vec<String>,
        signatures_required: u8,
    },
    ColdStaking {
        label: String,
        #[serde(default)]
        account: u32,
    },
}

impl ReceiveAddressRequest {
    pub fn label(&self) -> &str {
        match self {
            ReceiveAddressRequest::PubKeyHash { label }
            | ReceiveAddressRequest::MultiSig { label, .. }
            | ReceiveAddressRequest::ColdStaking { label, .. } => label,
        }
    }
}

/// One exported private key
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ExportedKey {
    pub address: String,
    #[zeroize(skip)]
    pub kind: AddressKind,
    pub wif: String,
    pub path: Option<String>,
}

// ============================================================================
// Public API
// ============================================================================

impl WalletFile {
    /// Create a wallet and pre-derive `gap_limit` receive and change addresses.
    ///
    /// Returns the mnemonic so the caller can show it once for backup.
    pub fn create(
        params: &ChainParams,
        settings: &WalletSettings,
        name: &str,
        passphrase: &SecretString,
        mnemonic: Option<&str>,
    ) -> WalletResult<(Self, Zeroizing<String>)> {
        validate_wallet_name(name)?;

        let mnemonic = match mnemonic {
            Some(phrase) => {
                let normalized = Zeroizing::new(normalize_phrase(phrase));
                Mnemonic::parse_in_normalized(Language::English, &normalized)?
            }
            None => {
                let mut entropy = Zeroizing::new([0u8; 32]);
                OsRng.fill_bytes(entropy.as_mut());
                Mnemonic::from_entropy_in(Language::English, entropy.as_ref())?
            }
        };
        let phrase = Zeroizing::new(mnemonic.to_string());
        let seed = Zeroizing::new(mnemonic.to_seed_normalized(""));
        derivation::validate_seed(seed.as_ref())?;

        let kdf = KdfSettings::generate(settings.kdf);
        let kek = KeyEncryptionKey::derive(passphrase, &kdf)?;

        let mut challenge = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(challenge.as_mut());
        let mut wallet_id = [0u8; 16];
        OsRng.fill_bytes(&mut wallet_id);

        let mut wallet = Self {
            version: WALLET_FILE_VERSION,
            wallet_name: name.to_string(),
            wallet_id: hex::encode(wallet_id),
            coin_ticker: params.coin_ticker.clone(),
            coin_type: params.coin_type,
            kdf,
            encrypted_seed: kek.seal(seed.as_ref())?,
            passphrase_challenge: kek.seal(challenge.as_ref())?,
            created_utc: chrono::Utc::now().timestamp(),
            pub_key_hash_addresses: BTreeMap::new(),
            multi_sig_addresses: BTreeMap::new(),
            cold_staking_addresses: BTreeMap::new(),
        };

        let master = derivation::master_from_seed(seed.as_ref(), params.network_kind())?;
        for change in [0, 1] {
            for _ in 0..settings.gap_limit {
                wallet.derive_pub_key_hash_with(params, settings, &kek, &master, change, None)?;
            }
        }

        log_info!(
            "wallet",
            "Wallet created",
            wallet = name,
            addresses = wallet.pub_key_hash_addresses.len()
        );
        Ok((wallet, phrase))
    }

    /// Stretch the passphrase and verify it against the challenge.
    /// Run this before taking the wallet lock.
    pub fn unlock(&self, passphrase: &SecretString) -> WalletResult<KeyEncryptionKey> {
        let kek = KeyEncryptionKey::derive(passphrase, &self.kdf)?;
        self.verify(&kek)?;
        Ok(kek)
    }

    pub fn verify(&self, kek: &KeyEncryptionKey) -> WalletResult<()> {
        kek.open(&self.passphrase_challenge).map(|_| ())
    }

    pub fn decrypt_seed(&self, kek: &KeyEncryptionKey) -> WalletResult<Zeroizing<Vec<u8>>> {
        let seed = kek.open(&self.encrypted_seed)?;
        derivation::validate_seed(&seed)?;
        Ok(seed)
    }

    fn master_key(&self, params: &ChainParams, kek: &KeyEncryptionKey) -> WalletResult<Xpriv> {
        let seed = self.decrypt_seed(kek)?;
        derivation::master_from_seed(&seed, params.network_kind())
    }

    /// Derive (without inserting) the next key on a (purpose, account, change) chain
    pub fn derive_next_key(
        &self,
        params: &ChainParams,
        settings: &WalletSettings,
        kek: &KeyEncryptionKey,
        purpose: KeyPurpose,
        account: u32,
        change: u32,
    ) -> WalletResult<KeyMaterial> {
        let master = self.master_key(params, kek)?;
        self.derive_key_with(settings, kek, &master, purpose, account, change)
    }

    /// Derive and insert the next PubKeyHash address on the receive (0) or
    /// change (1) chain of account 0
    pub fn derive_pub_key_hash_address(
        &mut self,
        params: &ChainParams,
        settings: &WalletSettings,
        kek: &KeyEncryptionKey,
        change: u32,
    ) -> WalletResult<String> {
        let master = self.master_key(params, kek)?;
        self.derive_pub_key_hash_with(params, settings, kek, &master, change, None)
    }

    /// Create a labelled receive address of any kind. The label must be
    /// unused across all three maps; nothing is mutated on failure.
    pub fn create_receive_address(
        &mut self,
        params: &ChainParams,
        settings: &WalletSettings,
        kek: &KeyEncryptionKey,
        request: &ReceiveAddressRequest,
    ) -> WalletResult<String> {
        let label = request.label().trim();
        if label.is_empty() {
            return Err(WalletError::invalid_input("Label is required"));
        }
        if self.label_in_use(label) {
            return Err(WalletError::duplicate_label(label));
        }

        // Validate co-signer keys before touching the seed
        let co_signers = match request {
            ReceiveAddressRequest::MultiSig {
                other_public_keys,
                signatures_required,
                ..
            } => {
                let keys = other_public_keys
                    .iter()
                    .map(|k| parse_public_key(k))
                    .collect::<WalletResult<Vec<_>>>()?;
                if *signatures_required == 0 || *signatures_required as usize > keys.len() + 1 {
                    return Err(WalletError::invalid_input(format!(
                        "{} signatures required of {} keys",
                        signatures_required,
                        keys.len() + 1
                    )));
                }
                keys
            }
            _ => Vec::new(),
        };

        let master = self.master_key(params, kek)?;
        let label = Some(label.to_string());

        let address = match request {
            ReceiveAddressRequest::PubKeyHash { .. } => {
                self.derive_pub_key_hash_with(params, settings, kek, &master, 0, label)?
            }
            ReceiveAddressRequest::MultiSig {
                account,
                other_public_keys,
                signatures_required,
                ..
            } => {
                let own_key = self.derive_key_with(settings, kek, &master, KeyPurpose::MultiSig, *account, 0)?;
                let mut keys = vec![own_key.public_key()?];
                keys.extend(co_signers.iter().copied());
                let redeem_script = multisig_redeem_script(*signatures_required, &keys)?;
                let script_pubkey = p2wsh_script(&redeem_script);
                let address = encode_address(&params.bech32_hrp, &script_pubkey)?;
                self.ensure_unique(&address)?;
                self.multi_sig_addresses.insert(
                    address.clone(),
                    MultiSigAddress {
                        address: address.clone(),
                        own_key,
                        other_public_keys: other_public_keys.iter().map(|k| k.trim().to_lowercase()).collect(),
                        signatures_required: *signatures_required,
                        redeem_script,
                        script_pubkey,
                        label,
                    },
                );
                address
            }
            ReceiveAddressRequest::ColdStaking { account, .. } => {
                let hot_key = self.derive_key_with(settings, kek, &master, KeyPurpose::ColdStakingHot, *account, 0)?;
                let cold_key = self.derive_key_with(settings, kek, &master, KeyPurpose::ColdStakingCold, *account, 0)?;
                let redeem_script = cold_staking_redeem_script(&hot_key.public_key()?, &cold_key.public_key()?)?;
                let script_pubkey = p2wsh_script(&redeem_script);
                let address = encode_address(&params.bech32_hrp, &script_pubkey)?;
                self.ensure_unique(&address)?;
                self.cold_staking_addresses.insert(
                    address.clone(),
                    ColdStakingAddress {
                        address: address.clone(),
                        hot_key,
                        cold_key,
                        redeem_script,
                        script_pubkey,
                        label,
                    },
                );
                address
            }
        };

        log_info!(
            "wallet",
            "Receive address created",
            kind = request_kind(request),
            address = address
        );
        Ok(address)
    }

    /// Top the change buffer back up to `gap_limit` unused addresses once it
    /// falls below `change_buffer_low`. Returns how many were derived.
    pub fn ensure_change_buffer(
        &mut self,
        params: &ChainParams,
        settings: &WalletSettings,
        kek: &KeyEncryptionKey,
    ) -> WalletResult<usize> {
        if self.unused_change_count() >= settings.change_buffer_low as usize {
            return Ok(0);
        }

        let master = self.master_key(params, kek)?;
        let mut derived = 0;
        while self.unused_change_count() < settings.gap_limit as usize {
            self.derive_pub_key_hash_with(params, settings, kek, &master, 1, None)?;
            derived += 1;
        }
        log_debug!("wallet", "Change buffer refilled", derived = derived);
        Ok(derived)
    }

    pub fn unused_change_count(&self) -> usize {
        self.pub_key_hash_addresses
            .values()
            .filter(|a| a.is_change() && !a.is_used())
            .count()
    }

    /// Lowest-index change address never seen on chain
    pub fn next_unused_change_address(&self) -> Option<&PubKeyHashAddress> {
        self.pub_key_hash_addresses
            .values()
            .filter(|a| a.is_change() && !a.is_used())
            .min_by_key(|a| a.key.hd_path.map(|p| p.index))
    }

    /// Lowest-index unlabelled receive address never seen on chain
    pub fn unused_receive_address(&self) -> Option<&PubKeyHashAddress> {
        self.pub_key_hash_addresses
            .values()
            .filter(|a| !a.is_change() && !a.is_used() && a.label.is_none() && a.key.kind == KeyMaterialKind::Hd)
            .min_by_key(|a| a.key.hd_path.map(|p| p.index))
    }

    pub fn find_address(&self, address: &str) -> Option<AddressRef<'_>> {
        if let Some(a) = self.pub_key_hash_addresses.get(address) {
            return Some(AddressRef::PubKeyHash(a));
        }
        if let Some(a) = self.multi_sig_addresses.get(address) {
            return Some(AddressRef::MultiSig(a));
        }
        self.cold_staking_addresses.get(address).map(AddressRef::ColdStaking)
    }

    pub fn find_by_script_pubkey(&self, script_pubkey: &Script) -> Option<AddressRef<'_>> {
        self.addresses().find(|a| a.script_pubkey() == script_pubkey)
    }

    pub fn addresses(&self) -> impl Iterator<Item = AddressRef<'_>> {
        self.pub_key_hash_addresses
            .values()
            .map(AddressRef::PubKeyHash)
            .chain(self.multi_sig_addresses.values().map(AddressRef::MultiSig))
            .chain(self.cold_staking_addresses.values().map(AddressRef::ColdStaking))
    }

    pub fn address_count(&self) -> usize {
        self.pub_key_hash_addresses.len() + self.multi_sig_addresses.len() + self.cold_staking_addresses.len()
    }

    /// Record the first on-chain sighting of a PubKeyHash address
    pub fn mark_seen(&mut self, address: &str, time: i64) -> bool {
        match self.pub_key_hash_addresses.get_mut(address) {
            Some(record) if record.first_seen_utc.is_none() => {
                record.first_seen_utc = Some(time);
                true
            }
            _ => false,
        }
    }

    pub fn label_in_use(&self, label: &str) -> bool {
        self.addresses().any(|a| a.label() == Some(label))
    }

    /// Import WIF keys as PubKeyHash addresses. All keys are validated before
    /// any is inserted; keys already present are skipped.
    pub fn import_keys(
        &mut self,
        params: &ChainParams,
        kek: &KeyEncryptionKey,
        wifs: &[String],
    ) -> WalletResult<Vec<String>> {
        let mut parsed = Vec::with_capacity(wifs.len());
        for wif in wifs {
            let key = PrivateKey::from_wif(wif.trim())?;
            if !key.compressed {
                return Err(WalletError::invalid_input("Uncompressed keys cannot own witness addresses"));
            }
            if key.network != params.network_kind() {
                return Err(WalletError::invalid_input("WIF key belongs to another network"));
            }
            parsed.push(key);
        }

        let secp = Secp256k1::new();
        let mut imported = Vec::new();
        for key in parsed {
            let public_key = bitcoin::CompressedPublicKey(key.inner.public_key(&secp));
            let script_pubkey = p2wpkh_script(&public_key);
            let address = encode_address(&params.bech32_hrp, &script_pubkey)?;
            if self.find_address(&address).is_some() {
                continue;
            }
            let material = KeyMaterial::seal(KeyMaterialKind::Imported, None, &key.inner, kek)?;
            self.pub_key_hash_addresses.insert(
                address.clone(),
                PubKeyHashAddress {
                    address: address.clone(),
                    key: material,
                    script_pubkey,
                    label: None,
                    first_seen_utc: None,
                },
            );
            imported.push(address);
        }

        log_info!("wallet", "Keys imported", count = imported.len(), skipped = wifs.len() - imported.len());
        Ok(imported)
    }

    pub fn export_keys(&self, params: &ChainParams, kek: &KeyEncryptionKey) -> WalletResult<Vec<ExportedKey>> {
        let network = params.network_kind();
        let mut exported = Vec::with_capacity(self.address_count());
        for address in self.addresses() {
            let keys: Vec<&KeyMaterial> = match address {
                AddressRef::PubKeyHash(a) => vec![&a.key],
                AddressRef::MultiSig(a) => vec![&a.own_key],
                AddressRef::ColdStaking(a) => vec![&a.hot_key, &a.cold_key],
            };
            for key in keys {
                let wif = key.to_wif(kek, network)?;
                exported.push(ExportedKey {
                    address: address.address().to_string(),
                    kind: address.kind(),
                    wif: wif.to_string(),
                    path: key.path_string(),
                });
            }
        }
        Ok(exported)
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn file_name(params: &ChainParams, name: &str) -> String {
        format!("{}.{}.json", name, params.wallet_extension())
    }

    pub fn path(dir: &Path, params: &ChainParams, name: &str) -> PathBuf {
        dir.join(Self::file_name(params, name))
    }

    pub fn exists(dir: &Path, params: &ChainParams, name: &str) -> bool {
        Self::path(dir, params, name).exists()
    }

    pub fn save(&self, dir: &Path, params: &ChainParams) -> WalletResult<PathBuf> {
        let path = Self::path(dir, params, &self.wallet_name);
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Load and check the embedded name and ticker against the file name
    pub fn load(dir: &Path, params: &ChainParams, name: &str) -> WalletResult<Self> {
        validate_wallet_name(name)?;
        let path = Self::path(dir, params, name);
        if !path.exists() {
            return Err(WalletError::wallet_not_found(name));
        }
        let wallet: Self = serde_json::from_str(&fs::read_to_string(&path)?)?;

        if wallet.wallet_name != name {
            return Err(WalletError::wallet_file_mismatch(format!(
                "File {} holds wallet '{}'",
                path.display(),
                wallet.wallet_name
            )));
        }
        if wallet.coin_ticker != params.coin_ticker {
            return Err(WalletError::wallet_file_mismatch(format!(
                "Wallet is for {} but the node runs {}",
                wallet.coin_ticker, params.coin_ticker
            )));
        }
        if wallet.version > WALLET_FILE_VERSION {
            return Err(WalletError::wallet_file_mismatch(format!(
                "Wallet file version {} is newer than supported {}",
                wallet.version, WALLET_FILE_VERSION
            )));
        }

        log_info!("wallet", "Wallet loaded", wallet = name, addresses = wallet.address_count());
        Ok(wallet)
    }

    // ------------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------------

    fn key_materials(&self) -> impl Iterator<Item = &KeyMaterial> {
        self.pub_key_hash_addresses
            .values()
            .map(|a| &a.key)
            .chain(self.multi_sig_addresses.values().map(|a| &a.own_key))
            .chain(
                self.cold_staking_addresses
                    .values()
                    .flat_map(|a| [&a.hot_key, &a.cold_key]),
            )
    }

    fn next_index(&self, purpose: KeyPurpose, account: u32, change: u32) -> u32 {
        self.key_materials()
            .filter_map(|k| k.hd_path)
            .filter(|p| p.purpose == purpose && p.account == account && p.change == change)
            .map(|p| p.index + 1)
            .max()
            .unwrap_or(0)
    }

    fn derive_key_with(
        &self,
        settings: &WalletSettings,
        kek: &KeyEncryptionKey,
        master: &Xpriv,
        purpose: KeyPurpose,
        account: u32,
        change: u32,
    ) -> WalletResult<KeyMaterial> {
        let index = self.next_index(purpose, account, change);
        if index >= settings.max_addresses_per_chain {
            return Err(WalletError::address_buffer_exhausted(format!(
                "Chain {:?}/{}/{} reached {} addresses",
                purpose, account, change, settings.max_addresses_per_chain
            )));
        }
        let path = HdPath::new(purpose, self.coin_type, account, change, index);
        let secp = Secp256k1::new();
        let secret = derivation::derive_secret_key(&secp, master, &path)?;
        KeyMaterial::seal(KeyMaterialKind::Hd, Some(path), &secret, kek)
    }

    fn derive_pub_key_hash_with(
        &mut self,
        params: &ChainParams,
        settings: &WalletSettings,
        kek: &KeyEncryptionKey,
        master: &Xpriv,
        change: u32,
        label: Option<String>,
    ) -> WalletResult<String> {
        let key = self.derive_key_with(settings, kek, master, KeyPurpose::PubKeyHash, 0, change)?;
        let script_pubkey = p2wpkh_script(&key.public_key()?);
        let address = encode_address(&params.bech32_hrp, &script_pubkey)?;
        self.ensure_unique(&address)?;
        self.pub_key_hash_addresses.insert(
            address.clone(),
            PubKeyHashAddress {
                address: address.clone(),
                key,
                script_pubkey,
                label,
                first_seen_utc: None,
            },
        );
        Ok(address)
    }

    fn ensure_unique(&self, address: &str) -> WalletResult<()> {
        if self.find_address(address).is_some() {
            return Err(WalletError::inconsistent(format!("Address {} already exists", address)));
        }
        Ok(())
    }
}

fn request_kind(request: &ReceiveAddressRequest) -> AddressKind {
    match request {
        ReceiveAddressRequest::PubKeyHash { .. } => AddressKind::PubKeyHash,
        ReceiveAddressRequest::MultiSig { .. } => AddressKind::MultiSig,
        ReceiveAddressRequest::ColdStaking { .. } => AddressKind::ColdStaking,
    }
}

/// Wallet names end up in file names: letters, digits, `-` and `_` only
pub fn validate_wallet_name(name: &str) -> WalletResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(WalletError::missing_wallet_name());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WalletError::invalid_input(format!("Wallet name exceeds {} characters", MAX_NAME_LEN)));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(WalletError::invalid_input("Wallet name may only contain letters, digits, '-' and '_'"));
    }
    Ok(())
}

fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write JSON to a sibling temp file and rename it into place
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> WalletResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
