#![allow(dead_code)]

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{CompressedPublicKey, ScriptBuf};
use secrecy::SecretString;
use stakewallet::node::memory::GENESIS_TIME;
use stakewallet::wallet::address::{decode_address, encode_address, p2wpkh_script};
use stakewallet::{ChainParams, InMemoryNode, StakingStatus, WalletManager, WalletService, WalletSettings};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";

pub struct Harness {
    pub dir: TempDir,
    pub params: Arc<ChainParams>,
    pub node: Arc<InMemoryNode>,
    pub manager: WalletManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(WalletSettings::for_tests())
    }

    pub fn with_settings(settings: WalletSettings) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = Arc::new(ChainParams::regtest());
        let node = Arc::new(InMemoryNode::new(Arc::clone(&params), dir.path()));
        let manager = WalletManager::new(Arc::clone(&params), settings, node.clone()).expect("manager");
        Self {
            dir,
            params,
            node,
            manager,
        }
    }

    /// New wallet plus its first receive address
    pub fn wallet(&self, name: &str) -> (Arc<WalletService>, String) {
        let created = self
            .manager
            .create_wallet(name, &passphrase(), None)
            .expect("create wallet");
        let address = created.receive_address.clone();
        (self.manager.wallet(name).expect("loaded"), address)
    }

    pub fn script(&self, address: &str) -> ScriptBuf {
        decode_address(&self.params.bech32_hrp, address).expect("wallet address decodes")
    }

    /// Pay `outputs` from one coinbase, then bury it `depth - 1` blocks deep
    pub fn fund(&self, outputs: &[(&str, u64)], depth: u32) {
        let payouts: Vec<(ScriptBuf, u64)> = outputs.iter().map(|(a, v)| (self.script(a), *v)).collect();
        self.node.mine_block(&payouts);
        self.mine_empty(depth.saturating_sub(1));
    }

    pub fn mine_empty(&self, count: u32) {
        for _ in 0..count {
            self.node.mine_block(&[]);
        }
    }

    /// A p2wpkh address no wallet owns
    pub fn foreign_address(&self, seed: u8) -> String {
        let key = foreign_public_key(seed);
        encode_address(&self.params.bech32_hrp, &p2wpkh_script(&key)).expect("encodes")
    }
}

pub fn passphrase() -> SecretString {
    SecretString::from(PASSPHRASE.to_string())
}

pub fn wrong_passphrase() -> SecretString {
    SecretString::from("not the passphrase".to_string())
}

pub fn foreign_secret(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed.max(1); 32]).expect("valid scalar")
}

pub fn foreign_public_key(seed: u8) -> CompressedPublicKey {
    let secp = Secp256k1::new();
    CompressedPublicKey(foreign_secret(seed).public_key(&secp))
}

pub fn genesis_time() -> u32 {
    GENESIS_TIME
}

/// Poll the staking status until `done` holds or ten seconds pass
pub fn wait_for_status(service: &WalletService, done: impl Fn(&StakingStatus) -> bool) -> StakingStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = service.staking_status();
        if done(&status) || Instant::now() > deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
