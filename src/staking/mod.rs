//! Staking Engine
//!
//! One named worker thread per wallet. The loop floors the node's adjusted
//! time to a slot and does work only when the slot advances:
//!
//! 1. template, tip and the wallet's stakable coins
//! 2. network weight and expected time to stake
//! 3. stake modifier from the tip, then a kernel hash per coin
//! 4. the smallest-value winning coin builds, signs and submits a block
//!
//! The wallet stays locked from the coin snapshot until the accepted
//! coinstake is recorded, so no send can pick the staked coin in between.
//! Its only blocking wait is `recv_timeout` on the stop channel. Slot
//! failures are classified into status counters and never end the loop; a
//! passphrase failure does, since no later slot can succeed.

pub mod coinstake;
pub mod kernel;
pub mod status;

pub use coinstake::{assemble_block, build_coinbase, build_coinstake, staker_key, staker_key_script};
pub use kernel::{
    check_kernel, coin_kernel_hash, expected_time_to_stake, kernel_hash, network_weight, stake_modifier,
};
pub use status::{StakingState, StakingStatus};

use bitcoin::pow::Target;
use bitcoin::{BlockHash, Transaction, Txid};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::balances::StakingCoin;
use crate::error::{ErrorCategory, WalletError, WalletResult};
use crate::node::{BlockRejection, ChainNode, StakedBlock};
use crate::signing::{SigningInput, SigningService};
use crate::utils::{ChainParams, KeyEncryptionKey, WalletSettings};
use crate::{log_debug, log_error, log_info, log_warn};

/// Stakable coins for one slot; the wallet stays locked until this drops
pub trait StakeSession {
    fn coins(&self) -> &[StakingCoin];

    /// Record an accepted coinstake as a pending spend of its coin
    fn record_coinstake(&mut self, coinstake: &Transaction) -> WalletResult<()>;
}

/// Opens a freshly synced session for every slot
pub trait StakeSource: Send + Sync {
    fn open_session(&self) -> WalletResult<Box<dyn StakeSession + '_>>;
}

/// Winning coin for `slot_time`, preferring the smallest value
pub fn find_kernel<'a>(
    params: &ChainParams,
    coins: &'a [StakingCoin],
    modifier: &[u8; 32],
    target: &Target,
    slot_time: u32,
    coin_time: impl Fn(&Txid) -> Option<u32>,
) -> Option<&'a StakingCoin> {
    coins
        .iter()
        .filter(|coin| {
            coin_kernel_hash(params, modifier, coin.tx_version, &coin.coin.outpoint, slot_time, &coin_time)
                .map_or(false, |hash| check_kernel(&hash, target, coin.coin.value))
        })
        .min_by(|a, b| {
            a.coin
                .value
                .cmp(&b.coin.value)
                .then_with(|| a.coin.outpoint.txid.cmp(&b.coin.outpoint.txid))
                .then_with(|| a.coin.outpoint.vout.cmp(&b.coin.outpoint.vout))
        })
}

#[derive(Debug, thiserror::Error)]
enum SlotError {
    #[error(transparent)]
    Rejected(#[from] BlockRejection),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

struct Staker {
    params: Arc<ChainParams>,
    node: Arc<dyn ChainNode>,
    source: Arc<dyn StakeSource>,
    kek: KeyEncryptionKey,
    signer: SigningService,
    status: Arc<Mutex<StakingStatus>>,
}

impl Staker {
    fn run(self, stop: mpsc::Receiver<()>, poll: Duration) {
        let mut last_slot: Option<u32> = None;
        loop {
            let slot = self.params.slot_time(self.node.adjusted_time());
            if last_slot.map_or(true, |last| slot > last) {
                last_slot = Some(slot);
                if !self.stake_slot(slot) {
                    break;
                }
            }
            match stop.recv_timeout(poll) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Returns false when staking cannot continue
    fn stake_slot(&self, slot: u32) -> bool {
        let outcome = self.try_stake(slot);
        let mut status = lock(&self.status);
        status.slots_evaluated += 1;
        status.last_slot_time = Some(slot);

        match outcome {
            Ok(None) => {}
            Ok(Some(hash)) => {
                status.blocks_accepted += 1;
                status.last_block_hash = Some(hash.to_string());
                log_info!("staking", "Staked block accepted", block_hash = hash, slot = slot);
            }
            Err(SlotError::Rejected(BlockRejection::TimeTooEarly { .. })) => {
                status.out_competed += 1;
                log_debug!("staking", "Out-competed for slot", slot = slot);
            }
            Err(SlotError::Rejected(BlockRejection::NotAccepted(reason))) => {
                status.blocks_not_accepted += 1;
                log_warn!("staking", "Staked block not accepted", reason = reason, slot = slot);
            }
            Err(SlotError::Rejected(rejection @ BlockRejection::Consensus(_))) => {
                status.exceptions += 1;
                status.last_error = Some(rejection.to_string());
                log_error!("staking", "Consensus error on staked block", error = rejection, slot = slot);
            }
            Err(SlotError::Wallet(e)) => {
                status.exceptions += 1;
                status.last_error = Some(e.to_string());
                log_error!("staking", "Staking slot failed", error = e, slot = slot);
                if e.category() == ErrorCategory::Passphrase {
                    return false;
                }
            }
        }
        true
    }

    fn try_stake(&self, slot: u32) -> Result<Option<BlockHash>, SlotError> {
        let tip = self.node.chain_tip()?;
        let template = self.node.block_template()?;
        let target = Target::from_compact(template.bits);
        let mut session = self.source.open_session()?;
        let coins = session.coins();

        let own_weight: u64 = coins.iter().map(|c| c.coin.value).sum();
        let net_weight = network_weight(&self.params, &target);
        {
            let mut status = lock(&self.status);
            status.coins_evaluated = coins.len() as u64;
            status.own_weight = own_weight;
            status.network_weight = net_weight;
            status.expected_time_secs = expected_time_to_stake(&self.params, net_weight, own_weight);
        }
        if coins.is_empty() {
            return Ok(None);
        }

        let modifier = stake_modifier(&tip.kernel, &tip.previous_stake_modifier);
        let Some(winner) = find_kernel(&self.params, coins, &modifier, &target, slot, |txid| {
            self.node.coin_time(txid)
        }) else {
            return Ok(None);
        };
        lock(&self.status).kernels_found += 1;
        log_debug!(
            "staking",
            "Kernel found",
            txid = winner.coin.outpoint.txid,
            value = winner.coin.value,
            slot = slot
        );

        let secret = winner.staking_key.decrypt(&self.kek)?;
        let public_key = winner.staking_key.public_key()?;
        let unsigned = build_coinstake(&self.params, winner, &public_key, &template)?;
        let coinstake = self
            .signer
            .sign(&unsigned, &[SigningInput::new(winner.coin.clone(), secret)])?;

        let block = assemble_block(&self.params, &template, coinstake.clone(), slot);
        let signature = self.signer.sign_block_hash(&block.block_hash(), &secret);
        let hash = self.node.submit_block(StakedBlock { block, signature })?;
        if let Err(e) = session.record_coinstake(&coinstake) {
            // The next sync picks the block up from the chain
            log_warn!(
                "staking",
                "Accepted coinstake not recorded",
                txid = coinstake.compute_txid(),
                error = e
            );
        }
        Ok(Some(hash))
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Start/stop handle for one wallet's staking thread
pub struct StakingEngine {
    wallet_name: String,
    status: Arc<Mutex<StakingStatus>>,
    worker: Mutex<Option<Worker>>,
}

impl StakingEngine {
    pub fn new(wallet_name: impl Into<String>) -> Self {
        Self {
            wallet_name: wallet_name.into(),
            status: Arc::new(Mutex::new(StakingStatus::default())),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the staking thread. `kek` must already be verified against the
    /// wallet; it is the only way the thread can open staking keys.
    pub fn start(
        &self,
        params: Arc<ChainParams>,
        settings: &WalletSettings,
        node: Arc<dyn ChainNode>,
        source: Arc<dyn StakeSource>,
        kek: KeyEncryptionKey,
    ) -> WalletResult<StakingStatus> {
        let mut worker = lock(&self.worker);
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                return Err(WalletError::invalid_input(format!(
                    "Staking is already running for {}",
                    self.wallet_name
                )));
            }
        }
        if let Some(finished) = worker.take() {
            let _ = finished.handle.join();
        }

        *lock(&self.status) = StakingStatus::started(chrono::Utc::now().timestamp());

        let staker = Staker {
            params,
            node,
            source,
            kek,
            signer: SigningService::new().with_cross_check(settings.verify_signatures),
            status: Arc::clone(&self.status),
        };
        let status = Arc::clone(&self.status);
        let poll = settings.staking_poll_interval();
        let (stop, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("staking-{}", self.wallet_name))
            .spawn(move || {
                staker.run(stop_rx, poll);
                let mut status = lock(&status);
                status.state = StakingState::Stopped;
                status.stopped_utc = Some(chrono::Utc::now().timestamp());
            })
            .map_err(|e| WalletError::internal(format!("Failed to spawn staking thread: {}", e)))?;

        *worker = Some(Worker { stop, handle });
        log_info!("staking", "Staking started", wallet = self.wallet_name);
        Ok(self.status())
    }

    /// Signal the thread and wait for it; a no-op when not running
    pub fn stop(&self) -> StakingStatus {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                let mut status = lock(&self.status);
                status.state = StakingState::Stopped;
                status.exceptions += 1;
                status.last_error = Some("Staking thread panicked".to_string());
            }
            log_info!("staking", "Staking stopped", wallet = self.wallet_name);
        }
        self.status()
    }

    pub fn status(&self) -> StakingStatus {
        lock(&self.status).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.status).is_running()
    }
}

impl Drop for StakingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
