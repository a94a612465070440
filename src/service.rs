//! Wallet Service
//!
//! `WalletManager` owns the shared collaborators (chain parameters, settings,
//! node) and the loaded wallets. Each `WalletService` guards its wallet file
//! and ledger with one mutex:
//!
//! - passphrase stretching happens before the lock is taken
//! - a send holds the lock from coin selection until its spend is recorded
//! - a staking slot holds the lock from its coin snapshot until the
//!   accepted coinstake is recorded

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::Transaction;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::balances::{compute_balance, Balance, BalanceFilter, StakingCoin};
use crate::error::{WalletError, WalletResult};
use crate::fees::FeeRate;
use crate::ledger::{BroadcastState, ChainScanner, MemoryPoolEntry, MetadataFile};
use crate::node::ChainNode;
use crate::signing::{SigningInput, SigningService};
use crate::staking::{StakeSession, StakeSource, StakingEngine, StakingStatus};
use crate::tx::{prepare_plan, TransactionPlan};
use crate::types::{
    AddressCounts, BuiltTransaction, CreatedWallet, FeeEstimate, HistoryEntry, SendRequest, SyncReport, WalletInfo,
};
use crate::utils::{ChainParams, KeyEncryptionKey, WalletSettings};
use crate::wallet::{ExportedKey, ReceiveAddressRequest, WalletFile};
use crate::{log_debug, log_error, log_info, log_warn};

/// Wallet file and ledger, always mutated together
pub struct WalletContext {
    pub wallet: WalletFile,
    pub metadata: MetadataFile,
}

impl WalletContext {
    fn persist(&self, dir: &Path, params: &ChainParams) -> WalletResult<()> {
        self.wallet.save(dir, params)?;
        self.metadata.save(dir, params)?;
        Ok(())
    }

    /// Ledger entry and first sightings for a transaction leaving the wallet now
    fn pending_entry(
        &self,
        params: &ChainParams,
        tx: &Transaction,
    ) -> WalletResult<(Option<MemoryPoolEntry>, Vec<(String, i64)>)> {
        let now = chrono::Utc::now().timestamp();
        let mut scanner = ChainScanner::new(params, &self.wallet, &self.metadata);
        let entry = scanner.scan_transaction(tx, now)?.map(|transaction| MemoryPoolEntry {
            transaction,
            raw_hex: Some(serialize_hex(tx)),
            arrival_utc: now,
            broadcast_state: BroadcastState::Broadcast,
            consensus_error: None,
        });
        Ok((entry, scanner.take_seen()))
    }

    fn balance(&self, params: &ChainParams, filter: &BalanceFilter) -> WalletResult<Balance> {
        compute_balance(params, &self.wallet, &self.metadata, self.metadata.sync_height, filter)
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct WalletManager {
    params: Arc<ChainParams>,
    settings: WalletSettings,
    node: Arc<dyn ChainNode>,
    wallets: Mutex<HashMap<String, Arc<WalletService>>>,
}

impl WalletManager {
    pub fn new(params: Arc<ChainParams>, settings: WalletSettings, node: Arc<dyn ChainNode>) -> WalletResult<Self> {
        params.validate()?;
        settings.validate()?;
        Ok(Self {
            params,
            settings,
            node,
            wallets: Mutex::new(HashMap::new()),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn settings(&self) -> &WalletSettings {
        &self.settings
    }

    pub fn node(&self) -> &Arc<dyn ChainNode> {
        &self.node
    }

    /// Create, persist and load a new wallet
    pub fn create_wallet(
        &self,
        name: &str,
        passphrase: &SecretString,
        mnemonic: Option<&str>,
    ) -> WalletResult<CreatedWallet> {
        let dir = self.node.wallet_dir();
        if WalletFile::exists(&dir, &self.params, name) {
            return Err(WalletError::wallet_exists(name));
        }
        fs::create_dir_all(&dir)?;

        let (wallet, phrase) = WalletFile::create(&self.params, &self.settings, name, passphrase, mnemonic)?;
        let metadata = MetadataFile::new(&wallet);
        let receive_address = wallet
            .unused_receive_address()
            .map(|a| a.address.clone())
            .ok_or_else(|| WalletError::address_buffer_exhausted("New wallet has no receive address"))?;
        let context = WalletContext { wallet, metadata };
        context.persist(&dir, &self.params)?;

        let created = CreatedWallet {
            wallet_name: name.to_string(),
            wallet_id: context.wallet.wallet_id.clone(),
            mnemonic: phrase.to_string(),
            receive_address,
        };
        let service = Arc::new(WalletService::new(self, dir, context));
        lock(&self.wallets).insert(name.to_string(), service);
        Ok(created)
    }

    /// Load a wallet from the node's wallet directory, or return the loaded one
    pub fn load_wallet(&self, name: &str) -> WalletResult<Arc<WalletService>> {
        let mut wallets = lock(&self.wallets);
        if let Some(service) = wallets.get(name) {
            return Ok(Arc::clone(service));
        }
        let dir = self.node.wallet_dir();
        let wallet = WalletFile::load(&dir, &self.params, name)?;
        let metadata = MetadataFile::load_or_new(&dir, &self.params, &wallet)?;
        log_info!(
            "service",
            "Wallet loaded",
            wallet = name,
            sync_height = metadata.sync_height.map(|h| h.to_string()).unwrap_or_else(|| "none".to_string())
        );
        let service = Arc::new(WalletService::new(self, dir, WalletContext { wallet, metadata }));
        wallets.insert(name.to_string(), Arc::clone(&service));
        Ok(service)
    }

    /// Loaded wallet by name; loads it from disk on first use
    pub fn wallet(&self, name: &str) -> WalletResult<Arc<WalletService>> {
        self.load_wallet(name)
    }

    pub fn loaded_wallets(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.wallets).keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop staking and forget the wallet; its files stay on disk
    pub fn unload_wallet(&self, name: &str) -> bool {
        let removed = lock(&self.wallets).remove(name);
        match removed {
            Some(service) => {
                service.stop_staking();
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Per-wallet service
// =============================================================================

pub struct WalletService {
    name: String,
    params: Arc<ChainParams>,
    settings: WalletSettings,
    node: Arc<dyn ChainNode>,
    dir: PathBuf,
    context: Arc<Mutex<WalletContext>>,
    signer: SigningService,
    staking: StakingEngine,
}

impl WalletService {
    fn new(manager: &WalletManager, dir: PathBuf, context: WalletContext) -> Self {
        let name = context.wallet.wallet_name.clone();
        Self {
            staking: StakingEngine::new(name.clone()),
            name,
            params: Arc::clone(&manager.params),
            settings: manager.settings.clone(),
            node: Arc::clone(&manager.node),
            dir,
            context: Arc::new(Mutex::new(context)),
            signer: SigningService::new().with_cross_check(manager.settings.verify_signatures),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> WalletResult<WalletInfo> {
        let staking = self.staking.status();
        let ctx = self.lock();
        let wallet = &ctx.wallet;
        Ok(WalletInfo {
            wallet_name: wallet.wallet_name.clone(),
            wallet_id: wallet.wallet_id.clone(),
            network: self.params.network.clone(),
            sync_height: ctx.metadata.sync_height,
            sync_hash: ctx.metadata.sync_hash,
            addresses: AddressCounts {
                pub_key_hash: wallet.pub_key_hash_addresses.len(),
                multi_sig: wallet.multi_sig_addresses.len(),
                cold_staking: wallet.cold_staking_addresses.len(),
                unused_change: wallet.unused_change_count(),
            },
            balance: ctx.balance(&self.params, &BalanceFilter::default())?,
            staking,
        })
    }

    pub fn balance(&self, filter: &BalanceFilter) -> WalletResult<Balance> {
        self.lock().balance(&self.params, filter)
    }

    pub fn history(&self) -> WalletResult<Vec<HistoryEntry>> {
        Ok(history_entries(&self.lock().metadata))
    }

    /// Lowest unused receive address. When every pre-derived one has been
    /// seen, a passphrase lets the wallet derive the next.
    pub fn unused_receive_address(&self, passphrase: Option<&SecretString>) -> WalletResult<String> {
        let kek = passphrase.map(|p| self.unlock(p)).transpose()?;
        let mut ctx = self.lock();
        if let Some(address) = ctx.wallet.unused_receive_address() {
            return Ok(address.address.clone());
        }
        let kek = kek.ok_or_else(|| {
            WalletError::address_buffer_exhausted("All receive addresses are used; the passphrase is needed to derive more")
        })?;
        let address = ctx
            .wallet
            .derive_pub_key_hash_address(&self.params, &self.settings, &kek, 0)?;
        ctx.wallet.save(&self.dir, &self.params)?;
        Ok(address)
    }

    pub fn create_receive_address(
        &self,
        passphrase: &SecretString,
        request: &ReceiveAddressRequest,
    ) -> WalletResult<String> {
        let kek = self.unlock(passphrase)?;
        let mut ctx = self.lock();
        let address = ctx
            .wallet
            .create_receive_address(&self.params, &self.settings, &kek, request)?;
        ctx.wallet.save(&self.dir, &self.params)?;
        Ok(address)
    }

    /// Run the fee loop for `request` without touching any state
    pub fn estimate_fee(&self, request: &SendRequest) -> WalletResult<FeeEstimate> {
        let fee_rate = self.fee_rate(request.fee_rate)?;
        let ctx = self.lock();
        let plan = self.plan(&ctx, request, fee_rate)?;
        Ok(FeeEstimate {
            fee: plan.fee,
            fee_rate: plan.fee_rate.sat_per_vb(),
            virtual_size: plan.virtual_size,
            total_send: plan.total_send,
            input_count: plan.inputs.len(),
            change: plan.change,
        })
    }

    /// Plan, optionally sign, optionally broadcast. A broadcast spend is
    /// recorded in the ledger's mempool before the lock is released.
    pub fn build_transaction(
        &self,
        passphrase: Option<&SecretString>,
        request: &SendRequest,
    ) -> WalletResult<BuiltTransaction> {
        if request.broadcast && !request.sign {
            return Err(WalletError::invalid_input("A transaction must be signed to be broadcast"));
        }
        let kek = if request.sign {
            let passphrase =
                passphrase.ok_or_else(|| WalletError::invalid_input("A passphrase is required to sign"))?;
            Some(self.unlock(passphrase)?)
        } else {
            None
        };
        let fee_rate = self.fee_rate(request.fee_rate)?;

        let mut guard = self.lock();
        let ctx = &mut *guard;
        let plan = self.plan(ctx, request, fee_rate)?;

        let mut complete = true;
        let mut inputs = Vec::with_capacity(plan.inputs.len());
        for coin in &plan.inputs {
            let address = ctx
                .wallet
                .find_address(&coin.address)
                .ok_or_else(|| WalletError::inconsistent(format!("Coin {} has no wallet address", coin.outpoint)))?;
            complete &= address.signatures_required() == 1;
            if let Some(kek) = &kek {
                inputs.push(SigningInput::new(coin.clone(), address.spending_key().decrypt(kek)?));
            }
        }
        let tx = if kek.is_some() {
            self.signer.sign(&plan.unsigned, &inputs)?
        } else {
            plan.unsigned.clone()
        };
        drop(inputs);

        let txid = tx.compute_txid();
        let mut broadcast = false;
        if request.broadcast {
            if !complete {
                return Err(WalletError::invalid_input(
                    "Transaction still needs co-signer signatures and cannot be broadcast",
                ));
            }
            let (mut entry, seen) = ctx.pending_entry(&self.params, &tx)?;
            // Staged; committed only once the node accepts the transaction
            let mut staged = ctx.wallet.clone();
            for (address, time) in seen {
                staged.mark_seen(&address, time);
            }
            if let Some(kek) = &kek {
                staged.ensure_change_buffer(&self.params, &self.settings, kek)?;
            }

            if let Err(e) = self.node.broadcast(&tx) {
                if let Some(mut entry) = entry.take() {
                    entry.broadcast_state = BroadcastState::Rejected;
                    entry.consensus_error = Some(e.message.clone());
                    ctx.metadata.memory_pool.insert(entry);
                    if let Err(save) = ctx.metadata.save(&self.dir, &self.params) {
                        log_error!("service", "Failed to save rejected transaction", txid = txid, error = save);
                    }
                }
                log_warn!("service", "Broadcast rejected", txid = txid, error = e);
                return Err(e);
            }

            if let Some(entry) = entry {
                ctx.metadata.memory_pool.insert(entry);
            }
            ctx.wallet = staged;
            if let Err(e) = ctx.persist(&self.dir, &self.params) {
                log_error!("service", "Broadcast transaction not persisted", txid = txid, error = e);
            }
            broadcast = true;
        }

        log_info!(
            "service",
            "Transaction built",
            txid = txid,
            fee = plan.fee,
            inputs = plan.inputs.len(),
            broadcast = broadcast
        );
        Ok(BuiltTransaction {
            txid,
            hex: serialize_hex(&tx),
            fee: plan.fee,
            fee_rate: plan.fee_rate.sat_per_vb(),
            virtual_size: plan.virtual_size,
            total_send: plan.total_send,
            change: plan.change,
            signed: request.sign,
            complete,
            broadcast,
        })
    }

    /// Import WIF keys; any new key resets the ledger so the next sync rescans
    pub fn import_keys(&self, passphrase: &SecretString, wifs: &[String]) -> WalletResult<Vec<String>> {
        let kek = self.unlock(passphrase)?;
        let mut ctx = self.lock();
        let imported = ctx.wallet.import_keys(&self.params, &kek, wifs)?;
        if !imported.is_empty() {
            ctx.metadata.reset();
            log_info!("service", "Ledger reset for rescan", wallet = self.name);
        }
        ctx.persist(&self.dir, &self.params)?;
        Ok(imported)
    }

    pub fn export_keys(&self, passphrase: &SecretString) -> WalletResult<Vec<ExportedKey>> {
        let kek = self.unlock(passphrase)?;
        self.lock().wallet.export_keys(&self.params, &kek)
    }

    pub fn start_staking(&self, passphrase: &SecretString) -> WalletResult<StakingStatus> {
        let kek = self.unlock(passphrase)?;
        let source = Arc::new(LedgerStakeSource {
            params: Arc::clone(&self.params),
            node: Arc::clone(&self.node),
            dir: self.dir.clone(),
            context: Arc::clone(&self.context),
        });
        self.staking
            .start(Arc::clone(&self.params), &self.settings, Arc::clone(&self.node), source, kek)
    }

    pub fn stop_staking(&self) -> StakingStatus {
        self.staking.stop()
    }

    pub fn staking_status(&self) -> StakingStatus {
        self.staking.status()
    }

    /// Pull blocks from the node up to its tip
    pub fn sync(&self) -> WalletResult<SyncReport> {
        let mut ctx = self.lock();
        sync_context(&self.params, self.node.as_ref(), &mut ctx, &self.dir)
    }

    /// Record an unconfirmed transaction relayed by the node. Returns whether
    /// it touched the wallet.
    pub fn on_mempool_transaction(&self, tx: &Transaction) -> WalletResult<bool> {
        let txid = tx.compute_txid();
        let mut guard = self.lock();
        let ctx = &mut *guard;
        if ctx.metadata.transaction(&txid).is_some() {
            return Ok(false);
        }
        let (entry, seen) = ctx.pending_entry(&self.params, tx)?;
        let Some(mut entry) = entry else {
            return Ok(false);
        };
        entry.broadcast_state = BroadcastState::Relayed;
        ctx.metadata.memory_pool.insert(entry);
        for (address, time) in seen {
            ctx.wallet.mark_seen(&address, time);
        }
        ctx.persist(&self.dir, &self.params)?;
        log_debug!("service", "Mempool transaction recorded", txid = txid);
        Ok(true)
    }

    /// Decode a raw transaction and hand it to `on_mempool_transaction`
    pub fn on_mempool_hex(&self, raw_hex: &str) -> WalletResult<bool> {
        let tx: Transaction = deserialize_hex(raw_hex.trim())
            .map_err(|e| WalletError::parse_error(format!("Invalid transaction: {}", e)))?;
        self.on_mempool_transaction(&tx)
    }

    // -------------------------------------------------------------------------

    /// Stretch and verify the passphrase without holding the wallet lock
    fn unlock(&self, passphrase: &SecretString) -> WalletResult<KeyEncryptionKey> {
        let (kdf, challenge) = {
            let ctx = self.lock();
            (ctx.wallet.kdf.clone(), ctx.wallet.passphrase_challenge.clone())
        };
        let kek = KeyEncryptionKey::derive(passphrase, &kdf)?;
        kek.open(&challenge)?;
        Ok(kek)
    }

    fn fee_rate(&self, requested: Option<u64>) -> WalletResult<FeeRate> {
        let minimum = self.node.minimum_fee_rate()?;
        match requested {
            Some(rate) => Ok(FeeRate::from_sat_per_vb(rate)?.max(minimum)),
            None => Ok(minimum),
        }
    }

    fn plan(&self, ctx: &WalletContext, request: &SendRequest, fee_rate: FeeRate) -> WalletResult<TransactionPlan> {
        let balance = ctx.balance(&self.params, &BalanceFilter::default())?;
        prepare_plan(
            &self.params,
            &self.settings,
            &ctx.wallet,
            &balance,
            &request.from,
            &request.recipients,
            &request.burns,
            fee_rate,
        )
    }

    fn lock(&self) -> MutexGuard<'_, WalletContext> {
        lock(&self.context)
    }
}

/// Stakable coins from a freshly synced ledger
struct LedgerStakeSource {
    params: Arc<ChainParams>,
    node: Arc<dyn ChainNode>,
    dir: PathBuf,
    context: Arc<Mutex<WalletContext>>,
}

impl StakeSource for LedgerStakeSource {
    fn open_session(&self) -> WalletResult<Box<dyn StakeSession + '_>> {
        let mut ctx = lock(&self.context);
        sync_context(&self.params, self.node.as_ref(), &mut ctx, &self.dir)?;
        let balance = ctx.balance(&self.params, &BalanceFilter::default())?;
        Ok(Box::new(LedgerStakeSession {
            params: self.params.as_ref(),
            coins: balance.stakable_coins.into_values().collect(),
            ctx,
        }))
    }
}

struct LedgerStakeSession<'a> {
    params: &'a ChainParams,
    coins: Vec<StakingCoin>,
    ctx: MutexGuard<'a, WalletContext>,
}

impl StakeSession for LedgerStakeSession<'_> {
    fn coins(&self) -> &[StakingCoin] {
        &self.coins
    }

    fn record_coinstake(&mut self, coinstake: &Transaction) -> WalletResult<()> {
        let (entry, _) = self.ctx.pending_entry(self.params, coinstake)?;
        if let Some(entry) = entry {
            log_debug!("service", "Coinstake recorded as pending", txid = entry.txid());
            self.ctx.metadata.memory_pool.insert(entry);
        }
        Ok(())
    }
}

/// Bring the ledger up to the node's tip.
///
/// A checkpoint or stored block that is no longer on the node's chain rewinds
/// the ledger by `stake_min_confirmations` blocks, repeatedly if needed.
fn sync_context(
    params: &ChainParams,
    node: &dyn ChainNode,
    ctx: &mut WalletContext,
    dir: &Path,
) -> WalletResult<SyncReport> {
    let tip = node.chain_tip()?;
    let mut rewound_to = None;
    let mut changed = false;

    while let Some(height) = ctx.metadata.sync_height {
        let checkpoint_ok = node.block_at(height)?.map(|b| b.block_hash()) == ctx.metadata.sync_hash;
        let last_block_ok = match ctx.metadata.blocks.values().next_back() {
            Some(stored) => node.block_at(stored.height)?.map(|b| b.block_hash()) == Some(stored.hash),
            None => true,
        };
        if checkpoint_ok && last_block_ok {
            break;
        }

        let target = height.checked_sub(params.stake_min_confirmations);
        let target_hash = match target {
            Some(t) => node.block_at(t)?.map(|b| b.block_hash()),
            None => None,
        };
        ctx.metadata.rewind_to(target, target_hash);
        rewound_to = Some(target.unwrap_or(0));
        changed = true;
    }

    let from_height = ctx.metadata.next_height();
    let mut report = SyncReport {
        from_height,
        tip_height: tip.height,
        rewound_to,
        ..SyncReport::default()
    };

    let seen = {
        let mut scanner = ChainScanner::new(params, &ctx.wallet, &ctx.metadata);
        for height in from_height..=tip.height {
            let Some(block) = node.block_at(height)? else {
                break;
            };
            let scanned = scanner.scan_block(&block, height)?;
            if scanned.is_some() {
                report.relevant_blocks += 1;
            }
            ctx.metadata.apply_block(&block, height, scanned);
            report.blocks_scanned += 1;
        }
        scanner.take_seen()
    };
    for (address, time) in seen {
        ctx.wallet.mark_seen(&address, time);
    }

    if changed || report.blocks_scanned > 0 {
        ctx.persist(dir, params)?;
        log_debug!(
            "service",
            "Ledger synced",
            wallet = ctx.wallet.wallet_name,
            scanned = report.blocks_scanned,
            relevant = report.relevant_blocks,
            tip = tip.height
        );
    }
    Ok(report)
}

/// Ledger transactions newest first: unconfirmed, then confirmed
pub fn history_entries(metadata: &MetadataFile) -> Vec<HistoryEntry> {
    let entry = |tx: &crate::ledger::TransactionMetadata| {
        let received = tx.total_received();
        let spent = tx.total_spent();
        HistoryEntry {
            txid: tx.hash,
            tx_type: tx.tx_type,
            height: None,
            time: None,
            received,
            spent,
            net: received as i64 - spent as i64,
            destinations: tx.destinations.values().cloned().collect(),
            broadcast_state: None,
            consensus_error: None,
        }
    };

    let mut history: Vec<HistoryEntry> = metadata
        .memory_pool
        .iter()
        .rev()
        .map(|pending| HistoryEntry {
            time: Some(pending.arrival_utc),
            broadcast_state: Some(pending.broadcast_state),
            consensus_error: pending.consensus_error.clone(),
            ..entry(&pending.transaction)
        })
        .collect();
    for block in metadata.blocks.values().rev() {
        for tx in block.transactions.iter().rev() {
            history.push(HistoryEntry {
                height: Some(block.height),
                time: Some(block.time as i64),
                ..entry(tx)
            });
        }
    }
    history
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
