//! In-memory regtest node
//!
//! A deterministic single-chain node for tests and offline tooling: blocks
//! are mined on demand, the clock and fee policy are settable, and submitted
//! PoS blocks go through the same kernel, timestamp and signature rules the
//! staking engine relies on.

use bitcoin::absolute::LockTime;
use bitcoin::block::{self, Header};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompressedPublicKey, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BlockRejection, BlockTemplate, ChainNode, ChainTip, StakedBlock};
use crate::error::{WalletError, WalletResult};
use crate::fees::FeeRate;
use crate::ledger::is_coinstake;
use crate::signing::SigningService;
use crate::staking::{check_kernel, coin_kernel_hash, stake_modifier, staker_key};
use crate::utils::ChainParams;
use crate::wallet::address::{commits_to_redeem_script, p2wpkh_script, parse_multisig_redeem_script};
use crate::{log_debug, log_info};

pub const GENESIS_TIME: u32 = 1_700_000_000;
pub const REGTEST_BITS: u32 = 0x207fffff;
pub const DEFAULT_STAKE_REWARD: u64 = 5_000_000;

#[derive(Debug, Clone)]
struct Coin {
    txout: TxOut,
    height: u32,
    tx_version: i32,
    is_reward: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    block: Block,
    hash: BlockHash,
    kernel: [u8; 32],
    stake_modifier: [u8; 32],
    /// Coins this block spent, for disconnecting it
    undo: Vec<(OutPoint, Coin)>,
}

struct State {
    chain: Vec<Entry>,
    utxos: HashMap<OutPoint, Coin>,
    tx_times: HashMap<Txid, u32>,
    mempool: Vec<Transaction>,
    clock: u32,
    fee_rate: FeeRate,
    bits: CompactTarget,
    stake_reward: u64,
    accepting: bool,
}

pub struct InMemoryNode {
    params: Arc<ChainParams>,
    wallet_dir: PathBuf,
    secp: Secp256k1<All>,
    verifier: SigningService,
    state: Mutex<State>,
}

impl InMemoryNode {
    pub fn new(params: Arc<ChainParams>, wallet_dir: impl Into<PathBuf>) -> Self {
        let genesis = mined_block(
            BlockHash::all_zeros(),
            GENESIS_TIME,
            CompactTarget::from_consensus(REGTEST_BITS),
            coinbase_tx(&params, 0, &[]),
            Vec::new(),
        );
        let hash = genesis.block_hash();
        let kernel = hash.to_byte_array();
        let mut state = State {
            chain: Vec::new(),
            utxos: HashMap::new(),
            tx_times: HashMap::new(),
            mempool: Vec::new(),
            clock: GENESIS_TIME,
            fee_rate: FeeRate::MIN,
            bits: CompactTarget::from_consensus(REGTEST_BITS),
            stake_reward: DEFAULT_STAKE_REWARD,
            accepting: true,
        };
        let undo = connect(&mut state, &genesis, 0);
        state.chain.push(Entry {
            block: genesis,
            hash,
            kernel,
            stake_modifier: stake_modifier(&kernel, &[0u8; 32]),
            undo,
        });

        Self {
            params,
            wallet_dir: wallet_dir.into(),
            secp: Secp256k1::new(),
            verifier: SigningService::new(),
            state: Mutex::new(state),
        }
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    pub fn set_time(&self, time: u32) {
        self.lock().clock = time;
    }

    pub fn advance_time(&self, secs: u32) {
        let mut state = self.lock();
        state.clock = state.clock.saturating_add(secs);
    }

    pub fn set_fee_rate(&self, rate: FeeRate) {
        self.lock().fee_rate = rate;
    }

    pub fn set_bits(&self, bits: CompactTarget) {
        self.lock().bits = bits;
    }

    pub fn set_stake_reward(&self, reward: u64) {
        self.lock().stake_reward = reward;
    }

    /// While false every submitted block is refused as not accepted
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    pub fn height(&self) -> u32 {
        (self.lock().chain.len() - 1) as u32
    }

    pub fn mempool(&self) -> Vec<Transaction> {
        self.lock().mempool.clone()
    }

    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.lock().utxos.contains_key(outpoint)
    }

    /// Mine a block paying `payouts` from its coinbase and confirming the
    /// mempool. Coinbases use the legacy kernel-time version when the network
    /// has one, so their outputs stake through that branch.
    pub fn mine_block(&self, payouts: &[(ScriptBuf, u64)]) -> Block {
        let mut state = self.lock();
        let height = state.chain.len() as u32;
        let (prev_hash, prev_time) = {
            let tip = tip_entry(&state);
            (tip.hash, tip.block.header.time)
        };
        let time = state.clock.max(prev_time + 1);

        let mempool = std::mem::take(&mut state.mempool);
        let confirmable: Vec<Transaction> = mempool
            .into_iter()
            .filter(|tx| tx.input.iter().all(|i| state.utxos.contains_key(&i.previous_output)))
            .collect();

        let block = mined_block(
            prev_hash,
            time,
            state.bits,
            coinbase_tx(&self.params, height, payouts),
            confirmable,
        );
        self.push_block(&mut state, block.clone(), None);
        block
    }

    pub fn mine_blocks(&self, count: u32, script_pubkey: &Script, value: u64) -> Vec<Block> {
        (0..count)
            .map(|_| self.mine_block(&[(script_pubkey.to_owned(), value)]))
            .collect()
    }

    /// Remove the tip and restore the coins it spent. Its transactions are
    /// dropped, not returned to the mempool.
    pub fn disconnect_tip(&self) -> Option<Block> {
        let mut state = self.lock();
        if state.chain.len() <= 1 {
            return None;
        }
        let entry = state.chain.pop()?;
        for tx in &entry.block.txdata {
            let txid = tx.compute_txid();
            state.tx_times.remove(&txid);
            for vout in 0..tx.output.len() as u32 {
                state.utxos.remove(&OutPoint::new(txid, vout));
            }
        }
        for (outpoint, coin) in entry.undo {
            state.utxos.insert(outpoint, coin);
        }
        log_info!("node", "Disconnected tip", block_hash = entry.hash);
        Some(entry.block)
    }

    fn push_block(&self, state: &mut State, block: Block, kernel: Option<[u8; 32]>) {
        let height = state.chain.len() as u32;
        let hash = block.block_hash();
        let kernel = kernel.unwrap_or_else(|| hash.to_byte_array());
        let modifier = stake_modifier(&kernel, &tip_entry(state).stake_modifier);
        let undo = connect(state, &block, height);

        let included: Vec<Txid> = block.txdata.iter().map(|tx| tx.compute_txid()).collect();
        state.mempool.retain(|tx| !included.contains(&tx.compute_txid()));

        state.chain.push(Entry {
            block,
            hash,
            kernel,
            stake_modifier: modifier,
            undo,
        });
        log_debug!("node", "Block connected", height = height, block_hash = hash);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    fn check_staked_block(&self, state: &State, staked: &StakedBlock) -> Result<[u8; 32], BlockRejection> {
        let block = &staked.block;
        let tip = tip_entry(state);
        let tip_height = (state.chain.len() - 1) as u32;

        if !state.accepting {
            return Err(BlockRejection::NotAccepted("node is not accepting blocks".to_string()));
        }
        if block.header.prev_blockhash != tip.hash {
            return Err(BlockRejection::NotAccepted("stale-template".to_string()));
        }
        if block.header.time <= tip.block.header.time {
            return Err(BlockRejection::TimeTooEarly {
                time: block.header.time,
                tip_time: tip.block.header.time,
            });
        }
        let consensus = |reason: &str| BlockRejection::Consensus(reason.to_string());
        if self.params.slot_time(block.header.time) != block.header.time {
            return Err(consensus("bad-stake-time"));
        }
        if block.header.bits != state.bits {
            return Err(consensus("bad-diffbits"));
        }
        if block.txdata.len() < 2 || !block.txdata[0].is_coinbase() || !is_coinstake(&block.txdata[1]) {
            return Err(consensus("bad-cs-missing"));
        }
        if !block.check_merkle_root() {
            return Err(consensus("bad-txnmrklroot"));
        }

        let coinstake = &block.txdata[1];
        let prevout = coinstake.input[0].previous_output;
        let coin = state.utxos.get(&prevout).ok_or_else(|| consensus("bad-cs-prevout"))?;
        let depth = tip_height + 1 - coin.height;
        if depth < self.params.stake_min_confirmations {
            return Err(consensus("bad-cs-depth"));
        }

        let modifier = stake_modifier(&tip.kernel, &previous_modifier(state));
        let hash = coin_kernel_hash(
            &self.params,
            &modifier,
            coin.tx_version,
            &prevout,
            block.header.time,
            |txid| state.tx_times.get(txid).copied(),
        )
        .ok_or_else(|| consensus("bad-cs-time"))?;
        if !check_kernel(&hash, &Target::from_compact(block.header.bits), coin.txout.value.to_sat()) {
            return Err(consensus("bad-cs-kernel"));
        }

        let mut fees = 0u64;
        for tx in &block.txdata[2..] {
            fees += self.check_transaction(state, tx).map_err(|e| consensus(&e))?;
        }
        let paid: u64 = coinstake.output.iter().map(|o| o.value.to_sat()).sum();
        if paid > coin.txout.value.to_sat() + state.stake_reward + fees {
            return Err(consensus("bad-cs-amount"));
        }
        if coinstake.output.get(2).map(|o| &o.script_pubkey) != Some(&coin.txout.script_pubkey) {
            return Err(consensus("bad-cs-script"));
        }
        verify_input(&self.secp, coinstake, 0, &coin.txout).map_err(|e| consensus(&e))?;

        let staker = staker_key(coinstake).ok_or_else(|| consensus("bad-cs-pubkey"))?;
        if !self
            .verifier
            .verify_block_signature(&block.block_hash(), &staked.signature, &staker.0)
        {
            return Err(consensus("bad-block-signature"));
        }

        Ok(prevout.txid.to_byte_array())
    }

    /// Fee of a non-coinbase transaction spending confirmed coins
    fn check_transaction(&self, state: &State, tx: &Transaction) -> Result<u64, String> {
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err("bad-txns-empty".to_string());
        }
        let tip_height = (state.chain.len() - 1) as u32;
        let mut input_total = 0u64;
        for (index, txin) in tx.input.iter().enumerate() {
            let coin = state
                .utxos
                .get(&txin.previous_output)
                .ok_or_else(|| "bad-txns-inputs-missingorspent".to_string())?;
            if coin.is_reward && tip_height + 1 - coin.height < self.params.coinbase_maturity {
                return Err("bad-txns-premature-spend-of-reward".to_string());
            }
            verify_input(&self.secp, tx, index, &coin.txout)?;
            input_total += coin.txout.value.to_sat();
        }
        let output_total = tx
            .output
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()))
            .filter(|total| *total <= Amount::MAX_MONEY.to_sat())
            .ok_or_else(|| "bad-txns-txouttotal-toolarge".to_string())?;
        input_total
            .checked_sub(output_total)
            .ok_or_else(|| "bad-txns-in-belowout".to_string())
    }
}

impl ChainNode for InMemoryNode {
    fn chain_tip(&self) -> WalletResult<ChainTip> {
        let state = self.lock();
        let tip = tip_entry(&state);
        Ok(ChainTip {
            height: (state.chain.len() - 1) as u32,
            hash: tip.hash,
            time: tip.block.header.time,
            kernel: tip.kernel,
            previous_stake_modifier: previous_modifier(&state),
        })
    }

    fn block_at(&self, height: u32) -> WalletResult<Option<Block>> {
        Ok(self.lock().chain.get(height as usize).map(|e| e.block.clone()))
    }

    fn block_template(&self) -> WalletResult<BlockTemplate> {
        let state = self.lock();
        let mut total_fees = 0u64;
        let mut transactions = Vec::new();
        for tx in &state.mempool {
            if let Ok(fee) = self.check_transaction(&state, tx) {
                total_fees += fee;
                transactions.push(tx.clone());
            }
        }
        let tip = tip_entry(&state);
        Ok(BlockTemplate {
            height: state.chain.len() as u32,
            previous_block_hash: tip.hash,
            bits: state.bits,
            block_version: 0x2000_0000,
            transactions,
            total_fees,
            stake_reward: state.stake_reward,
        })
    }

    fn minimum_fee_rate(&self) -> WalletResult<FeeRate> {
        Ok(self.lock().fee_rate)
    }

    fn adjusted_time(&self) -> u32 {
        self.lock().clock
    }

    fn coin_time(&self, txid: &Txid) -> Option<u32> {
        self.lock().tx_times.get(txid).copied()
    }

    fn submit_block(&self, staked: StakedBlock) -> Result<BlockHash, BlockRejection> {
        let mut state = self.lock();
        let kernel = self.check_staked_block(&state, &staked)?;
        let hash = staked.block.block_hash();
        self.push_block(&mut state, staked.block, Some(kernel));
        log_info!("node", "Accepted staked block", block_hash = hash);
        Ok(hash)
    }

    fn broadcast(&self, tx: &Transaction) -> WalletResult<Txid> {
        let mut state = self.lock();
        let txid = tx.compute_txid();
        if state.mempool.iter().any(|m| m.compute_txid() == txid) {
            return Ok(txid);
        }
        let conflict = state.mempool.iter().any(|m| {
            m.input
                .iter()
                .any(|a| tx.input.iter().any(|b| a.previous_output == b.previous_output))
        });
        if conflict {
            return Err(WalletError::consensus_rejected("txn-mempool-conflict"));
        }
        let fee = self
            .check_transaction(&state, tx)
            .map_err(WalletError::consensus_rejected)?;
        let relay_fee = state
            .fee_rate
            .fee_for(tx.vsize() as u64)
            .map_err(|e| WalletError::consensus_rejected(e.message))?;
        if fee < relay_fee {
            return Err(WalletError::consensus_rejected("min relay fee not met"));
        }
        state.mempool.push(tx.clone());
        log_debug!("node", "Transaction accepted to mempool", txid = txid, fee = fee);
        Ok(txid)
    }

    fn wallet_dir(&self) -> PathBuf {
        self.wallet_dir.clone()
    }
}

fn tip_entry(state: &State) -> &Entry {
    // The chain always holds genesis
    &state.chain[state.chain.len() - 1]
}

fn previous_modifier(state: &State) -> [u8; 32] {
    let len = state.chain.len();
    if len >= 2 {
        state.chain[len - 2].stake_modifier
    } else {
        [0u8; 32]
    }
}

/// Apply a block to the coin view, returning the coins it spent
fn connect(state: &mut State, block: &Block, height: u32) -> Vec<(OutPoint, Coin)> {
    let mut undo = Vec::new();
    for tx in &block.txdata {
        let txid = tx.compute_txid();
        if !tx.is_coinbase() {
            for txin in &tx.input {
                if let Some(coin) = state.utxos.remove(&txin.previous_output) {
                    undo.push((txin.previous_output, coin));
                }
            }
        }
        let is_reward = tx.is_coinbase() || is_coinstake(tx);
        for (vout, txout) in tx.output.iter().enumerate() {
            if txout.script_pubkey.is_empty() || txout.script_pubkey.is_op_return() {
                continue;
            }
            state.utxos.insert(
                OutPoint::new(txid, vout as u32),
                Coin {
                    txout: txout.clone(),
                    height,
                    tx_version: tx.version.0,
                    is_reward,
                },
            );
        }
        state.tx_times.insert(txid, block.header.time);
    }
    undo
}

fn coinbase_tx(params: &ChainParams, height: u32, payouts: &[(ScriptBuf, u64)]) -> Transaction {
    let mut output: Vec<TxOut> = payouts
        .iter()
        .map(|(script, value)| TxOut {
            value: Amount::from_sat(*value),
            script_pubkey: script.clone(),
        })
        .collect();
    if output.is_empty() {
        output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new(),
        });
    }
    Transaction {
        version: Version(params.legacy_kernel_time_tx_version.unwrap_or(params.tx_version)),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(height as i64).push_int(0).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}

fn mined_block(
    prev_blockhash: BlockHash,
    time: u32,
    bits: CompactTarget,
    coinbase: Transaction,
    transactions: Vec<Transaction>,
) -> Block {
    let mut txdata = Vec::with_capacity(transactions.len() + 1);
    txdata.push(coinbase);
    txdata.extend(transactions);
    let mut block = Block {
        header: Header {
            version: block::Version::from_consensus(0x2000_0000),
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits,
            nonce: 0,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

/// Witness check for the two wallet script shapes
fn verify_input(secp: &Secp256k1<All>, tx: &Transaction, index: usize, prev: &TxOut) -> Result<(), String> {
    let witness = &tx.input[index].witness;
    let mut cache = SighashCache::new(tx);
    let parse_sig = |bytes: &[u8]| ecdsa::Signature::from_slice(bytes).map_err(|_| "bad-witness-sig".to_string());

    if prev.script_pubkey.is_p2wpkh() {
        let (Some(sig), Some(key), 2) = (witness.nth(0), witness.nth(1), witness.len()) else {
            return Err("bad-witness-p2wpkh".to_string());
        };
        let sig = parse_sig(sig)?;
        let key = CompressedPublicKey::from_slice(key).map_err(|_| "bad-witness-pubkey".to_string())?;
        if p2wpkh_script(&key) != prev.script_pubkey {
            return Err("bad-witness-program".to_string());
        }
        let sighash = cache
            .p2wpkh_signature_hash(index, &prev.script_pubkey, prev.value, sig.sighash_type)
            .map_err(|e| e.to_string())?;
        secp.verify_ecdsa(&Message::from_digest(sighash.to_byte_array()), &sig.signature, &key.0)
            .map_err(|_| "bad-witness-signature".to_string())
    } else if prev.script_pubkey.is_p2wsh() {
        let n = witness.len();
        if n < 3 || witness.nth(0).map_or(true, |dummy| !dummy.is_empty()) {
            return Err("bad-witness-p2wsh".to_string());
        }
        let redeem = Script::from_bytes(witness.nth(n - 1).unwrap_or_default());
        if !commits_to_redeem_script(&prev.script_pubkey, redeem) {
            return Err("bad-witness-program".to_string());
        }
        let (required, keys) = parse_multisig_redeem_script(redeem).map_err(|e| e.message)?;
        if n - 2 != required {
            return Err("bad-witness-signature-count".to_string());
        }

        // CHECKMULTISIG: signatures match keys in order
        let mut keys = keys.iter();
        for sig in witness.iter().skip(1).take(required) {
            let sig = parse_sig(sig)?;
            let sighash = cache
                .p2wsh_signature_hash(index, redeem, prev.value, sig.sighash_type)
                .map_err(|e| e.to_string())?;
            let message = Message::from_digest(sighash.to_byte_array());
            loop {
                let key = keys.next().ok_or_else(|| "bad-witness-signature".to_string())?;
                if secp.verify_ecdsa(&message, &sig.signature, &key.0).is_ok() {
                    break;
                }
            }
        }
        Ok(())
    } else {
        Err("bad-witness-unsupported".to_string())
    }
}
