//! Chain Scanner
//!
//! Turns raw blocks into wallet-relevant `TransactionMetadata`. Each scanner
//! is one pass: it allocates its script and outpoint indexes once, sized
//! from the wallet and the already-scanned ledger, and grows the outpoint
//! index as it goes so spends within the same block are matched.

use bitcoin::{Block, OutPoint, Script, Transaction};
use std::collections::{BTreeMap, HashMap};

use super::{is_coinstake, utxo_key, BlockMetadata, MetadataFile, TransactionMetadata, TxType, UtxoMetadata};
use crate::error::WalletResult;
use crate::log_debug;
use crate::utils::ChainParams;
use crate::wallet::{encode_address, AddressKind, WalletFile};

pub struct ChainScanner<'a> {
    params: &'a ChainParams,
    scripts: HashMap<&'a Script, (&'a str, AddressKind)>,
    owned: HashMap<OutPoint, UtxoMetadata>,
    seen: Vec<(String, i64)>,
}

impl<'a> ChainScanner<'a> {
    pub fn new(params: &'a ChainParams, wallet: &'a WalletFile, metadata: &MetadataFile) -> Self {
        let mut scripts = HashMap::with_capacity(wallet.address_count());
        for address in wallet.addresses() {
            scripts.insert(address.script_pubkey(), (address.address(), address.kind()));
        }

        let known = metadata
            .blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .chain(metadata.memory_pool.iter().map(|e| &e.transaction))
            .map(|t| t.received.len())
            .sum::<usize>();
        let mut owned = HashMap::with_capacity(known);
        for tx in metadata.blocks.values().flat_map(|b| b.transactions.iter()) {
            for utxo in tx.received.values() {
                owned.insert(utxo.outpoint(), utxo.clone());
            }
        }
        for entry in metadata.memory_pool.iter().filter(|e| e.counts_toward_balance()) {
            for utxo in entry.transaction.received.values() {
                owned.insert(utxo.outpoint(), utxo.clone());
            }
        }

        Self {
            params,
            scripts,
            owned,
            seen: Vec::new(),
        }
    }

    /// Scan every transaction of a block; `None` when nothing touched the wallet
    pub fn scan_block(&mut self, block: &Block, height: u32) -> WalletResult<Option<BlockMetadata>> {
        let time = block.header.time;
        let mut transactions = Vec::new();
        for tx in &block.txdata {
            if let Some(meta) = self.scan_transaction(tx, time as i64)? {
                transactions.push(meta);
            }
        }
        if transactions.is_empty() {
            return Ok(None);
        }

        log_debug!(
            "scanner",
            "Block relevant to wallet",
            height = height,
            transactions = transactions.len()
        );
        Ok(Some(BlockMetadata {
            height,
            hash: block.block_hash(),
            time,
            transactions,
        }))
    }

    /// Outgoing pass, then incoming pass, then classification.
    /// `seen_time` stamps first sightings of PubKeyHash addresses.
    pub fn scan_transaction(&mut self, tx: &Transaction, seen_time: i64) -> WalletResult<Option<TransactionMetadata>> {
        let txid = tx.compute_txid();
        let coinbase = tx.is_coinbase();
        let coinstake = is_coinstake(tx);

        let mut spent = BTreeMap::new();
        let mut spends_cold_staking = false;
        if !coinbase {
            for input in &tx.input {
                if let Some(utxo) = self.owned.get(&input.previous_output) {
                    if self.kind_of(&utxo.address) == Some(AddressKind::ColdStaking) {
                        spends_cold_staking = true;
                    }
                    spent.insert(utxo.key(), utxo.clone());
                }
            }
        }

        let mut received = BTreeMap::new();
        let mut unowned = BTreeMap::new();
        for (index, output) in tx.output.iter().enumerate() {
            if is_protocol_output(tx, coinbase, coinstake, index) {
                continue;
            }
            let index = index as u32;
            let record = |address: String| UtxoMetadata {
                address,
                hash: txid,
                index,
                satoshis: output.value.to_sat(),
            };
            match self.scripts.get(output.script_pubkey.as_script()) {
                Some((address, _)) => {
                    received.insert(utxo_key(&txid, index), record(address.to_string()));
                }
                None => {
                    let described = encode_address(&self.params.bech32_hrp, &output.script_pubkey)
                        .unwrap_or_else(|_| hex::encode(output.script_pubkey.as_bytes()));
                    unowned.insert(utxo_key(&txid, index), record(described));
                }
            }
        }

        if received.is_empty() && spent.is_empty() {
            return Ok(None);
        }

        let tx_type = TxType::classify(
            coinbase,
            coinstake,
            spends_cold_staking,
            !received.is_empty(),
            !spent.is_empty(),
            !unowned.is_empty(),
        )?;

        // Destinations only explain where the wallet's own funds went
        let destinations = if spent.is_empty() { BTreeMap::new() } else { unowned };

        for utxo in received.values() {
            self.owned.insert(utxo.outpoint(), utxo.clone());
            self.seen.push((utxo.address.clone(), seen_time));
        }

        Ok(Some(TransactionMetadata {
            hash: txid,
            tx_type,
            tx_version: tx.version.0,
            received,
            spent,
            destinations,
        }))
    }

    /// Addresses that received funds during this pass, with sighting time
    pub fn take_seen(&mut self) -> Vec<(String, i64)> {
        std::mem::take(&mut self.seen)
    }

    fn kind_of(&self, address: &str) -> Option<AddressKind> {
        self.scripts
            .values()
            .find(|(a, _)| *a == address)
            .map(|(_, kind)| *kind)
    }
}

/// Empty and OP_RETURN markers of coinbase and coinstake transactions
fn is_protocol_output(tx: &Transaction, coinbase: bool, coinstake: bool, index: usize) -> bool {
    let script = &tx.output[index].script_pubkey;
    if coinbase {
        return script.is_empty() || script.is_op_return();
    }
    if coinstake {
        return index == 0 || script.is_op_return();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::WalletSettings;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};
    use secrecy::SecretString;

    fn wallet() -> (ChainParams, WalletFile) {
        let params = ChainParams::regtest();
        let (wallet, _) = WalletFile::create(
            &params,
            &WalletSettings::for_tests(),
            "scan",
            &SecretString::from("pw".to_string()),
            None,
        )
        .unwrap();
        (params, wallet)
    }

    fn scripts(wallet: &WalletFile, n: usize) -> Vec<ScriptBuf> {
        wallet
            .pub_key_hash_addresses
            .values()
            .take(n)
            .map(|a| a.script_pubkey.clone())
            .collect()
    }

    fn foreign() -> ScriptBuf {
        ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::from_byte_array([7; 32]))
    }

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<(ScriptBuf, u64)>) -> Transaction {
        let mut input: Vec<TxIn> = inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();
        if input.is_empty() {
            input.push(TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([0xee; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
        }
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: outputs
                .into_iter()
                .map(|(script_pubkey, sats)| TxOut {
                    value: Amount::from_sat(sats),
                    script_pubkey,
                })
                .collect(),
        }
    }

    #[test]
    fn test_receive_has_no_destinations() {
        let (params, wallet) = wallet();
        let meta = MetadataFile::new(&wallet);
        let mut scanner = ChainScanner::new(&params, &wallet, &meta);
        let ours = scripts(&wallet, 1);

        let funding = tx(vec![], vec![(ours[0].clone(), 50_000), (foreign(), 10_000)]);
        let record = scanner.scan_transaction(&funding, 100).unwrap().unwrap();
        assert_eq!(record.tx_type, TxType::Receive);
        assert_eq!(record.total_received(), 50_000);
        assert!(record.destinations.is_empty());
        assert_eq!(scanner.take_seen().len(), 1);
    }

    #[test]
    fn test_spend_and_within_wallet() {
        let (params, wallet) = wallet();
        let meta = MetadataFile::new(&wallet);
        let mut scanner = ChainScanner::new(&params, &wallet, &meta);
        let ours = scripts(&wallet, 3);

        let funding = tx(vec![], vec![(ours[0].clone(), 50_000), (ours[1].clone(), 20_000)]);
        let funding_id = funding.compute_txid();
        scanner.scan_transaction(&funding, 1).unwrap().unwrap();

        let spend = tx(
            vec![OutPoint::new(funding_id, 0)],
            vec![(foreign(), 30_000), (ours[2].clone(), 19_000)],
        );
        let record = scanner.scan_transaction(&spend, 2).unwrap().unwrap();
        assert_eq!(record.tx_type, TxType::Spend);
        assert_eq!(record.total_spent(), 50_000);
        assert_eq!(record.destinations.len(), 1);

        let internal = tx(vec![OutPoint::new(funding_id, 1)], vec![(ours[0].clone(), 19_500)]);
        assert_eq!(scanner.scan_transaction(&internal, 3).unwrap().unwrap().tx_type, TxType::WithinWallet);

        let sweep = tx(vec![OutPoint::new(spend.compute_txid(), 1)], vec![(foreign(), 18_000)]);
        assert_eq!(
            scanner.scan_transaction(&sweep, 4).unwrap().unwrap().tx_type,
            TxType::SpendWithoutChange
        );
    }

    #[test]
    fn test_irrelevant_transaction_not_stored() {
        let (params, wallet) = wallet();
        let meta = MetadataFile::new(&wallet);
        let mut scanner = ChainScanner::new(&params, &wallet, &meta);
        let unrelated = tx(vec![], vec![(foreign(), 1_000)]);
        assert!(scanner.scan_transaction(&unrelated, 1).unwrap().is_none());
    }

    #[test]
    fn test_coinstake_markers_are_protocol_outputs() {
        let (params, wallet) = wallet();
        let meta = MetadataFile::new(&wallet);
        let mut scanner = ChainScanner::new(&params, &wallet, &meta);
        let ours = scripts(&wallet, 1);

        let funding = tx(vec![], vec![(ours[0].clone(), 50_000)]);
        scanner.scan_transaction(&funding, 1).unwrap();

        let op_return = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x02]);
        let coinstake = tx(
            vec![OutPoint::new(funding.compute_txid(), 0)],
            vec![(ScriptBuf::new(), 0), (op_return, 0), (ours[0].clone(), 60_000)],
        );
        let record = scanner.scan_transaction(&coinstake, 2).unwrap().unwrap();
        assert_eq!(record.tx_type, TxType::Coinstake);
        assert_eq!(record.received.len(), 1);
        assert!(record.destinations.is_empty());
    }
}
