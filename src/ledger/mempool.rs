//! Unconfirmed wallet transactions, ordered by arrival

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::TransactionMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastState {
    /// Built by this wallet, not handed to the node
    NotBroadcast,
    Broadcast,
    /// Seen from the network
    Relayed,
    /// The node refused it; ignored by the balance
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPoolEntry {
    pub transaction: TransactionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hex: Option<String>,
    pub arrival_utc: i64,
    pub broadcast_state: BroadcastState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_error: Option<String>,
}

impl MemoryPoolEntry {
    pub fn txid(&self) -> Txid {
        self.transaction.hash
    }

    pub fn counts_toward_balance(&self) -> bool {
        self.broadcast_state != BroadcastState::Rejected
    }

    fn spends_any(&self, outpoints: &HashSet<OutPoint>) -> bool {
        self.transaction.spent.values().any(|u| outpoints.contains(&u.outpoint()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryPool {
    entries: Vec<MemoryPoolEntry>,
}

impl MemoryPool {
    /// Insert keeping arrival order; a re-seen txid replaces its entry but
    /// keeps the original arrival time.
    pub fn insert(&mut self, mut entry: MemoryPoolEntry) {
        if let Some(pos) = self.entries.iter().position(|e| e.txid() == entry.txid()) {
            entry.arrival_utc = self.entries[pos].arrival_utc;
            self.entries[pos] = entry;
            return;
        }
        let pos = self.entries.partition_point(|e| e.arrival_utc <= entry.arrival_utc);
        self.entries.insert(pos, entry);
    }

    pub fn get(&self, txid: &Txid) -> Option<&MemoryPoolEntry> {
        self.entries.iter().find(|e| e.txid() == *txid)
    }

    pub fn get_mut(&mut self, txid: &Txid) -> Option<&mut MemoryPoolEntry> {
        self.entries.iter_mut().find(|e| e.txid() == *txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.get(txid).is_some()
    }

    pub fn remove(&mut self, txid: &Txid) -> Option<MemoryPoolEntry> {
        let pos = self.entries.iter().position(|e| e.txid() == *txid)?;
        Some(self.entries.remove(pos))
    }

    /// Entries in arrival order
    pub fn iter(&self) -> std::slice::Iter<'_, MemoryPoolEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries that confirmed or conflict with confirmed spends
    pub fn remove_confirmed(&mut self, confirmed: &HashSet<Txid>, spent: &HashSet<OutPoint>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !confirmed.contains(&e.txid()) && !e.spends_any(spent));
        before - self.entries.len()
    }
}
