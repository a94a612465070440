//! First-fit coin selection over a deterministic candidate order

use crate::balances::SegWitCoin;

/// Oldest confirmation first, then txid, then output index
pub fn order_candidates(coins: &mut [SegWitCoin]) {
    coins.sort_by(|a, b| {
        a.height
            .cmp(&b.height)
            .then_with(|| a.outpoint.txid.cmp(&b.outpoint.txid))
            .then_with(|| a.outpoint.vout.cmp(&b.outpoint.vout))
    });
}

/// Take candidates in order until `target` is covered.
/// Returns the prefix length and its value, or `None` if all of them fall short.
pub fn select_first_fit(candidates: &[SegWitCoin], target: u64) -> Option<(usize, u64)> {
    let mut total = 0u64;
    for (i, coin) in candidates.iter().enumerate() {
        if total >= target && i > 0 {
            return Some((i, total));
        }
        total += coin.value;
    }
    if total >= target && !candidates.is_empty() {
        Some((candidates.len(), total))
    } else {
        None
    }
}

pub fn total_value(coins: &[SegWitCoin]) -> u64 {
    coins.iter().map(|c| c.value).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TxType;
    use crate::wallet::AddressKind;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, ScriptBuf, Txid};

    fn coin(height: u32, tag: u8, vout: u32, value: u64) -> SegWitCoin {
        SegWitCoin {
            outpoint: OutPoint::new(Txid::from_byte_array([tag; 32]), vout),
            value,
            address: "rstk1q".to_string(),
            kind: AddressKind::PubKeyHash,
            script_pubkey: ScriptBuf::new(),
            redeem_script: None,
            height,
            tx_type: TxType::Receive,
        }
    }

    #[test]
    fn test_ordering() {
        let mut coins = vec![coin(5, 1, 0, 1), coin(2, 9, 1, 2), coin(2, 9, 0, 3), coin(2, 3, 4, 4)];
        order_candidates(&mut coins);
        let values: Vec<u64> = coins.iter().map(|c| c.value).collect();
        assert_eq!(values, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_first_fit() {
        let coins = vec![coin(1, 1, 0, 100), coin(2, 2, 0, 50), coin(3, 3, 0, 500)];
        assert_eq!(select_first_fit(&coins, 100), Some((1, 100)));
        assert_eq!(select_first_fit(&coins, 101), Some((2, 150)));
        assert_eq!(select_first_fit(&coins, 650), Some((3, 650)));
        assert_eq!(select_first_fit(&coins, 651), None);
        assert_eq!(select_first_fit(&[], 1), None);
    }

    #[test]
    fn test_zero_target_still_takes_one_input() {
        let coins = vec![coin(1, 1, 0, 100)];
        assert_eq!(select_first_fit(&coins, 0), Some((1, 100)));
    }
}
