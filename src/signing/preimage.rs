//! Witness v0 Pre-Image Hashing
//!
//! Hand-built BIP-143 signature hash for script inputs. Must stay
//! byte-identical to `bitcoin::sighash::SighashCache`; the tests below and
//! the service's cross-check mode compare the two.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{PubkeyHash, Script, ScriptBuf, Transaction, TxOut};

#[derive(Debug, thiserror::Error)]
pub enum SighashError {
    #[error("Input index {index} out of range ({inputs} inputs)")]
    InvalidInputIndex { index: usize, inputs: usize },

    #[error("Script is not a witness v0 key hash program")]
    NotWitnessKeyHash,
}

pub type SighashResult<T> = Result<T, SighashError>;

/// BIP-143 signature hash of input `input_index` spending `value` satoshis
/// under `script_code`.
pub fn segwit_v0_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: u64,
    sighash_type: EcdsaSighashType,
) -> SighashResult<[u8; 32]> {
    let input = tx.input.get(input_index).ok_or(SighashError::InvalidInputIndex {
        index: input_index,
        inputs: tx.input.len(),
    })?;

    let type_byte = sighash_type.to_u32();
    let anyone_can_pay = type_byte & 0x80 != 0;
    let base = type_byte & 0x1f;
    let is_single = base == EcdsaSighashType::Single.to_u32();
    let is_none = base == EcdsaSighashType::None.to_u32();

    let mut preimage = Vec::with_capacity(156 + script_code.len());

    // 1. nVersion
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());

    // 2. hashPrevouts
    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut prevouts = Vec::with_capacity(tx.input.len() * 36);
        for txin in &tx.input {
            prevouts.extend_from_slice(&txin.previous_output.txid.to_byte_array());
            prevouts.extend_from_slice(&txin.previous_output.vout.to_le_bytes());
        }
        sha256d::Hash::hash(&prevouts).to_byte_array()
    };
    preimage.extend_from_slice(&hash_prevouts);

    // 3. hashSequence
    let hash_sequence = if anyone_can_pay || is_single || is_none {
        [0u8; 32]
    } else {
        let mut sequences = Vec::with_capacity(tx.input.len() * 4);
        for txin in &tx.input {
            sequences.extend_from_slice(&txin.sequence.0.to_le_bytes());
        }
        sha256d::Hash::hash(&sequences).to_byte_array()
    };
    preimage.extend_from_slice(&hash_sequence);

    // 4. outpoint
    preimage.extend_from_slice(&input.previous_output.txid.to_byte_array());
    preimage.extend_from_slice(&input.previous_output.vout.to_le_bytes());

    // 5. scriptCode
    write_compact_size(&mut preimage, script_code.len() as u64);
    preimage.extend_from_slice(script_code.as_bytes());

    // 6. amount
    preimage.extend_from_slice(&value.to_le_bytes());

    // 7. nSequence
    preimage.extend_from_slice(&input.sequence.0.to_le_bytes());

    // 8. hashOutputs
    let hash_outputs = if !is_single && !is_none {
        let mut outputs = Vec::new();
        for txout in &tx.output {
            write_output(&mut outputs, txout);
        }
        sha256d::Hash::hash(&outputs).to_byte_array()
    } else if is_single && input_index < tx.output.len() {
        let mut single = Vec::new();
        write_output(&mut single, &tx.output[input_index]);
        sha256d::Hash::hash(&single).to_byte_array()
    } else {
        [0u8; 32]
    };
    preimage.extend_from_slice(&hash_outputs);

    // 9. nLockTime
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());

    // 10. sighash type
    preimage.extend_from_slice(&type_byte.to_le_bytes());

    Ok(sha256d::Hash::hash(&preimage).to_byte_array())
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG` for a P2WPKH program
pub fn p2wpkh_script_code(script_pubkey: &Script) -> SighashResult<ScriptBuf> {
    if !script_pubkey.is_p2wpkh() {
        return Err(SighashError::NotWitnessKeyHash);
    }
    let program = &script_pubkey.as_bytes()[2..22];
    let hash = PubkeyHash::from_slice(program).map_err(|_| SighashError::NotWitnessKeyHash)?;
    Ok(ScriptBuf::new_p2pkh(&hash))
}

fn write_output(buf: &mut Vec<u8>, txout: &TxOut) {
    buf.extend_from_slice(&txout.value.to_sat().to_le_bytes());
    write_compact_size(buf, txout.script_pubkey.len() as u64);
    buf.extend_from_slice(txout.script_pubkey.as_bytes());
}

fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::sighash::SighashCache;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, Txid, WPubkeyHash, Witness};

    fn sample_tx(outputs: usize) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(17),
            input: (0..3u8)
                .map(|i| TxIn {
                    previous_output: OutPoint::new(Txid::from_byte_array([i + 1; 32]), i as u32),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence(0xffff_fffd - i as u32),
                    witness: Witness::new(),
                })
                .collect(),
            output: (0..outputs as u8)
                .map(|i| TxOut {
                    value: Amount::from_sat(10_000 * (i as u64 + 1)),
                    script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([i; 20])),
                })
                .collect(),
        }
    }

    fn witness_script() -> ScriptBuf {
        // Any script works as a script code; make it long enough to matter
        ScriptBuf::from_bytes(vec![0x51; 71])
    }

    #[test]
    fn test_matches_sighash_cache_for_every_type() {
        let types = [
            EcdsaSighashType::All,
            EcdsaSighashType::None,
            EcdsaSighashType::Single,
            EcdsaSighashType::AllPlusAnyoneCanPay,
            EcdsaSighashType::NonePlusAnyoneCanPay,
            EcdsaSighashType::SinglePlusAnyoneCanPay,
        ];
        let tx = sample_tx(2);
        let script = witness_script();
        for ty in types {
            for index in 0..tx.input.len() {
                let ours = segwit_v0_sighash(&tx, index, &script, 123_456, ty).unwrap();
                let theirs = SighashCache::new(&tx)
                    .p2wsh_signature_hash(index, &script, Amount::from_sat(123_456), ty)
                    .unwrap();
                assert_eq!(ours, theirs.to_byte_array(), "type {:?} input {}", ty, index);
            }
        }
    }

    #[test]
    fn test_p2wpkh_script_code_matches_cache() {
        let tx = sample_tx(1);
        let spk = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([9; 20]));
        let code = p2wpkh_script_code(&spk).unwrap();
        let ours = segwit_v0_sighash(&tx, 1, &code, 5_000, EcdsaSighashType::All).unwrap();
        let theirs = SighashCache::new(&tx)
            .p2wpkh_signature_hash(1, &spk, Amount::from_sat(5_000), EcdsaSighashType::All)
            .unwrap();
        assert_eq!(ours, theirs.to_byte_array());
    }

    #[test]
    fn test_long_script_code_uses_wide_length_prefix() {
        let tx = sample_tx(1);
        let script = ScriptBuf::from_bytes(vec![0x51; 300]);
        let ours = segwit_v0_sighash(&tx, 0, &script, 1, EcdsaSighashType::All).unwrap();
        let theirs = SighashCache::new(&tx)
            .p2wsh_signature_hash(0, &script, Amount::from_sat(1), EcdsaSighashType::All)
            .unwrap();
        assert_eq!(ours, theirs.to_byte_array());
    }

    #[test]
    fn test_invalid_input_index() {
        let tx = sample_tx(1);
        let err = segwit_v0_sighash(&tx, 3, &witness_script(), 1, EcdsaSighashType::All).unwrap_err();
        assert!(matches!(err, SighashError::InvalidInputIndex { index: 3, inputs: 3 }));
    }

    #[test]
    fn test_script_code_requires_p2wpkh() {
        assert!(p2wpkh_script_code(&witness_script()).is_err());
    }
}
