//! Coinstake and PoS block assembly

use bitcoin::absolute::LockTime;
use bitcoin::block::{self, Header};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut,
    Witness,
};

use crate::balances::StakingCoin;
use crate::error::{WalletError, WalletResult};
use crate::node::BlockTemplate;
use crate::utils::ChainParams;

/// `OP_RETURN <pubkey>`: publishes the key that signs the block
pub fn staker_key_script(public_key: &CompressedPublicKey) -> WalletResult<ScriptBuf> {
    let push = PushBytesBuf::try_from(public_key.to_bytes().to_vec())
        .map_err(|_| WalletError::invalid_script("Public key push too large"))?;
    Ok(Builder::new().push_opcode(OP_RETURN).push_slice(push).into_script())
}

/// Read the staker key back out of output 1 of a coinstake
pub fn staker_key(coinstake: &Transaction) -> Option<CompressedPublicKey> {
    let script = coinstake.output.get(1)?.script_pubkey.as_bytes();
    // OP_RETURN, push-33, key
    if script.len() != 35 || script[0] != OP_RETURN.to_u8() || script[1] != 33 {
        return None;
    }
    CompressedPublicKey::from_slice(&script[2..]).ok()
}

/// Unsigned coinstake: `[empty marker, OP_RETURN <pubkey>, coin + reward + fees]`
pub fn build_coinstake(
    params: &ChainParams,
    coin: &StakingCoin,
    public_key: &CompressedPublicKey,
    template: &BlockTemplate,
) -> WalletResult<Transaction> {
    let value = coin
        .coin
        .value
        .checked_add(template.stake_reward)
        .and_then(|v| v.checked_add(template.total_fees))
        .ok_or_else(|| WalletError::inconsistent("Coinstake value overflows"))?;

    Ok(Transaction {
        version: Version(params.tx_version),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: coin.coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::new(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: staker_key_script(public_key)?,
            },
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: coin.coin.script_pubkey.clone(),
            },
        ],
    })
}

/// PoS coinbase: BIP34 height and a single empty output
pub fn build_coinbase(params: &ChainParams, height: u32) -> Transaction {
    Transaction {
        version: Version(params.tx_version),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(height as i64).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Coinbase, signed coinstake, then the template's transactions
pub fn assemble_block(params: &ChainParams, template: &BlockTemplate, coinstake: Transaction, time: u32) -> Block {
    let mut txdata = Vec::with_capacity(template.transactions.len() + 2);
    txdata.push(build_coinbase(params, template.height));
    txdata.push(coinstake);
    txdata.extend(template.transactions.iter().cloned());

    let mut block = Block {
        header: Header {
            version: block::Version::from_consensus(template.block_version),
            prev_blockhash: template.previous_block_hash,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: template.bits,
            nonce: 0,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balances::SegWitCoin;
    use crate::ledger::{is_coinstake, TxType};
    use crate::utils::KeyEncryptionKey;
    use crate::utils::{KdfParams, KdfSettings};
    use crate::wallet::{AddressKind, KeyMaterial, KeyMaterialKind};
    use bitcoin::pow::CompactTarget;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{BlockHash, Txid};
    use secrecy::SecretString;

    fn staking_coin() -> (StakingCoin, CompressedPublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[7; 32]).unwrap();
        let public = CompressedPublicKey(secret.public_key(&secp));
        let kek = KeyEncryptionKey::derive(
            &SecretString::from("pw".to_string()),
            &KdfSettings::generate(KdfParams::insecure_fast()),
        )
        .unwrap();
        let key = KeyMaterial::seal(KeyMaterialKind::Generated, None, &secret, &kek).unwrap();
        let coin = StakingCoin {
            coin: SegWitCoin {
                outpoint: OutPoint::new(Txid::from_byte_array([3; 32]), 1),
                value: 10_000,
                address: "rstk1q".to_string(),
                kind: AddressKind::PubKeyHash,
                script_pubkey: ScriptBuf::new_p2wpkh(&public.wpubkey_hash()),
                redeem_script: None,
                height: 4,
                tx_type: TxType::Receive,
            },
            tx_version: 2,
            block_height: 4,
            block_time: 1_000,
            staking_key: key,
        };
        (coin, public)
    }

    fn template() -> BlockTemplate {
        BlockTemplate {
            height: 30,
            previous_block_hash: BlockHash::from_byte_array([1; 32]),
            bits: CompactTarget::from_consensus(0x207fffff),
            block_version: 4,
            transactions: vec![],
            total_fees: 250,
            stake_reward: 5_000,
        }
    }

    #[test]
    fn test_coinstake_shape() {
        let params = ChainParams::regtest();
        let (coin, public) = staking_coin();
        let tx = build_coinstake(&params, &coin, &public, &template()).unwrap();

        assert!(is_coinstake(&tx));
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[2].value.to_sat(), 15_250);
        assert_eq!(tx.output[2].script_pubkey, coin.coin.script_pubkey);
        assert_eq!(tx.input[0].sequence, Sequence::MAX);
        assert_eq!(staker_key(&tx), Some(public));
    }

    #[test]
    fn test_block_layout() {
        let params = ChainParams::regtest();
        let (coin, public) = staking_coin();
        let template = template();
        let coinstake = build_coinstake(&params, &coin, &public, &template).unwrap();
        let block = assemble_block(&params, &template, coinstake.clone(), 1_600);

        assert!(block.txdata[0].is_coinbase());
        assert_eq!(block.txdata[1], coinstake);
        assert_eq!(block.header.time, 1_600);
        assert_eq!(block.header.prev_blockhash, template.previous_block_hash);
        assert!(block.check_merkle_root());
    }
}
