//! Signing Service
//!
//! Produces per-kind witnesses for wallet inputs:
//!
//! - **P2WPKH**: `[DER||0x01, pubkey]` over the library witness v0 sighash
//! - **P2WSH** (multisig, cold staking): `[<empty>, DER||0x01, redeem_script]`
//!   over the hand-built sighash in [`preimage`]. The empty element feeds
//!   CHECKMULTISIG's extra stack pop.
//!
//! Each key is checked against the coin's script before anything is signed.
//! With cross-checking on, the result is re-signed by [`ReferenceSigner`] and
//! both serializations must match byte for byte.

pub mod preimage;
pub mod reference;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, BlockHash, CompressedPublicKey, Transaction, Witness};

use crate::balances::SegWitCoin;
use crate::error::{WalletError, WalletResult};
use crate::wallet::address::{commits_to_redeem_script, p2wpkh_script, parse_multisig_redeem_script};

pub use preimage::{p2wpkh_script_code, segwit_v0_sighash, SighashError};
pub use reference::ReferenceSigner;

impl From<SighashError> for WalletError {
    fn from(e: SighashError) -> Self {
        WalletError::signing_failed(e.to_string())
    }
}

/// A coin being spent and the decrypted key that unlocks it
pub struct SigningInput {
    pub coin: SegWitCoin,
    pub secret_key: SecretKey,
}

impl SigningInput {
    pub fn new(coin: SegWitCoin, secret_key: SecretKey) -> Self {
        Self { coin, secret_key }
    }
}

impl Drop for SigningInput {
    fn drop(&mut self) {
        self.secret_key.non_secure_erase();
    }
}

pub struct SigningService {
    secp: Secp256k1<All>,
    cross_check: bool,
}

impl Default for SigningService {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningService {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            cross_check: false,
        }
    }

    pub fn with_cross_check(mut self, enabled: bool) -> Self {
        self.cross_check = enabled;
        self
    }

    /// Sign every input of `unsigned`; `inputs[i]` must spend `unsigned.input[i]`
    pub fn sign(&self, unsigned: &Transaction, inputs: &[SigningInput]) -> WalletResult<Transaction> {
        if inputs.len() != unsigned.input.len() {
            return Err(WalletError::signing_failed(format!(
                "{} signing inputs for {} transaction inputs",
                inputs.len(),
                unsigned.input.len()
            )));
        }

        let mut cache = SighashCache::new(unsigned);
        let mut witnesses = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            if unsigned.input[index].previous_output != input.coin.outpoint {
                return Err(WalletError::signing_failed(format!(
                    "Input {} spends {}, signing input is for {}",
                    index, unsigned.input[index].previous_output, input.coin.outpoint
                )));
            }
            let public_key = self.check_key(input)?;

            let witness = match &input.coin.redeem_script {
                None => {
                    let sighash = cache
                        .p2wpkh_signature_hash(
                            index,
                            &input.coin.script_pubkey,
                            Amount::from_sat(input.coin.value),
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| WalletError::signing_failed(e.to_string()))?;
                    let signature = self.signature_bytes(sighash.to_byte_array(), &input.secret_key);
                    Witness::from_slice(&[signature, public_key.to_bytes().to_vec()])
                }
                Some(redeem) => {
                    let sighash =
                        segwit_v0_sighash(unsigned, index, redeem, input.coin.value, EcdsaSighashType::All)?;
                    let signature = self.signature_bytes(sighash, &input.secret_key);
                    Witness::from_slice(&[Vec::new(), signature, redeem.to_bytes()])
                }
            };
            witnesses.push(witness);
        }

        let mut signed = unsigned.clone();
        for (txin, witness) in signed.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }

        if self.cross_check {
            let reference = ReferenceSigner::new().sign(unsigned, inputs)?;
            if serialize(&reference) != serialize(&signed) {
                return Err(WalletError::inconsistent(format!(
                    "Signature cross-check failed for {}",
                    signed.compute_txid()
                )));
            }
        }

        Ok(signed)
    }

    /// DER signature over a block hash
    pub fn sign_block_hash(&self, block_hash: &BlockHash, key: &SecretKey) -> Vec<u8> {
        let message = Message::from_digest(block_hash.to_byte_array());
        self.secp.sign_ecdsa(&message, key).serialize_der().to_vec()
    }

    pub fn verify_block_signature(&self, block_hash: &BlockHash, signature: &[u8], public_key: &PublicKey) -> bool {
        let message = Message::from_digest(block_hash.to_byte_array());
        match ecdsa::Signature::from_der(signature) {
            Ok(sig) => self.secp.verify_ecdsa(&message, &sig, public_key).is_ok(),
            Err(_) => false,
        }
    }

    /// The key must control the coin's script: hash to the P2WPKH program, or
    /// appear in a redeem script the P2WSH program commits to.
    fn check_key(&self, input: &SigningInput) -> WalletResult<CompressedPublicKey> {
        let public_key = CompressedPublicKey(input.secret_key.public_key(&self.secp));
        let coin = &input.coin;
        match &coin.redeem_script {
            None => {
                if !coin.script_pubkey.is_p2wpkh() {
                    return Err(WalletError::invalid_script(format!(
                        "Coin {} has no redeem script and is not P2WPKH",
                        coin.outpoint
                    )));
                }
                if coin.script_pubkey != p2wpkh_script(&public_key) {
                    return Err(WalletError::inconsistent(format!(
                        "Key does not match the script of {}",
                        coin.outpoint
                    )));
                }
            }
            Some(redeem) => {
                if !commits_to_redeem_script(&coin.script_pubkey, redeem) {
                    return Err(WalletError::redeem_script_mismatch(format!(
                        "Script of {} does not commit to its redeem script",
                        coin.outpoint
                    )));
                }
                let (_, keys) = parse_multisig_redeem_script(redeem)?;
                if !keys.contains(&public_key) {
                    return Err(WalletError::inconsistent(format!(
                        "Key is not part of the redeem script of {}",
                        coin.outpoint
                    )));
                }
            }
        }
        Ok(public_key)
    }

    fn signature_bytes(&self, digest: [u8; 32], key: &SecretKey) -> Vec<u8> {
        let message = Message::from_digest(digest);
        let mut bytes = self.secp.sign_ecdsa(&message, key).serialize_der().to_vec();
        bytes.push(EcdsaSighashType::All.to_u32() as u8);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::ledger::TxType;
    use crate::wallet::address::{cold_staking_redeem_script, multisig_redeem_script, p2wsh_script};
    use crate::wallet::AddressKind;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid};

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn pubkey(secret: &SecretKey) -> CompressedPublicKey {
        CompressedPublicKey(secret.public_key(&Secp256k1::new()))
    }

    fn coin(tag: u8, script_pubkey: ScriptBuf, redeem: Option<ScriptBuf>, kind: AddressKind) -> SegWitCoin {
        SegWitCoin {
            outpoint: OutPoint::new(Txid::from_byte_array([tag; 32]), tag as u32),
            value: 75_000 + tag as u64,
            address: format!("addr{}", tag),
            kind,
            script_pubkey,
            redeem_script: redeem,
            height: 1,
            tx_type: TxType::Receive,
        }
    }

    fn unsigned(coins: &[&SegWitCoin]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: coins
                .iter()
                .map(|c| TxIn {
                    previous_output: c.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: p2wpkh_script(&pubkey(&key(99))),
            }],
        }
    }

    fn mixed_inputs() -> Vec<SigningInput> {
        let pkh_key = key(1);
        let pkh = coin(1, p2wpkh_script(&pubkey(&pkh_key)), None, AddressKind::PubKeyHash);

        let own = key(2);
        let ms_redeem = multisig_redeem_script(1, &[pubkey(&own), pubkey(&key(3))]).unwrap();
        let ms = coin(2, p2wsh_script(&ms_redeem), Some(ms_redeem), AddressKind::MultiSig);

        let hot = key(4);
        let cold = key(5);
        let cs_redeem = cold_staking_redeem_script(&pubkey(&hot), &pubkey(&cold)).unwrap();
        let cs = coin(3, p2wsh_script(&cs_redeem), Some(cs_redeem), AddressKind::ColdStaking);

        vec![
            SigningInput::new(pkh, pkh_key),
            SigningInput::new(ms, own),
            SigningInput::new(cs, hot),
        ]
    }

    #[test]
    fn test_service_matches_reference_for_all_kinds() {
        let inputs = mixed_inputs();
        let tx = unsigned(&inputs.iter().map(|i| &i.coin).collect::<Vec<_>>());

        let ours = SigningService::new().sign(&tx, &inputs).unwrap();
        let theirs = ReferenceSigner::new().sign(&tx, &inputs).unwrap();
        assert_eq!(serialize(&ours), serialize(&theirs));
        assert_eq!(ours.compute_txid(), theirs.compute_txid());
        assert_eq!(ours.compute_wtxid(), theirs.compute_wtxid());
    }

    #[test]
    fn test_witness_layouts() {
        let inputs = mixed_inputs();
        let tx = unsigned(&inputs.iter().map(|i| &i.coin).collect::<Vec<_>>());
        let signed = SigningService::new().with_cross_check(true).sign(&tx, &inputs).unwrap();

        let pkh = &signed.input[0].witness;
        assert_eq!(pkh.len(), 2);
        assert_eq!(pkh.nth(1).unwrap().len(), 33);

        for (i, txin) in signed.input.iter().enumerate().skip(1) {
            let witness = &txin.witness;
            assert_eq!(witness.len(), 3);
            assert!(witness.nth(0).unwrap().is_empty());
            assert_eq!(witness.nth(1).unwrap().last(), Some(&0x01));
            assert_eq!(witness.nth(2).unwrap(), inputs[i].coin.redeem_script.as_ref().unwrap().as_bytes());
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut inputs = mixed_inputs();
        let tx = unsigned(&inputs.iter().map(|i| &i.coin).collect::<Vec<_>>());
        // Cold key owns the cold-staking script too; an unrelated key does not
        inputs[2].secret_key = key(77);
        let err = SigningService::new().sign(&tx, &inputs).unwrap_err();
        assert_eq!(err.code, ErrorCode::InconsistentState);

        let mut inputs = mixed_inputs();
        inputs[0].secret_key = key(2);
        let err = SigningService::new().sign(&tx, &inputs).unwrap_err();
        assert_eq!(err.code, ErrorCode::InconsistentState);
    }

    #[test]
    fn test_redeem_script_not_committed() {
        let mut inputs = mixed_inputs();
        let tx = unsigned(&inputs.iter().map(|i| &i.coin).collect::<Vec<_>>());
        let other = multisig_redeem_script(1, &[pubkey(&key(2))]).unwrap();
        inputs[1].coin.redeem_script = Some(other);
        let err = SigningService::new().sign(&tx, &inputs).unwrap_err();
        assert_eq!(err.code, ErrorCode::RedeemScriptMismatch);
    }

    #[test]
    fn test_input_order_enforced() {
        let inputs = mixed_inputs();
        let mut coins: Vec<&SegWitCoin> = inputs.iter().map(|i| &i.coin).collect();
        coins.swap(0, 1);
        let tx = unsigned(&coins);
        assert!(SigningService::new().sign(&tx, &inputs).is_err());
        assert!(SigningService::new().sign(&tx, &inputs[..1]).is_err());
    }

    #[test]
    fn test_block_signature() {
        let service = SigningService::new();
        let secret = key(8);
        let hash = BlockHash::from_byte_array([3; 32]);
        let sig = service.sign_block_hash(&hash, &secret);
        let public = secret.public_key(&Secp256k1::new());
        assert!(service.verify_block_signature(&hash, &sig, &public));
        assert!(!service.verify_block_signature(&BlockHash::from_byte_array([4; 32]), &sig, &public));
        assert!(!service.verify_block_signature(&hash, &[0x30, 0x00], &public));
    }
}
