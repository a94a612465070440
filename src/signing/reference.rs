//! Reference signer backed by `bitcoin::sighash::SighashCache`

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Transaction, Witness};

use super::SigningInput;
use crate::error::{WalletError, WalletResult};

/// Signs every input kind through the library sighash implementation
pub struct ReferenceSigner {
    secp: Secp256k1<All>,
}

impl Default for ReferenceSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSigner {
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }

    pub fn sign(&self, unsigned: &Transaction, inputs: &[SigningInput]) -> WalletResult<Transaction> {
        if inputs.len() != unsigned.input.len() {
            return Err(WalletError::signing_failed("Signing input count does not match transaction"));
        }

        let mut cache = SighashCache::new(unsigned);
        let mut witnesses = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let amount = Amount::from_sat(input.coin.value);
            let sighash = match &input.coin.redeem_script {
                None => cache
                    .p2wpkh_signature_hash(index, &input.coin.script_pubkey, amount, EcdsaSighashType::All)
                    .map_err(|e| WalletError::signing_failed(e.to_string()))?,
                Some(redeem) => cache
                    .p2wsh_signature_hash(index, redeem, amount, EcdsaSighashType::All)
                    .map_err(|e| WalletError::signing_failed(e.to_string()))?,
            };

            let message = Message::from_digest(sighash.to_byte_array());
            let mut sig_bytes = self.secp.sign_ecdsa(&message, &input.secret_key).serialize_der().to_vec();
            sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);

            let witness = match &input.coin.redeem_script {
                None => {
                    let pubkey = input.secret_key.public_key(&self.secp).serialize();
                    Witness::from_slice(&[sig_bytes, pubkey.to_vec()])
                }
                Some(redeem) => Witness::from_slice(&[Vec::new(), sig_bytes, redeem.to_bytes()]),
            };
            witnesses.push(witness);
        }

        let mut signed = unsigned.clone();
        for (txin, witness) in signed.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }
        Ok(signed)
    }
}
