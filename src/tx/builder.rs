//! Transaction Builder
//!
//! Resolves recipients and burns into outputs, picks candidate coins for the
//! requested source, and runs the fee fixed-point loop:
//!
//! 1. select first-fit coins covering `total_send + fee`
//! 2. size the transaction with worst-case witnesses and one change output
//! 3. `required = vsize * rate`; stop when it equals `fee`, else repeat
//!
//! Fees only grow between iterations, so the loop reaches its fixed point;
//! the iteration cap turns a bug into a consistency error instead of a hang.

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{Amount, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use serde::{Deserialize, Serialize};

use super::coin_selection::{order_candidates, select_first_fit, total_value};
use crate::balances::{Balance, SegWitCoin};
use crate::error::{WalletError, WalletResult};
use crate::fees::{estimate_vsize, FeeRate, InputShape};
use crate::utils::{ChainParams, WalletSettings};
use crate::wallet::address::commits_to_redeem_script;
use crate::wallet::{decode_address, AddressKind, WalletFile};

/// Largest OP_RETURN payload relayed by standard policy
pub const MAX_BURN_DATA: usize = 80;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub address: String,
    pub amount: u64,
}

/// Value destroyed into an `OP_RETURN <data>` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Burn {
    pub amount: u64,
    /// Payload (hex)
    #[serde(default)]
    pub data: String,
}

/// Which coins fund a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpendFrom {
    /// Any spendable PubKeyHash coin; change to a fresh change address
    PubKeyHash,
    /// Every coin at one multisig address; change back to it
    MultiSig { address: String },
    /// Every coin at one cold-staking address; change back to it
    ColdStaking { address: String },
}

impl SpendFrom {
    pub fn kind(&self) -> AddressKind {
        match self {
            SpendFrom::PubKeyHash => AddressKind::PubKeyHash,
            SpendFrom::MultiSig { .. } => AddressKind::MultiSig,
            SpendFrom::ColdStaking { .. } => AddressKind::ColdStaking,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutput {
    pub address: String,
    pub amount: u64,
    pub vout: u32,
}

/// Outcome of the fee loop; nothing has been signed or recorded yet
#[derive(Debug, Clone)]
pub struct TransactionPlan {
    pub unsigned: Transaction,
    pub inputs: Vec<SegWitCoin>,
    pub total_send: u64,
    pub fee: u64,
    /// Estimated vsize with worst-case signatures and a change output
    pub virtual_size: u64,
    pub fee_rate: FeeRate,
    pub change: Option<ChangeOutput>,
    pub iterations: u32,
}

impl TransactionPlan {
    pub fn input_total(&self) -> u64 {
        total_value(&self.inputs)
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Validate recipients and burns and turn them into outputs, in order
pub fn resolve_outputs(params: &ChainParams, recipients: &[Payment], burns: &[Burn]) -> WalletResult<Vec<TxOut>> {
    if recipients.is_empty() && burns.is_empty() {
        return Err(WalletError::invalid_input("At least one recipient or burn is required"));
    }

    let mut outputs = Vec::with_capacity(recipients.len() + burns.len() + 1);
    for payment in recipients {
        if payment.amount == 0 {
            return Err(WalletError::invalid_input(format!("Zero amount to {}", payment.address)));
        }
        check_money_range(payment.amount)?;
        outputs.push(TxOut {
            value: Amount::from_sat(payment.amount),
            script_pubkey: decode_address(&params.bech32_hrp, &payment.address)?,
        });
    }
    for burn in burns {
        check_money_range(burn.amount)?;
        outputs.push(TxOut {
            value: Amount::from_sat(burn.amount),
            script_pubkey: burn_script(&burn.data)?,
        });
    }
    total_output_value(&outputs)?;
    Ok(outputs)
}

fn check_money_range(amount: u64) -> WalletResult<()> {
    if amount > Amount::MAX_MONEY.to_sat() {
        return Err(WalletError::invalid_input(format!(
            "Amount {} exceeds the money supply",
            amount
        )));
    }
    Ok(())
}

/// Sum of output values, bounded by the money supply
fn total_output_value(outputs: &[TxOut]) -> WalletResult<u64> {
    outputs
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()))
        .filter(|total| *total <= Amount::MAX_MONEY.to_sat())
        .ok_or_else(|| WalletError::invalid_input("Total output value exceeds the money supply"))
}

pub fn burn_script(data_hex: &str) -> WalletResult<ScriptBuf> {
    let data = hex::decode(data_hex.trim())
        .map_err(|e| WalletError::invalid_script(format!("Invalid burn data: {}", e)))?;
    if data.len() > MAX_BURN_DATA {
        return Err(WalletError::invalid_script(format!(
            "Burn data is {} bytes, limit is {}",
            data.len(),
            MAX_BURN_DATA
        )));
    }
    let push = PushBytesBuf::try_from(data).map_err(|_| WalletError::invalid_script("Burn data too large"))?;
    Ok(Builder::new().push_opcode(OP_RETURN).push_slice(push).into_script())
}

/// Run the fee fixed-point loop over ordered `candidates`
pub fn plan_transaction(
    params: &ChainParams,
    settings: &WalletSettings,
    candidates: &[SegWitCoin],
    outputs: Vec<TxOut>,
    fee_rate: FeeRate,
    change_address: &str,
    change_script: &Script,
) -> WalletResult<TransactionPlan> {
    let total_send = total_output_value(&outputs)?;
    let available = total_value(candidates);
    if available < total_send {
        return Err(WalletError::insufficient_funds(total_send, available));
    }

    let dust = fee_rate.dust_threshold(params.dust_multiplier)?;
    let mut fee = 0u64;

    for iteration in 1..=settings.fee_loop_max_iterations {
        let target = total_send
            .checked_add(fee)
            .ok_or_else(|| WalletError::invalid_input("Amount plus fee overflows"))?;
        let (count, selected_total) =
            select_first_fit(candidates, target).ok_or_else(|| WalletError::insufficient_funds(target, available))?;
        let selected = &candidates[..count];

        let shapes = selected
            .iter()
            .map(|c| InputShape::for_redeem_script(c.redeem_script.as_deref()))
            .collect::<WalletResult<Vec<_>>>()?;

        let mut template = assemble(params, selected, &outputs);
        template.output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: change_script.to_owned(),
        });
        let virtual_size = estimate_vsize(&template, &shapes)?;
        let required = fee_rate.fee_for(virtual_size)?;

        if required != fee {
            fee = required;
            continue;
        }

        let mut unsigned = assemble(params, selected, &outputs);
        let change_value = selected_total - total_send - fee;
        let (fee, change) = if change_value >= dust {
            unsigned.output.push(TxOut {
                value: Amount::from_sat(change_value),
                script_pubkey: change_script.to_owned(),
            });
            let change = ChangeOutput {
                address: change_address.to_string(),
                amount: change_value,
                vout: (unsigned.output.len() - 1) as u32,
            };
            (fee, Some(change))
        } else {
            // Sub-dust change is absorbed into the fee
            (selected_total - total_send, None)
        };

        return Ok(TransactionPlan {
            unsigned,
            inputs: selected.to_vec(),
            total_send,
            fee,
            virtual_size,
            fee_rate,
            change,
            iterations: iteration,
        });
    }

    Err(WalletError::inconsistent(format!(
        "Fee did not converge within {} iterations",
        settings.fee_loop_max_iterations
    )))
}

/// Pick candidates for `from` out of the spendable set and plan
#[allow(clippy::too_many_arguments)]
pub fn prepare_plan(
    params: &ChainParams,
    settings: &WalletSettings,
    wallet: &WalletFile,
    balance: &Balance,
    from: &SpendFrom,
    recipients: &[Payment],
    burns: &[Burn],
    fee_rate: FeeRate,
) -> WalletResult<TransactionPlan> {
    let outputs = resolve_outputs(params, recipients, burns)?;

    match from {
        SpendFrom::PubKeyHash => {
            let mut candidates: Vec<SegWitCoin> = balance
                .spendable_coins
                .values()
                .filter(|c| c.kind == AddressKind::PubKeyHash)
                .cloned()
                .collect();
            order_candidates(&mut candidates);
            let change = wallet
                .next_unused_change_address()
                .ok_or_else(|| WalletError::address_buffer_exhausted("No unused change address available"))?;
            plan_transaction(
                params,
                settings,
                &candidates,
                outputs,
                fee_rate,
                &change.address,
                &change.script_pubkey,
            )
        }
        SpendFrom::MultiSig { address } | SpendFrom::ColdStaking { address } => {
            let record = wallet
                .find_address(address)
                .ok_or_else(|| WalletError::invalid_address(format!("{} is not a wallet address", address)))?;
            if record.kind() != from.kind() {
                return Err(WalletError::invalid_address(format!(
                    "{} is a {} address, not {}",
                    address,
                    record.kind(),
                    from.kind()
                )));
            }
            let redeem_script = record
                .redeem_script()
                .ok_or_else(|| WalletError::inconsistent("Script address without redeem script"))?;

            let mut candidates: Vec<SegWitCoin> = balance
                .spendable_coins
                .values()
                .filter(|c| c.address == *address)
                .cloned()
                .collect();
            for coin in &candidates {
                if coin.redeem_script.as_deref() != Some(redeem_script)
                    || !commits_to_redeem_script(&coin.script_pubkey, redeem_script)
                {
                    return Err(WalletError::redeem_script_mismatch(format!(
                        "Coin {} does not share the redeem script of {}",
                        coin.outpoint, address
                    )));
                }
            }
            order_candidates(&mut candidates);
            plan_transaction(
                params,
                settings,
                &candidates,
                outputs,
                fee_rate,
                record.address(),
                record.script_pubkey(),
            )
        }
    }
}

fn assemble(params: &ChainParams, inputs: &[SegWitCoin], outputs: &[TxOut]) -> Transaction {
    Transaction {
        version: Version(params.tx_version),
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|coin| TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs.to_vec(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::ledger::TxType;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid, WPubkeyHash};

    fn p2wpkh(tag: u8) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([tag; 20]))
    }

    fn coin(tag: u8, value: u64) -> SegWitCoin {
        SegWitCoin {
            outpoint: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
            value,
            address: format!("coin{}", tag),
            kind: AddressKind::PubKeyHash,
            script_pubkey: p2wpkh(tag),
            redeem_script: None,
            height: tag as u32,
            tx_type: TxType::Receive,
        }
    }

    fn pay(sats: u64) -> Vec<TxOut> {
        vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: p2wpkh(200),
        }]
    }

    fn plan(candidates: &[SegWitCoin], outputs: Vec<TxOut>, rate: u64) -> WalletResult<TransactionPlan> {
        plan_transaction(
            &ChainParams::regtest(),
            &WalletSettings::for_tests(),
            candidates,
            outputs,
            FeeRate::from_sat_per_vb(rate).unwrap(),
            "change",
            &p2wpkh(201),
        )
    }

    #[test]
    fn test_fee_is_exact_with_change() {
        let coins = vec![coin(1, 30_000), coin(2, 30_000), coin(3, 100_000)];
        let plan = plan(&coins, pay(50_000), 3).unwrap();

        assert_eq!(plan.fee, plan.virtual_size * 3);
        let change = plan.change.clone().unwrap();
        assert_eq!(plan.input_total(), plan.total_send + plan.fee + change.amount);
        assert_eq!(plan.unsigned.output.len(), 2);
        assert_eq!(change.vout, 1);
        assert!(plan.iterations <= 32);
    }

    #[test]
    fn test_fee_loop_pulls_extra_input() {
        // The first coin covers the amount but not amount + fee
        let coins = vec![coin(1, 50_000), coin(2, 40_000)];
        let plan = plan(&coins, pay(50_000), 2).unwrap();
        assert_eq!(plan.inputs.len(), 2);
        assert!(plan.iterations >= 2);
    }

    #[test]
    fn test_dust_change_folded_into_fee() {
        let coins = vec![coin(1, 50_500)];
        let plan = plan(&coins, pay(50_000), 1).unwrap();
        assert!(plan.change.is_none());
        assert_eq!(plan.fee, 500);
        assert_eq!(plan.unsigned.output.len(), 1);
    }

    #[test]
    fn test_insufficient_funds_carries_shortfall() {
        let coins = vec![coin(1, 10_000)];
        let err = plan(&coins, pay(25_000), 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientFunds);
        assert_eq!(err.shortfall, Some(15_000));
    }

    #[test]
    fn test_fee_shortfall_detected_in_loop() {
        let coins = vec![coin(1, 25_000)];
        let err = plan(&coins, pay(25_000), 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientFunds);
        assert!(err.shortfall.unwrap() > 0);
    }

    #[test]
    fn test_burn_outputs() {
        let params = ChainParams::regtest();
        let outputs = resolve_outputs(&params, &[], &[Burn {
            amount: 1_000,
            data: "deadbeef".to_string(),
        }])
        .unwrap();
        assert!(outputs[0].script_pubkey.is_op_return());
        assert!(burn_script(&"00".repeat(81)).is_err());
        assert!(burn_script("zz").is_err());
    }

    #[test]
    fn test_bad_recipient_rejected() {
        let params = ChainParams::regtest();
        let err = resolve_outputs(&params, &[Payment {
            address: "stk1qnotmine".to_string(),
            amount: 5,
        }], &[])
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAddress);
        assert!(resolve_outputs(&params, &[], &[]).is_err());
    }

    #[test]
    fn test_output_total_overflow_rejected() {
        let coins = vec![coin(1, 100_000)];
        let mut outputs = pay(u64::MAX);
        outputs.extend(pay(2));
        let err = plan(&coins, outputs, 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_amounts_above_money_supply_rejected() {
        let params = ChainParams::regtest();
        let err = resolve_outputs(&params, &[Payment {
            address: "unchecked".to_string(),
            amount: u64::MAX,
        }], &[])
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        let half = Amount::MAX_MONEY.to_sat() / 2 + 1;
        let err = resolve_outputs(&params, &[], &[
            Burn {
                amount: half,
                data: String::new(),
            },
            Burn {
                amount: half,
                data: String::new(),
            },
        ])
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
