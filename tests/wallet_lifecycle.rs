mod common;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::{absolute, transaction, Amount, NetworkKind, OutPoint, PrivateKey, Transaction, TxIn, TxOut, Txid};
use common::*;
use stakewallet::ledger::{BroadcastState, TxType};
use stakewallet::{
    AddressKind, BalanceFilter, ErrorCode, Payment, ReceiveAddressRequest, SendRequest, SpendFrom, WalletFile,
    WalletSettings,
};

fn send(from: SpendFrom, to: String, amount: u64) -> SendRequest {
    SendRequest {
        from,
        recipients: vec![Payment { address: to, amount }],
        burns: Vec::new(),
        fee_rate: None,
        sign: true,
        broadcast: true,
    }
}

#[test]
fn new_wallet_fills_both_chains_to_the_gap_limit() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");

    let info = service.info().unwrap();
    assert_eq!(info.network, "regtest");
    assert_eq!(info.addresses.pub_key_hash, 10);
    assert_eq!(info.addresses.unused_change, 5);
    assert_eq!(info.addresses.multi_sig, 0);
    assert_eq!(info.sync_height, None);
    assert!(address.starts_with("rstk1"));
    assert_eq!(service.unused_receive_address(None).unwrap(), address);
    assert!(WalletFile::exists(h.dir.path(), &h.params, "alpha"));

    let err = h.manager.create_wallet("alpha", &passphrase(), None).unwrap_err();
    assert_eq!(err.code, ErrorCode::WalletExists);
}

#[test]
fn restoring_a_mnemonic_reproduces_addresses() {
    let first = Harness::new();
    let created = first.manager.create_wallet("alpha", &passphrase(), None).unwrap();

    let second = Harness::new();
    let restored = second
        .manager
        .create_wallet("beta", &wrong_passphrase(), Some(&created.mnemonic))
        .unwrap();
    assert_eq!(restored.receive_address, created.receive_address);
    assert_ne!(restored.wallet_id, created.wallet_id);
}

#[test]
fn wrong_passphrase_changes_nothing() {
    let h = Harness::new();
    let (service, _) = h.wallet("alpha");

    let request = ReceiveAddressRequest::PubKeyHash {
        label: "rent".to_string(),
    };
    let err = service.create_receive_address(&wrong_passphrase(), &request).unwrap_err();
    assert_eq!(err.code, ErrorCode::WrongPassphrase);
    assert_eq!(service.info().unwrap().addresses.pub_key_hash, 10);

    let err = service.export_keys(&wrong_passphrase()).unwrap_err();
    assert_eq!(err.code, ErrorCode::WrongPassphrase);

    let err = service.start_staking(&wrong_passphrase()).unwrap_err();
    assert_eq!(err.code, ErrorCode::WrongPassphrase);
    assert!(!service.staking_status().is_running());
}

#[test]
fn labels_are_unique_across_kinds() {
    let h = Harness::new();
    let (service, _) = h.wallet("alpha");

    service
        .create_receive_address(
            &passphrase(),
            &ReceiveAddressRequest::PubKeyHash {
                label: "rent".to_string(),
            },
        )
        .unwrap();
    let err = service
        .create_receive_address(
            &passphrase(),
            &ReceiveAddressRequest::ColdStaking {
                label: "rent".to_string(),
                account: 0,
            },
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateLabel);
    assert_eq!(service.info().unwrap().addresses.cold_staking, 0);
}

#[test]
fn wallet_file_under_another_name_is_refused() {
    let h = Harness::new();
    h.wallet("alpha");
    std::fs::copy(
        WalletFile::path(h.dir.path(), &h.params, "alpha"),
        WalletFile::path(h.dir.path(), &h.params, "beta"),
    )
    .unwrap();

    let Err(err) = h.manager.load_wallet("beta") else {
        panic!("renamed wallet file loaded");
    };
    assert_eq!(err.code, ErrorCode::WalletFileMismatch);

    let Err(err) = h.manager.load_wallet("gamma") else {
        panic!("missing wallet loaded");
    };
    assert_eq!(err.code, ErrorCode::WalletNotFound);
}

#[test]
fn sync_picks_up_a_coinbase_payment() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 50_000_000)], 11);

    let report = service.sync().unwrap();
    assert_eq!(report.from_height, 0);
    assert_eq!(report.tip_height, 11);
    assert_eq!(report.blocks_scanned, 12);
    assert_eq!(report.relevant_blocks, 1);

    let balance = service.balance(&BalanceFilter::default()).unwrap();
    assert_eq!(balance.confirmed, 50_000_000);
    assert_eq!(balance.pending, 0);
    assert_eq!(balance.spendable, 50_000_000);
    assert_eq!(balance.stakable, 50_000_000);

    let history = service.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tx_type, TxType::Coinbase);
    assert_eq!(history[0].height, Some(1));

    assert_ne!(service.unused_receive_address(None).unwrap(), address);
    assert_eq!(service.sync().unwrap().blocks_scanned, 0);
}

#[test]
fn reloaded_wallet_keeps_its_ledger() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 1_000_000)], 6);
    service.sync().unwrap();

    assert!(h.manager.unload_wallet("alpha"));
    drop(service);
    let reloaded = h.manager.load_wallet("alpha").unwrap();
    let info = reloaded.info().unwrap();
    assert_eq!(info.sync_height, Some(6));
    assert_eq!(info.balance.confirmed, 1_000_000);
}

#[test]
fn second_send_fails_with_shortfall_and_leaves_state_alone() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 100_000)], 6);
    service.sync().unwrap();

    let request = send(SpendFrom::PubKeyHash, h.foreign_address(7), 60_000);
    let estimate = service.estimate_fee(&request).unwrap();
    let built = service.build_transaction(Some(&passphrase()), &request).unwrap();
    assert!(built.signed && built.complete && built.broadcast);
    assert_eq!(built.fee, estimate.fee);
    let change = built.change.clone().expect("change output");
    assert_eq!(built.total_send + built.fee + change.amount, 100_000);
    assert_eq!(h.node.mempool().len(), 1);

    let balance = service.balance(&BalanceFilter::default()).unwrap();
    assert_eq!(balance.pending, -(60_000 + built.fee as i64));
    assert_eq!(balance.total, balance.confirmed + balance.pending);
    assert_eq!(balance.spendable, 0);

    let err = service.build_transaction(Some(&passphrase()), &request).unwrap_err();
    assert_eq!(err.code, ErrorCode::InsufficientFunds);
    assert_eq!(err.shortfall, Some(60_000));
    assert_eq!(h.node.mempool().len(), 1);
    assert_eq!(service.history().unwrap().len(), 2);

    h.node.mine_block(&[]);
    service.sync().unwrap();
    let balance = service.balance(&BalanceFilter::default()).unwrap();
    assert_eq!(balance.pending, 0);
    assert_eq!(balance.confirmed, change.amount as i64);
    assert_eq!(balance.spendable, change.amount);

    let history = service.history().unwrap();
    assert_eq!(history[0].tx_type, TxType::Spend);
    assert_eq!(history[0].height, Some(7));
    assert_eq!(history[0].destinations.len(), 1);
}

#[test]
fn oversized_fee_rate_and_amounts_are_refused() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 100_000)], 6);
    service.sync().unwrap();

    let request = SendRequest {
        fee_rate: Some(u64::MAX / 50),
        ..send(SpendFrom::PubKeyHash, h.foreign_address(7), 10_000)
    };
    let err = service.estimate_fee(&request).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    let request = SendRequest {
        recipients: vec![
            Payment {
                address: h.foreign_address(7),
                amount: u64::MAX,
            },
            Payment {
                address: h.foreign_address(8),
                amount: 2,
            },
        ],
        ..send(SpendFrom::PubKeyHash, h.foreign_address(7), 1)
    };
    let err = service.estimate_fee(&request).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);
    let err = service.build_transaction(Some(&passphrase()), &request).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    assert!(h.node.mempool().is_empty());
    assert_eq!(service.balance(&BalanceFilter::default()).unwrap().spendable, 100_000);
}

#[test]
fn exhausted_change_chain_fails_before_broadcast() {
    let h = Harness::with_settings(WalletSettings {
        max_addresses_per_chain: 5,
        ..WalletSettings::for_tests()
    });
    let (service, address) = h.wallet("alpha");
    h.fund(&[(address.as_str(), 100_000); 4], 6);
    service.sync().unwrap();

    let request = send(SpendFrom::PubKeyHash, h.foreign_address(7), 10_000);
    for _ in 0..3 {
        let built = service.build_transaction(Some(&passphrase()), &request).unwrap();
        assert!(built.broadcast);
    }
    assert_eq!(h.node.mempool().len(), 3);

    // The fourth send would leave one unused change address and cannot refill
    let err = service.build_transaction(Some(&passphrase()), &request).unwrap_err();
    assert_eq!(err.code, ErrorCode::AddressBufferExhausted);
    assert_eq!(h.node.mempool().len(), 3);
    assert_eq!(service.history().unwrap().len(), 4);
    assert_eq!(service.balance(&BalanceFilter::default()).unwrap().spendable, 100_000);
}

#[test]
fn unsigned_build_records_nothing() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 100_000)], 6);
    service.sync().unwrap();

    let request = SendRequest {
        sign: false,
        broadcast: false,
        ..send(SpendFrom::PubKeyHash, h.foreign_address(7), 10_000)
    };
    let built = service.build_transaction(None, &request).unwrap();
    assert!(!built.signed && !built.broadcast);
    assert!(h.node.mempool().is_empty());
    assert_eq!(service.history().unwrap().len(), 1);

    let err = service
        .build_transaction(None, &SendRequest { broadcast: true, ..request })
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);
}

#[test]
fn multisig_spend_needs_every_signature_before_broadcast() {
    let h = Harness::new();
    let (service, _) = h.wallet("alpha");
    let co_signer = hex::encode(foreign_public_key(9).to_bytes());
    let multisig = |label: &str, required: u8| ReceiveAddressRequest::MultiSig {
        label: label.to_string(),
        account: 0,
        other_public_keys: vec![co_signer.clone()],
        signatures_required: required,
    };
    let vault = service.create_receive_address(&passphrase(), &multisig("vault", 2)).unwrap();
    let joint = service.create_receive_address(&passphrase(), &multisig("joint", 1)).unwrap();
    h.fund(&[(&vault, 200_000), (&joint, 200_000)], 6);
    service.sync().unwrap();

    let balance = service.balance(&BalanceFilter::kind(AddressKind::MultiSig)).unwrap();
    assert_eq!(balance.confirmed, 400_000);

    let to_vault = SpendFrom::MultiSig { address: vault.clone() };
    let partial = service
        .build_transaction(
            Some(&passphrase()),
            &SendRequest {
                broadcast: false,
                ..send(to_vault.clone(), h.foreign_address(4), 50_000)
            },
        )
        .unwrap();
    assert!(partial.signed && !partial.complete && !partial.broadcast);

    let err = service
        .build_transaction(Some(&passphrase()), &send(to_vault, h.foreign_address(4), 50_000))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);
    assert!(h.node.mempool().is_empty());

    let built = service
        .build_transaction(
            Some(&passphrase()),
            &send(SpendFrom::MultiSig { address: joint.clone() }, h.foreign_address(4), 50_000),
        )
        .unwrap();
    assert!(built.complete && built.broadcast);
    assert_eq!(built.change.expect("change").address, joint);
    assert_eq!(h.node.mempool().len(), 1);
}

#[test]
fn cold_staking_coins_spend_with_the_cold_key() {
    let h = Harness::new();
    let (service, _) = h.wallet("alpha");
    let cold = service
        .create_receive_address(
            &passphrase(),
            &ReceiveAddressRequest::ColdStaking {
                label: "cold".to_string(),
                account: 0,
            },
        )
        .unwrap();
    h.fund(&[(&cold, 300_000)], 6);
    service.sync().unwrap();

    let balance = service.balance(&BalanceFilter::address(cold.clone())).unwrap();
    assert_eq!(balance.spendable, 300_000);

    let built = service
        .build_transaction(
            Some(&passphrase()),
            &send(SpendFrom::ColdStaking { address: cold.clone() }, h.foreign_address(5), 120_000),
        )
        .unwrap();
    assert!(built.complete && built.broadcast);

    h.node.mine_block(&[]);
    service.sync().unwrap();
    let balance = service.balance(&BalanceFilter::address(cold)).unwrap();
    assert_eq!(balance.confirmed, (300_000 - 120_000 - built.fee) as i64);
    assert_eq!(service.history().unwrap()[0].tx_type, TxType::Spend);
}

#[test]
fn sending_from_the_wrong_kind_is_refused() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    let err = service
        .estimate_fee(&send(SpendFrom::ColdStaking { address }, h.foreign_address(5), 1_000))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidAddress);
}

#[test]
fn reorg_rewinds_and_rescans() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 70_000_000)], 20);
    assert_eq!(service.sync().unwrap().tip_height, 20);

    for _ in 0..3 {
        h.node.disconnect_tip();
    }
    let other = h.script(&h.foreign_address(3));
    h.node.mine_blocks(4, &other, 1_000);

    let report = service.sync().unwrap();
    assert_eq!(report.rewound_to, Some(10));
    assert_eq!(report.from_height, 11);
    assert_eq!(report.tip_height, 21);

    let info = service.info().unwrap();
    assert_eq!(info.sync_height, Some(21));
    assert_eq!(info.balance.confirmed, 70_000_000);
}

#[test]
fn rejected_broadcast_is_kept_but_not_counted() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    h.fund(&[(&address, 100_000)], 6);
    service.sync().unwrap();

    for _ in 0..6 {
        h.node.disconnect_tip();
    }
    let err = service
        .build_transaction(Some(&passphrase()), &send(SpendFrom::PubKeyHash, h.foreign_address(7), 60_000))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConsensusRejected);

    let history = service.history().unwrap();
    assert_eq!(history[0].broadcast_state, Some(BroadcastState::Rejected));
    assert!(history[0].consensus_error.is_some());

    let balance = service.balance(&BalanceFilter::default()).unwrap();
    assert_eq!(balance.pending, 0);
    assert_eq!(balance.spendable, 100_000);
}

#[test]
fn imported_key_is_found_on_rescan() {
    let h = Harness::new();
    let (service, _) = h.wallet("alpha");
    let outside = h.foreign_address(11);
    h.fund(&[(&outside, 40_000)], 6);
    service.sync().unwrap();
    assert_eq!(service.balance(&BalanceFilter::default()).unwrap().confirmed, 0);

    let wif = PrivateKey::new(foreign_secret(11), NetworkKind::Test).to_wif();
    let imported = service.import_keys(&passphrase(), &[wif.clone()]).unwrap();
    assert_eq!(imported, vec![outside.clone()]);
    assert_eq!(service.info().unwrap().sync_height, None);
    assert!(service.import_keys(&passphrase(), &[wif]).unwrap().is_empty());

    service.sync().unwrap();
    let balance = service.balance(&BalanceFilter::address(outside.clone())).unwrap();
    assert_eq!(balance.confirmed, 40_000);

    let exported = service.export_keys(&passphrase()).unwrap();
    assert!(exported.iter().any(|k| k.address == outside));
}

#[test]
fn relayed_mempool_payment_is_pending() {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([5; 32]), 0),
            ..TxIn::default()
        }],
        output: vec![TxOut {
            value: Amount::from_sat(25_000),
            script_pubkey: h.script(&address),
        }],
    };

    assert!(service.on_mempool_transaction(&tx).unwrap());
    assert!(!service.on_mempool_hex(&serialize_hex(&tx)).unwrap());

    let balance = service.balance(&BalanceFilter::default()).unwrap();
    assert_eq!(balance.confirmed, 0);
    assert_eq!(balance.pending, 25_000);
    assert_eq!(balance.spendable, 0);

    let history = service.history().unwrap();
    assert_eq!(history[0].broadcast_state, Some(BroadcastState::Relayed));
    assert_eq!(history[0].tx_type, TxType::Receive);

    let err = service.on_mempool_hex("zz").unwrap_err();
    assert_eq!(err.code, ErrorCode::ParseError);
}
