mod common;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use common::*;
use stakewallet::balances::compute_balance;
use stakewallet::ledger::MetadataFile;
use stakewallet::node::ChainNode;
use stakewallet::signing::SigningInput;
use stakewallet::staking::build_coinstake;
use stakewallet::tx::prepare_plan;
use stakewallet::utils::KeyEncryptionKey;
use stakewallet::{
    AddressKind, BalanceFilter, FeeRate, Payment, ReceiveAddressRequest, ReferenceSigner, SigningService, SpendFrom,
    WalletFile, WalletSettings,
};

struct Fixture {
    h: Harness,
    cold: String,
    joint: String,
    wallet: WalletFile,
    metadata: MetadataFile,
    kek: KeyEncryptionKey,
}

/// 200 blocks paying the three address kinds in turn
fn round_robin_fixture() -> Fixture {
    let h = Harness::new();
    let (service, address) = h.wallet("alpha");
    let cold = service
        .create_receive_address(
            &passphrase(),
            &ReceiveAddressRequest::ColdStaking {
                label: "cold".to_string(),
                account: 0,
            },
        )
        .unwrap();
    let joint = service
        .create_receive_address(
            &passphrase(),
            &ReceiveAddressRequest::MultiSig {
                label: "joint".to_string(),
                account: 0,
                other_public_keys: vec![hex::encode(foreign_public_key(3).to_bytes())],
                signatures_required: 1,
            },
        )
        .unwrap();

    let targets = [address, cold.clone(), joint.clone()];
    for i in 0..200u64 {
        let target = &targets[(i % 3) as usize];
        h.node.mine_block(&[(h.script(target), 1_000_000 + i * 1_000)]);
    }
    service.sync().unwrap();

    let wallet = WalletFile::load(h.dir.path(), &h.params, "alpha").unwrap();
    let metadata = MetadataFile::load_or_new(h.dir.path(), &h.params, &wallet).unwrap();
    let kek = wallet.unlock(&passphrase()).unwrap();
    Fixture {
        h,
        cold,
        joint,
        wallet,
        metadata,
        kek,
    }
}

fn assert_same_bytes(inputs: &[SigningInput], unsigned: &bitcoin::Transaction) {
    let ours = SigningService::new().sign(unsigned, inputs).unwrap();
    let reference = ReferenceSigner::new().sign(unsigned, inputs).unwrap();
    assert_eq!(serialize(&ours), serialize(&reference));
    assert!(ours.input.iter().all(|i| !i.witness.is_empty()));
}

#[test]
fn coinstakes_for_every_kind_match_the_reference_signer() {
    let f = round_robin_fixture();
    let balance = compute_balance(
        &f.h.params,
        &f.wallet,
        &f.metadata,
        f.metadata.sync_height,
        &BalanceFilter::default(),
    )
    .unwrap();
    let template = f.h.node.block_template().unwrap();

    // Tip 200 and ten confirmations leave heights 1..=191 stakable
    assert_eq!(balance.stakable_count(), 191);
    let mut kinds = Vec::new();
    for staking in balance.stakable_coins.values() {
        let secret = staking.staking_key.decrypt(&f.kek).unwrap();
        let public_key = staking.staking_key.public_key().unwrap();
        let unsigned = build_coinstake(&f.h.params, staking, &public_key, &template).unwrap();
        assert_same_bytes(&[SigningInput::new(staking.coin.clone(), secret)], &unsigned);
        if !kinds.contains(&staking.coin.kind) {
            kinds.push(staking.coin.kind);
        }
    }
    assert_eq!(kinds.len(), 3);
    assert!(kinds.contains(&AddressKind::PubKeyHash));
    assert!(kinds.contains(&AddressKind::ColdStaking));
    assert!(kinds.contains(&AddressKind::MultiSig));
}

#[test]
fn multi_input_spends_match_the_reference_signer() {
    let f = round_robin_fixture();
    let settings = WalletSettings::for_tests();
    let balance = compute_balance(
        &f.h.params,
        &f.wallet,
        &f.metadata,
        f.metadata.sync_height,
        &BalanceFilter::default(),
    )
    .unwrap();

    let sources = [
        SpendFrom::PubKeyHash,
        SpendFrom::MultiSig {
            address: f.joint.clone(),
        },
        SpendFrom::ColdStaking {
            address: f.cold.clone(),
        },
    ];
    for from in &sources {
        let payment = Payment {
            address: f.h.foreign_address(8),
            amount: 4_500_000,
        };
        let plan = prepare_plan(
            &f.h.params,
            &settings,
            &f.wallet,
            &balance,
            from,
            &[payment],
            &[],
            FeeRate::from_sat_per_vb(3).unwrap(),
        )
        .unwrap();
        assert!(plan.inputs.len() >= 4, "{:?} spent {} inputs", from, plan.inputs.len());

        let inputs: Vec<SigningInput> = plan
            .inputs
            .iter()
            .map(|coin| {
                let key = f.wallet.find_address(&coin.address).unwrap().spending_key().decrypt(&f.kek).unwrap();
                SigningInput::new(coin.clone(), key)
            })
            .collect();
        assert_same_bytes(&inputs, &plan.unsigned);

        let checked = SigningService::new().with_cross_check(true).sign(&plan.unsigned, &inputs);
        assert!(checked.is_ok());
    }
}

#[test]
fn node_accepts_the_signed_spends() {
    let f = round_robin_fixture();
    let service = f.h.manager.wallet("alpha").unwrap();
    let sources = [
        SpendFrom::PubKeyHash,
        SpendFrom::MultiSig {
            address: f.joint.clone(),
        },
        SpendFrom::ColdStaking {
            address: f.cold.clone(),
        },
    ];
    for from in sources {
        let request = stakewallet::SendRequest {
            from,
            recipients: vec![Payment {
                address: f.h.foreign_address(8),
                amount: 2_000_000,
            }],
            burns: Vec::new(),
            fee_rate: None,
            sign: true,
            broadcast: true,
        };
        let built = service.build_transaction(Some(&passphrase()), &request).unwrap();
        assert!(built.broadcast);
    }
    assert_eq!(f.h.node.mempool().len(), 3);
}

#[test]
fn signing_with_a_foreign_key_is_refused() {
    let f = round_robin_fixture();
    let balance = compute_balance(
        &f.h.params,
        &f.wallet,
        &f.metadata,
        f.metadata.sync_height,
        &BalanceFilter::default(),
    )
    .unwrap();
    let template = f.h.node.block_template().unwrap();
    let staking = balance.stakable_coins.values().next().unwrap();
    let public_key = staking.staking_key.public_key().unwrap();
    let unsigned = build_coinstake(&f.h.params, staking, &public_key, &template).unwrap();

    let result = SigningService::new().sign(&unsigned, &[SigningInput::new(staking.coin.clone(), foreign_secret(2))]);
    assert!(result.is_err());
}

#[test]
fn block_signature_verifies_against_the_staker_key() {
    let signer = SigningService::new();
    let secret = foreign_secret(6);
    let public_key = foreign_public_key(6).0;
    let hash = bitcoin::BlockHash::from_byte_array([9; 32]);

    let signature = signer.sign_block_hash(&hash, &secret);
    assert!(signer.verify_block_signature(&hash, &signature, &public_key));
    assert!(!signer.verify_block_signature(&hash, &signature, &foreign_public_key(7).0));
    assert!(!signer.verify_block_signature(&bitcoin::BlockHash::from_byte_array([8; 32]), &signature, &public_key));
}
