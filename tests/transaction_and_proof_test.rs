/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::time::Duration;

use byzledger::chain::ChainStore;
use byzledger::service::messages::{
    AddTxRequest, GetProofRequest, GetSignerCountersRequest, ServiceError,
};
use byzledger::types::basic::{CryptoHash, InstanceId, StateVersion};
use log::LevelFilter;

mod common;

use common::{await_proven_value, setup_logger, TestNet};

/// The end-to-end happy path: a 4-node committee, a spawned contract instance, and proofs that
/// verify against nothing but the ledger id.
#[test]
fn transaction_and_proof_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a 4-node committee and create a ledger.
    let net = TestNet::start(4, 10);
    let ledger_id = net.genesis(Duration::from_millis(300), 16_000);
    assert_eq!(net.chain.block_count(&ledger_id), 1);

    // 2. Spawn a `value` instance holding {5, 6, 7, 8}, blocking until it is included.
    let tx = net.spawn_value_tx(vec![5, 6, 7, 8], 0);
    let instance = tx.instructions[0].derive_id("");
    let response = net.services[0]
        .add_transaction(AddTxRequest {
            ledger_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .expect("the transaction is included in time");
    assert!(response.error.is_none());
    assert_eq!(net.chain.block_count(&ledger_id), 2);

    // 3. Every member serves a proof that verifies against the ledger id and carries the
    // spawned value.
    for service in &net.services {
        await_proven_value(service, &ledger_id, &instance, &[5, 6, 7, 8]);
    }

    // 4. An absence proof for a key never written also verifies.
    let absent = InstanceId::new([0xEE; 32]);
    let proof = net.services[1]
        .get_proof(GetProofRequest {
            ledger_id,
            key: absent,
            must_contain_block: None,
        })
        .expect("absence proofs are served too")
        .proof;
    proof.verify(&ledger_id).expect("absence proof verifies");
    assert!(!proof.matches(&absent).unwrap());
    assert!(proof.get_values(&absent).unwrap().is_none());

    // 5. The client's replay counter advanced to exactly 1.
    let counters = net.services[2]
        .get_signer_counters(GetSignerCountersRequest {
            ledger_id,
            identities: vec![net.client_identity()],
        })
        .expect("counters are served")
        .counters;
    assert_eq!(counters, vec![1]);

    // 6. Updating the instance bumps its version to 1, and the new value is provable.
    let update = net.update_value_tx(instance, vec![9, 9], 1);
    let response = net.services[0]
        .add_transaction(AddTxRequest {
            ledger_id,
            transaction: update,
            inclusion_wait: 10,
        })
        .expect("the update is included in time");
    assert!(response.error.is_none());

    await_proven_value(&net.services[3], &ledger_id, &instance, &[9, 9]);
    let proof = net.services[3]
        .get_proof(GetProofRequest {
            ledger_id,
            key: instance,
            must_contain_block: None,
        })
        .expect("proof is served")
        .proof;
    proof.verify(&ledger_id).expect("proof verifies");
    let values = proof.get_values(&instance).unwrap().expect("key is present");
    assert_eq!(values.value, vec![9, 9]);
    assert_eq!(values.version, StateVersion::new(1));

    // 7. A proof anchored at the server's own latest block is served; an anchor the server has
    // never heard of is refused as being ahead of it.
    let latest = net.chain.get_latest(&ledger_id).unwrap();
    net.services[0]
        .get_proof(GetProofRequest {
            ledger_id,
            key: instance,
            must_contain_block: Some(latest.hash()),
        })
        .expect("an anchor equal to our knowledge answers");
    let unknown_anchor = CryptoHash::new([0xAB; 32]);
    let refused = net.services[0].get_proof(GetProofRequest {
        ledger_id,
        key: instance,
        must_contain_block: Some(unknown_anchor),
    });
    assert!(matches!(refused, Err(ServiceError::StaleState { .. })));

    net.shutdown();
}
