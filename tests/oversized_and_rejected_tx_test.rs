/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{thread, time::Duration};

use byzledger::service::messages::{AddTxRequest, GetSignerCountersRequest, ServiceError};
use log::LevelFilter;

mod common;

use common::{setup_logger, TestNet};

/// Tests the two rejection paths of transaction submission: a transaction too large for any
/// block is refused outright and never reaches the chain, while a transaction with a stale
/// replay counter is included in a block, recorded as rejected, and leaves no side effects.
#[test]
fn oversized_and_rejected_tx_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a 4-node committee with the smallest allowed block size.
    let net = TestNet::start(4, 10);
    let ledger_id = net.genesis(Duration::from_millis(200), 16_000);

    // 2. A transaction bigger than a whole block is refused at submission.
    let oversized = net.spawn_value_tx(vec![0u8; 20_000], 0);
    let refused = net.services[0].add_transaction(AddTxRequest {
        ledger_id,
        transaction: oversized,
        inclusion_wait: 0,
    });
    assert!(matches!(
        refused,
        Err(ServiceError::TransactionTooLarge { .. })
    ));

    // 3. It never appears in any block: a few intervals later the chain is still at genesis.
    thread::sleep(Duration::from_millis(800));
    assert_eq!(net.chain.block_count(&ledger_id), 1);

    // 4. A transaction claiming a counter ahead of the stored one is included but rejected,
    // and the submitting client learns the reason.
    let stale = net.spawn_value_tx(vec![1], 5);
    let response = net.services[0]
        .add_transaction(AddTxRequest {
            ledger_id,
            transaction: stale,
            inclusion_wait: 10,
        })
        .expect("the transaction's outcome is observed in time");
    let reason = response.error.expect("the rejection reason is surfaced");
    assert!(reason.contains("counter"), "unexpected reason: {}", reason);

    // 5. The rejection had no side effects: the stored counter is untouched.
    let counters = net.services[0]
        .get_signer_counters(GetSignerCountersRequest {
            ledger_id,
            identities: vec![net.client_identity()],
        })
        .unwrap()
        .counters;
    assert_eq!(counters, vec![0]);

    // 6. The same instructions signed with the correct counter go through.
    let correct = net.spawn_value_tx(vec![1], 0);
    let response = net.services[0]
        .add_transaction(AddTxRequest {
            ledger_id,
            transaction: correct,
            inclusion_wait: 10,
        })
        .expect("the corrected transaction is included in time");
    assert!(response.error.is_none());

    net.shutdown();
}
