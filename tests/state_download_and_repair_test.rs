/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::time::Duration;

use byzledger::service::messages::{AddTxRequest, DownloadStateRequest, ServiceError};
use log::LevelFilter;

mod common;

use common::{await_proven_value, setup_logger, TestNet};

/// Tests the two recovery surfaces: paged bulk download of the full state, and the
/// walk-back-and-replay repair that rebuilds a ledger's state from the chain alone.
#[test]
fn state_download_and_repair_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a 4-node committee and spawn one `value` instance.
    let net = TestNet::start(4, 10);
    let ledger_id = net.genesis(Duration::from_millis(200), 16_000);
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

    // 2. Page through the full state. After one spawn the store holds exactly four entries:
    // the config, the genesis policy, the value instance, and the client's counter.
    let first = net.services[0]
        .download_state(DownloadStateRequest {
            ledger_id,
            nonce: 0,
            page_len: 3,
        })
        .expect("the first page opens a download");
    assert_eq!(first.total, 4);
    assert_eq!(first.key_values.len(), 3);
    assert_ne!(first.nonce, 0);

    let second = net.services[0]
        .download_state(DownloadStateRequest {
            ledger_id,
            nonce: first.nonce,
            page_len: 3,
        })
        .expect("the second page continues the download");
    assert_eq!(second.key_values.len(), 1);

    let mut entries = first.key_values;
    entries.extend(second.key_values);
    assert!(entries.iter().all(|(key, _)| key.len() == 32));
    assert!(entries
        .iter()
        .any(|(key, _)| key.as_slice() == &instance.bytes()[..]));

    // 3. A zero page length is refused.
    let refused = net.services[0].download_state(DownloadStateRequest {
        ledger_id,
        nonce: 0,
        page_len: 0,
    });
    assert!(matches!(refused, Err(ServiceError::InvalidRequest { .. })));

    // 4. Nonce 0 opens a fresh download and supersedes the previous cursor.
    let reopened = net.services[0]
        .download_state(DownloadStateRequest {
            ledger_id,
            nonce: 0,
            page_len: 2,
        })
        .expect("reopening succeeds");
    assert_eq!(reopened.total, 4);
    let superseded = net.services[0].download_state(DownloadStateRequest {
        ledger_id,
        nonce: first.nonce,
        page_len: 2,
    });
    assert!(matches!(
        superseded,
        Err(ServiceError::UnknownDownloadCursor { .. })
    ));

    // 5. Repairing a member's state rebuilds it from the chain alone: proofs served afterwards
    // still verify and carry the spawned value.
    await_proven_value(&net.services[2], &ledger_id, &instance, &[5, 6, 7, 8]);
    net.services[2]
        .repair_state(&ledger_id)
        .expect("repair replays every block");
    await_proven_value(&net.services[2], &ledger_id, &instance, &[5, 6, 7, 8]);

    net.shutdown();
}
