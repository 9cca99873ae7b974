/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The collect-transactions protocol.
//!
//! A flat star: the leader sends every committee member a [`CollectTxRequest`] and merges the
//! [`CollectTxResponse`]s that come back within half a block interval. Stragglers are simply
//! omitted from the round — no block waits for them — and a member that replies with more
//! transactions than were requested is treated as misbehaving and contributes nothing. The
//! star shape keeps latency at one round-trip and keeps one member's failure from shadowing
//! the subtree a relay topology would hang under it.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::networking::{Message, Network};
use crate::types::basic::{CryptoHash, LedgerId};
use crate::types::crypto_primitives::VerifyingKey;
use crate::types::roster::Roster;
use crate::types::transaction::ClientTransaction;

/// The leader's request for a member's buffered pending transactions.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CollectTxRequest {
    pub ledger_id: LedgerId,
    /// The latest block the leader knows, so lagging members can catch up first.
    pub latest_block: CryptoHash,
    /// Upper bound on the transactions the member may contribute this round.
    pub max_count: u32,
    /// Round marker echoed in responses, so responses from a previous round are not merged
    /// into this one.
    pub nonce: u64,
}

/// A member's contribution to one collection round.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CollectTxResponse {
    pub ledger_id: LedgerId,
    pub nonce: u64,
    pub transactions: Vec<ClientTransaction>,
}

/// Run one collection round as the leader.
///
/// `local` is the leader's own buffered contribution (the leader does not message itself).
/// Returns the merged transactions of every member that answered in time.
pub fn collect_transactions<N: Network>(
    network: &mut N,
    roster: &Roster,
    me: &VerifyingKey,
    ledger_id: LedgerId,
    latest_block: CryptoHash,
    max_count: u32,
    responses: &Receiver<(VerifyingKey, CollectTxResponse)>,
    timeout: Duration,
    local: Vec<ClientTransaction>,
) -> Vec<ClientTransaction> {
    let nonce: u64 = rand::random();
    let request = CollectTxRequest {
        ledger_id,
        latest_block,
        max_count,
        nonce,
    };

    let mut expected = 0usize;
    for member in roster.members() {
        if member == me {
            continue;
        }
        network.send(*member, Message::CollectTxRequest(request.clone()));
        expected += 1;
    }

    let mut merged = local;
    let mut answered: Vec<VerifyingKey> = Vec::new();
    let deadline = Instant::now() + timeout;
    while answered.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (origin, response) = match responses.recv_timeout(remaining) {
            Ok(received) => received,
            Err(RecvTimeoutError::Timeout) => {
                log::debug!(
                    "timeout while collecting transactions, {} of {} members answered",
                    answered.len(),
                    expected
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if response.nonce != nonce || response.ledger_id != ledger_id {
            continue;
        }
        if !roster.contains(&origin) || answered.contains(&origin) {
            continue;
        }
        answered.push(origin);
        if response.transactions.len() > max_count as usize {
            // Flooding beyond the requested maximum forfeits the whole contribution.
            log::warn!(
                "discarding over-limit contribution ({} transactions, {} requested)",
                response.transactions.len(),
                max_count
            );
            continue;
        }
        merged.extend(response.transactions);
    }
    merged
}
