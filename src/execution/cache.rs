/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Memoization of executed transaction batches.
//!
//! A batch of transactions only ever recurs at block boundaries, never interleaved: the leader
//! executes it once while planning a proposal, and again when the proposal is verified; a
//! follower executes it while verifying, and again when the block is applied. One entry per
//! ledger therefore gives constant memory and catches every redundant execution.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::basic::{CryptoHash, LedgerId};
use crate::types::state_change::StateChange;
use crate::types::transaction::TxResults;

struct CacheEntry {
    digest: CryptoHash,
    root: CryptoHash,
    tx_results: TxResults,
    state_changes: Vec<StateChange>,
}

/// The per-ledger single-entry cache of `(batch digest → execution result)`.
#[derive(Default)]
pub struct StateChangeCache {
    entries: Mutex<HashMap<LedgerId, CacheEntry>>,
}

impl StateChangeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the result of executing the batch with digest `digest` on ledger `ledger_id`.
    pub fn get(
        &self,
        ledger_id: &LedgerId,
        digest: &CryptoHash,
    ) -> Option<(CryptoHash, TxResults, Vec<StateChange>)> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(ledger_id)?;
        if entry.digest != *digest {
            return None;
        }
        Some((
            entry.root,
            entry.tx_results.clone(),
            entry.state_changes.clone(),
        ))
    }

    /// Unconditionally overwrite the cached entry for `ledger_id`.
    pub fn update(
        &self,
        ledger_id: LedgerId,
        digest: CryptoHash,
        root: CryptoHash,
        tx_results: TxResults,
        state_changes: Vec<StateChange>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            ledger_id,
            CacheEntry {
                digest,
                root,
                tx_results,
                state_changes,
            },
        );
    }
}
