/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The append-only block ledger collaborator.
//!
//! Storing blocks, running consensus over proposals, maintaining forward links, and choosing
//! between forks is the job of an external layer; this crate consumes it exclusively through
//! the [`ChainStore`] trait. Implementations must uphold two guarantees the rest of the crate
//! leans on: blocks of one ledger are appended in strictly increasing index order, and a block
//! is only stored after the committee accepted it (the store drives every member's
//! [`verify_proposal`](crate::service::Service::verify_proposal) and distributes accepted
//! blocks to every member's [`deliver_block`](crate::service::Service::deliver_block)).

use std::fmt::{self, Display, Formatter};

use crate::types::basic::{BlockIndex, CryptoHash, LedgerId};
use crate::types::block::ChainBlock;

/// Error raised by [`ChainStore`] operations.
#[derive(Debug)]
pub enum ChainStoreError {
    /// The addressed ledger is not known to this store.
    UnknownLedger { ledger_id: LedgerId },
    /// The committee refused the proposed block.
    Refused { reason: String },
    /// The store itself failed.
    Internal { reason: String },
}

impl Display for ChainStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainStoreError::UnknownLedger { ledger_id } => {
                write!(f, "unknown ledger {}", ledger_id)
            }
            ChainStoreError::Refused { reason } => write!(f, "block refused: {}", reason),
            ChainStoreError::Internal { reason } => write!(f, "chain store failure: {}", reason),
        }
    }
}

/// The interface of the underlying block ledger.
pub trait ChainStore: Send + Sync + 'static {
    /// Get a block by its hash.
    fn get_block(&self, id: &CryptoHash) -> Option<ChainBlock>;

    /// Get the latest block of a ledger.
    fn get_latest(&self, ledger_id: &LedgerId) -> Option<ChainBlock>;

    /// Propose `block` for appending to `ledger_id`. Blocks for the duration of a consensus
    /// round; on success the returned block is the stored one, with its hash fixed. A block
    /// with index 0 creates a new ledger.
    fn store_block(
        &self,
        ledger_id: &LedgerId,
        block: ChainBlock,
    ) -> Result<ChainBlock, ChainStoreError>;

    /// Get the blocks of `ledger_id` from index `from` (inclusive) up to the latest, in index
    /// order. Used by the catch-up and repair paths.
    fn get_update_chain(&self, ledger_id: &LedgerId, from: BlockIndex) -> Vec<ChainBlock>;
}
