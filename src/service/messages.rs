/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Request and response types of the service's RPC surface.
//!
//! How these are framed on the wire is the transport collaborator's concern; they are plain
//! borsh-encodable values here.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::chain::ChainStoreError;
use crate::contracts::policy::Policy;
use crate::proof::{Proof, ProofBuildError};
use crate::state::StateError;
use crate::types::basic::{BlockIndex, CryptoHash, InstanceId, LedgerId};
use crate::types::identity::Identity;
use crate::types::roster::Roster;
use crate::types::transaction::ClientTransaction;

/// Bootstrap a new ledger.
#[derive(Clone, Debug)]
pub struct CreateGenesisBlockRequest {
    pub roster: Roster,
    pub genesis_policy: Policy,
    pub block_interval: Duration,
    pub max_block_size: u64,
}

/// Submit a transaction.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct AddTxRequest {
    pub ledger_id: LedgerId,
    pub transaction: ClientTransaction,
    /// 0 fires and forgets; `n > 0` blocks until the transaction's outcome is observed in a
    /// block, bounded by `2 × n × block_interval`.
    pub inclusion_wait: u32,
}

/// Outcome of a transaction submission.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct AddTxResponse {
    /// The rejection reason when the transaction made it into a block but was refused there.
    pub error: Option<String>,
}

/// Request a proof of presence or absence for a key.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetProofRequest {
    pub ledger_id: LedgerId,
    pub key: InstanceId,
    /// When set, the server refuses to answer if its knowledge is strictly behind this anchor
    /// block. A server exactly at the anchor answers.
    pub must_contain_block: Option<CryptoHash>,
}

/// A served proof.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetProofResponse {
    pub proof: Proof,
}

/// Read the stored replay counters of a set of signers.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetSignerCountersRequest {
    pub ledger_id: LedgerId,
    pub identities: Vec<Identity>,
}

/// The stored counters, in request order. 0 for signers never seen.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetSignerCountersResponse {
    pub counters: Vec<u64>,
}

/// Fetch a page of the full state for catch-up.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DownloadStateRequest {
    pub ledger_id: LedgerId,
    /// 0 opens a new download (superseding any previous one); otherwise the nonce returned by
    /// the first page.
    pub nonce: u64,
    pub page_len: usize,
}

/// One page of a state download.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DownloadStateResponse {
    pub key_values: Vec<(Vec<u8>, Vec<u8>)>,
    pub nonce: u64,
    /// Total number of entries of the snapshot being paged.
    pub total: usize,
}

/// Error raised by the service's RPC surface.
#[derive(Debug)]
pub enum ServiceError {
    /// The addressed ledger does not exist on this node.
    UnknownLedger { ledger_id: LedgerId },
    /// The transaction carries no instructions.
    EmptyTransaction,
    /// The serialized transaction alone exceeds the ledger's maximum block size.
    TransactionTooLarge { size: u64, max: u64 },
    /// This node is not part of the ledger's committee.
    NotInCommittee,
    /// The transaction's outcome was not observed within the inclusion-wait bound. Retry
    /// out-of-band.
    InclusionTimeout { waited: Duration },
    /// The transaction was included in a block and rejected there.
    TransactionRejected { reason: String },
    /// The server's knowledge is behind the caller's anchor block.
    StaleState {
        anchor: CryptoHash,
        at_index: Option<BlockIndex>,
    },
    /// A paged download was requested with an unknown or superseded cursor.
    UnknownDownloadCursor { nonce: u64 },
    /// A request parameter is invalid.
    InvalidRequest { reason: String },
    /// The state store failed.
    State(StateError),
    /// The block ledger collaborator failed.
    Chain(ChainStoreError),
    /// Proof construction failed.
    Proof(ProofBuildError),
    /// A local invariant was violated; continuing risks divergence.
    Internal { reason: String },
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::UnknownLedger { ledger_id } => write!(f, "unknown ledger {}", ledger_id),
            ServiceError::EmptyTransaction => write!(f, "no instructions to add"),
            ServiceError::TransactionTooLarge { size, max } => {
                write!(f, "transaction too large: {} bytes, maximum {}", size, max)
            }
            ServiceError::NotInCommittee => {
                write!(f, "refusing a transaction for a ledger we are not part of")
            }
            ServiceError::InclusionTimeout { waited } => {
                write!(f, "transaction not included after {:?}", waited)
            }
            ServiceError::TransactionRejected { reason } => {
                write!(f, "transaction rejected: {}", reason)
            }
            ServiceError::StaleState { anchor, at_index } => match at_index {
                Some(index) => write!(
                    f,
                    "knowledge at block {} is behind the anchor {}",
                    index, anchor
                ),
                None => write!(f, "no state yet, behind the anchor {}", anchor),
            },
            ServiceError::UnknownDownloadCursor { nonce } => {
                write!(f, "unknown download cursor {}", nonce)
            }
            ServiceError::InvalidRequest { reason } => write!(f, "invalid request: {}", reason),
            ServiceError::State(err) => write!(f, "state failure: {}", err),
            ServiceError::Chain(err) => write!(f, "chain failure: {}", err),
            ServiceError::Proof(err) => write!(f, "proof construction failed: {}", err),
            ServiceError::Internal { reason } => write!(f, "internal error: {}", reason),
        }
    }
}

impl From<StateError> for ServiceError {
    fn from(err: StateError) -> Self {
        ServiceError::State(err)
    }
}

impl From<ChainStoreError> for ServiceError {
    fn from(err: ChainStoreError) -> Self {
        ServiceError::Chain(err)
    }
}

impl From<ProofBuildError> for ServiceError {
    fn from(err: ProofBuildError) -> Self {
        ServiceError::Proof(err)
    }
}
