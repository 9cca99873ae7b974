/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Ledger-level proofs: a trie inclusion proof anchored to a block, anchored in turn to the
//! ledger's genesis through a chain of committee-signed forward links.
//!
//! Neither half is sufficient alone. The trie proof ties a key's value to a root hash, but
//! says nothing about which ledger that root belongs to; the link chain ties a block to the
//! trusted genesis, but says nothing about any key. Requiring both defeats an attacker who
//! controls the trie but not the committee's signing keys, and one who controls signing keys
//! but not the trie contents.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::chain::ChainStore;
use crate::state::{ReadOnlyState, StateValues};
use crate::trie::proof::{Presence, ProofError, TrieProof};
use crate::types::basic::{BlockIndex, CryptoHash, InstanceId, LedgerId, SignatureSet};
use crate::types::block::{ChainBlock, ForwardLink};
use crate::types::state_change::StateChangeBody;

/// Reason building a proof failed.
#[derive(Debug)]
pub enum ProofBuildError {
    /// The state store has no applied block yet.
    NoStateYet,
    /// The ledger's genesis block is missing from the chain store.
    GenesisNotFound { ledger_id: LedgerId },
    /// No chain of forward links reaches a block with the snapshot's index.
    NoSuchBlock { target: BlockIndex },
    /// The state store failed while producing the trie proof.
    State(crate::state::StateError),
}

impl Display for ProofBuildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProofBuildError::NoStateYet => write!(f, "no block applied to the state store yet"),
            ProofBuildError::GenesisNotFound { ledger_id } => {
                write!(f, "genesis block of ledger {} not found", ledger_id)
            }
            ProofBuildError::NoSuchBlock { target } => {
                write!(f, "no forward-link path reaches block index {}", target)
            }
            ProofBuildError::State(err) => write!(f, "reading state: {}", err),
        }
    }
}

impl From<crate::state::StateError> for ProofBuildError {
    fn from(err: crate::state::StateError) -> Self {
        ProofBuildError::State(err)
    }
}

/// Reason a proof failed verification.
#[derive(Debug, PartialEq, Eq)]
pub enum ProofVerifyError {
    /// The proof carries no links at all.
    EmptyLinkChain,
    /// The first link does not identify the trusted ledger.
    WrongGenesis,
    /// The first link does not carry the genesis roster.
    MissingGenesisRoster,
    /// A link's `from` does not equal the previous link's `to`.
    BrokenLinkChain { hop: usize },
    /// A link is not signed by a quorum of the committee current at its source.
    BadLinkSignature { hop: usize },
    /// The last link does not land on the proof's terminal block.
    WrongTerminalBlock,
    /// The trie root recomputed from the inclusion proof does not equal the root the terminal
    /// block header commits to.
    RootMismatch,
    /// The inclusion proof's internal hash chain is broken.
    Trie(ProofError),
    /// The proven value failed to decode as a state-change body.
    MalformedValue,
}

impl Display for ProofVerifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProofVerifyError::EmptyLinkChain => write!(f, "proof carries no links"),
            ProofVerifyError::WrongGenesis => {
                write!(f, "first link does not identify the trusted ledger")
            }
            ProofVerifyError::MissingGenesisRoster => {
                write!(f, "first link carries no genesis roster")
            }
            ProofVerifyError::BrokenLinkChain { hop } => {
                write!(f, "link chain broken at hop {}", hop)
            }
            ProofVerifyError::BadLinkSignature { hop } => {
                write!(f, "link at hop {} lacks a committee quorum", hop)
            }
            ProofVerifyError::WrongTerminalBlock => {
                write!(f, "link chain does not land on the terminal block")
            }
            ProofVerifyError::RootMismatch => {
                write!(f, "inclusion proof root differs from the block header root")
            }
            ProofVerifyError::Trie(err) => write!(f, "inclusion proof invalid: {}", err),
            ProofVerifyError::MalformedValue => {
                write!(f, "proven value is not a state-change body")
            }
        }
    }
}

impl From<ProofError> for ProofVerifyError {
    fn from(err: ProofError) -> Self {
        ProofVerifyError::Trie(err)
    }
}

/// Evidence that a key maps (or does not map) to a value at a specific block of a specific
/// ledger, trustable without trusting the servers that produced it.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct Proof {
    /// The chain of links from the genesis to the terminal block. The first entry is the
    /// unsigned genesis pseudo-link: it names the genesis hash (which covers the genesis
    /// roster) and carries that roster for verifying the first real link.
    pub links: Vec<ForwardLink>,
    /// The block the proof speaks about.
    pub latest: ChainBlock,
    /// The trie proof for the queried key against `latest`'s root.
    pub inclusion: TrieProof,
}

impl Proof {
    /// Build a proof for `key` from a state snapshot and the ledger's block store.
    ///
    /// Walks forward links starting at the genesis block, preferring the highest link whose
    /// target does not overshoot the snapshot's block index and falling back to lower levels
    /// when it would.
    pub fn new(
        state: &dyn ReadOnlyState,
        chain: &dyn ChainStore,
        ledger_id: &LedgerId,
        key: &InstanceId,
    ) -> Result<Proof, ProofBuildError> {
        let target = state.index().ok_or(ProofBuildError::NoStateYet)?;
        let genesis =
            chain
                .get_block(&ledger_id.hash())
                .ok_or(ProofBuildError::GenesisNotFound {
                    ledger_id: *ledger_id,
                })?;

        let mut links = vec![ForwardLink {
            from: CryptoHash::zero(),
            to: genesis.hash(),
            new_roster: Some(genesis.roster.clone()),
            signatures: SignatureSet::empty(),
        }];

        let mut current = genesis;
        while current.index < target {
            let mut advanced = false;
            for link in current.forward_links.iter().rev() {
                let Some(next) = chain.get_block(&link.to) else {
                    continue;
                };
                if next.index <= target {
                    links.push(link.clone());
                    current = next;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                return Err(ProofBuildError::NoSuchBlock { target });
            }
        }
        if current.index != target {
            return Err(ProofBuildError::NoSuchBlock { target });
        }

        Ok(Proof {
            links,
            latest: current,
            inclusion: state.get_proof(key)?,
        })
    }

    /// Verify this proof against a trusted ledger id.
    ///
    /// Checks that the link chain starts at the trusted genesis, that every hop is contiguous
    /// and signed by a quorum of the committee implied by the links before it, that the chain
    /// lands on the terminal block, and that the trie root recomputed from the inclusion proof
    /// equals the root the terminal block header commits to.
    pub fn verify(&self, trusted: &LedgerId) -> Result<(), ProofVerifyError> {
        let genesis_link = self.links.first().ok_or(ProofVerifyError::EmptyLinkChain)?;
        if genesis_link.to != trusted.hash() {
            return Err(ProofVerifyError::WrongGenesis);
        }
        // The genesis hash covers the genesis roster, so the roster carried here is as trusted
        // as the ledger id itself.
        let mut roster = genesis_link
            .new_roster
            .clone()
            .ok_or(ProofVerifyError::MissingGenesisRoster)?;

        let mut position = genesis_link.to;
        for (hop, link) in self.links.iter().enumerate().skip(1) {
            if link.from != position {
                return Err(ProofVerifyError::BrokenLinkChain { hop });
            }
            if !link.is_correctly_signed(&roster) {
                return Err(ProofVerifyError::BadLinkSignature { hop });
            }
            if let Some(new_roster) = &link.new_roster {
                roster = new_roster.clone();
            }
            position = link.to;
        }

        if position != self.latest.hash() {
            return Err(ProofVerifyError::WrongTerminalBlock);
        }
        if self.inclusion.compute_root() != self.latest.header.trie_root {
            return Err(ProofVerifyError::RootMismatch);
        }
        Ok(())
    }

    /// Whether the proof shows `key` as present. The inclusion proof's hash chain is checked;
    /// call [`verify`](Self::verify) first to anchor it to a ledger.
    pub fn matches(&self, key: &InstanceId) -> Result<bool, ProofVerifyError> {
        Ok(self.inclusion.exists(&key.bytes())?)
    }

    /// The decoded values stored under `key`, if the proof shows the key as present.
    pub fn get_values(&self, key: &InstanceId) -> Result<Option<StateValues>, ProofVerifyError> {
        match self.inclusion.check(&key.bytes())? {
            Presence::Absent => Ok(None),
            Presence::Present(bytes) => {
                let body = StateChangeBody::decode(&bytes)
                    .map_err(|_| ProofVerifyError::MalformedValue)?;
                Ok(Some(StateValues {
                    value: body.value,
                    version: body.version,
                    contract_kind: body.contract_kind,
                    policy_id: body.policy_id,
                }))
            }
        }
    }

    /// The index of the block this proof speaks about.
    pub fn block_index(&self) -> BlockIndex {
        self.latest.index
    }
}
