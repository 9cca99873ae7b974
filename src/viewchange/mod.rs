/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The PBFT-style view-change subprotocol.
//!
//! A [`View`] identifies one consensus round's leadership proposal: a block, the ledger it
//! belongs to, and a candidate leader index. Nodes that suspect the leader broadcast signed
//! [`InitReq`]s; once enough distinct reports accumulate, the [`Controller`](controller::Controller)
//! drives the election of a new leader, who announces itself with a [`NewViewReq`] carrying the
//! collected reports as proof.

pub mod controller;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{CryptoHash, LeaderIndex, LedgerId, SignatureBytes};
use crate::types::crypto_primitives::{verify_signature, CryptoHasher, Digest, Keypair, VerifyingKey};
use crate::types::roster::Roster;

/// A candidate (block, ledger, leader-index) triple for one consensus round.
///
/// Two views are the same view only if all three fields match.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct View {
    /// The latest block the reporter has observed.
    pub block_id: CryptoHash,
    /// The ledger this view belongs to.
    pub ledger_id: LedgerId,
    /// The candidate leader: the roster member at `leader_index % roster.len()`.
    pub leader_index: LeaderIndex,
}

impl View {
    /// Compute the digest of the view.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.block_id.bytes());
        hasher.update(self.ledger_id.bytes());
        hasher.update(self.leader_index.to_le_bytes());
        CryptoHash::new(hasher.finalize().into())
    }
}

/// A signed failure report: "I suspect the leader of this view". The "view-change" message of
/// the PBFT paper.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct InitReq {
    pub view: View,
    /// The reporting member's verifying key bytes.
    pub signer: [u8; 32],
    pub signature: Option<SignatureBytes>,
}

impl InitReq {
    /// Create an unsigned report by `signer` for `view`.
    pub fn new(view: View, signer: &VerifyingKey) -> Self {
        Self {
            view,
            signer: signer.to_bytes(),
            signature: None,
        }
    }

    /// Compute the digest of the report, the message its signature covers.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.signer);
        hasher.update(self.view.hash().bytes());
        CryptoHash::new(hasher.finalize().into())
    }

    /// Sign the report with `keypair`, which must hold the report's signer key.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = Some(keypair.sign(&self.hash().bytes()));
    }

    /// Verify the report's signature against its claimed signer.
    pub fn is_correctly_signed(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(public) = VerifyingKey::from_bytes(&self.signer) else {
            return false;
        };
        verify_signature(&public, &self.hash().bytes(), signature)
    }
}

/// The new leader's announcement: the roster it proposes to lead and the failure reports that
/// justify the election.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct NewViewReq {
    pub roster: Roster,
    pub proof: Vec<InitReq>,
}

impl NewViewReq {
    /// Compute the digest of the announcement.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.roster.hash().bytes());
        for req in &self.proof {
            hasher.update(req.hash().bytes());
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// The view the proof is about. `None` if the proof is empty. All reports are assumed to
    /// share the view; [`check_proof`](Self::check_proof) verifies that.
    pub fn view(&self) -> Option<&View> {
        self.proof.first().map(|req| &req.view)
    }

    /// Check that the proof justifies the election against `roster` (the committee the reports
    /// came from): every report correctly signed by a distinct member, all for the same view,
    /// and more than `2f` of them.
    pub fn check_proof(&self, roster: &Roster) -> Result<(), NewViewError> {
        let view = self.view().ok_or(NewViewError::EmptyProof)?;
        let mut seen = Vec::new();
        for req in &self.proof {
            if req.view != *view {
                return Err(NewViewError::MixedViews);
            }
            if !req.is_correctly_signed() {
                return Err(NewViewError::BadSignature);
            }
            let Ok(public) = VerifyingKey::from_bytes(&req.signer) else {
                return Err(NewViewError::BadSignature);
            };
            if !roster.contains(&public) {
                return Err(NewViewError::SignerNotInRoster);
            }
            if seen.contains(&req.signer) {
                return Err(NewViewError::DuplicateSigner);
            }
            seen.push(req.signer);
        }
        if seen.len() <= 2 * roster.max_faulty() {
            return Err(NewViewError::InsufficientReports {
                got: seen.len(),
                needed: 2 * roster.max_faulty() + 1,
            });
        }
        Ok(())
    }
}

/// Reason a [`NewViewReq`]'s proof was rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum NewViewError {
    EmptyProof,
    MixedViews,
    BadSignature,
    SignerNotInRoster,
    DuplicateSigner,
    InsufficientReports { got: usize, needed: usize },
}

impl std::fmt::Display for NewViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NewViewError::EmptyProof => write!(f, "proof is empty"),
            NewViewError::MixedViews => write!(f, "proof mixes reports for different views"),
            NewViewError::BadSignature => write!(f, "a report carries an invalid signature"),
            NewViewError::SignerNotInRoster => write!(f, "a report signer is not in the roster"),
            NewViewError::DuplicateSigner => write!(f, "a member reported twice"),
            NewViewError::InsufficientReports { got, needed } => {
                write!(f, "only {} reports, {} needed", got, needed)
            }
        }
    }
}
