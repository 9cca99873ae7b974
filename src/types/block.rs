/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the 'block' type, block headers, and signed forward links.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{BlockIndex, CryptoHash, LedgerId, SignatureSet};
use super::crypto_primitives::{CryptoHasher, Digest};
use super::roster::Roster;
use super::transaction::TxResults;

/// The claims a leader makes about the effect of a block's payload.
///
/// Followers re-execute the payload and accept the block only if their independently computed
/// `trie_root` and `tx_results_hash` match.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct BlockHeader {
    /// The root of the state trie after applying this block.
    pub trie_root: CryptoHash,
    /// The digest of the block's [`TxResults`] payload, accepted flags included.
    pub tx_results_hash: CryptoHash,
    /// The digest of the state changes produced by applying the payload.
    pub state_changes_hash: CryptoHash,
    /// Wall-clock time at proposal, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
}

/// One block of a ledger.
///
/// Blocks are appended and distributed by the ledger-storage collaborator (the
/// [`ChainStore`](crate::chain::ChainStore)); this crate proposes them, verifies them, and
/// applies their effects to the state store.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ChainBlock {
    pub index: BlockIndex,
    /// Hash of the previous block. Zero for the genesis block.
    pub previous: CryptoHash,
    pub header: BlockHeader,
    pub payload: TxResults,
    /// The committee as of this block, leader first.
    pub roster: Roster,
    /// Signed links to later blocks, lowest level first. Level `l` links to the block
    /// `base^l` indices ahead. Filled in by the ledger-storage collaborator as later blocks
    /// are appended.
    pub forward_links: Vec<ForwardLink>,
}

impl ChainBlock {
    /// Compute the hash of this block. Forward links are excluded: they are added after the
    /// block's hash is fixed.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.previous.bytes());
        // Vec writers do not fail.
        hasher.update(self.header.try_to_vec().unwrap());
        hasher.update(self.header.tx_results_hash.bytes());
        hasher.update(self.roster.hash().bytes());
        CryptoHash::new(hasher.finalize().into())
    }

    /// The id of the ledger this block belongs to, if this block is a genesis block.
    pub fn ledger_id(&self) -> Option<LedgerId> {
        if self.index == BlockIndex::new(0) {
            Some(LedgerId::new(self.hash()))
        } else {
            None
        }
    }
}

/// A signed link from one block to a later block.
///
/// A chain of forward links lets a verifier jump from a trusted block to a later block without
/// replaying every intermediate block: each link is signed by the committee that was current at
/// the link's source, and carries the new roster whenever membership changed, to be used for
/// verifying the *next* link.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ForwardLink {
    pub from: CryptoHash,
    pub to: CryptoHash,
    /// The roster from `to` onwards, present only when it differs from the roster that signed
    /// this link.
    pub new_roster: Option<Roster>,
    /// Signatures by the committee current at `from`, positioned by roster order.
    pub signatures: SignatureSet,
}

impl ForwardLink {
    /// The bytes the committee signs for this link.
    pub fn message_bytes(&self) -> Vec<u8> {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.from.bytes());
        hasher.update(self.to.bytes());
        if let Some(roster) = &self.new_roster {
            hasher.update(roster.hash().bytes());
        }
        hasher.finalize().to_vec()
    }

    /// Check that more than two thirds of `roster` signed this link.
    pub fn is_correctly_signed(&self, roster: &Roster) -> bool {
        let message = self.message_bytes();
        roster.count_valid_signatures(&message, &self.signatures) >= roster.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::SignatureBytes;
    use crate::types::crypto_primitives::Keypair;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn keypairs(n: usize) -> Vec<Keypair> {
        let mut csprg = OsRng {};
        (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
            .collect()
    }

    fn sign_link(link: &mut ForwardLink, roster: &Roster, keypairs: &[Keypair], count: usize) {
        let message = link.message_bytes();
        let mut signatures = SignatureSet::new(roster.len());
        for keypair in keypairs.iter().take(count) {
            let pos = roster.position(&keypair.public()).unwrap();
            signatures.set(pos, Some(keypair.sign(&message)));
        }
        link.signatures = signatures;
    }

    #[test]
    fn quorum_of_signatures_accepted() {
        let keypairs = keypairs(4);
        let roster = Roster::new(keypairs.iter().map(|kp| kp.public()).collect());
        let mut link = ForwardLink {
            from: CryptoHash::new([1u8; 32]),
            to: CryptoHash::new([2u8; 32]),
            new_roster: None,
            signatures: SignatureSet::empty(),
        };

        sign_link(&mut link, &roster, &keypairs, 3);
        assert!(link.is_correctly_signed(&roster));

        sign_link(&mut link, &roster, &keypairs, 2);
        assert!(!link.is_correctly_signed(&roster));
    }

    #[test]
    fn tampered_signature_does_not_count() {
        let keypairs = keypairs(4);
        let roster = Roster::new(keypairs.iter().map(|kp| kp.public()).collect());
        let mut link = ForwardLink {
            from: CryptoHash::new([1u8; 32]),
            to: CryptoHash::new([2u8; 32]),
            new_roster: None,
            signatures: SignatureSet::empty(),
        };
        sign_link(&mut link, &roster, &keypairs, 3);
        link.signatures.set(0, Some(SignatureBytes::new([0u8; 64])));
        assert!(!link.is_correctly_signed(&roster));
    }
}
