/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trie-level inclusion and absence proofs.
//!
//! A [`TrieProof`] carries the interior nodes on the path from the root to the queried key plus
//! the terminal node the path ends at. The verifier recomputes the hash chain from its own copy
//! of the key's bits: every node is anchored to the root, so a prover cannot substitute nodes
//! from elsewhere in the trie, and the terminal node decides presence or absence.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::CryptoHash;

use super::{hash_empty, hash_interior, hash_leaf, key_bits};

/// An interior node carried inside a proof: the hashes of both children. The subtree the path
/// does not descend into stays a bare hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct InteriorNode {
    pub left: CryptoHash,
    pub right: CryptoHash,
}

/// The node a proof's path terminates at.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum TerminalNode {
    Empty {
        prefix: Vec<bool>,
    },
    Leaf {
        prefix: Vec<bool>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

/// What a verified proof asserts about the queried key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presence {
    Present(Vec<u8>),
    Absent,
}

/// Reason a proof failed verification.
#[derive(Debug, PartialEq, Eq)]
pub enum ProofError {
    /// A hash on the path does not match the node presented for that position.
    BrokenHashChain { depth: usize },
    /// The proof's path is longer than the key has bits.
    PathTooLong,
    /// The proof has no nodes at all.
    EmptyProof,
}

impl Display for ProofError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProofError::BrokenHashChain { depth } => {
                write!(f, "hash chain broken at depth {}", depth)
            }
            ProofError::PathTooLong => write!(f, "proof path longer than the key's bits"),
            ProofError::EmptyProof => write!(f, "proof contains no nodes"),
        }
    }
}

/// Proof that a key maps (or does not map) to a value under a particular trie root.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct TrieProof {
    interiors: Vec<InteriorNode>,
    terminal: TerminalNode,
    nonce: [u8; 32],
}

impl TrieProof {
    pub(crate) fn new(
        interiors: Vec<InteriorNode>,
        terminal: TerminalNode,
        nonce: [u8; 32],
    ) -> Self {
        Self {
            interiors,
            terminal,
            nonce,
        }
    }

    /// The trie root this proof is anchored to: the hash of its topmost node.
    pub fn compute_root(&self) -> CryptoHash {
        match self.interiors.first() {
            Some(interior) => hash_interior(&interior.left, &interior.right),
            None => self.terminal_hash(),
        }
    }

    fn terminal_hash(&self) -> CryptoHash {
        match &self.terminal {
            TerminalNode::Empty { prefix } => hash_empty(&self.nonce, prefix),
            TerminalNode::Leaf { prefix, key, value } => {
                hash_leaf(&self.nonce, prefix, key, value)
            }
        }
    }

    /// Verify the proof's internal hash chain with respect to `key` and decide the key's
    /// presence. The result is only meaningful if [`compute_root`](Self::compute_root) equals a
    /// root hash the caller trusts.
    pub fn check(&self, key: &[u8]) -> Result<Presence, ProofError> {
        let bits = key_bits(key);
        if self.interiors.len() > bits.len() {
            return Err(ProofError::PathTooLong);
        }
        // Walk the interiors, checking that each node hashes to the child hash its parent
        // committed to for this key's path.
        for depth in 1..self.interiors.len() {
            let parent = &self.interiors[depth - 1];
            let expected = if bits[depth - 1] {
                parent.left
            } else {
                parent.right
            };
            let actual = hash_interior(&self.interiors[depth].left, &self.interiors[depth].right);
            if expected != actual {
                return Err(ProofError::BrokenHashChain { depth });
            }
        }
        if let Some(last) = self.interiors.last() {
            let depth = self.interiors.len();
            let expected = if bits[depth - 1] { last.left } else { last.right };
            if expected != self.terminal_hash() {
                return Err(ProofError::BrokenHashChain { depth });
            }
        }
        match &self.terminal {
            TerminalNode::Empty { .. } => Ok(Presence::Absent),
            TerminalNode::Leaf {
                key: stored_key,
                value,
                ..
            } => {
                if stored_key == key {
                    Ok(Presence::Present(value.clone()))
                } else {
                    Ok(Presence::Absent)
                }
            }
        }
    }

    /// Whether the proof shows `key` to be present. Fails if the hash chain is broken.
    pub fn exists(&self, key: &[u8]) -> Result<bool, ProofError> {
        Ok(matches!(self.check(key)?, Presence::Present(_)))
    }

    /// The key-value pair at the proof's terminal leaf, if the path ends at a leaf.
    pub fn key_value(&self) -> Option<(&[u8], &[u8])> {
        match &self.terminal {
            TerminalNode::Leaf { key, value, .. } => Some((key, value)),
            TerminalNode::Empty { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::store::MemStore;
    use crate::trie::Trie;

    fn populated_trie() -> Trie<MemStore> {
        let mut trie = Trie::new(MemStore::new(), [3u8; 32]);
        for i in 0u8..30 {
            trie.set(&[i; 8], &[i]).unwrap();
        }
        trie
    }

    #[test]
    fn inclusion_proof_round_trip() {
        let trie = populated_trie();
        for i in 0u8..30 {
            let proof = trie.get_proof(&[i; 8]).unwrap();
            assert_eq!(proof.compute_root(), trie.root());
            assert_eq!(proof.check(&[i; 8]).unwrap(), Presence::Present(vec![i]));
        }
    }

    #[test]
    fn absence_proof_round_trip() {
        let trie = populated_trie();
        let proof = trie.get_proof(b"not there").unwrap();
        assert_eq!(proof.compute_root(), trie.root());
        assert_eq!(proof.check(b"not there").unwrap(), Presence::Absent);
    }

    #[test]
    fn proof_does_not_transfer_between_keys() {
        let trie = populated_trie();
        let proof = trie.get_proof(&[1u8; 8]).unwrap();
        // Checking a proof against a different key either breaks the chain or shows absence; it
        // never shows the other key as present.
        match proof.check(&[2u8; 8]) {
            Ok(Presence::Present(_)) => panic!("proof for one key validated another"),
            Ok(Presence::Absent) | Err(_) => {}
        }
    }

    #[test]
    fn tampered_value_breaks_the_chain() {
        let trie = populated_trie();
        let mut proof = trie.get_proof(&[1u8; 8]).unwrap();
        if let TerminalNode::Leaf { value, .. } = &mut proof.terminal {
            value[0] ^= 1;
        }
        assert!(
            proof.compute_root() != trie.root() || proof.check(&[1u8; 8]).is_err(),
            "tampering must either change the implied root or break the chain"
        );
    }
}
