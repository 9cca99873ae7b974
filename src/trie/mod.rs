/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The authenticated binary prefix trie backing the state store.
//!
//! Keys are addressed by the bits of their SHA256 digest, so the trie stays balanced regardless
//! of the key distribution an adversary chooses. Every node is stored under its own hash in a
//! [`NodeStore`](store::NodeStore); leaf and empty nodes are additionally salted with a per-trie
//! nonce, which ties each node to its position and prevents cross-trie precomputation.
//!
//! The trie produces `O(log n)` [proofs](proof::TrieProof) of both presence and absence: an
//! absence proof terminates either at an empty node or at a leaf whose stored key differs from
//! the queried key at the depth reached.

pub mod proof;

pub mod staging;

pub mod store;

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::CryptoHash;
use crate::types::crypto_primitives::{sha256, CryptoHasher, Digest};

use proof::{InteriorNode, TerminalNode, TrieProof};
use store::NodeStore;

/// One mutation of a trie key, applied through [`Trie::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrieOp {
    Set(Vec<u8>),
    Del,
}

/// Error raised by trie operations.
#[derive(Debug)]
pub enum TrieError {
    /// A node referenced by the structure is not in the node store. The store is corrupt.
    MissingNode { hash: CryptoHash },
    /// A stored node failed to decode. The store is corrupt.
    MalformedNode { source: std::io::Error },
    /// A key passed to [`Trie::delete`] is not set.
    KeyNotFound,
}

impl Display for TrieError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TrieError::MissingNode { hash } => write!(f, "trie node {} missing from store", hash),
            TrieError::MalformedNode { source } => write!(f, "malformed trie node: {}", source),
            TrieError::KeyNotFound => write!(f, "key not found"),
        }
    }
}

/// A node of the trie.
///
/// Subtrees that a proof does not descend into are carried as bare hashes inside
/// [`InteriorNode`]s, so there is no "unknown" node variant here.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub(crate) enum Node {
    Empty {
        prefix: Vec<bool>,
    },
    Leaf {
        prefix: Vec<bool>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Interior {
        left: CryptoHash,
        right: CryptoHash,
    },
}

impl Node {
    pub(crate) fn hash(&self, nonce: &[u8; 32]) -> CryptoHash {
        match self {
            Node::Empty { prefix } => hash_empty(nonce, prefix),
            Node::Leaf { prefix, key, value } => hash_leaf(nonce, prefix, key, value),
            Node::Interior { left, right } => hash_interior(left, right),
        }
    }
}

pub(crate) fn hash_empty(nonce: &[u8; 32], prefix: &[bool]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([0u8]);
    hasher.update(nonce);
    hasher.update((prefix.len() as u32).to_le_bytes());
    hasher.update(pack_bits(prefix));
    CryptoHash::new(hasher.finalize().into())
}

pub(crate) fn hash_leaf(nonce: &[u8; 32], prefix: &[bool], key: &[u8], value: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([1u8]);
    hasher.update(nonce);
    hasher.update((prefix.len() as u32).to_le_bytes());
    hasher.update(pack_bits(prefix));
    hasher.update((key.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.update(sha256(value).bytes());
    CryptoHash::new(hasher.finalize().into())
}

pub(crate) fn hash_interior(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([2u8]);
    hasher.update(left.bytes());
    hasher.update(right.bytes());
    CryptoHash::new(hasher.finalize().into())
}

/// The bits a key is addressed by: the bits of its SHA256 digest, most significant first.
pub(crate) fn key_bits(key: &[u8]) -> Vec<bool> {
    let digest = sha256(key).bytes();
    let mut bits = Vec::with_capacity(digest.len() * 8);
    for byte in digest {
        for i in 0..8 {
            bits.push((byte << i) & 0x80 > 0);
        }
    }
    bits
}

pub(crate) fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut buf = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            buf[i / 8] |= 0x80 >> (i % 8);
        }
    }
    buf
}

/// The authenticated trie over a node store `S`.
///
/// The durable flavor is `Trie<MemStore>`; staging flavors are built over an
/// [`OverlayStore`](store::OverlayStore) by [`StagingTrie`](staging::StagingTrie).
#[derive(Clone)]
pub struct Trie<S: NodeStore> {
    store: S,
    nonce: [u8; 32],
    root: CryptoHash,
}

impl<S: NodeStore> Trie<S> {
    /// Create a fresh trie in `store`, salted with `nonce`. The trie starts with an interior
    /// root over two empty subtrees.
    pub fn new(mut store: S, nonce: [u8; 32]) -> Self {
        let left = Node::Empty {
            prefix: vec![true],
        };
        let right = Node::Empty {
            prefix: vec![false],
        };
        let left_hash = left.hash(&nonce);
        let right_hash = right.hash(&nonce);
        let root = Node::Interior {
            left: left_hash,
            right: right_hash,
        };
        let root_hash = root.hash(&nonce);
        store.put(left_hash.bytes().to_vec(), left.try_to_vec().unwrap());
        store.put(right_hash.bytes().to_vec(), right.try_to_vec().unwrap());
        store.put(root_hash.bytes().to_vec(), root.try_to_vec().unwrap());
        Self {
            store,
            nonce,
            root: root_hash,
        }
    }

    /// Reopen a trie whose nodes already live in `store`.
    pub fn open(store: S, nonce: [u8; 32], root: CryptoHash) -> Self {
        Self { store, nonce, root }
    }

    /// The current root hash. One root hash corresponds to exactly one snapshot of the
    /// key-value mapping.
    pub fn root(&self) -> CryptoHash {
        self.root
    }

    /// The per-trie nonce.
    pub fn nonce(&self) -> [u8; 32] {
        self.nonce
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    fn load(&self, hash: &CryptoHash) -> Result<Node, TrieError> {
        let bytes = self
            .store
            .get(&hash.bytes())
            .ok_or(TrieError::MissingNode { hash: *hash })?;
        Node::try_from_slice(&bytes).map_err(|source| TrieError::MalformedNode { source })
    }

    fn put_node(&mut self, node: &Node) -> CryptoHash {
        let hash = node.hash(&self.nonce);
        self.store
            .put(hash.bytes().to_vec(), node.try_to_vec().unwrap());
        hash
    }

    fn drop_node(&mut self, hash: &CryptoHash) {
        self.store.delete(&hash.bytes());
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        let bits = key_bits(key);
        let mut current = self.root;
        let mut depth = 0;
        loop {
            match self.load(&current)? {
                Node::Empty { .. } => return Ok(None),
                Node::Leaf {
                    key: stored_key,
                    value,
                    ..
                } => {
                    if stored_key == key {
                        return Ok(Some(value));
                    }
                    return Ok(None);
                }
                Node::Interior { left, right } => {
                    current = if bits[depth] { left } else { right };
                    depth += 1;
                }
            }
        }
    }

    /// Set or overwrite the value stored under `key`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        let bits = key_bits(key);
        self.root = self.set_node(self.root, &bits, 0, key, value)?;
        Ok(())
    }

    fn set_node(
        &mut self,
        node_hash: CryptoHash,
        bits: &[bool],
        depth: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<CryptoHash, TrieError> {
        match self.load(&node_hash)? {
            Node::Empty { prefix } => {
                self.drop_node(&node_hash);
                let leaf = Node::Leaf {
                    prefix,
                    key: key.to_vec(),
                    value: value.to_vec(),
                };
                Ok(self.put_node(&leaf))
            }
            Node::Leaf {
                prefix,
                key: stored_key,
                value: stored_value,
            } => {
                self.drop_node(&node_hash);
                if stored_key == key {
                    let leaf = Node::Leaf {
                        prefix,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    };
                    return Ok(self.put_node(&leaf));
                }
                // Two distinct keys now share the position: push the old leaf down, creating
                // interior nodes until the keys' bits diverge.
                let (left, right) =
                    self.extend_leaf(prefix, &stored_key, &stored_value, key, value);
                let interior = Node::Interior { left, right };
                Ok(self.put_node(&interior))
            }
            Node::Interior { left, right } => {
                self.drop_node(&node_hash);
                let (left, right) = if bits[depth] {
                    (self.set_node(left, bits, depth + 1, key, value)?, right)
                } else {
                    (left, self.set_node(right, bits, depth + 1, key, value)?)
                };
                let interior = Node::Interior { left, right };
                Ok(self.put_node(&interior))
            }
        }
    }

    fn extend_leaf(
        &mut self,
        prefix: Vec<bool>,
        key1: &[u8],
        value1: &[u8],
        key2: &[u8],
        value2: &[u8],
    ) -> (CryptoHash, CryptoHash) {
        let depth = prefix.len();
        let bits1 = key_bits(key1);
        let bits2 = key_bits(key2);
        if bits1[depth] != bits2[depth] {
            let mut prefix1 = prefix.clone();
            prefix1.push(bits1[depth]);
            let mut prefix2 = prefix;
            prefix2.push(bits2[depth]);
            let leaf1 = Node::Leaf {
                prefix: prefix1,
                key: key1.to_vec(),
                value: value1.to_vec(),
            };
            let leaf2 = Node::Leaf {
                prefix: prefix2,
                key: key2.to_vec(),
                value: value2.to_vec(),
            };
            let hash1 = self.put_node(&leaf1);
            let hash2 = self.put_node(&leaf2);
            if bits1[depth] {
                return (hash1, hash2);
            }
            return (hash2, hash1);
        }
        let mut shared = prefix.clone();
        shared.push(bits1[depth]);
        let (left, right) = self.extend_leaf(shared, key1, value1, key2, value2);
        let interior = Node::Interior { left, right };
        let interior_hash = self.put_node(&interior);
        let mut empty_prefix = prefix;
        empty_prefix.push(!bits1[depth]);
        let empty = Node::Empty {
            prefix: empty_prefix,
        };
        let empty_hash = self.put_node(&empty);
        if bits1[depth] {
            (interior_hash, empty_hash)
        } else {
            (empty_hash, interior_hash)
        }
    }

    /// Delete the value stored under `key`. Fails with [`TrieError::KeyNotFound`] if the key is
    /// not set.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        let bits = key_bits(key);
        self.root = self.delete_node(self.root, &bits, 0, key)?;
        Ok(())
    }

    fn delete_node(
        &mut self,
        node_hash: CryptoHash,
        bits: &[bool],
        depth: usize,
        key: &[u8],
    ) -> Result<CryptoHash, TrieError> {
        match self.load(&node_hash)? {
            Node::Empty { .. } => Err(TrieError::KeyNotFound),
            Node::Leaf {
                prefix,
                key: stored_key,
                ..
            } => {
                if stored_key != key {
                    return Err(TrieError::KeyNotFound);
                }
                self.drop_node(&node_hash);
                let empty = Node::Empty { prefix };
                Ok(self.put_node(&empty))
            }
            Node::Interior { left, right } => {
                let (left, right) = if bits[depth] {
                    (self.delete_node(left, bits, depth + 1, key)?, right)
                } else {
                    (left, self.delete_node(right, bits, depth + 1, key)?)
                };
                self.drop_node(&node_hash);
                let interior = Node::Interior { left, right };
                Ok(self.put_node(&interior))
            }
        }
    }

    /// Apply a batch of operations. The batch is not atomic at this level; atomicity against
    /// root expectations is enforced by the caller
    /// ([`StateTrie::verified_store_all`](crate::state::StateTrie::verified_store_all)).
    pub fn apply(&mut self, ops: &[(Vec<u8>, TrieOp)]) -> Result<(), TrieError> {
        for (key, op) in ops {
            match op {
                TrieOp::Set(value) => self.set(key, value)?,
                TrieOp::Del => self.delete(key)?,
            }
        }
        Ok(())
    }

    /// Produce a proof of presence or absence for `key`. Always succeeds on a healthy store.
    pub fn get_proof(&self, key: &[u8]) -> Result<TrieProof, TrieError> {
        let bits = key_bits(key);
        let mut interiors = Vec::new();
        let mut current = self.root;
        let mut depth = 0;
        loop {
            match self.load(&current)? {
                Node::Empty { prefix } => {
                    return Ok(TrieProof::new(
                        interiors,
                        TerminalNode::Empty { prefix },
                        self.nonce,
                    ));
                }
                Node::Leaf {
                    prefix,
                    key: stored_key,
                    value,
                } => {
                    return Ok(TrieProof::new(
                        interiors,
                        TerminalNode::Leaf {
                            prefix,
                            key: stored_key,
                            value,
                        },
                        self.nonce,
                    ));
                }
                Node::Interior { left, right } => {
                    interiors.push(InteriorNode { left, right });
                    current = if bits[depth] { left } else { right };
                    depth += 1;
                }
            }
        }
    }

    /// Visit every key-value pair in the trie. The visit order is the trie's bit order, which
    /// is deterministic but not meaningful to callers.
    pub fn for_each<F: FnMut(&[u8], &[u8])>(&self, f: &mut F) -> Result<(), TrieError> {
        self.visit(&self.root, f)
    }

    fn visit<F: FnMut(&[u8], &[u8])>(
        &self,
        node_hash: &CryptoHash,
        f: &mut F,
    ) -> Result<(), TrieError> {
        match self.load(node_hash)? {
            Node::Empty { .. } => Ok(()),
            Node::Leaf { key, value, .. } => {
                f(&key, &value);
                Ok(())
            }
            Node::Interior { left, right } => {
                self.visit(&left, f)?;
                self.visit(&right, f)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::store::MemStore;
    use super::*;

    fn new_trie() -> Trie<MemStore> {
        Trie::new(MemStore::new(), [7u8; 32])
    }

    #[test]
    fn set_get_round_trip() {
        let mut trie = new_trie();
        for i in 0u8..50 {
            trie.set(&[i; 4], &[i, i, i]).unwrap();
        }
        for i in 0u8..50 {
            assert_eq!(trie.get(&[i; 4]).unwrap(), Some(vec![i, i, i]));
        }
        assert_eq!(trie.get(b"absent").unwrap(), None);
    }

    #[test]
    fn overwrite_changes_root() {
        let mut trie = new_trie();
        trie.set(b"key", b"one").unwrap();
        let root_one = trie.root();
        trie.set(b"key", b"two").unwrap();
        assert_ne!(trie.root(), root_one);
        assert_eq!(trie.get(b"key").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn root_is_insertion_order_dependent_only_on_content() {
        let mut a = new_trie();
        let mut b = new_trie();
        for i in 0u8..20 {
            a.set(&[i], &[i]).unwrap();
        }
        for i in (0u8..20).rev() {
            b.set(&[i], &[i]).unwrap();
        }
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn delete_restores_prior_root() {
        let mut trie = new_trie();
        trie.set(b"a", b"1").unwrap();
        let before = trie.root();
        trie.set(b"b", b"2").unwrap();
        trie.delete(b"b").unwrap();
        assert_eq!(trie.root(), before);
        assert!(matches!(trie.delete(b"b"), Err(TrieError::KeyNotFound)));
    }

    #[test]
    fn for_each_visits_all_leaves() {
        let mut trie = new_trie();
        for i in 0u8..10 {
            trie.set(&[i], &[i]).unwrap();
        }
        let mut seen = 0;
        trie.for_each(&mut |_, _| seen += 1).unwrap();
        assert_eq!(seen, 10);
    }
}
