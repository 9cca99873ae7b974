/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Disposable copy-on-write views of a trie for speculative execution.
//!
//! A [`StagingTrie`] is created from a snapshot of a durable trie in O(1). Reads fall through
//! to the snapshot; writes land in an overlay and are additionally recorded as an op log, so
//! the staging work can later be replayed onto the durable trie (or simply dropped).

use crate::types::basic::CryptoHash;

use super::proof::TrieProof;
use super::store::{MemStore, OverlayStore};
use super::{Trie, TrieError, TrieOp};

/// An isolated, independently mutable view over a snapshot of a durable trie.
#[derive(Clone)]
pub struct StagingTrie {
    trie: Trie<OverlayStore>,
    ops: Vec<(Vec<u8>, TrieOp)>,
}

impl StagingTrie {
    /// Create a staging view over the current state of `base`. Shares all unmodified nodes
    /// with `base` structurally; nothing is copied until either side writes.
    pub fn new(base: &Trie<MemStore>) -> Self {
        let store = OverlayStore::new(base.store().snapshot());
        Self {
            trie: Trie::open(store, base.nonce(), base.root()),
            ops: Vec::new(),
        }
    }

    /// The root hash of the staged state.
    pub fn root(&self) -> CryptoHash {
        self.trie.root()
    }

    /// The per-trie nonce, inherited from the parent.
    pub fn nonce(&self) -> [u8; 32] {
        self.trie.nonce()
    }

    /// Look up the value staged (or inherited) under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.trie.get(key)
    }

    /// Set or overwrite the value under `key`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        self.trie.set(key, value)?;
        self.ops.push((key.to_vec(), TrieOp::Set(value.to_vec())));
        Ok(())
    }

    /// Delete the value under `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        self.trie.delete(key)?;
        self.ops.push((key.to_vec(), TrieOp::Del));
        Ok(())
    }

    /// Produce a proof of presence or absence for `key` against the staged root.
    pub fn get_proof(&self, key: &[u8]) -> Result<TrieProof, TrieError> {
        self.trie.get_proof(key)
    }

    /// Visit every key-value pair of the staged state.
    pub fn for_each<F: FnMut(&[u8], &[u8])>(&self, f: &mut F) -> Result<(), TrieError> {
        self.trie.for_each(f)
    }

    /// The op log accumulated since this staging view (or its earliest ancestor clone) was
    /// created.
    pub fn ops(&self) -> &[(Vec<u8>, TrieOp)] {
        &self.ops
    }

    /// Replay the op log onto `base`. The caller is responsible for only committing onto the
    /// trie this staging view was created from (or an identical one); committing onto a
    /// diverged base corrupts nothing but yields a different root than [`root`](Self::root).
    pub fn commit_into(&self, base: &mut Trie<MemStore>) -> Result<(), TrieError> {
        base.apply(&self.ops)
    }
}
