/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ledger-level state store.
//!
//! [`StateTrie`] is the durable, per-ledger source of truth: a versioned
//! `key → (value, contract kind, owner policy, version)` map over the [trie](crate::trie), with
//! the index of the last applied block kept alongside. There is exactly one writer path per
//! ledger (the block-applied callback); readers take snapshots.
//!
//! [`StagingState`] is the disposable flavor used for speculative execution: leaders build
//! proposals against one, followers re-execute proposals against one, and either side throws it
//! away on failure without ever risking the durable copy.

pub mod counters;

use std::fmt::{self, Display, Formatter};

use crate::trie::proof::TrieProof;
use crate::trie::staging::StagingTrie;
use crate::trie::store::MemStore;
use crate::trie::{Trie, TrieError, TrieOp};
use crate::types::basic::{BlockIndex, CryptoHash, InstanceId, PolicyId, StateVersion};
use crate::types::state_change::{StateAction, StateChange, StateChangeBody};

/// Error raised by state store operations.
#[derive(Debug)]
pub enum StateError {
    /// The queried key is not set.
    KeyNotSet { key: InstanceId },
    /// The value under a key failed to decode as a [`StateChangeBody`]. The store is corrupt.
    MalformedBody {
        key: InstanceId,
        source: std::io::Error,
    },
    /// A batch was rejected because the root it produced does not match the expected root.
    /// Nothing was applied.
    RootMismatch {
        expected: CryptoHash,
        computed: CryptoHash,
    },
    /// A batch was rejected because its block index does not directly follow the last applied
    /// block. The caller should drive catch-up instead.
    IndexGap {
        last_applied: Option<BlockIndex>,
        given: BlockIndex,
    },
    /// An underlying trie failure. The store is corrupt.
    Trie(TrieError),
}

impl Display for StateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateError::KeyNotSet { key } => write!(f, "key {} not set", key),
            StateError::MalformedBody { key, source } => {
                write!(f, "malformed value under key {}: {}", key, source)
            }
            StateError::RootMismatch { expected, computed } => {
                write!(f, "root mismatch: expected {}, computed {}", expected, computed)
            }
            StateError::IndexGap { last_applied, given } => match last_applied {
                Some(last) => write!(
                    f,
                    "block index gap: last applied {}, given {}",
                    last, given
                ),
                None => write!(f, "block index gap: state empty, given {}", given),
            },
            StateError::Trie(err) => write!(f, "trie failure: {}", err),
        }
    }
}

impl From<TrieError> for StateError {
    fn from(err: TrieError) -> Self {
        StateError::Trie(err)
    }
}

/// Everything stored under one instance id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateValues {
    pub value: Vec<u8>,
    pub version: StateVersion,
    pub contract_kind: String,
    pub policy_id: PolicyId,
}

/// The read surface shared by the durable and staging state stores. Contracts and the
/// execution engine only see this trait.
pub trait ReadOnlyState {
    /// Get the raw encoded body stored under `key`, or `None` if the key is absent.
    fn get_raw(&self, key: &InstanceId) -> Result<Option<Vec<u8>>, StateError>;

    /// Produce a proof of presence or absence for `key`. Always succeeds on a healthy store.
    fn get_proof(&self, key: &InstanceId) -> Result<TrieProof, StateError>;

    /// The current root hash of the store.
    fn root_hash(&self) -> CryptoHash;

    /// The index of the last applied block, or `None` if no block has been applied.
    fn index(&self) -> Option<BlockIndex>;

    /// Get the decoded values stored under `key`. Fails with
    /// [`StateError::KeyNotSet`] if the key is absent.
    fn get_values(&self, key: &InstanceId) -> Result<StateValues, StateError> {
        let bytes = self
            .get_raw(key)?
            .ok_or(StateError::KeyNotSet { key: *key })?;
        let body = StateChangeBody::decode(&bytes).map_err(|source| {
            StateError::MalformedBody { key: *key, source }
        })?;
        Ok(StateValues {
            value: body.value,
            version: body.version,
            contract_kind: body.contract_kind,
            policy_id: body.policy_id,
        })
    }
}

fn change_ops(changes: &[StateChange]) -> Vec<(Vec<u8>, TrieOp)> {
    changes
        .iter()
        .map(|change| {
            let key = change.key().bytes().to_vec();
            match change.action {
                StateAction::Create | StateAction::Update => {
                    // body_bytes is Some for Create and Update.
                    (key, TrieOp::Set(change.body_bytes().unwrap()))
                }
                StateAction::Remove => (key, TrieOp::Del),
            }
        })
        .collect()
}

/// The durable state store of one ledger.
pub struct StateTrie {
    trie: Trie<MemStore>,
    index: Option<BlockIndex>,
}

impl StateTrie {
    /// Create a fresh state store salted with `nonce`. No block has been applied yet.
    pub fn new(nonce: [u8; 32]) -> Self {
        Self {
            trie: Trie::new(MemStore::new(), nonce),
            index: None,
        }
    }

    /// The per-ledger trie nonce.
    pub fn nonce(&self) -> [u8; 32] {
        self.trie.nonce()
    }

    /// Create an isolated staging view of the current state for speculative execution.
    pub fn staging(&self) -> StagingState {
        StagingState {
            trie: StagingTrie::new(&self.trie),
            index: self.index,
        }
    }

    /// Atomically apply `changes` as the effects of block `index`.
    ///
    /// Fails without any application if `index` does not directly follow the last applied block,
    /// or if `expected_root` is given and the root after application would differ from it.
    pub fn verified_store_all(
        &mut self,
        changes: &[StateChange],
        index: BlockIndex,
        expected_root: Option<CryptoHash>,
    ) -> Result<(), StateError> {
        let expected_index = match self.index {
            None => BlockIndex::new(0),
            Some(last) => last + 1,
        };
        if index != expected_index {
            return Err(StateError::IndexGap {
                last_applied: self.index,
                given: index,
            });
        }

        // Stage the whole batch first so a root mismatch rejects without partial application.
        let mut staged = StagingTrie::new(&self.trie);
        let ops = change_ops(changes);
        for (key, op) in &ops {
            match op {
                TrieOp::Set(value) => staged.set(key, value)?,
                TrieOp::Del => staged.delete(key)?,
            }
        }
        if let Some(expected) = expected_root {
            if staged.root() != expected {
                return Err(StateError::RootMismatch {
                    expected,
                    computed: staged.root(),
                });
            }
        }

        staged.commit_into(&mut self.trie)?;
        self.index = Some(index);
        Ok(())
    }

    /// Apply `changes` as the effects of block `index` without a root expectation.
    pub fn store_all(
        &mut self,
        changes: &[StateChange],
        index: BlockIndex,
    ) -> Result<(), StateError> {
        self.verified_store_all(changes, index, None)
    }

    /// Visit every key-value pair of the store. Used by paged state downloads.
    pub fn for_each<F: FnMut(&[u8], &[u8])>(&self, f: &mut F) -> Result<(), StateError> {
        self.trie.for_each(f)?;
        Ok(())
    }
}

impl ReadOnlyState for StateTrie {
    fn get_raw(&self, key: &InstanceId) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.trie.get(&key.bytes())?)
    }

    fn get_proof(&self, key: &InstanceId) -> Result<TrieProof, StateError> {
        Ok(self.trie.get_proof(&key.bytes())?)
    }

    fn root_hash(&self) -> CryptoHash {
        self.trie.root()
    }

    fn index(&self) -> Option<BlockIndex> {
        self.index
    }
}

/// A disposable staging view of a ledger's state.
///
/// Cloning is cheap: clones share all unmodified trie nodes with the durable parent and with
/// each other.
#[derive(Clone)]
pub struct StagingState {
    trie: StagingTrie,
    index: Option<BlockIndex>,
}

impl StagingState {
    /// Apply `changes` to the staged state, in order.
    pub fn store_all(&mut self, changes: &[StateChange]) -> Result<(), StateError> {
        for (key, op) in change_ops(changes) {
            match op {
                TrieOp::Set(value) => self.trie.set(&key, &value)?,
                TrieOp::Del => self.trie.delete(&key)?,
            }
        }
        Ok(())
    }

    /// The per-ledger trie nonce, inherited from the durable parent.
    pub fn nonce(&self) -> [u8; 32] {
        self.trie.nonce()
    }

    /// Visit every key-value pair of the staged state.
    pub fn for_each<F: FnMut(&[u8], &[u8])>(&self, f: &mut F) -> Result<(), StateError> {
        self.trie.for_each(f)?;
        Ok(())
    }
}

impl ReadOnlyState for StagingState {
    fn get_raw(&self, key: &InstanceId) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.trie.get(&key.bytes())?)
    }

    fn get_proof(&self, key: &InstanceId) -> Result<TrieProof, StateError> {
        Ok(self.trie.get_proof(&key.bytes())?)
    }

    fn root_hash(&self) -> CryptoHash {
        self.trie.root()
    }

    fn index(&self) -> Option<BlockIndex> {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::state_change::StateAction;

    fn create(id: u8, value: Vec<u8>) -> StateChange {
        StateChange::new(
            StateAction::Create,
            InstanceId::new([id; 32]),
            "value",
            value,
            PolicyId::new([0u8; 32]),
        )
    }

    #[test]
    fn verified_store_all_rejects_wholesale_on_root_mismatch() {
        let mut state = StateTrie::new([1u8; 32]);
        let before = state.root_hash();
        let result = state.verified_store_all(
            &[create(1, vec![1]), create(2, vec![2])],
            BlockIndex::new(0),
            Some(CryptoHash::new([0xAA; 32])),
        );
        assert!(matches!(result, Err(StateError::RootMismatch { .. })));
        assert_eq!(state.root_hash(), before);
        assert!(state.get_raw(&InstanceId::new([1u8; 32])).unwrap().is_none());
        assert_eq!(state.index(), None);
    }

    #[test]
    fn refuses_out_of_order_blocks() {
        let mut state = StateTrie::new([1u8; 32]);
        let result = state.store_all(&[create(1, vec![1])], BlockIndex::new(3));
        assert!(matches!(result, Err(StateError::IndexGap { .. })));

        state.store_all(&[create(1, vec![1])], BlockIndex::new(0)).unwrap();
        assert_eq!(state.index(), Some(BlockIndex::new(0)));
        let result = state.store_all(&[create(2, vec![2])], BlockIndex::new(0));
        assert!(matches!(result, Err(StateError::IndexGap { .. })));
    }

    #[test]
    fn staging_does_not_touch_the_durable_copy() {
        let mut state = StateTrie::new([1u8; 32]);
        state.store_all(&[create(1, vec![1])], BlockIndex::new(0)).unwrap();
        let durable_root = state.root_hash();

        let mut staging = state.staging();
        staging.store_all(&[create(2, vec![2])]).unwrap();

        assert_ne!(staging.root_hash(), durable_root);
        assert_eq!(state.root_hash(), durable_root);
    }

    #[test]
    fn get_values_decodes_the_body() {
        let mut state = StateTrie::new([1u8; 32]);
        state
            .store_all(&[create(1, vec![5, 6, 7, 8])], BlockIndex::new(0))
            .unwrap();
        let values = state.get_values(&InstanceId::new([1u8; 32])).unwrap();
        assert_eq!(values.value, vec![5, 6, 7, 8]);
        assert_eq!(values.contract_kind, "value");
        assert_eq!(values.version, StateVersion::init());

        let missing = state.get_values(&InstanceId::new([9u8; 32]));
        assert!(matches!(missing, Err(StateError::KeyNotSet { .. })));
    }
}
