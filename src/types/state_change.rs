/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! State changes: the atomic mutations that executing instructions produces.
//!
//! A [`StateChange`] either creates, updates, or removes one key of the state store. The value
//! stored under a key is a [`StateChangeBody`], which is decodable independently of the key.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{CryptoHash, InstanceId, PolicyId, StateVersion};
use super::crypto_primitives::{CryptoHasher, Digest};

/// The contract kind of a state change that carries a synthetic follow-up instruction rather
/// than a data mutation. The execution engine decodes the change's value as an
/// [`Instruction`](super::transaction::Instruction) and splices it into the transaction instead
/// of storing it.
pub const SYNTHETIC_INSTRUCTION_KIND: &str = "_instruction";

/// How a [`StateChange`] modifies the state store.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum StateAction {
    /// Insert a new key-value association. The key must be absent.
    Create,
    /// Change the value of an existing key. The key must be present.
    Update,
    /// Delete an existing key-value association. The key must be present.
    Remove,
}

impl Display for StateAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateAction::Create => write!(f, "Create"),
            StateAction::Update => write!(f, "Update"),
            StateAction::Remove => write!(f, "Remove"),
        }
    }
}

/// One atomic mutation of the state store.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateChange {
    pub action: StateAction,
    pub instance_id: InstanceId,
    pub contract_kind: String,
    pub value: Vec<u8>,
    pub policy_id: PolicyId,
    pub version: StateVersion,
}

impl StateChange {
    /// Create a `StateChange` with version 0. The execution engine assigns the real version
    /// after dispatch.
    pub fn new(
        action: StateAction,
        instance_id: InstanceId,
        contract_kind: &str,
        value: Vec<u8>,
        policy_id: PolicyId,
    ) -> Self {
        Self {
            action,
            instance_id,
            contract_kind: contract_kind.to_string(),
            value,
            policy_id,
            version: StateVersion::init(),
        }
    }

    /// Create a state change that splices `instruction_bytes` (a borsh-encoded
    /// [`Instruction`](super::transaction::Instruction)) into the enclosing transaction.
    pub fn synthetic_instruction(instruction_bytes: Vec<u8>) -> Self {
        Self {
            action: StateAction::Create,
            instance_id: InstanceId::zero(),
            contract_kind: SYNTHETIC_INSTRUCTION_KIND.to_string(),
            value: instruction_bytes,
            policy_id: PolicyId::new([0u8; 32]),
            version: StateVersion::init(),
        }
    }

    /// Whether this state change carries a synthetic follow-up instruction.
    pub fn is_synthetic_instruction(&self) -> bool {
        self.contract_kind == SYNTHETIC_INSTRUCTION_KIND
    }

    /// The key under which this change is stored in the state store.
    pub fn key(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The encoded [`StateChangeBody`] that this change stores under its key. `None` for
    /// removals.
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        match self.action {
            StateAction::Remove => None,
            StateAction::Create | StateAction::Update => {
                let body = StateChangeBody {
                    contract_kind: self.contract_kind.clone(),
                    value: self.value.clone(),
                    policy_id: self.policy_id,
                    version: self.version,
                };
                // Vec writers do not fail.
                Some(body.try_to_vec().unwrap())
            }
        }
    }
}

impl Display for StateChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) v{}",
            self.action, self.instance_id, self.contract_kind, self.version
        )
    }
}

/// The value stored under a key of the state store.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateChangeBody {
    pub contract_kind: String,
    pub value: Vec<u8>,
    pub policy_id: PolicyId,
    pub version: StateVersion,
}

impl StateChangeBody {
    /// Decode a `StateChangeBody` from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, std::io::Error> {
        StateChangeBody::try_from_slice(bytes)
    }
}

/// Hash an ordered list of state changes: SHA256 over the concatenated encodings.
pub fn hash_state_changes(changes: &[StateChange]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    for change in changes {
        // Vec writers do not fail.
        hasher.update(change.try_to_vec().unwrap());
    }
    super::basic::CryptoHash::new(hasher.finalize().into())
}
