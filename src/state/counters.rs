/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replay guard: per-signer monotonic counters kept inside the state store itself.
//!
//! Every top-level instruction carries, per signer, the counter value the signer claims to be
//! at. An instruction verifies only if each claimed counter equals the stored counter plus one,
//! and applying the instruction bumps the stored counters in the same atomic batch as the
//! instruction's own effects. Replaying a signed transaction therefore always fails: its
//! counters are stale the moment the original is applied.

use std::fmt::{self, Display, Formatter};

use crate::types::basic::{InstanceId, PolicyId, StateVersion};
use crate::types::crypto_primitives::{CryptoHasher, Digest};
use crate::types::identity::Identity;
use crate::types::state_change::{StateAction, StateChange};

use super::{ReadOnlyState, StateError};

/// Reason counter verification failed.
#[derive(Debug)]
pub enum CounterError {
    /// The number of claimed counters does not match the number of signers.
    LengthMismatch { counters: usize, signers: usize },
    /// A delegated identity tried to submit a top-level instruction.
    NonPrimarySigner { identity: Identity },
    /// A claimed counter is not the stored counter plus one.
    WrongCounter {
        identity: Identity,
        expected: u64,
        claimed: u64,
    },
    /// The store failed while reading a counter.
    State(StateError),
}

impl Display for CounterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::LengthMismatch { counters, signers } => write!(
                f,
                "{} counters given for {} signers",
                counters, signers
            ),
            CounterError::NonPrimarySigner { identity } => {
                write!(f, "identity {} may not submit top-level instructions", identity)
            }
            CounterError::WrongCounter {
                identity,
                expected,
                claimed,
            } => write!(
                f,
                "identity {} claimed counter {}, expected {}",
                identity, claimed, expected
            ),
            CounterError::State(err) => write!(f, "reading counter: {}", err),
        }
    }
}

impl From<StateError> for CounterError {
    fn from(err: StateError) -> Self {
        CounterError::State(err)
    }
}

/// The instance id a signer's counter is stored under.
pub fn signer_counter_id(identity: &Identity) -> InstanceId {
    let mut hasher = CryptoHasher::new();
    hasher.update(b"signer-counter");
    hasher.update(identity.to_bytes());
    InstanceId::new(hasher.finalize().into())
}

/// The stored counter of `identity`, 0 if the identity has never signed.
pub fn counter_of(state: &dyn ReadOnlyState, identity: &Identity) -> Result<u64, StateError> {
    let key = signer_counter_id(identity);
    match state.get_values(&key) {
        Ok(values) => {
            let mut buf = [0u8; 8];
            let n = values.value.len().min(8);
            buf[..n].copy_from_slice(&values.value[..n]);
            Ok(u64::from_le_bytes(buf))
        }
        Err(StateError::KeyNotSet { .. }) => Ok(0),
        Err(err) => Err(err),
    }
}

/// Verify that each claimed counter equals the corresponding signer's stored counter plus one,
/// and that every signer is a primary identity.
pub fn verify_signer_counters(
    state: &dyn ReadOnlyState,
    claimed: &[u64],
    signers: &[Identity],
) -> Result<(), CounterError> {
    if claimed.len() != signers.len() {
        return Err(CounterError::LengthMismatch {
            counters: claimed.len(),
            signers: signers.len(),
        });
    }
    for (claimed, identity) in claimed.iter().zip(signers.iter()) {
        if !identity.is_primary() {
            return Err(CounterError::NonPrimarySigner {
                identity: identity.clone(),
            });
        }
        let expected = counter_of(state, identity)? + 1;
        if *claimed != expected {
            return Err(CounterError::WrongCounter {
                identity: identity.clone(),
                expected,
                claimed: *claimed,
            });
        }
    }
    Ok(())
}

/// Produce the state changes that bump each signer's counter by one.
///
/// The changes are returned, not applied: the caller applies them in the same batch as the
/// instruction's own effects so that the counter bump and the effect are transactionally
/// coupled.
pub fn increment_signer_counters(
    state: &dyn ReadOnlyState,
    signers: &[Identity],
) -> Result<Vec<StateChange>, StateError> {
    let mut changes = Vec::with_capacity(signers.len());
    for identity in signers {
        let key = signer_counter_id(identity);
        let (action, version, current) = match state.get_values(&key) {
            Ok(values) => {
                let mut buf = [0u8; 8];
                let n = values.value.len().min(8);
                buf[..n].copy_from_slice(&values.value[..n]);
                (
                    StateAction::Update,
                    values.version.next(),
                    u64::from_le_bytes(buf),
                )
            }
            Err(StateError::KeyNotSet { .. }) => {
                (StateAction::Create, StateVersion::init(), 0)
            }
            Err(err) => return Err(err),
        };
        let mut change = StateChange::new(
            action,
            key,
            "",
            (current + 1).to_le_bytes().to_vec(),
            PolicyId::new([0u8; 32]),
        );
        change.version = version;
        changes.push(change);
    }
    Ok(changes)
}
