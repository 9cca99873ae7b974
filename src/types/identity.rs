/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signer identities.
//!
//! An [`Identity`] names a party that may sign instructions or appear in authorization-policy
//! rules. Primary identities hold an Ed25519 key of their own and can submit top-level
//! instructions; delegated identities name a policy and can only appear inside policy rules.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    basic::{PolicyId, SignatureBytes},
    crypto_primitives::{verify_signature, VerifyingKey},
};

/// The identity of a signer.
#[derive(Clone, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub enum Identity {
    /// A party holding an Ed25519 keypair, identified by the bytes of its verifying key.
    Ed25519([u8; 32]),
    /// A party standing for "whoever satisfies this policy". Delegated identities may appear in
    /// policy rules but may not submit top-level instructions.
    Delegated(PolicyId),
}

impl Identity {
    /// Create the `Identity` of the holder of `public`.
    pub fn ed25519(public: &VerifyingKey) -> Self {
        Identity::Ed25519(public.to_bytes())
    }

    /// Whether this identity is a primary identity, i.e., one that may sign and submit top-level
    /// instructions.
    pub fn is_primary(&self) -> bool {
        matches!(self, Identity::Ed25519(_))
    }

    /// Verify that `signature` is a signature produced by this identity over `message`.
    ///
    /// Delegated identities hold no key and never verify.
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> bool {
        match self {
            Identity::Ed25519(bytes) => match VerifyingKey::from_bytes(bytes) {
                Ok(public) => verify_signature(&public, message, signature),
                Err(_) => false,
            },
            Identity::Delegated(_) => false,
        }
    }

    /// Get the canonical byte representation of this identity, used in hashing and as input to
    /// the signer-counter key derivation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        match self {
            Identity::Ed25519(bytes) => {
                out.push(0u8);
                out.extend_from_slice(bytes);
            }
            Identity::Delegated(id) => {
                out.push(1u8);
                out.extend_from_slice(&id.bytes());
            }
        }
        out
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Ed25519(bytes) => {
                write!(f, "ed25519:")?;
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Identity::Delegated(id) => {
                write!(f, "policy:")?;
                for byte in id.bytes() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}
