/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// 32-byte cryptographic hash.
///
/// Within byzledger, `CryptoHash`-es are always SHA256 digests: block hashes, transaction
/// digests, trie roots, and trie node hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Get the all-zeros `CryptoHash`.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Identifier of one independently-governed ledger: the hash of its genesis block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct LedgerId(CryptoHash);

impl LedgerId {
    /// Create a new `LedgerId` wrapping the hash of a genesis block.
    pub const fn new(genesis_hash: CryptoHash) -> Self {
        Self(genesis_hash)
    }

    /// Get the genesis block hash of this `LedgerId`.
    pub const fn hash(&self) -> CryptoHash {
        self.0
    }

    /// Get the inner `[u8; 32]` value of this `LedgerId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0.bytes()
    }
}

impl Display for LedgerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for LedgerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte address of a contract instance.
///
/// Stable for the lifetime of the instance. The all-zeros instance id addresses the ledger
/// configuration ([`ChainConfig`](super::config::ChainConfig)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct InstanceId([u8; 32]);

impl InstanceId {
    /// Create a new `InstanceId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the instance id of the ledger configuration.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `InstanceId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Create an `InstanceId` from the first 32 bytes of `slice`, zero-padding if shorter.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        let n = slice.len().min(32);
        bytes[..n].copy_from_slice(&slice[..n]);
        Self(bytes)
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// 32-byte identifier of the authorization policy that owns an instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct PolicyId([u8; 32]);

impl PolicyId {
    /// Create a new `PolicyId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `PolicyId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Get the instance id under which this policy is stored.
    pub const fn instance_id(&self) -> InstanceId {
        InstanceId::new(self.0)
    }
}

impl Display for PolicyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for PolicyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Sequence number of a block in a ledger. Starts at 0 for the genesis block and increases by 1
/// for every appended block.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockIndex(u64);

impl BlockIndex {
    /// Create a new `BlockIndex` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `BlockIndex`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the little-endian representation of the inner `u64` value of this `BlockIndex`.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for BlockIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockIndex {
    type Output = BlockIndex;
    fn add(self, rhs: u64) -> Self::Output {
        BlockIndex::new(self.0.add(rhs))
    }
}

impl AddAssign<u64> for BlockIndex {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Version of one instance's value in the state store.
///
/// Starts at 0 when the instance is created and increases by 1 with every change, with no gaps,
/// regardless of how many unrelated instructions interleave.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct StateVersion(u64);

impl StateVersion {
    /// Create a new `StateVersion` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the initial `StateVersion`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` value of this `StateVersion`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the `StateVersion` that follows this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for StateVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index into a [`Roster`](super::roster::Roster) identifying a candidate leader in a
/// view-change.
///
/// The member at `leader_index % roster.len()` is the prospective leader of the view.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct LeaderIndex(u32);

impl LeaderIndex {
    /// Create a new `LeaderIndex` with an `int` inner value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` value of this `LeaderIndex`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get the little-endian representation of the inner `u32` value of this `LeaderIndex`.
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Get the `LeaderIndex` that follows this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for LeaderIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Ed25519 digital signature.
///
/// Produced using the [`ed25519_dalek`] crate, whose main definitions are re-exported from the
/// [`crypto_primitives`](super::crypto_primitives) module.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes(..)")
    }
}

/// An ordered list of optional [`SignatureBytes`] from the same
/// [`Roster`](super::roster::Roster).
///
/// A signature appears at the position its signer occupies in the roster the set corresponds to.
/// Users of this type are responsible for upholding this order every time they call
/// [`set`](Self::set). A misplaced signature is ignored when the set is verified against the
/// roster.
#[derive(Clone, Debug, PartialEq, Eq, Default, BorshDeserialize, BorshSerialize)]
pub struct SignatureSet(Vec<Option<SignatureBytes>>);

impl SignatureSet {
    /// Create a new `SignatureSet` initially containing `len` `None`s.
    pub fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    /// Create the empty `SignatureSet` carried by links that are not signed (the genesis link).
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Get a reference to the inner `Vec<Option<SignatureBytes>>` of this `SignatureSet`.
    pub const fn vec(&self) -> &Vec<Option<SignatureBytes>> {
        &self.0
    }

    /// Set the value at `pos` in this `SignatureSet` to be `signature`.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= self.len()`.
    pub fn set(&mut self, pos: usize, signature: Option<SignatureBytes>) {
        self.0[pos] = signature
    }

    /// Get the length of the inner vector, which corresponds to the size of the roster this set
    /// was created for, not to the number of signatures actually collected.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the inner vector is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the `Option<SignatureBytes>`s in this `SignatureSet`.
    pub fn iter(&self) -> std::slice::Iter<'_, Option<SignatureBytes>> {
        self.0.iter()
    }
}
