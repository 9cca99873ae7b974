/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The committee of a ledger.
//!
//! A [`Roster`] is the *ordered* list of the members of one ledger's committee. The member at
//! index 0 is the current leader. Unlike validator sets in weighted-vote protocols, all members
//! carry equal weight; the fault threshold `f` is `⌊n/3⌋`.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    basic::{CryptoHash, SignatureSet},
    crypto_primitives::{sha256, VerifyingKey},
};

/// Byte representation of a roster, for serialization. Convert to a [`Roster`] with `try_from`
/// to validate the member keys.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct RosterBytes(Vec<[u8; 32]>);

/// The ordered committee of a ledger. Index 0 is the current leader.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Roster {
    members: Vec<VerifyingKey>,
}

impl Roster {
    /// Create a new `Roster` from an ordered list of member keys.
    pub fn new(members: Vec<VerifyingKey>) -> Self {
        Self { members }
    }

    /// Get the current leader: the member at index 0.
    pub fn leader(&self) -> Option<&VerifyingKey> {
        self.members.first()
    }

    /// Get the member that leads the view with the given leader index, i.e., the member at
    /// `leader_index % len`.
    pub fn leader_of(&self, leader_index: u32) -> Option<&VerifyingKey> {
        if self.members.is_empty() {
            return None;
        }
        self.members.get(leader_index as usize % self.members.len())
    }

    /// Get the position of `member` in this roster, if it is a member.
    pub fn position(&self, member: &VerifyingKey) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }

    /// Check whether `member` is in this roster.
    pub fn contains(&self, member: &VerifyingKey) -> bool {
        self.position(member).is_some()
    }

    /// Iterate over the members in roster order.
    pub fn members(&self) -> std::slice::Iter<'_, VerifyingKey> {
        self.members.iter()
    }

    /// Get the number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Get the maximum number of Byzantine-faulty members tolerated: `⌊n/3⌋`.
    pub fn max_faulty(&self) -> usize {
        self.members.len() / 3
    }

    /// Get the number of members whose agreement constitutes a quorum: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    /// Produce a `Roster` with the same members, rotated so that the member at
    /// `leader_index % len` becomes the leader.
    pub fn rotated(&self, leader_index: u32) -> Roster {
        if self.members.is_empty() {
            return self.clone();
        }
        let pivot = leader_index as usize % self.members.len();
        let mut members = Vec::with_capacity(self.members.len());
        members.extend_from_slice(&self.members[pivot..]);
        members.extend_from_slice(&self.members[..pivot]);
        Roster::new(members)
    }

    /// Check whether `other` has exactly the same members as this roster, in any order.
    pub fn is_permutation_of(&self, other: &Roster) -> bool {
        if self.members.len() != other.members.len() {
            return false;
        }
        self.members.iter().all(|m| other.contains(m))
    }

    /// Count how many members of `other` are not members of this roster, plus how many members
    /// of this roster are not members of `other`.
    pub fn membership_distance(&self, other: &Roster) -> usize {
        let added = other.members.iter().filter(|m| !self.contains(m)).count();
        let removed = self.members.iter().filter(|m| !other.contains(m)).count();
        added + removed
    }

    /// Hash the roster: SHA256 over the concatenated member keys in roster order.
    pub fn hash(&self) -> CryptoHash {
        let mut buf = Vec::with_capacity(self.members.len() * 32);
        for member in &self.members {
            buf.extend_from_slice(&member.to_bytes());
        }
        sha256(&buf)
    }

    /// Count the valid signatures in `signatures` over `message`, where position `i` of the set
    /// corresponds to member `i` of this roster.
    pub fn count_valid_signatures(&self, message: &[u8], signatures: &SignatureSet) -> usize {
        self.members
            .iter()
            .zip(signatures.iter())
            .filter(|(member, signature)| match signature {
                Some(signature) => {
                    super::crypto_primitives::verify_signature(member, message, signature)
                }
                None => false,
            })
            .count()
    }
}

impl From<&Roster> for RosterBytes {
    fn from(roster: &Roster) -> Self {
        RosterBytes(roster.members.iter().map(|m| m.to_bytes()).collect())
    }
}

impl TryFrom<RosterBytes> for Roster {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(bytes: RosterBytes) -> Result<Self, Self::Error> {
        let members = bytes
            .0
            .iter()
            .map(VerifyingKey::from_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Roster::new(members))
    }
}

impl BorshSerialize for Roster {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        RosterBytes::from(self).serialize(writer)
    }
}

impl BorshDeserialize for Roster {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let bytes = RosterBytes::deserialize_reader(reader)?;
        Roster::try_from(bytes)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn roster_of(n: usize) -> Roster {
        let mut csprg = OsRng {};
        Roster::new(
            (0..n)
                .map(|_| SigningKey::generate(&mut csprg).verifying_key())
                .collect(),
        )
    }

    #[test]
    fn quorum_thresholds() {
        let roster = roster_of(4);
        assert_eq!(roster.max_faulty(), 1);
        assert_eq!(roster.quorum(), 3);

        let roster = roster_of(7);
        assert_eq!(roster.max_faulty(), 2);
        assert_eq!(roster.quorum(), 5);
    }

    #[test]
    fn rotation_preserves_membership() {
        let roster = roster_of(4);
        let rotated = roster.rotated(2);
        assert!(roster.is_permutation_of(&rotated));
        assert_eq!(rotated.leader(), roster.leader_of(2));
        assert_eq!(roster.membership_distance(&rotated), 0);
    }
}
