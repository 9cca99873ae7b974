/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mutable governance parameters of a ledger.
//!
//! A [`ChainConfig`] is stored in the state store under the all-zeros instance id and is changed
//! through the `config` contract. Every node reads it to learn the committee, the block interval,
//! and the maximum block size.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use super::roster::Roster;

/// The smallest accepted `max_block_size`, in bytes.
pub const MIN_BLOCK_SIZE: u64 = 16_000;

/// The largest accepted `max_block_size`, in bytes.
pub const MAX_BLOCK_SIZE: u64 = 32_000_000;

/// The mutable governance parameters of one ledger.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ChainConfig {
    /// The committee, in leader-first order.
    pub roster: Roster,
    /// The target interval between blocks, in nanoseconds.
    pub block_interval_ns: u64,
    /// The maximum serialized size of a block's transaction payload, in bytes.
    pub max_block_size: u64,
    /// The contract kinds that are recognized as decoding to an authorization policy.
    pub policy_contract_kinds: Vec<String>,
}

/// Reason a [`ChainConfig`] was rejected by [`sanity_check`](ChainConfig::sanity_check).
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroBlockInterval,
    BlockSizeOutOfBounds { size: u64 },
    EmptyRoster,
    NoPolicyContractKinds,
    RosterChangedTooMuch { distance: usize },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroBlockInterval => write!(f, "block interval must be positive"),
            ConfigError::BlockSizeOutOfBounds { size } => write!(
                f,
                "max block size {} outside of [{}, {}]",
                size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            ),
            ConfigError::EmptyRoster => write!(f, "roster must not be empty"),
            ConfigError::NoPolicyContractKinds => {
                write!(f, "at least one policy contract kind must be recognized")
            }
            ConfigError::RosterChangedTooMuch { distance } => write!(
                f,
                "roster differs from the previous one by {} members, at most 1 is allowed",
                distance
            ),
        }
    }
}

impl ChainConfig {
    /// Create a new `ChainConfig`.
    pub fn new(
        roster: Roster,
        block_interval: Duration,
        max_block_size: u64,
        policy_contract_kinds: Vec<String>,
    ) -> Self {
        Self {
            roster,
            block_interval_ns: block_interval.as_nanos() as u64,
            max_block_size,
            policy_contract_kinds,
        }
    }

    /// Get the target interval between blocks.
    pub fn block_interval(&self) -> Duration {
        Duration::from_nanos(self.block_interval_ns)
    }

    /// Check that this configuration is internally consistent and, if `prev` is given, that the
    /// transition from `prev` to this configuration is allowed.
    ///
    /// Between consecutive blocks the roster may rotate freely (same members, new leader) but
    /// its membership may change by at most one member.
    pub fn sanity_check(&self, prev: Option<&ChainConfig>) -> Result<(), ConfigError> {
        if self.block_interval_ns == 0 {
            return Err(ConfigError::ZeroBlockInterval);
        }
        if self.max_block_size < MIN_BLOCK_SIZE || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeOutOfBounds {
                size: self.max_block_size,
            });
        }
        if self.roster.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        if self.policy_contract_kinds.is_empty() {
            return Err(ConfigError::NoPolicyContractKinds);
        }
        if let Some(prev) = prev {
            if !self.roster.is_permutation_of(&prev.roster) {
                let distance = prev.roster.membership_distance(&self.roster);
                if distance > 1 {
                    return Err(ConfigError::RosterChangedTooMuch { distance });
                }
            }
        }
        Ok(())
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

    fn config_with(roster: Roster) -> ChainConfig {
        ChainConfig::new(
            roster,
            Duration::from_millis(500),
            MIN_BLOCK_SIZE,
            vec!["policy".to_string()],
        )
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = config_with(roster_of(4));
        config.block_interval_ns = 0;
        assert_eq!(
            config.sanity_check(None),
            Err(ConfigError::ZeroBlockInterval)
        );
    }

    #[test]
    fn rotation_is_a_legal_transition() {
        let config = config_with(roster_of(4));
        let mut rotated = config.clone();
        rotated.roster = config.roster.rotated(1);
        assert_eq!(rotated.sanity_check(Some(&config)), Ok(()));
    }

    #[test]
    fn wholesale_roster_replacement_is_rejected() {
        let config = config_with(roster_of(4));
        let replaced = config_with(roster_of(4));
        assert!(matches!(
            replaced.sanity_check(Some(&config)),
            Err(ConfigError::RosterChangedTooMuch { .. })
        ));
    }
}
