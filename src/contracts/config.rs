/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The config contract: governs the ledger's [`ChainConfig`], stored under the all-zeros
//! instance id.
//!
//! Spawning it bootstraps a new ledger (the genesis transaction); invoking `update_config`
//! changes the governance parameters under the genesis policy's authority; invoking
//! `view_change` rotates the roster after a completed leader election, authorized not by a
//! client signature but by the collected failure reports themselves.

use borsh::BorshDeserialize;

use crate::state::ReadOnlyState;
use crate::types::basic::{CryptoHash, InstanceId};
use crate::types::config::ChainConfig;
use crate::types::identity::Identity;
use crate::types::state_change::{StateAction, StateChange};
use crate::types::transaction::{Instruction, InstructionBody};
use crate::viewchange::NewViewReq;

use super::policy::{genesis_policy, Policy, POLICY_CONTRACT_KIND};
use super::{Contract, ExecError};

/// The contract kind of the ledger configuration.
pub const CONFIG_CONTRACT_KIND: &str = "config";

/// The contract kind of the name-resolution singleton.
///
/// The singleton's instance id resolves to this kind even before the instance exists, so that
/// its first spawn can bootstrap itself; this crate registers no constructor for it.
pub const NAMING_CONTRACT_KIND: &str = "naming";

/// The well-known instance id of the name-resolution singleton.
pub const NAMING_INSTANCE_ID: InstanceId = InstanceId::new([
    1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0,
]);

/// Load the ledger configuration from the state store.
pub fn load_config(state: &dyn ReadOnlyState) -> Result<ChainConfig, ExecError> {
    let values = state.get_values(&InstanceId::zero())?;
    if values.contract_kind != CONFIG_CONTRACT_KIND {
        return Err(ExecError::Malformed {
            what: format!(
                "instance zero holds \"{}\", not the ledger config",
                values.contract_kind
            ),
        });
    }
    ChainConfig::try_from_slice(&values.value).map_err(|_| ExecError::Malformed {
        what: "chain config".to_string(),
    })
}

/// Constructor registered for [`CONFIG_CONTRACT_KIND`].
pub fn construct(stored: &[u8]) -> Result<Box<dyn Contract>, ExecError> {
    let config = if stored.is_empty() {
        None
    } else {
        Some(
            ChainConfig::try_from_slice(stored).map_err(|_| ExecError::Malformed {
                what: "chain config".to_string(),
            })?,
        )
    };
    Ok(Box::new(ConfigContract { stored: config }))
}

/// The contract governing the ledger configuration.
pub struct ConfigContract {
    stored: Option<ChainConfig>,
}

impl Contract for ConfigContract {
    fn verify_instruction(
        &self,
        state: &dyn ReadOnlyState,
        instruction: &Instruction,
        batch_hash: &CryptoHash,
    ) -> Result<(), ExecError> {
        // Genesis bootstrap: when the config does not exist yet there is nothing to verify
        // against, so the first spawn passes unchecked.
        match state.get_raw(&InstanceId::zero()) {
            Ok(None) => return Ok(()),
            Ok(Some(_)) => {}
            Err(err) => return Err(err.into()),
        }
        // A view-change is authorized by its collected failure reports, checked in `invoke`;
        // the instruction itself carries no client signature worth verifying.
        if let InstructionBody::Invoke(invoke) = &instruction.body {
            if invoke.command == "view_change" {
                return Ok(());
            }
        }
        super::authorize_instruction(state, instruction, batch_hash)
    }

    fn spawn(
        &self,
        _state: &dyn ReadOnlyState,
        instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        let args = match &instruction.body {
            InstructionBody::Spawn(spawn) => &spawn.args,
            _ => {
                return Err(ExecError::Malformed {
                    what: "spawn body".to_string(),
                })
            }
        };

        let policy_bytes = args.search("policy").ok_or(ExecError::Malformed {
            what: "missing 'policy' argument".to_string(),
        })?;
        let policy = Policy::decode(policy_bytes)?;
        if policy.rules.is_empty() {
            return Err(ExecError::Rejected {
                reason: "refusing a genesis policy with no rules".to_string(),
            });
        }

        let config_bytes = args.search("config").ok_or(ExecError::Malformed {
            what: "missing 'config' argument".to_string(),
        })?;
        let config =
            ChainConfig::try_from_slice(config_bytes).map_err(|_| ExecError::Malformed {
                what: "chain config".to_string(),
            })?;
        config
            .sanity_check(None)
            .map_err(|err| ExecError::Rejected {
                reason: err.to_string(),
            })?;

        Ok(vec![
            StateChange::new(
                StateAction::Create,
                InstanceId::zero(),
                CONFIG_CONTRACT_KIND,
                config_bytes.to_vec(),
                policy.base_id,
            ),
            StateChange::new(
                StateAction::Create,
                policy.base_id.instance_id(),
                POLICY_CONTRACT_KIND,
                policy_bytes.to_vec(),
                policy.base_id,
            ),
        ])
    }

    fn invoke(
        &self,
        state: &dyn ReadOnlyState,
        instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        let invoke = match &instruction.body {
            InstructionBody::Invoke(invoke) => invoke,
            _ => {
                return Err(ExecError::Malformed {
                    what: "invoke body".to_string(),
                })
            }
        };
        let old_config = self.stored.as_ref().ok_or(ExecError::Rejected {
            reason: "ledger config does not exist".to_string(),
        })?;
        let policy_id = state.get_values(&InstanceId::zero())?.policy_id;

        match invoke.command.as_str() {
            "update_config" => {
                let config_bytes = invoke.args.search("config").ok_or(ExecError::Malformed {
                    what: "missing 'config' argument".to_string(),
                })?;
                let new_config = ChainConfig::try_from_slice(config_bytes).map_err(|_| {
                    ExecError::Malformed {
                        what: "chain config".to_string(),
                    }
                })?;
                new_config
                    .sanity_check(Some(old_config))
                    .map_err(|err| ExecError::Rejected {
                        reason: err.to_string(),
                    })?;

                let mut changes = vec![StateChange::new(
                    StateAction::Update,
                    InstanceId::zero(),
                    CONFIG_CONTRACT_KIND,
                    config_bytes.to_vec(),
                    policy_id,
                )];
                changes.push(view_change_rule_update(
                    state,
                    &policy_id,
                    &new_config,
                    &old_config.policy_contract_kinds,
                )?);
                Ok(changes)
            }
            "view_change" => {
                let req_bytes = invoke.args.search("newview").ok_or(ExecError::Malformed {
                    what: "missing 'newview' argument".to_string(),
                })?;
                let req = NewViewReq::try_from_slice(req_bytes).map_err(|_| {
                    ExecError::Malformed {
                        what: "new-view request".to_string(),
                    }
                })?;
                // The reports were signed by the committee that observed the failure: the
                // roster stored before this invocation.
                req.check_proof(&old_config.roster)
                    .map_err(|err| ExecError::Rejected {
                        reason: format!("view-change proof rejected: {}", err),
                    })?;
                let view = req.view().ok_or(ExecError::Rejected {
                    reason: "view-change proof rejected: empty".to_string(),
                })?;

                let rotated = old_config.roster.rotated(view.leader_index.int());
                if !rotated.is_permutation_of(&req.roster) {
                    return Err(ExecError::Rejected {
                        reason: "announced roster is not a rotation of the current one"
                            .to_string(),
                    });
                }

                let mut new_config = old_config.clone();
                new_config.roster = rotated;
                Ok(vec![StateChange::new(
                    StateAction::Update,
                    InstanceId::zero(),
                    CONFIG_CONTRACT_KIND,
                    // Vec writers do not fail.
                    borsh::BorshSerialize::try_to_vec(&new_config).unwrap(),
                    policy_id,
                )])
            }
            other => Err(ExecError::Rejected {
                reason: format!("invalid invoke command: {}", other),
            }),
        }
    }
}

/// Refresh the genesis policy's `invoke:config.view_change` rule to the members of the new
/// roster, so a future view-change stays invocable by the committee that actually serves.
fn view_change_rule_update(
    state: &dyn ReadOnlyState,
    policy_id: &crate::types::basic::PolicyId,
    new_config: &ChainConfig,
    recognized_kinds: &[String],
) -> Result<StateChange, ExecError> {
    let mut policy = super::policy::load_policy(state, policy_id, recognized_kinds)?;
    let members: Vec<String> = new_config
        .roster
        .members()
        .map(|member| Identity::ed25519(member).to_string())
        .collect();
    policy.update_rule("invoke:config.view_change", members);
    Ok(StateChange::new(
        StateAction::Update,
        policy_id.instance_id(),
        POLICY_CONTRACT_KIND,
        policy.to_bytes(),
        *policy_id,
    ))
}

/// Build the config and policy arguments of a genesis spawn from a config and an owner
/// identity, granting every roster member the view-change rule.
pub fn genesis_spawn_args(
    config: &ChainConfig,
    owner: &Identity,
    policy_base: crate::types::basic::PolicyId,
) -> (Vec<u8>, Vec<u8>) {
    let roster_identities: Vec<Identity> = config
        .roster
        .members()
        .map(Identity::ed25519)
        .collect();
    let policy = genesis_policy(policy_base, owner, &roster_identities);
    (
        borsh::BorshSerialize::try_to_vec(config).unwrap(),
        policy.to_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateTrie;
    use crate::types::basic::PolicyId;
    use crate::types::roster::Roster;
    use crate::types::transaction::{Argument, Arguments, Spawn};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;
    use std::time::Duration;

    fn sample_config() -> ChainConfig {
        let mut csprg = OsRng {};
        let roster = Roster::new(
            (0..4)
                .map(|_| SigningKey::generate(&mut csprg).verifying_key())
                .collect(),
        );
        ChainConfig::new(
            roster,
            Duration::from_millis(500),
            crate::types::config::MIN_BLOCK_SIZE,
            vec![POLICY_CONTRACT_KIND.to_string()],
        )
    }

    #[test]
    fn genesis_spawn_creates_config_and_policy() {
        let config = sample_config();
        let owner = Identity::Ed25519([9u8; 32]);
        let (config_bytes, policy_bytes) =
            genesis_spawn_args(&config, &owner, PolicyId::new([8u8; 32]));

        let instruction = Instruction::new(
            InstanceId::zero(),
            InstructionBody::Spawn(Spawn {
                contract_kind: CONFIG_CONTRACT_KIND.to_string(),
                args: Arguments::new(vec![
                    Argument::new("config", config_bytes),
                    Argument::new("policy", policy_bytes),
                ]),
            }),
        );

        let state = StateTrie::new([0u8; 32]);
        let contract = construct(&[]).unwrap();
        contract
            .verify_instruction(&state, &instruction, &CryptoHash::zero())
            .unwrap();
        let changes = contract.spawn(&state, &instruction).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].instance_id, InstanceId::zero());
        assert_eq!(changes[0].contract_kind, CONFIG_CONTRACT_KIND);
        assert_eq!(changes[1].contract_kind, POLICY_CONTRACT_KIND);
    }

    #[test]
    fn spawn_rejects_an_insane_config() {
        let mut config = sample_config();
        config.block_interval_ns = 0;
        let owner = Identity::Ed25519([9u8; 32]);
        let (config_bytes, policy_bytes) =
            genesis_spawn_args(&config, &owner, PolicyId::new([8u8; 32]));

        let instruction = Instruction::new(
            InstanceId::zero(),
            InstructionBody::Spawn(Spawn {
                contract_kind: CONFIG_CONTRACT_KIND.to_string(),
                args: Arguments::new(vec![
                    Argument::new("config", config_bytes),
                    Argument::new("policy", policy_bytes),
                ]),
            }),
        );

        let state = StateTrie::new([0u8; 32]);
        let contract = construct(&[]).unwrap();
        assert!(matches!(
            contract.spawn(&state, &instruction),
            Err(ExecError::Rejected { .. })
        ));
    }
}
