/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The minimal authorization-policy store.
//!
//! Every instance records the id of the policy that owns it. A [`Policy`] maps action strings
//! (`spawn:kind`, `invoke:kind.command`, `delete:kind`) to the identities allowed to perform
//! them; an action is authorized when any verified signer appears in its rule. Richer policy
//! expression languages are an external concern; this module is deliberately the smallest
//! evaluator that closes the authorization loop.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::state::ReadOnlyState;
use crate::types::basic::{InstanceId, PolicyId};
use crate::types::identity::Identity;
use crate::types::state_change::{StateAction, StateChange};
use crate::types::transaction::{Instruction, InstructionBody};

use super::{Contract, ExecError};

/// The contract kind under which policies are stored.
pub const POLICY_CONTRACT_KIND: &str = "policy";

/// One rule of a policy: the identities allowed to perform one action.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Rule {
    pub action: String,
    pub identities: Vec<String>,
}

/// An authorization policy: a list of [`Rule`]s owned by a stable base id.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Policy {
    pub base_id: PolicyId,
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Create a new policy.
    pub fn new(base_id: PolicyId, rules: Vec<Rule>) -> Self {
        Self { base_id, rules }
    }

    /// Get the rule for `action`, if one exists.
    pub fn rule(&self, action: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.action == action)
    }

    /// Replace or insert the rule for `action`.
    pub fn update_rule(&mut self, action: &str, identities: Vec<String>) {
        match self.rules.iter_mut().find(|rule| rule.action == action) {
            Some(rule) => rule.identities = identities,
            None => self.rules.push(Rule {
                action: action.to_string(),
                identities,
            }),
        }
    }

    /// Check that `action` is allowed for at least one of `satisfied_identities` (identity
    /// strings whose signature already verified).
    pub fn evaluate(&self, action: &str, satisfied_identities: &[String]) -> Result<(), ExecError> {
        let rule = self.rule(action).ok_or_else(|| ExecError::Unauthorized {
            reason: format!("action '{}' does not exist", action),
        })?;
        if rule
            .identities
            .iter()
            .any(|allowed| satisfied_identities.contains(allowed))
        {
            Ok(())
        } else {
            Err(ExecError::Unauthorized {
                reason: format!("no verified signer satisfies the rule for '{}'", action),
            })
        }
    }

    /// Encode this policy for storage or as an instruction argument.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Vec writers do not fail.
        self.try_to_vec().unwrap()
    }

    /// Decode a policy from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ExecError> {
        Policy::try_from_slice(bytes).map_err(|_| ExecError::Malformed {
            what: "policy".to_string(),
        })
    }
}

/// Build the policy that governs a new ledger: `owner` may administrate, every roster member
/// may invoke a view-change.
pub fn genesis_policy(base_id: PolicyId, owner: &Identity, roster_identities: &[Identity]) -> Policy {
    let owner_str = owner.to_string();
    let roster_strs: Vec<String> = roster_identities.iter().map(|id| id.to_string()).collect();
    Policy::new(
        base_id,
        vec![
            Rule {
                action: "invoke:config.update_config".to_string(),
                identities: vec![owner_str.clone()],
            },
            Rule {
                action: "invoke:config.view_change".to_string(),
                identities: roster_strs,
            },
            Rule {
                action: format!("spawn:{}", POLICY_CONTRACT_KIND),
                identities: vec![owner_str.clone()],
            },
            Rule {
                action: format!("invoke:{}.update", POLICY_CONTRACT_KIND),
                identities: vec![owner_str],
            },
        ],
    )
}

/// Load the policy stored under `policy_id`, checking that the instance it lives in is of a
/// recognized policy contract kind.
pub fn load_policy(
    state: &dyn ReadOnlyState,
    policy_id: &PolicyId,
    recognized_kinds: &[String],
) -> Result<Policy, ExecError> {
    let values = state.get_values(&policy_id.instance_id())?;
    if !recognized_kinds.contains(&values.contract_kind) {
        return Err(ExecError::Unauthorized {
            reason: format!(
                "contract kind \"{}\" does not decode to a policy",
                values.contract_kind
            ),
        });
    }
    Policy::decode(&values.value)
}

/// Load the policy that owns `instance_id`: read the instance's stored owner-policy id, then
/// the policy itself.
pub fn policy_of_instance(
    state: &dyn ReadOnlyState,
    instance_id: &InstanceId,
    recognized_kinds: &[String],
) -> Result<Policy, ExecError> {
    let values = state.get_values(instance_id)?;
    load_policy(state, &values.policy_id, recognized_kinds)
}

/// Constructor registered for [`POLICY_CONTRACT_KIND`].
pub fn construct(stored: &[u8]) -> Result<Box<dyn Contract>, ExecError> {
    let policy = if stored.is_empty() {
        None
    } else {
        Some(Policy::decode(stored)?)
    };
    Ok(Box::new(PolicyContract {
        stored: policy,
        registry: None,
    }))
}

/// The contract that stores and updates policies.
///
/// Spawns of *other* contract kinds address the policy instance that will own the new
/// instance, so this contract also acts as the generic spawn router: it looks the requested
/// kind up in the registry and delegates. This is why it implements the registry-aware
/// capability ([`Contract::set_registry`]).
pub struct PolicyContract {
    /// The decoded policy of the addressed instance; `None` when the instruction spawns into a
    /// fresh instance.
    stored: Option<Policy>,
    registry: Option<crate::contracts::ContractRegistry>,
}

impl Contract for PolicyContract {
    fn set_registry(&mut self, registry: crate::contracts::ContractRegistry) {
        self.registry = Some(registry);
    }

    fn spawn(
        &self,
        state: &dyn ReadOnlyState,
        instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        let spawn = match &instruction.body {
            InstructionBody::Spawn(spawn) => spawn,
            _ => {
                return Err(ExecError::Malformed {
                    what: "spawn body".to_string(),
                })
            }
        };

        // Spawns of other kinds route through the registry: the policy instance only lends its
        // authority, the spawned kind's own contract produces the changes.
        if spawn.contract_kind != POLICY_CONTRACT_KIND {
            let registry = self.registry.as_ref().ok_or(ExecError::Fault {
                reason: "policy contract dispatched without a registry".to_string(),
            })?;
            let constructor =
                registry
                    .search(&spawn.contract_kind)
                    .ok_or(ExecError::UnknownContract {
                        kind: spawn.contract_kind.clone(),
                    })?;
            let mut contract = constructor(&[])?;
            contract.set_registry(registry.clone());
            return contract.spawn(state, instruction);
        }

        let policy_bytes = spawn.args.search("policy").ok_or(ExecError::Malformed {
            what: "missing 'policy' argument".to_string(),
        })?;
        let policy = Policy::decode(policy_bytes)?;
        if policy.rules.is_empty() {
            return Err(ExecError::Rejected {
                reason: "refusing a policy with no rules".to_string(),
            });
        }
        Ok(vec![StateChange::new(
            StateAction::Create,
            policy.base_id.instance_id(),
            POLICY_CONTRACT_KIND,
            policy_bytes.to_vec(),
            policy.base_id,
        )])
    }

    fn invoke(
        &self,
        _state: &dyn ReadOnlyState,
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
        match invoke.command.as_str() {
            "update" => {
                let stored = self.stored.as_ref().ok_or(ExecError::Rejected {
                    reason: "cannot update a policy that does not exist".to_string(),
                })?;
                let new_bytes = invoke.args.search("policy").ok_or(ExecError::Malformed {
                    what: "missing 'policy' argument".to_string(),
                })?;
                let new_policy = Policy::decode(new_bytes)?;
                if new_policy.base_id != stored.base_id {
                    return Err(ExecError::Rejected {
                        reason: "policy update must keep the base id".to_string(),
                    });
                }
                Ok(vec![StateChange::new(
                    StateAction::Update,
                    stored.base_id.instance_id(),
                    POLICY_CONTRACT_KIND,
                    new_bytes.to_vec(),
                    stored.base_id,
                )])
            }
            other => Err(ExecError::Rejected {
                reason: format!("invalid invoke command: {}", other),
            }),
        }
    }

    fn delete(
        &self,
        _state: &dyn ReadOnlyState,
        instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        let stored = self.stored.as_ref().ok_or(ExecError::Rejected {
            reason: "cannot delete a policy that does not exist".to_string(),
        })?;
        Ok(vec![StateChange::new(
            StateAction::Remove,
            instruction.instance_id,
            POLICY_CONTRACT_KIND,
            Vec::new(),
            stored.base_id,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::new(
            PolicyId::new([1u8; 32]),
            vec![Rule {
                action: "spawn:value".to_string(),
                identities: vec!["ed25519:aa".to_string()],
            }],
        )
    }

    #[test]
    fn evaluate_requires_a_matching_rule() {
        let policy = policy();
        assert!(policy
            .evaluate("spawn:value", &["ed25519:aa".to_string()])
            .is_ok());
        assert!(policy
            .evaluate("spawn:value", &["ed25519:bb".to_string()])
            .is_err());
        assert!(policy
            .evaluate("delete:value", &["ed25519:aa".to_string()])
            .is_err());
    }

    #[test]
    fn update_rule_replaces_in_place() {
        let mut policy = policy();
        policy.update_rule("spawn:value", vec!["ed25519:cc".to_string()]);
        assert_eq!(policy.rules.len(), 1);
        assert!(policy
            .evaluate("spawn:value", &["ed25519:cc".to_string()])
            .is_ok());

        policy.update_rule("delete:value", vec!["ed25519:cc".to_string()]);
        assert_eq!(policy.rules.len(), 2);
    }

    #[test]
    fn encoding_round_trips() {
        let policy = policy();
        assert_eq!(Policy::decode(&policy.to_bytes()).unwrap(), policy);
    }
}
