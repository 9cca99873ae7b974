/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transaction execution engine.
//!
//! The [`Executor`] turns client transactions into state changes: it reconstructs the addressed
//! contract, verifies authorization and replay counters, dispatches spawn/invoke/delete, splices
//! contract-generated follow-up instructions, enforces the create/update/remove guards, and
//! assigns instance versions. Leaders and followers run the same engine over the same snapshot,
//! which is what makes the root hash comparison in block verification meaningful.

pub mod cache;

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use borsh::BorshDeserialize;

use crate::contracts::{config, ContractConstructor, ContractRegistry, ExecError};
use crate::state::counters::increment_signer_counters;
use crate::state::{ReadOnlyState, StagingState, StateError};
use crate::types::basic::{CryptoHash, InstanceId, LedgerId, StateVersion};
use crate::types::state_change::{StateAction, StateChange};
use crate::types::transaction::{ClientTransaction, Instruction, InstructionBody, TxResult, TxResults};

use cache::StateChangeCache;

/// Upper bound on instructions executed for one transaction, counting spliced synthetic
/// instructions. A contract that keeps generating follow-ups beyond this is faulted.
const INSTRUCTION_EXPANSION_LIMIT: usize = 1000;

/// The outcome of executing a batch of transactions against a snapshot.
pub struct ExecutionResult {
    /// The root hash of the state after applying every accepted transaction.
    pub root: CryptoHash,
    /// Per-transaction outcomes, in batch order (planning mode may cut the batch short).
    pub tx_results: TxResults,
    /// The state changes of all accepted transactions, in application order.
    pub state_changes: Vec<StateChange>,
    /// Rejection reasons, keyed by the transaction's signature-covering hash.
    pub rejections: Vec<(CryptoHash, String)>,
}

/// The execution engine of one node, shared by every ledger it serves.
pub struct Executor {
    registry: ContractRegistry,
    cache: StateChangeCache,
}

impl Executor {
    /// Create an executor dispatching against `registry`. The registry is frozen by this call.
    pub fn new(registry: &ContractRegistry) -> Self {
        Self {
            registry: registry.clone_for_ledger(),
            cache: StateChangeCache::new(),
        }
    }

    /// The frozen registry this executor dispatches against.
    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    /// Resolve the constructor for an instruction addressed at `instance_id`, whose stored
    /// contract kind is `stored_kind` (`None` when the instance does not exist yet).
    ///
    /// The all-zeros instance and the naming singleton resolve to their bootstrapping kinds
    /// even before they exist, so that their own first spawn can go through.
    fn resolve_constructor(
        &self,
        instance_id: &InstanceId,
        stored_kind: Option<&str>,
    ) -> Result<ContractConstructor, ExecError> {
        if let Some(kind) = stored_kind {
            return self
                .registry
                .search(kind)
                .ok_or(ExecError::UnknownContract {
                    kind: kind.to_string(),
                });
        }
        let bootstrap_kind = if *instance_id == InstanceId::zero() {
            config::CONFIG_CONTRACT_KIND
        } else if *instance_id == config::NAMING_INSTANCE_ID {
            config::NAMING_CONTRACT_KIND
        } else {
            return Err(ExecError::UnknownContract {
                kind: String::new(),
            });
        };
        self.registry
            .search(bootstrap_kind)
            .ok_or(ExecError::UnknownContract {
                kind: bootstrap_kind.to_string(),
            })
    }

    /// Execute one instruction against `state`, without applying anything.
    ///
    /// Returns the produced state changes with versions assigned; synthetic follow-up
    /// instructions are passed through unversioned for the caller to splice.
    pub fn execute_instruction(
        &self,
        state: &dyn ReadOnlyState,
        instruction: &Instruction,
        batch_hash: &CryptoHash,
    ) -> Result<Vec<StateChange>, ExecError> {
        let (contents, stored_kind) = match state.get_values(&instruction.instance_id) {
            Ok(values) => (values.value, Some(values.contract_kind)),
            Err(StateError::KeyNotSet { .. }) => (Vec::new(), None),
            Err(err) => return Err(err.into()),
        };

        let constructor = self.resolve_constructor(&instruction.instance_id, stored_kind.as_deref())?;
        let mut contract = constructor(&contents)?;
        contract.set_registry(self.registry.clone());

        // A misbehaving contract must not crash the node: panics become ordinary rejections at
        // this boundary.
        let dispatch = catch_unwind(AssertUnwindSafe(|| {
            contract.verify_instruction(state, instruction, batch_hash)?;
            match &instruction.body {
                InstructionBody::Spawn(_) => contract.spawn(state, instruction),
                InstructionBody::Invoke(_) => contract.invoke(state, instruction),
                InstructionBody::Delete(_) => contract.delete(state, instruction),
            }
        }));
        let mut changes = match dispatch {
            Ok(result) => result?,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".to_string());
                return Err(ExecError::Fault { reason });
            }
        };

        // Assign versions: 0 for instances absent from the pre-instruction snapshot, else one
        // plus the snapshot's version, increasing across multiple changes to the same instance.
        let mut versions: HashMap<InstanceId, StateVersion> = HashMap::new();
        for change in changes.iter_mut() {
            if change.is_synthetic_instruction() {
                continue;
            }
            if !change.contract_kind.is_empty()
                && self.registry.search(&change.contract_kind).is_none()
            {
                return Err(ExecError::UnknownContract {
                    kind: change.contract_kind.clone(),
                });
            }
            let version = match versions.get(&change.instance_id) {
                Some(version) => version.next(),
                None => match state.get_values(&change.instance_id) {
                    Ok(values) => values.version.next(),
                    Err(StateError::KeyNotSet { .. }) => StateVersion::init(),
                    Err(err) => return Err(err.into()),
                },
            };
            change.version = version;
            versions.insert(change.instance_id, version);
        }
        Ok(changes)
    }

    /// Apply one transaction to a clone of `base`, instruction by instruction.
    ///
    /// Instructions inside the transaction see the effects (including counter bumps and
    /// spliced synthetic instructions) of the instructions before them. Any failure rejects
    /// the whole transaction; `base` is never modified.
    pub fn process_one_tx(
        &self,
        base: &StagingState,
        transaction: &ClientTransaction,
    ) -> Result<(Vec<StateChange>, StagingState), ExecError> {
        let mut staged = base.clone();
        let batch_hash = transaction.hash();
        let mut queue: VecDeque<Instruction> = transaction.instructions.iter().cloned().collect();
        let mut produced = Vec::new();
        let mut executed = 0usize;

        while let Some(instruction) = queue.pop_front() {
            executed += 1;
            if executed > INSTRUCTION_EXPANSION_LIMIT {
                return Err(ExecError::Fault {
                    reason: format!(
                        "transaction expanded beyond {} instructions",
                        INSTRUCTION_EXPANSION_LIMIT
                    ),
                });
            }

            let changes = self.execute_instruction(&staged, &instruction, &batch_hash)?;
            let counter_changes =
                increment_signer_counters(&staged, &instruction.signer_identities)?;

            let mut spliced = Vec::new();
            for change in changes {
                if change.is_synthetic_instruction() {
                    let follow_up =
                        Instruction::try_from_slice(&change.value).map_err(|_| {
                            ExecError::Malformed {
                                what: "synthetic instruction".to_string(),
                            }
                        })?;
                    spliced.push(follow_up);
                    continue;
                }

                // Explicit guards, checked against the state as of this change.
                let exists = staged.get_raw(&change.instance_id)?.is_some();
                let violation = match change.action {
                    StateAction::Create if exists => Some("tried to create existing instance"),
                    StateAction::Update if !exists => Some("tried to update missing instance"),
                    StateAction::Remove if !exists => Some("tried to remove missing instance"),
                    _ => None,
                };
                if let Some(violation) = violation {
                    return Err(ExecError::Rejected {
                        reason: format!("{} {}", violation, change.instance_id),
                    });
                }

                staged.store_all(std::slice::from_ref(&change))?;
                produced.push(change);
            }

            // Depth-first expansion: follow-ups run immediately after the instruction that
            // generated them, before the rest of the queue.
            for follow_up in spliced.into_iter().rev() {
                queue.push_front(follow_up);
            }

            staged.store_all(&counter_changes)?;
            produced.extend(counter_changes);
        }

        Ok((produced, staged))
    }

    /// Execute a batch of transactions against `base`, serving from the cache when the
    /// identical batch was already executed on this ledger.
    ///
    /// With `planning` set, execution stops early once `deadline` passes or once the next
    /// transaction would push the batch beyond `max_block_size`; the transactions accepted so
    /// far are still returned, and partial results stay out of the cache.
    pub fn create_state_changes(
        &self,
        base: &StagingState,
        ledger_id: LedgerId,
        tx_in: TxResults,
        planning: Option<Duration>,
        max_block_size: u64,
    ) -> ExecutionResult {
        let digest = tx_in.hash();
        if let Some((root, tx_results, state_changes)) = self.cache.get(&ledger_id, &digest) {
            log::debug!("state changes for ledger {} served from cache", ledger_id);
            return ExecutionResult {
                root,
                tx_results,
                state_changes,
                rejections: Vec::new(),
            };
        }

        let deadline = planning.map(|timeout| Instant::now() + timeout);
        let mut staged = base.clone();
        let mut tx_out = TxResults::default();
        let mut state_changes = Vec::new();
        let mut rejections = Vec::new();
        let mut block_size = 0u64;
        let mut cut_short = false;

        for result in tx_in.0 {
            let tx_size = result.transaction.size();
            match self.process_one_tx(&staged, &result.transaction) {
                Err(err) => {
                    log::info!(
                        "rejecting transaction {}: {}",
                        result.transaction.hash(),
                        err
                    );
                    rejections.push((result.transaction.hash_with_signatures(), err.to_string()));
                    tx_out.0.push(TxResult {
                        transaction: result.transaction,
                        accepted: false,
                    });
                }
                Ok((changes, new_staged)) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() > deadline {
                            log::warn!("planning ran out of time for ledger {}", ledger_id);
                            cut_short = true;
                            break;
                        }
                        if block_size + tx_size > max_block_size {
                            log::debug!(
                                "stopping block planning at {} bytes (+{} would exceed {})",
                                block_size,
                                tx_size,
                                max_block_size
                            );
                            cut_short = true;
                            break;
                        }
                    }
                    staged = new_staged;
                    block_size += tx_size;
                    state_changes.extend(changes);
                    tx_out.0.push(TxResult {
                        transaction: result.transaction,
                        accepted: true,
                    });
                }
            }
        }

        let root = staged.root_hash();
        if !cut_short && !state_changes.is_empty() && !tx_out.is_empty() {
            self.cache.update(
                ledger_id,
                tx_out.hash(),
                root,
                tx_out.clone(),
                state_changes.clone(),
            );
        }
        ExecutionResult {
            root,
            tx_results: tx_out,
            state_changes,
            rejections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::policy::{genesis_policy, POLICY_CONTRACT_KIND};
    use crate::contracts::{config, Contract, ContractRegistry};
    use crate::state::counters::counter_of;
    use crate::state::StateTrie;
    use crate::types::basic::{BlockIndex, PolicyId};
    use crate::types::config::ChainConfig;
    use crate::types::crypto_primitives::Keypair;
    use crate::types::identity::Identity;
    use crate::types::roster::Roster;
    use crate::types::transaction::{Argument, Arguments, Delete, Invoke, Spawn};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A test contract kind storing an opaque byte value per instance.
    struct ValueContract;

    impl Contract for ValueContract {
        fn spawn(
            &self,
            state: &dyn ReadOnlyState,
            instruction: &Instruction,
        ) -> Result<Vec<StateChange>, ExecError> {
            let args = match &instruction.body {
                InstructionBody::Spawn(spawn) => &spawn.args,
                _ => unreachable!(),
            };
            let value = args.search("value").unwrap_or_default().to_vec();
            // The spawning instruction addresses the owning policy instance.
            let policy_id = state.get_values(&instruction.instance_id)?.policy_id;
            Ok(vec![StateChange::new(
                StateAction::Create,
                instruction.derive_id(""),
                "value",
                value,
                policy_id,
            )])
        }

        fn invoke(
            &self,
            state: &dyn ReadOnlyState,
            instruction: &Instruction,
        ) -> Result<Vec<StateChange>, ExecError> {
            let args = match &instruction.body {
                InstructionBody::Invoke(invoke) => &invoke.args,
                _ => unreachable!(),
            };
            let value = args.search("value").unwrap_or_default().to_vec();
            let policy_id = state.get_values(&instruction.instance_id)?.policy_id;
            Ok(vec![StateChange::new(
                StateAction::Update,
                instruction.instance_id,
                "value",
                value,
                policy_id,
            )])
        }

        fn delete(
            &self,
            state: &dyn ReadOnlyState,
            instruction: &Instruction,
        ) -> Result<Vec<StateChange>, ExecError> {
            let policy_id = state.get_values(&instruction.instance_id)?.policy_id;
            Ok(vec![StateChange::new(
                StateAction::Remove,
                instruction.instance_id,
                "value",
                Vec::new(),
                policy_id,
            )])
        }
    }

    struct Harness {
        executor: Executor,
        state: StateTrie,
        ledger_id: LedgerId,
        owner: Keypair,
        policy_instance: InstanceId,
    }

    fn harness_with<F: Fn(&ContractRegistry)>(register_extra: F) -> Harness {
        let mut csprg = OsRng {};
        let owner = Keypair::new(SigningKey::generate(&mut csprg));
        let owner_id = Identity::ed25519(&owner.public());

        let registry = ContractRegistry::with_builtin_contracts();
        registry
            .register(
                "value",
                Arc::new(|_| Ok(Box::new(ValueContract) as Box<dyn Contract>)),
            )
            .unwrap();
        register_extra(&registry);

        let roster = Roster::new(vec![owner.public()]);
        let chain_config = ChainConfig::new(
            roster,
            Duration::from_millis(500),
            crate::types::config::MIN_BLOCK_SIZE,
            vec![POLICY_CONTRACT_KIND.to_string()],
        );

        let policy_base = PolicyId::new([42u8; 32]);
        let mut policy = genesis_policy(policy_base, &owner_id, &[owner_id.clone()]);
        for action in [
            "spawn:value",
            "invoke:value.update",
            "delete:value",
            "spawn:splicer",
            "spawn:counting",
            "spawn:bad",
        ] {
            policy.update_rule(action, vec![owner_id.to_string()]);
        }

        let mut state = StateTrie::new([5u8; 32]);
        state
            .store_all(
                &[
                    StateChange::new(
                        StateAction::Create,
                        InstanceId::zero(),
                        config::CONFIG_CONTRACT_KIND,
                        borsh::BorshSerialize::try_to_vec(&chain_config).unwrap(),
                        policy_base,
                    ),
                    StateChange::new(
                        StateAction::Create,
                        policy_base.instance_id(),
                        POLICY_CONTRACT_KIND,
                        policy.to_bytes(),
                        policy_base,
                    ),
                ],
                BlockIndex::new(0),
            )
            .unwrap();

        Harness {
            executor: Executor::new(&registry),
            state,
            ledger_id: LedgerId::new(CryptoHash::new([9u8; 32])),
            owner,
            policy_instance: policy_base.instance_id(),
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    impl Harness {
        fn signed_tx(&self, instructions: Vec<Instruction>) -> ClientTransaction {
            let counter = counter_of(
                &self.state,
                &Identity::ed25519(&self.owner.public()),
            )
            .unwrap();
            let mut tx = ClientTransaction::new(instructions);
            tx.fill_signers_and_sign(std::slice::from_ref(&self.owner), &[counter])
                .unwrap();
            tx
        }

        fn spawn_value_tx(&self, value: Vec<u8>) -> ClientTransaction {
            self.signed_tx(vec![Instruction::new(
                self.policy_instance,
                InstructionBody::Spawn(Spawn {
                    contract_kind: "value".to_string(),
                    args: Arguments::new(vec![Argument::new("value", value)]),
                }),
            )])
        }
    }

    #[test]
    fn spawn_executes_and_bumps_the_counter() {
        let mut harness = harness();
        let tx = harness.spawn_value_tx(vec![5, 6, 7, 8]);
        let derived = tx.instructions[0].derive_id("");

        let (changes, staged) = harness
            .executor
            .process_one_tx(&harness.state.staging(), &tx)
            .unwrap();

        // One data change plus one counter change.
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].instance_id, derived);
        assert_eq!(changes[0].version, StateVersion::init());
        assert_eq!(staged.get_values(&derived).unwrap().value, vec![5, 6, 7, 8]);
        assert_eq!(
            counter_of(&staged, &Identity::ed25519(&harness.owner.public())).unwrap(),
            1
        );

        // Apply and replay: the same signed transaction must now fail its counter check.
        harness.state.store_all(&changes, BlockIndex::new(1)).unwrap();
        let replay = harness
            .executor
            .process_one_tx(&harness.state.staging(), &tx);
        assert!(matches!(replay, Err(ExecError::Counter(_))));
    }

    #[test]
    fn versions_count_up_without_gaps() {
        let mut harness = harness();
        let spawn_tx = harness.spawn_value_tx(vec![1]);
        let instance = spawn_tx.instructions[0].derive_id("");
        let (changes, _) = harness
            .executor
            .process_one_tx(&harness.state.staging(), &spawn_tx)
            .unwrap();
        harness.state.store_all(&changes, BlockIndex::new(1)).unwrap();

        for round in 1u64..=3 {
            let update_tx = harness.signed_tx(vec![Instruction::new(
                instance,
                InstructionBody::Invoke(Invoke {
                    contract_kind: "value".to_string(),
                    command: "update".to_string(),
                    args: Arguments::new(vec![Argument::new("value", vec![round as u8])]),
                }),
            )]);
            let (changes, _) = harness
                .executor
                .process_one_tx(&harness.state.staging(), &update_tx)
                .unwrap();
            assert_eq!(changes[0].version, StateVersion::new(round));
            harness
                .state
                .store_all(&changes, BlockIndex::new(round + 1))
                .unwrap();
        }
    }

    #[test]
    fn delete_then_update_is_rejected() {
        let mut harness = harness();
        let spawn_tx = harness.spawn_value_tx(vec![1]);
        let instance = spawn_tx.instructions[0].derive_id("");
        let (changes, _) = harness
            .executor
            .process_one_tx(&harness.state.staging(), &spawn_tx)
            .unwrap();
        harness.state.store_all(&changes, BlockIndex::new(1)).unwrap();

        let delete_tx = harness.signed_tx(vec![Instruction::new(
            instance,
            InstructionBody::Delete(Delete {
                contract_kind: "value".to_string(),
            }),
        )]);
        let (changes, _) = harness
            .executor
            .process_one_tx(&harness.state.staging(), &delete_tx)
            .unwrap();
        harness.state.store_all(&changes, BlockIndex::new(2)).unwrap();

        let update_tx = harness.signed_tx(vec![Instruction::new(
            instance,
            InstructionBody::Invoke(Invoke {
                contract_kind: "value".to_string(),
                command: "update".to_string(),
                args: Arguments::new(vec![Argument::new("value", vec![9])]),
            }),
        )]);
        let result = harness
            .executor
            .process_one_tx(&harness.state.staging(), &update_tx);
        assert!(result.is_err());
    }

    #[test]
    fn guards_fire_before_any_side_effect() {
        struct BadContract;
        impl Contract for BadContract {
            fn verify_instruction(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
                _batch_hash: &CryptoHash,
            ) -> Result<(), ExecError> {
                Ok(())
            }
            fn spawn(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
            ) -> Result<Vec<StateChange>, ExecError> {
                // An update of an instance that does not exist.
                Ok(vec![StateChange::new(
                    StateAction::Update,
                    InstanceId::new([77u8; 32]),
                    "value",
                    vec![1],
                    PolicyId::new([0u8; 32]),
                )])
            }
        }

        let harness = harness_with(|registry| {
            registry
                .register("bad", Arc::new(|_| Ok(Box::new(BadContract) as Box<dyn Contract>)))
                .unwrap();
        });

        let tx = harness.signed_tx(vec![Instruction::new(
            harness.policy_instance,
            InstructionBody::Spawn(Spawn {
                contract_kind: "bad".to_string(),
                args: Arguments::default(),
            }),
        )]);
        let before = harness.state.root_hash();
        let result = harness
            .executor
            .process_one_tx(&harness.state.staging(), &tx);
        assert!(matches!(result, Err(ExecError::Rejected { .. })));
        assert_eq!(harness.state.root_hash(), before);
    }

    #[test]
    fn contract_panic_becomes_a_rejection() {
        struct PanickingContract;
        impl Contract for PanickingContract {
            fn verify_instruction(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
                _batch_hash: &CryptoHash,
            ) -> Result<(), ExecError> {
                Ok(())
            }
            fn spawn(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
            ) -> Result<Vec<StateChange>, ExecError> {
                panic!("misbehaving contract")
            }
        }

        let harness = harness_with(|registry| {
            registry
                .register(
                    "bad",
                    Arc::new(|_| Ok(Box::new(PanickingContract) as Box<dyn Contract>)),
                )
                .unwrap();
        });
        let tx = harness.signed_tx(vec![Instruction::new(
            harness.policy_instance,
            InstructionBody::Spawn(Spawn {
                contract_kind: "bad".to_string(),
                args: Arguments::default(),
            }),
        )]);
        let result = harness
            .executor
            .process_one_tx(&harness.state.staging(), &tx);
        assert!(matches!(result, Err(ExecError::Fault { .. })));
    }

    #[test]
    fn synthetic_instructions_expand_depth_first() {
        struct SplicerContract;
        impl Contract for SplicerContract {
            fn verify_instruction(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
                _batch_hash: &CryptoHash,
            ) -> Result<(), ExecError> {
                Ok(())
            }
            fn spawn(
                &self,
                _state: &dyn ReadOnlyState,
                instruction: &Instruction,
            ) -> Result<Vec<StateChange>, ExecError> {
                // Emit a marker, then a synthetic instruction that emits its own marker.
                let follow_up = Instruction::new(
                    instruction.derive_id("follow-up"),
                    InstructionBody::Spawn(Spawn {
                        contract_kind: "marker".to_string(),
                        args: Arguments::default(),
                    }),
                );
                Ok(vec![
                    StateChange::new(
                        StateAction::Create,
                        instruction.derive_id("own"),
                        "marker",
                        vec![1],
                        PolicyId::new([0u8; 32]),
                    ),
                    StateChange::synthetic_instruction(
                        borsh::BorshSerialize::try_to_vec(&follow_up).unwrap(),
                    ),
                ])
            }
        }

        struct MarkerContract;
        impl Contract for MarkerContract {
            fn verify_instruction(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
                _batch_hash: &CryptoHash,
            ) -> Result<(), ExecError> {
                Ok(())
            }
            fn spawn(
                &self,
                _state: &dyn ReadOnlyState,
                instruction: &Instruction,
            ) -> Result<Vec<StateChange>, ExecError> {
                Ok(vec![StateChange::new(
                    StateAction::Create,
                    instruction.instance_id,
                    "marker",
                    vec![2],
                    PolicyId::new([0u8; 32]),
                )])
            }
        }

        let harness = harness_with(|registry| {
            registry
                .register(
                    "splicer",
                    Arc::new(|_| Ok(Box::new(SplicerContract) as Box<dyn Contract>)),
                )
                .unwrap();
            registry
                .register(
                    "marker",
                    Arc::new(|_| Ok(Box::new(MarkerContract) as Box<dyn Contract>)),
                )
                .unwrap();
        });

        let tx = harness.signed_tx(vec![Instruction::new(
            harness.policy_instance,
            InstructionBody::Spawn(Spawn {
                contract_kind: "splicer".to_string(),
                args: Arguments::default(),
            }),
        )]);
        let spawner = &tx.instructions[0];
        let (changes, staged) = harness
            .executor
            .process_one_tx(&harness.state.staging(), &tx)
            .unwrap();

        // The spliced instruction's effect landed, and it ran after the splicer's own change.
        let own = spawner.derive_id("own");
        let follow_up = spawner.derive_id("follow-up");
        assert!(staged.get_raw(&follow_up).unwrap().is_some());
        let own_pos = changes.iter().position(|c| c.instance_id == own).unwrap();
        let follow_pos = changes
            .iter()
            .position(|c| c.instance_id == follow_up)
            .unwrap();
        assert!(own_pos < follow_pos);
    }

    #[test]
    fn identical_batches_are_served_from_the_cache() {
        static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);

        struct CountingContract;
        impl Contract for CountingContract {
            fn verify_instruction(
                &self,
                _state: &dyn ReadOnlyState,
                _instruction: &Instruction,
                _batch_hash: &CryptoHash,
            ) -> Result<(), ExecError> {
                Ok(())
            }
            fn spawn(
                &self,
                _state: &dyn ReadOnlyState,
                instruction: &Instruction,
            ) -> Result<Vec<StateChange>, ExecError> {
                Ok(vec![StateChange::new(
                    StateAction::Create,
                    instruction.derive_id(""),
                    "counting",
                    vec![1],
                    PolicyId::new([0u8; 32]),
                )])
            }
        }

        let harness = harness_with(|registry| {
            registry
                .register(
                    "counting",
                    Arc::new(|_| {
                        CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
                        Ok(Box::new(CountingContract) as Box<dyn Contract>)
                    }),
                )
                .unwrap();
        });

        let tx = harness.signed_tx(vec![Instruction::new(
            harness.policy_instance,
            InstructionBody::Spawn(Spawn {
                contract_kind: "counting".to_string(),
                args: Arguments::default(),
            }),
        )]);
        let batch = TxResults::pending(vec![tx]);

        CONSTRUCTIONS.store(0, Ordering::SeqCst);
        let planned = harness.executor.create_state_changes(
            &harness.state.staging(),
            harness.ledger_id,
            batch,
            None,
            u64::MAX,
        );
        assert!(planned.tx_results.0[0].accepted);

        // Re-run with the accepted flags the first run produced, as happens when the planned
        // block comes back for verification.
        let verified = harness.executor.create_state_changes(
            &harness.state.staging(),
            harness.ledger_id,
            planned.tx_results.clone(),
            None,
            u64::MAX,
        );
        // The contract ran during the first call only; the second was a pure cache hit.
        assert_eq!(CONSTRUCTIONS.load(Ordering::SeqCst), 1);
        assert_eq!(verified.root, planned.root);
    }

    #[test]
    fn identical_batches_yield_identical_roots() {
        let harness = harness();
        let tx = harness.spawn_value_tx(vec![1, 2, 3]);
        let batch = TxResults::pending(vec![tx]);

        // Two independent executors (separate caches) against identical snapshots.
        let other = Executor::new(harness.executor.registry());
        let a = harness.executor.create_state_changes(
            &harness.state.staging(),
            harness.ledger_id,
            batch.clone(),
            None,
            u64::MAX,
        );
        let b = other.create_state_changes(
            &harness.state.staging(),
            harness.ledger_id,
            batch,
            None,
            u64::MAX,
        );
        assert_eq!(a.root, b.root);
        assert_eq!(a.tx_results, b.tx_results);
        assert_eq!(a.state_changes, b.state_changes);
    }

    #[test]
    fn planning_stops_at_the_block_size() {
        let harness = harness();
        let tx_a = harness.spawn_value_tx(vec![1]);
        // The second transaction needs the counter after the first.
        let mut tx_b = ClientTransaction::new(vec![Instruction::new(
            harness.policy_instance,
            InstructionBody::Spawn(Spawn {
                contract_kind: "value".to_string(),
                args: Arguments::new(vec![Argument::new("value", vec![2])]),
            }),
        )]);
        tx_b.fill_signers_and_sign(std::slice::from_ref(&harness.owner), &[1])
            .unwrap();

        let size_a = tx_a.size();
        let batch = TxResults::pending(vec![tx_a, tx_b]);
        let result = harness.executor.create_state_changes(
            &harness.state.staging(),
            harness.ledger_id,
            batch,
            Some(Duration::from_secs(5)),
            size_a + 1,
        );
        // Only the first transaction fits.
        assert_eq!(result.tx_results.len(), 1);
        assert!(result.tx_results.0[0].accepted);
    }
}
