/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable contract logic and the registry that dispatches to it.
//!
//! A contract kind is a name bound to a constructor that rebuilds contract values from their
//! stored bytes. The [`ContractRegistry`] is mutable during process initialization and freezes
//! the first time it is cloned for a ledger; from then on registration is rejected, so every
//! ledger of a node dispatches against the same immutable table.

pub mod config;

pub mod policy;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use crate::state::counters::{verify_signer_counters, CounterError};
use crate::state::{ReadOnlyState, StateError};
use crate::types::basic::CryptoHash;
use crate::types::state_change::StateChange;
use crate::types::transaction::Instruction;

/// Reason an instruction was rejected or a contract failed.
#[derive(Debug)]
pub enum ExecError {
    /// The contract does not implement the requested operation.
    NotImplemented { what: &'static str },
    /// No constructor is registered for the contract kind.
    UnknownContract { kind: String },
    /// Authorization failed: the policy has no matching rule or no verified signer satisfies it.
    Unauthorized { reason: String },
    /// The replay guard rejected the instruction's counters.
    Counter(CounterError),
    /// The state store failed.
    State(StateError),
    /// An argument or stored value failed to decode.
    Malformed { what: String },
    /// The contract panicked; converted to an error at the dispatch boundary.
    Fault { reason: String },
    /// A contract-level business error.
    Rejected { reason: String },
}

impl Display for ExecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::NotImplemented { what } => {
                write!(f, "this contract does not implement {}", what)
            }
            ExecError::UnknownContract { kind } => write!(f, "unknown contract kind \"{}\"", kind),
            ExecError::Unauthorized { reason } => write!(f, "unauthorized: {}", reason),
            ExecError::Counter(err) => write!(f, "counter check failed: {}", err),
            ExecError::State(err) => write!(f, "state failure: {}", err),
            ExecError::Malformed { what } => write!(f, "malformed {}", what),
            ExecError::Fault { reason } => write!(f, "contract fault: {}", reason),
            ExecError::Rejected { reason } => write!(f, "{}", reason),
        }
    }
}

impl From<StateError> for ExecError {
    fn from(err: StateError) -> Self {
        ExecError::State(err)
    }
}

impl From<CounterError> for ExecError {
    fn from(err: CounterError) -> Self {
        ExecError::Counter(err)
    }
}

/// The interface a contract kind implements to be callable from transactions.
///
/// A value of the implementing type is reconstructed from the addressed instance's stored bytes
/// for every instruction, dispatched once, and dropped. All methods receive the state as it is
/// *before* the instruction; the state changes they return are applied by the execution engine.
pub trait Contract {
    /// Authorization and replay checking. The default delegates to
    /// [`authorize_instruction`]; contracts with bootstrap special cases (the config contract)
    /// override this.
    fn verify_instruction(
        &self,
        state: &dyn ReadOnlyState,
        instruction: &Instruction,
        batch_hash: &CryptoHash,
    ) -> Result<(), ExecError> {
        authorize_instruction(state, instruction, batch_hash)
    }

    /// Create new instances.
    fn spawn(
        &self,
        _state: &dyn ReadOnlyState,
        _instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        Err(ExecError::NotImplemented { what: "spawn" })
    }

    /// Modify existing instances.
    fn invoke(
        &self,
        _state: &dyn ReadOnlyState,
        _instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        Err(ExecError::NotImplemented { what: "invoke" })
    }

    /// Remove the addressed instance.
    fn delete(
        &self,
        _state: &dyn ReadOnlyState,
        _instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        Err(ExecError::NotImplemented { what: "delete" })
    }

    /// Optional capability: receive a handle to the registry before dispatch. Contracts that
    /// recursively dispatch to other contract kinds (generic spawn routing) implement this; the
    /// default ignores the registry.
    fn set_registry(&mut self, _registry: ContractRegistry) {}
}

/// The default authorization path: counters, then the owning policy's rule for the
/// instruction's action, satisfied by the identities whose signature over `batch_hash`
/// verifies.
pub fn authorize_instruction(
    state: &dyn ReadOnlyState,
    instruction: &Instruction,
    batch_hash: &CryptoHash,
) -> Result<(), ExecError> {
    if instruction.signer_identities.len() != instruction.signatures.len() {
        return Err(ExecError::Unauthorized {
            reason: "number of identities does not match number of signatures".to_string(),
        });
    }
    if instruction.signatures.is_empty() {
        return Err(ExecError::Unauthorized {
            reason: "no signatures".to_string(),
        });
    }

    verify_signer_counters(
        state,
        &instruction.signer_counters,
        &instruction.signer_identities,
    )?;

    let chain_config = config::load_config(state)?;
    let policy = policy::policy_of_instance(
        state,
        &instruction.instance_id,
        &chain_config.policy_contract_kinds,
    )?;

    let verified = instruction.verified_identity_strings(batch_hash);
    policy.evaluate(&instruction.action(), &verified)
}

/// Constructor that rebuilds a contract value from an instance's stored bytes. For spawns of
/// not-yet-existing instances the input is empty.
pub type ContractConstructor =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn Contract>, ExecError> + Send + Sync>;

struct RegistryInner {
    constructors: HashMap<String, ContractConstructor>,
    locked: bool,
}

/// Reason a registration was rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    Locked,
    AlreadyRegistered { kind: String },
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Locked => write!(f, "contract registry is locked"),
            RegistryError::AlreadyRegistered { kind } => {
                write!(f, "contract kind \"{}\" already registered", kind)
            }
        }
    }
}

/// A name → constructor table for contract kinds.
///
/// Cloning the handle (`Clone`) shares the same table; [`clone_for_ledger`]
/// (Self::clone_for_ledger) freezes the table and yields an independent frozen copy for a
/// fresh ledger instance.
#[derive(Clone)]
pub struct ContractRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractRegistry {
    /// Create an empty, unlocked registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                constructors: HashMap::new(),
                locked: false,
            })),
        }
    }

    /// Create a registry pre-populated with the bootstrap contracts (`config` and `policy`).
    pub fn with_builtin_contracts() -> Self {
        let registry = Self::new();
        registry
            .register(config::CONFIG_CONTRACT_KIND, Arc::new(config::construct))
            .expect("fresh registry accepts the config contract");
        registry
            .register(policy::POLICY_CONTRACT_KIND, Arc::new(policy::construct))
            .expect("fresh registry accepts the policy contract");
        registry
    }

    /// Bind `kind` to `constructor`. Fails once the registry is locked or if the kind is
    /// already bound.
    pub fn register(
        &self,
        kind: &str,
        constructor: ContractConstructor,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locked {
            return Err(RegistryError::Locked);
        }
        if inner.constructors.contains_key(kind) {
            return Err(RegistryError::AlreadyRegistered {
                kind: kind.to_string(),
            });
        }
        inner.constructors.insert(kind.to_string(), constructor);
        Ok(())
    }

    /// Look up the constructor bound to `kind`.
    pub fn search(&self, kind: &str) -> Option<ContractConstructor> {
        self.inner.lock().unwrap().constructors.get(kind).cloned()
    }

    /// Freeze this registry and return an independent, equally frozen copy for a fresh ledger
    /// instance.
    pub fn clone_for_ledger(&self) -> ContractRegistry {
        let mut inner = self.inner.lock().unwrap();
        inner.locked = true;
        ContractRegistry {
            inner: Arc::new(Mutex::new(RegistryInner {
                constructors: inner.constructors.clone(),
                locked: true,
            })),
        }
    }

    /// Whether registration is still possible.
    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().locked
    }
}
