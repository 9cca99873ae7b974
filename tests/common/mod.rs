/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Shared test fixtures: a channel-based mock [`Network`], an in-memory [`ChainStore`] that
//! plays the role of the consensus collaborator (verifying proposals with every live node,
//! appending blocks, signing forward links, and distributing the result), a tiny `value`
//! contract, and a multi-node harness built from them.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use byzledger::chain::{ChainStore, ChainStoreError};
use byzledger::contracts::policy::{genesis_policy, Policy};
use byzledger::contracts::{Contract, ContractRegistry, ExecError};
use byzledger::networking::{Message, Network};
use byzledger::service::messages::{CreateGenesisBlockRequest, GetProofRequest};
use byzledger::service::{Service, ServiceConfiguration};
use byzledger::state::ReadOnlyState;
use byzledger::types::basic::{BlockIndex, CryptoHash, InstanceId, LedgerId, PolicyId, SignatureSet};
use byzledger::types::block::{ChainBlock, ForwardLink};
use byzledger::types::crypto_primitives::Keypair;
use byzledger::types::identity::Identity;
use byzledger::types::roster::Roster;
use byzledger::types::state_change::{StateAction, StateChange};
use byzledger::types::transaction::{
    Argument, Arguments, ClientTransaction, Instruction, InstructionBody, Invoke, Spawn,
};
use byzledger::types::crypto_primitives::VerifyingKey;
use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;

static LOGGER: Once = Once::new();

pub fn setup_logger(level: LevelFilter) {
    LOGGER.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!("[{}] {}", record.level(), message))
            })
            .level(level)
            .chain(std::io::stdout())
            .apply()
            .expect("logger applies once");
    });
}

/* ↓↓↓ Mock network ↓↓↓ */

type Inbox = (VerifyingKey, Message);

/// A network stub delivering messages through in-process channels.
#[derive(Clone)]
pub struct NetworkStub {
    me: VerifyingKey,
    inboxes: Arc<Mutex<HashMap<[u8; 32], Sender<Inbox>>>>,
    inbox: Arc<Mutex<Receiver<Inbox>>>,
}

impl Network for NetworkStub {
    fn init_roster(&mut self, _roster: Roster) {}

    fn update_roster(&mut self, _roster: Roster) {}

    fn send(&mut self, peer: VerifyingKey, message: Message) {
        if let Some(sender) = self.inboxes.lock().unwrap().get(&peer.to_bytes()) {
            let _ = sender.send((self.me, message));
        }
    }

    fn broadcast(&mut self, message: Message) {
        for sender in self.inboxes.lock().unwrap().values() {
            let _ = sender.send((self.me, message.clone()));
        }
    }

    fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
        self.inbox.lock().unwrap().try_recv().ok()
    }
}

/// Create one connected [`NetworkStub`] per key. Broadcasts reach every peer, the sender
/// included.
pub fn mock_network(keys: &[VerifyingKey]) -> Vec<NetworkStub> {
    let mut inboxes = HashMap::new();
    let mut receivers = VecDeque::new();
    for key in keys {
        let (sender, receiver) = mpsc::channel();
        inboxes.insert(key.to_bytes(), sender);
        receivers.push_back(receiver);
    }
    let inboxes = Arc::new(Mutex::new(inboxes));
    keys.iter()
        .map(|key| NetworkStub {
            me: *key,
            inboxes: Arc::clone(&inboxes),
            inbox: Arc::new(Mutex::new(receivers.pop_front().unwrap())),
        })
        .collect()
}

/* ↓↓↓ In-memory chain store ↓↓↓ */

pub type TestService = Service<TestChain, NetworkStub>;

struct NodeSlot {
    service: Arc<TestService>,
    alive: bool,
}

struct ChainInner {
    blocks: HashMap<CryptoHash, ChainBlock>,
    ledgers: HashMap<LedgerId, Vec<CryptoHash>>,
}

/// An in-memory stand-in for the block-ledger collaborator.
///
/// `store_block` collects the committee's verdicts through each live node's
/// `verify_proposal`, appends the block once a quorum accepts, signs the skip-list forward
/// links with the committee keypairs (the test world holds them all), and distributes the
/// block to every live node's `deliver_block`.
#[derive(Clone)]
pub struct TestChain {
    inner: Arc<Mutex<ChainInner>>,
    nodes: Arc<Mutex<Vec<NodeSlot>>>,
    keypairs: Arc<Vec<Keypair>>,
}

impl TestChain {
    pub fn new(keypairs: Vec<Keypair>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChainInner {
                blocks: HashMap::new(),
                ledgers: HashMap::new(),
            })),
            nodes: Arc::new(Mutex::new(Vec::new())),
            keypairs: Arc::new(keypairs),
        }
    }

    pub fn register(&self, service: Arc<TestService>) {
        self.nodes.lock().unwrap().push(NodeSlot {
            service,
            alive: true,
        });
    }

    /// Simulate a node crash: the node no longer verifies or receives blocks.
    pub fn crash(&self, key: &VerifyingKey) {
        for slot in self.nodes.lock().unwrap().iter_mut() {
            if slot.service.public_key() == *key {
                slot.alive = false;
            }
        }
    }

    pub fn block_count(&self, ledger_id: &LedgerId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .ledgers
            .get(ledger_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn sign_link(&self, source_roster: &Roster, link: &mut ForwardLink) {
        let message = link.message_bytes();
        let mut signatures = SignatureSet::new(source_roster.len());
        for keypair in self.keypairs.iter() {
            if let Some(pos) = source_roster.position(&keypair.public()) {
                signatures.set(pos, Some(keypair.sign(&message)));
            }
        }
        link.signatures = signatures;
    }
}

impl ChainStore for TestChain {
    fn get_block(&self, id: &CryptoHash) -> Option<ChainBlock> {
        self.inner.lock().unwrap().blocks.get(id).cloned()
    }

    fn get_latest(&self, ledger_id: &LedgerId) -> Option<ChainBlock> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.ledgers.get(ledger_id)?.last()?;
        inner.blocks.get(hash).cloned()
    }

    fn store_block(
        &self,
        ledger_id: &LedgerId,
        block: ChainBlock,
    ) -> Result<ChainBlock, ChainStoreError> {
        // Validate the index against the current chain without holding the lock during
        // verification: verifying nodes read the chain themselves.
        {
            let inner = self.inner.lock().unwrap();
            let height = inner.ledgers.get(ledger_id).map(Vec::len).unwrap_or(0);
            if block.index.int() != height as u64 {
                return Err(ChainStoreError::Refused {
                    reason: format!(
                        "block index {} does not extend a chain of height {}",
                        block.index, height
                    ),
                });
            }
        }

        let nodes = self.nodes.lock().unwrap();
        let mut accepts = 0;
        for slot in nodes.iter() {
            if !slot.alive {
                continue;
            }
            match slot.service.verify_proposal(ledger_id, &block) {
                Ok(()) => accepts += 1,
                Err(reason) => log::warn!("a node refused the proposal: {}", reason),
            }
        }
        if accepts < block.roster.quorum() {
            return Err(ChainStoreError::Refused {
                reason: format!(
                    "only {} of {} members accepted",
                    accepts,
                    block.roster.len()
                ),
            });
        }

        let stored = {
            let mut inner = self.inner.lock().unwrap();
            let new_hash = block.hash();
            let hashes = inner.ledgers.entry(*ledger_id).or_default().clone();
            let new_index = hashes.len();

            // Skip-list forward links: every block a power-of-two behind the new one links to
            // it, signed by the committee that was current at the source.
            for (source_index, source_hash) in hashes.iter().enumerate() {
                let gap = new_index - source_index;
                if gap & (gap - 1) != 0 {
                    continue;
                }
                let source_roster = inner.blocks[source_hash].roster.clone();
                let mut link = ForwardLink {
                    from: *source_hash,
                    to: new_hash,
                    new_roster: if source_roster == block.roster {
                        None
                    } else {
                        Some(block.roster.clone())
                    },
                    signatures: SignatureSet::empty(),
                };
                self.sign_link(&source_roster, &mut link);
                inner
                    .blocks
                    .get_mut(source_hash)
                    .unwrap()
                    .forward_links
                    .push(link);
            }

            inner.ledgers.get_mut(ledger_id).unwrap().push(new_hash);
            inner.blocks.insert(new_hash, block.clone());
            block
        };

        for slot in nodes.iter() {
            if !slot.alive {
                continue;
            }
            if let Err(err) = slot.service.deliver_block(ledger_id, &stored) {
                log::error!("a node failed to apply the stored block: {}", err);
            }
        }
        Ok(stored)
    }

    fn get_update_chain(&self, ledger_id: &LedgerId, from: BlockIndex) -> Vec<ChainBlock> {
        let inner = self.inner.lock().unwrap();
        let Some(hashes) = inner.ledgers.get(ledger_id) else {
            return Vec::new();
        };
        hashes
            .iter()
            .skip(from.int() as usize)
            .filter_map(|hash| inner.blocks.get(hash).cloned())
            .collect()
    }
}

/* ↓↓↓ The `value` test contract ↓↓↓ */

/// A contract kind storing one opaque byte value per instance.
pub struct ValueContract;

impl Contract for ValueContract {
    fn spawn(
        &self,
        state: &dyn ReadOnlyState,
        instruction: &Instruction,
    ) -> Result<Vec<StateChange>, ExecError> {
        let args = match &instruction.body {
            InstructionBody::Spawn(spawn) => &spawn.args,
            _ => unreachable!("spawn dispatch carries a spawn body"),
        };
        let value = args.search("value").unwrap_or_default().to_vec();
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
            _ => unreachable!("invoke dispatch carries an invoke body"),
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

pub fn test_registry() -> ContractRegistry {
    let registry = ContractRegistry::with_builtin_contracts();
    registry
        .register("value", Arc::new(|_| Ok(Box::new(ValueContract) as Box<dyn Contract>)))
        .expect("fresh registry accepts the value contract");
    registry
}

/* ↓↓↓ Multi-node harness ↓↓↓ */

pub struct TestNet {
    pub chain: TestChain,
    pub services: Vec<Arc<TestService>>,
    pub node_keys: Vec<VerifyingKey>,
    pub client: Keypair,
    policy_base: PolicyId,
}

impl TestNet {
    /// Start `n` connected nodes sharing one chain store.
    pub fn start(n: usize, rotation_window: u32) -> TestNet {
        let mut csprg = OsRng {};
        let signing_keys: Vec<SigningKey> =
            (0..n).map(|_| SigningKey::generate(&mut csprg)).collect();
        let keypairs: Vec<Keypair> = signing_keys
            .iter()
            .map(|key| Keypair::new(key.clone()))
            .collect();
        let node_keys: Vec<VerifyingKey> =
            keypairs.iter().map(|keypair| keypair.public()).collect();

        let networks = mock_network(&node_keys);
        let chain = TestChain::new(keypairs);
        let registry = test_registry();

        let services: Vec<Arc<TestService>> = signing_keys
            .into_iter()
            .zip(networks)
            .map(|(key, network)| {
                let configuration = ServiceConfiguration::builder()
                    .me(key)
                    .rotation_window(rotation_window)
                    .log_events(true)
                    .build();
                Arc::new(Service::start(
                    configuration,
                    &registry,
                    chain.clone(),
                    network,
                ))
            })
            .collect();
        for service in &services {
            chain.register(Arc::clone(service));
        }

        TestNet {
            chain,
            services,
            node_keys,
            client: Keypair::new(SigningKey::generate(&mut csprg)),
            policy_base: PolicyId::new([99u8; 32]),
        }
    }

    /// The identity the test client signs with.
    pub fn client_identity(&self) -> Identity {
        Identity::ed25519(&self.client.public())
    }

    /// The instance id of the genesis policy.
    pub fn policy_instance(&self) -> InstanceId {
        self.policy_base.instance_id()
    }

    /// The genesis policy: the client administrates and may drive the `value` contract; the
    /// committee may invoke view-changes.
    pub fn build_genesis_policy(&self) -> Policy {
        let client = self.client_identity();
        let roster_identities: Vec<Identity> =
            self.node_keys.iter().map(Identity::ed25519).collect();
        let mut policy = genesis_policy(self.policy_base, &client, &roster_identities);
        for action in ["spawn:value", "invoke:value.update", "delete:value"] {
            policy.update_rule(action, vec![client.to_string()]);
        }
        policy
    }

    /// Create a ledger over all nodes and return its id.
    pub fn genesis(&self, block_interval: Duration, max_block_size: u64) -> LedgerId {
        let genesis = self.services[0]
            .create_genesis_block(CreateGenesisBlockRequest {
                roster: Roster::new(self.node_keys.clone()),
                genesis_policy: self.build_genesis_policy(),
                block_interval,
                max_block_size,
            })
            .expect("genesis creation succeeds");
        LedgerId::new(genesis.hash())
    }

    /// A client transaction spawning a `value` instance, signed with `counter` (the client's
    /// stored counter).
    pub fn spawn_value_tx(&self, value: Vec<u8>, counter: u64) -> ClientTransaction {
        let mut tx = ClientTransaction::new(vec![Instruction::new(
            self.policy_instance(),
            InstructionBody::Spawn(Spawn {
                contract_kind: "value".to_string(),
                args: Arguments::new(vec![Argument::new("value", value)]),
            }),
        )]);
        tx.fill_signers_and_sign(std::slice::from_ref(&self.client), &[counter])
            .expect("signing succeeds");
        tx
    }

    /// A client transaction updating a `value` instance.
    pub fn update_value_tx(
        &self,
        instance: InstanceId,
        value: Vec<u8>,
        counter: u64,
    ) -> ClientTransaction {
        let mut tx = ClientTransaction::new(vec![Instruction::new(
            instance,
            InstructionBody::Invoke(Invoke {
                contract_kind: "value".to_string(),
                command: "update".to_string(),
                args: Arguments::new(vec![Argument::new("value", value)]),
            }),
        )]);
        tx.fill_signers_and_sign(std::slice::from_ref(&self.client), &[counter])
            .expect("signing succeeds");
        tx
    }

    /// Stop every node.
    pub fn shutdown(&self) {
        for service in &self.services {
            service.stop();
        }
    }
}

/// Poll `service` until a proof verified against `ledger_id` shows `key` holding `expected`.
///
/// Block distribution is synchronous in the test chain but runs node by node, so a node other
/// than the submitting one may be a moment behind when a test queries it.
pub fn await_proven_value(
    service: &TestService,
    ledger_id: &LedgerId,
    key: &InstanceId,
    expected: &[u8],
) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(response) = service.get_proof(GetProofRequest {
            ledger_id: *ledger_id,
            key: *key,
            must_contain_block: None,
        }) {
            let proof = response.proof;
            if proof.verify(ledger_id).is_ok() {
                if let Ok(Some(values)) = proof.get_values(key) {
                    if values.value == expected {
                        return;
                    }
                }
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "key {} never proved the expected value",
            key
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}
