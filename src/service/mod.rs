/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-node ledger service.
//!
//! A [`Service`] owns the durable state stores, buffers, timers, and background threads of
//! every ledger the node participates in, keyed per ledger behind per-resource locks; no
//! single lock serializes unrelated ledgers. It exposes the client-facing RPC surface
//! (genesis creation, transaction submission, proofs, counters, paged state download), the
//! committee-internal handlers (collect-tx serving, view-change messages), and the two
//! callbacks the block-ledger collaborator drives: [`verify_proposal`](Service::verify_proposal)
//! before a block is accepted and [`block_applied`](Service::block_applied) after it is
//! durably appended.
//!
//! ## Roles
//!
//! Whether this node leads a ledger follows from the roster stored in the ledger's own
//! configuration: after every applied block the service compares the leader against its own
//! key and either runs the [transaction pipeline](crate::pipeline) (leader) or a
//! [heartbeat monitor](crate::heartbeat) plus [view-change controller](crate::viewchange)
//! (follower).
//!
//! ## Shutdown
//!
//! [`stop`](Service::stop) (also run on drop) closes every loop's stop channel and joins the
//! threads, draining in-flight work, so that an immediate restart is always safe.

pub mod messages;

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};
use rand::RngCore;
use typed_builder::TypedBuilder;

use crate::chain::ChainStore;
use crate::collect::{collect_transactions, CollectTxRequest, CollectTxResponse};
use crate::contracts::config::{self as config_contract, CONFIG_CONTRACT_KIND};
use crate::contracts::policy::POLICY_CONTRACT_KIND;
use crate::contracts::ContractRegistry;
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::events::*;
use crate::execution::Executor;
use crate::heartbeat::HeartbeatMonitor;
use crate::networking::{start_polling, Message, Network, ViewChangeMessage};
use crate::pipeline::buffer::TxBuffer;
use crate::pipeline::{PipelineState, TxPipeline, TxProcessor};
use crate::proof::Proof;
use crate::state::counters::counter_of;
use crate::state::{ReadOnlyState, StateTrie};
use crate::types::basic::{BlockIndex, CryptoHash, InstanceId, LeaderIndex, LedgerId, PolicyId};
use crate::types::block::{BlockHeader, ChainBlock};
use crate::types::config::ChainConfig;
use crate::types::crypto_primitives::{Keypair, SigningKey, VerifyingKey};
use crate::types::state_change::hash_state_changes;
use crate::types::transaction::{
    Argument, Arguments, ClientTransaction, Instruction, InstructionBody, Invoke, Spawn,
    TxResults,
};
use crate::viewchange::controller::Controller;
use crate::viewchange::{InitReq, NewViewReq, View};

use messages::*;

/// Fallback block interval used when a ledger's configuration cannot be read.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// How many transactions one member may contribute per collection round.
const MAX_COLLECTED_TXS: u32 = 100;

/// How many rejection reasons are remembered for reporting to submitting clients.
const MAX_TX_ERRORS: usize = 1000;

/// Stores the user-defined parameters required to start a [`Service`].
///
/// ## Rotation window
///
/// A follower expects a heartbeat from the leader at least once per
/// `rotation_window × block_interval`; silence beyond that window counts as a suspected leader
/// failure. The same product seeds the view-change backoff timer.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ServiceConfiguration]. On the builder call the following
    methods to construct a valid [ServiceConfiguration].

    Required:
    - `.me(...)`

    Optional:
    - `.rotation_window(...)` (default 10)
    - `.log_events(...)` (default false)
"))]
pub struct ServiceConfiguration {
    #[builder(setter(doc = "Set the node's keypair, used to sign committee messages. Required."))]
    pub me: SigningKey,
    #[builder(
        default = 10,
        setter(doc = "Set the leader-rotation window, in block intervals. Optional.")
    )]
    pub rotation_window: u32,
    #[builder(
        default = false,
        setter(doc = "Log events through the `log` crate? Optional.")
    )]
    pub log_events: bool,
}

struct DownloadCursor {
    ledger_id: LedgerId,
    nonce: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    offset: usize,
}

struct NotificationsInner {
    tx_waiters: HashMap<CryptoHash, SyncSender<bool>>,
    block_waiters: HashMap<u64, Sender<LedgerId>>,
    next_waiter_id: u64,
}

/// Wait channels for transaction outcomes and block arrivals, used by the inclusion-wait path
/// of [`Service::add_transaction`].
struct Notifications {
    inner: Mutex<NotificationsInner>,
}

impl Notifications {
    fn new() -> Self {
        Self {
            inner: Mutex::new(NotificationsInner {
                tx_waiters: HashMap::new(),
                block_waiters: HashMap::new(),
                next_waiter_id: 0,
            }),
        }
    }

    fn create_tx_waiter(&self, tx_hash: CryptoHash) -> Receiver<bool> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.inner.lock().unwrap().tx_waiters.insert(tx_hash, sender);
        receiver
    }

    fn remove_tx_waiter(&self, tx_hash: &CryptoHash) {
        self.inner.lock().unwrap().tx_waiters.remove(tx_hash);
    }

    fn notify_tx(&self, tx_hash: &CryptoHash, accepted: bool) {
        if let Some(waiter) = self.inner.lock().unwrap().tx_waiters.get(tx_hash) {
            let _ = waiter.try_send(accepted);
        }
    }

    fn register_for_blocks(&self) -> (u64, Receiver<LedgerId>) {
        let (sender, receiver) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        inner.block_waiters.insert(id, sender);
        (id, receiver)
    }

    fn unregister_for_blocks(&self, id: u64) {
        self.inner.lock().unwrap().block_waiters.remove(&id);
    }

    fn notify_block(&self, ledger_id: LedgerId) {
        for waiter in self.inner.lock().unwrap().block_waiters.values() {
            let _ = waiter.send(ledger_id);
        }
    }
}

struct ServiceInner<C: ChainStore, N: Network> {
    keypair: Keypair,
    rotation_window: u32,
    chain: C,
    network: Mutex<N>,
    executor: Executor,
    states: Mutex<HashMap<LedgerId, Arc<Mutex<StateTrie>>>>,
    ledger_by_policy: Mutex<HashMap<PolicyId, LedgerId>>,
    tx_buffer: TxBuffer,
    tx_errors: Mutex<HashMap<CryptoHash, String>>,
    notifications: Notifications,
    heartbeats: HeartbeatMonitor,
    heartbeat_reports: SyncSender<LedgerId>,
    view_changes: Mutex<HashMap<LedgerId, Controller>>,
    pipelines: Mutex<HashMap<LedgerId, TxPipeline>>,
    collect_responses: Mutex<Receiver<(VerifyingKey, CollectTxResponse)>>,
    download: Mutex<Option<DownloadCursor>>,
    event_publisher: Option<Sender<Event>>,
}

struct BackgroundThreads {
    poller: Option<(JoinHandle<()>, Sender<()>)>,
    message_loop: Option<(JoinHandle<()>, Sender<()>)>,
    failure_monitor: Option<(JoinHandle<()>, Sender<()>)>,
    event_bus: Option<(JoinHandle<()>, Sender<()>)>,
}

/// One node's ledger service.
pub struct Service<C: ChainStore, N: Network> {
    inner: Arc<ServiceInner<C, N>>,
    threads: Mutex<BackgroundThreads>,
}

impl<C: ChainStore, N: Network> Service<C, N> {
    /// Start the service and its background threads: the network poller, the
    /// committee-message loop, the leader-failure monitor, and (when events are consumed) the
    /// event bus.
    ///
    /// `registry` is frozen by this call; contract registration must happen before.
    pub fn start(
        configuration: ServiceConfiguration,
        registry: &ContractRegistry,
        chain: C,
        network: N,
    ) -> Service<C, N> {
        let executor = Executor::new(registry);
        let (poller, poller_shutdown, inbound) = start_polling(network.clone());
        let (heartbeat_reports, heartbeat_report_receiver) = mpsc::sync_channel(1);

        let (event_publisher, event_bus) = if configuration.log_events {
            let mut handlers = EventHandlers::default();
            handlers.add_logging_handlers();
            let (publisher, subscriber) = mpsc::channel();
            let (bus_shutdown, bus_shutdown_receiver) = mpsc::channel();
            let bus = start_event_bus(handlers, subscriber, bus_shutdown_receiver);
            (Some(publisher), Some((bus, bus_shutdown)))
        } else {
            (None, None)
        };

        let inner = Arc::new(ServiceInner {
            keypair: Keypair::new(configuration.me),
            rotation_window: configuration.rotation_window,
            chain,
            network: Mutex::new(network),
            executor,
            states: Mutex::new(HashMap::new()),
            ledger_by_policy: Mutex::new(HashMap::new()),
            tx_buffer: TxBuffer::new(),
            tx_errors: Mutex::new(HashMap::new()),
            notifications: Notifications::new(),
            heartbeats: HeartbeatMonitor::new(),
            heartbeat_reports,
            view_changes: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            collect_responses: Mutex::new(inbound.collect_responses),
            download: Mutex::new(None),
            event_publisher,
        });

        let (message_shutdown, message_shutdown_receiver) = mpsc::channel();
        let message_loop = {
            let inner = Arc::clone(&inner);
            let collect_requests = inbound.collect_requests;
            let view_change = inbound.view_change;
            thread::spawn(move || {
                message_loop(inner, collect_requests, view_change, message_shutdown_receiver)
            })
        };

        let (monitor_shutdown, monitor_shutdown_receiver) = mpsc::channel();
        let failure_monitor = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || {
                failure_monitor(inner, heartbeat_report_receiver, monitor_shutdown_receiver)
            })
        };

        Service {
            inner,
            threads: Mutex::new(BackgroundThreads {
                poller: Some((poller, poller_shutdown)),
                message_loop: Some((message_loop, message_shutdown)),
                failure_monitor: Some((failure_monitor, monitor_shutdown)),
                event_bus,
            }),
        }
    }

    /// The node's public key.
    pub fn public_key(&self) -> VerifyingKey {
        self.inner.keypair.public()
    }

    /// Bootstrap a new ledger: execute the genesis spawn speculatively, store the genesis
    /// block through the chain collaborator, and return it. The durable state is created when
    /// the collaborator feeds the block back through [`block_applied`](Self::block_applied).
    pub fn create_genesis_block(
        &self,
        request: CreateGenesisBlockRequest,
    ) -> Result<ChainBlock, ServiceError> {
        let config = ChainConfig::new(
            request.roster.clone(),
            request.block_interval,
            request.max_block_size,
            vec![POLICY_CONTRACT_KIND.to_string()],
        );
        config
            .sanity_check(None)
            .map_err(|err| ServiceError::InvalidRequest {
                reason: err.to_string(),
            })?;

        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let instruction = Instruction::new(
            InstanceId::zero(),
            InstructionBody::Spawn(Spawn {
                contract_kind: CONFIG_CONTRACT_KIND.to_string(),
                args: Arguments::new(vec![
                    Argument::new("config", config.try_to_vec().unwrap()),
                    Argument::new("policy", request.genesis_policy.to_bytes()),
                    Argument::new("trie_nonce", nonce.to_vec()),
                ]),
            }),
        );
        let transaction = ClientTransaction::new(vec![instruction]);

        let scratch = StateTrie::new(nonce);
        let (state_changes, staged) = self
            .inner
            .executor
            .process_one_tx(&scratch.staging(), &transaction)
            .map_err(|err| ServiceError::InvalidRequest {
                reason: format!("genesis transaction refused: {}", err),
            })?;

        let mut payload = TxResults::pending(vec![transaction]);
        payload.0[0].accepted = true;

        let block = ChainBlock {
            index: BlockIndex::new(0),
            previous: CryptoHash::zero(),
            header: BlockHeader {
                trie_root: staged.root_hash(),
                tx_results_hash: payload.hash(),
                state_changes_hash: hash_state_changes(&state_changes),
                timestamp_ns: timestamp_ns(),
            },
            payload,
            roster: request.roster,
            forward_links: Vec::new(),
        };
        let ledger_id = LedgerId::new(block.hash());
        let stored = self.inner.chain.store_block(&ledger_id, block)?;
        Ok(stored)
    }

    /// Submit a transaction for inclusion.
    ///
    /// With `inclusion_wait == 0` the transaction is buffered and the call returns. With
    /// `inclusion_wait == n > 0` the call blocks until the transaction's outcome is observed
    /// in a block, until `n` blocks pass without it, or until the hard bound of
    /// `2 × n × block_interval` elapses — after which the caller should retry out-of-band
    /// rather than keep blocking.
    pub fn add_transaction(&self, request: AddTxRequest) -> Result<AddTxResponse, ServiceError> {
        if request.transaction.instructions.is_empty() {
            return Err(ServiceError::EmptyTransaction);
        }
        let ledger_id = request.ledger_id;
        if self.inner.chain.get_block(&ledger_id.hash()).is_none() {
            return Err(ServiceError::UnknownLedger { ledger_id });
        }

        let config = self.inner.load_config(&ledger_id)?;
        if !config.roster.contains(&self.inner.keypair.public()) {
            return Err(ServiceError::NotInCommittee);
        }

        let size = request.transaction.size();
        if size > config.max_block_size {
            return Err(ServiceError::TransactionTooLarge {
                size,
                max: config.max_block_size,
            });
        }

        if request.inclusion_wait == 0 {
            self.inner.tx_buffer.add(ledger_id, request.transaction);
            return Ok(AddTxResponse { error: None });
        }

        // The wait channel must exist before the transaction is buffered: otherwise the block
        // could land (and notify nobody) between buffering and waiting.
        let tx_hash = request.transaction.hash();
        let signed_hash = request.transaction.hash_with_signatures();
        let outcome = self.inner.notifications.create_tx_waiter(tx_hash);
        let (blocks_id, blocks) = self.inner.notifications.register_for_blocks();
        self.inner.tx_buffer.add(ledger_id, request.transaction);

        let too_long = config.block_interval() * request.inclusion_wait * 2;
        let deadline = Instant::now() + too_long;
        let mut blocks_left = request.inclusion_wait;

        let result = loop {
            if let Ok(accepted) = outcome.try_recv() {
                if accepted {
                    if let Some(warning) = self.inner.take_tx_error(&signed_hash) {
                        log::warn!("transaction accepted but with errors: {}", warning);
                    }
                    break Ok(AddTxResponse { error: None });
                }
                let reason = self
                    .inner
                    .take_tx_error(&signed_hash)
                    .unwrap_or_else(|| "transaction is in a block but was refused".to_string());
                break Ok(AddTxResponse {
                    error: Some(reason),
                });
            }
            if let Ok(block_ledger) = blocks.try_recv() {
                if block_ledger == ledger_id {
                    blocks_left = blocks_left.saturating_sub(1);
                    if blocks_left == 0 {
                        break Err(ServiceError::InclusionTimeout {
                            waited: too_long - deadline.saturating_duration_since(Instant::now()),
                        });
                    }
                }
            }
            if Instant::now() > deadline {
                break Err(ServiceError::InclusionTimeout { waited: too_long });
            }
            thread::sleep(Duration::from_millis(10));
        };

        self.inner.notifications.remove_tx_waiter(&tx_hash);
        self.inner.notifications.unregister_for_blocks(blocks_id);
        result
    }

    /// Serve a proof of presence or absence for a key.
    pub fn get_proof(&self, request: GetProofRequest) -> Result<GetProofResponse, ServiceError> {
        let state = self.inner.state_of(&request.ledger_id)?;
        let state = state.lock().unwrap();

        if let Some(anchor) = request.must_contain_block {
            let anchor_index = self
                .inner
                .chain
                .get_block(&anchor)
                .map(|block| block.index);
            let behind = match (anchor_index, state.index()) {
                (Some(anchor_index), Some(ours)) => ours < anchor_index,
                (Some(_), None) => true,
                // An anchor we have never heard of is by definition ahead of us.
                (None, _) => true,
            };
            if behind {
                return Err(ServiceError::StaleState {
                    anchor,
                    at_index: state.index(),
                });
            }
        }

        let proof = Proof::new(&*state, &self.inner.chain, &request.ledger_id, &request.key)?;
        Ok(GetProofResponse { proof })
    }

    /// Read the stored replay counters of the given signers.
    pub fn get_signer_counters(
        &self,
        request: GetSignerCountersRequest,
    ) -> Result<GetSignerCountersResponse, ServiceError> {
        let state = self.inner.state_of(&request.ledger_id)?;
        let state = state.lock().unwrap();
        let counters = request
            .identities
            .iter()
            .map(|identity| counter_of(&*state, identity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GetSignerCountersResponse { counters })
    }

    /// Serve a page of the full state for catch-up. Nonce 0 opens a new paged download over a
    /// consistent snapshot, superseding any previous one.
    pub fn download_state(
        &self,
        request: DownloadStateRequest,
    ) -> Result<DownloadStateResponse, ServiceError> {
        if request.page_len == 0 {
            return Err(ServiceError::InvalidRequest {
                reason: "page length must be bigger than 0".to_string(),
            });
        }
        let mut download = self.inner.download.lock().unwrap();

        if request.nonce == 0 {
            let state = self.inner.state_of(&request.ledger_id)?;
            let state = state.lock().unwrap();
            let mut entries = Vec::new();
            state.for_each(&mut |key, value| entries.push((key.to_vec(), value.to_vec())))?;
            let nonce = loop {
                let nonce: u64 = rand::random();
                if nonce != 0 {
                    break nonce;
                }
            };
            *download = Some(DownloadCursor {
                ledger_id: request.ledger_id,
                nonce,
                entries,
                offset: 0,
            });
        }

        let cursor = download
            .as_mut()
            .filter(|cursor| {
                cursor.ledger_id == request.ledger_id
                    && (request.nonce == 0 || cursor.nonce == request.nonce)
            })
            .ok_or(ServiceError::UnknownDownloadCursor {
                nonce: request.nonce,
            })?;

        let end = (cursor.offset + request.page_len).min(cursor.entries.len());
        let page = cursor.entries[cursor.offset..end].to_vec();
        cursor.offset = end;
        Ok(DownloadStateResponse {
            key_values: page,
            nonce: cursor.nonce,
            total: cursor.entries.len(),
        })
    }

    /// The ledger governed by the given genesis policy, if this node serves it.
    pub fn ledger_of_policy(&self, policy_id: &PolicyId) -> Option<LedgerId> {
        self.inner.ledger_by_policy.lock().unwrap().get(policy_id).copied()
    }

    /// Verify a proposed block: re-execute its payload against this node's state and compare
    /// the resulting root, outcomes, and state changes with what the header claims. Called by
    /// the chain collaborator before this node accepts the block; an `Err` means this node
    /// does not vote for it.
    pub fn verify_proposal(
        &self,
        ledger_id: &LedgerId,
        block: &ChainBlock,
    ) -> Result<(), String> {
        let result = self.inner.check_proposal(ledger_id, block);
        if let Err(reason) = &result {
            Event::RejectProposal(RejectProposalEvent {
                timestamp: SystemTime::now(),
                ledger_id: *ledger_id,
                reason: reason.clone(),
            })
            .publish(&self.inner.event_publisher);
        }
        result
    }

    /// Apply a durably appended block: the single writer path of the ledger's state store.
    /// Called by the chain collaborator on every member after a block is stored.
    pub fn block_applied(
        &self,
        ledger_id: &LedgerId,
        block: &ChainBlock,
    ) -> Result<(), ServiceError> {
        self.inner.apply_block(ledger_id, block)
    }

    /// Rebuild a ledger's state from scratch by replaying every block from the genesis. The
    /// recovery path for a state store that diverged or was corrupted on disk.
    pub fn repair_state(&self, ledger_id: &LedgerId) -> Result<(), ServiceError> {
        let genesis =
            self.inner
                .chain
                .get_block(&ledger_id.hash())
                .ok_or(ServiceError::UnknownLedger {
                    ledger_id: *ledger_id,
                })?;
        let nonce = genesis_nonce(&genesis)?;
        let mut fresh = StateTrie::new(nonce);
        for block in self
            .inner
            .chain
            .get_update_chain(ledger_id, BlockIndex::new(0))
        {
            self.inner.execute_and_store(ledger_id, &mut fresh, &block)?;
        }
        log::info!(
            "repaired state of ledger {} up to block {:?}",
            ledger_id,
            fresh.index()
        );
        self.inner
            .states
            .lock()
            .unwrap()
            .insert(*ledger_id, Arc::new(Mutex::new(fresh)));
        Ok(())
    }

    /// Stop every background thread and per-ledger loop, draining in-flight work.
    pub fn stop(&self) {
        // Pipelines and heartbeats first: they feed the loops that are stopped after.
        let pipelines: Vec<TxPipeline> = {
            let mut pipelines = self.inner.pipelines.lock().unwrap();
            pipelines.drain().map(|(_, pipeline)| pipeline).collect()
        };
        for pipeline in pipelines {
            pipeline.shutdown();
        }
        self.inner.heartbeats.stop_all();
        {
            let mut view_changes = self.inner.view_changes.lock().unwrap();
            for (_, controller) in view_changes.drain() {
                controller.stop();
            }
        }

        let mut threads = self.threads.lock().unwrap();
        for slot in [
            &mut threads.message_loop,
            &mut threads.failure_monitor,
            &mut threads.poller,
            &mut threads.event_bus,
        ] {
            if let Some((handle, shutdown)) = slot.take() {
                let _ = shutdown.send(());
                let _ = handle.join();
            }
        }
    }
}

impl<C: ChainStore, N: Network> Drop for Service<C, N> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

/// Read the trie nonce out of a genesis block's spawn instruction.
fn genesis_nonce(genesis: &ChainBlock) -> Result<[u8; 32], ServiceError> {
    let instruction = genesis
        .payload
        .iter()
        .next()
        .and_then(|result| result.transaction.instructions.first())
        .ok_or(ServiceError::Internal {
            reason: "genesis block carries no instructions".to_string(),
        })?;
    let args = match &instruction.body {
        InstructionBody::Spawn(spawn) => &spawn.args,
        _ => {
            return Err(ServiceError::Internal {
                reason: "first genesis instruction is not a spawn".to_string(),
            })
        }
    };
    let nonce_bytes = args.search("trie_nonce").ok_or(ServiceError::Internal {
        reason: "genesis spawn carries no trie nonce".to_string(),
    })?;
    if nonce_bytes.len() != 32 {
        return Err(ServiceError::Internal {
            reason: "genesis trie nonce is not 32 bytes".to_string(),
        });
    }
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(nonce_bytes);
    Ok(nonce)
}

impl<C: ChainStore, N: Network> ServiceInner<C, N> {
    fn network(&self) -> N {
        self.network.lock().unwrap().clone()
    }

    fn state_of(&self, ledger_id: &LedgerId) -> Result<Arc<Mutex<StateTrie>>, ServiceError> {
        self.states
            .lock()
            .unwrap()
            .get(ledger_id)
            .cloned()
            .ok_or(ServiceError::UnknownLedger {
                ledger_id: *ledger_id,
            })
    }

    fn load_config(&self, ledger_id: &LedgerId) -> Result<ChainConfig, ServiceError> {
        let state = self.state_of(ledger_id)?;
        let state = state.lock().unwrap();
        config_contract::load_config(&*state).map_err(|err| ServiceError::Internal {
            reason: format!("reading ledger config: {}", err),
        })
    }

    fn record_tx_errors(&self, rejections: &[(CryptoHash, String)]) {
        if rejections.is_empty() {
            return;
        }
        let mut errors = self.tx_errors.lock().unwrap();
        for (hash, reason) in rejections {
            errors.insert(*hash, reason.clone());
        }
        // Bounded memory: forget arbitrary old entries beyond the cap.
        while errors.len() > MAX_TX_ERRORS {
            let key = *errors.keys().next().unwrap();
            errors.remove(&key);
        }
    }

    fn take_tx_error(&self, signed_hash: &CryptoHash) -> Option<String> {
        self.tx_errors.lock().unwrap().get(signed_hash).cloned()
    }

    /// Re-execute a block's payload and apply the changes to `state`, verifying the header's
    /// claims. Shared by the apply path and the repair path.
    fn execute_and_store(
        &self,
        ledger_id: &LedgerId,
        state: &mut StateTrie,
        block: &ChainBlock,
    ) -> Result<(), ServiceError> {
        let result = self.executor.create_state_changes(
            &state.staging(),
            *ledger_id,
            block.payload.clone(),
            None,
            u64::MAX,
        );
        self.record_tx_errors(&result.rejections);

        if result.tx_results.hash() != block.header.tx_results_hash {
            return Err(ServiceError::Internal {
                reason: format!(
                    "block {} of ledger {}: recomputed outcomes differ from the header",
                    block.index, ledger_id
                ),
            });
        }
        state.verified_store_all(
            &result.state_changes,
            block.index,
            Some(block.header.trie_root),
        )?;
        Ok(())
    }

    fn apply_block(&self, ledger_id: &LedgerId, block: &ChainBlock) -> Result<(), ServiceError> {
        let mut stopped_pipelines = Vec::new();
        let result = self.apply_block_inner(ledger_id, block, &mut stopped_pipelines);
        // Joining a pipeline's threads must happen outside the state lock: the threads
        // themselves take that lock.
        for pipeline in stopped_pipelines {
            pipeline.shutdown();
        }
        result
    }

    fn apply_block_inner(
        &self,
        ledger_id: &LedgerId,
        block: &ChainBlock,
        stopped_pipelines: &mut Vec<TxPipeline>,
    ) -> Result<(), ServiceError> {
        let state_arc = {
            let mut states = self.states.lock().unwrap();
            match states.get(ledger_id) {
                Some(state) => Arc::clone(state),
                None => {
                    let genesis = if block.index == BlockIndex::new(0) {
                        block.clone()
                    } else {
                        self.chain.get_block(&ledger_id.hash()).ok_or(
                            ServiceError::UnknownLedger {
                                ledger_id: *ledger_id,
                            },
                        )?
                    };
                    let nonce = genesis_nonce(&genesis)?;
                    let state = Arc::new(Mutex::new(StateTrie::new(nonce)));
                    states.insert(*ledger_id, Arc::clone(&state));
                    state
                }
            }
        };
        let mut state = state_arc.lock().unwrap();

        let expected = match state.index() {
            None => BlockIndex::new(0),
            Some(index) => index + 1,
        };
        if block.index < expected {
            // Already applied; the collaborator may deliver a block more than once.
            return Ok(());
        }
        if block.index > expected {
            // The store refuses gaps: catch up on the missing blocks first.
            log::info!(
                "catching up ledger {} from block {} to {}",
                ledger_id,
                expected,
                block.index
            );
            for missing in self.chain.get_update_chain(ledger_id, expected) {
                if missing.index >= block.index {
                    break;
                }
                self.apply_one(ledger_id, &mut state, &missing, stopped_pipelines)?;
            }
        }
        self.apply_one(ledger_id, &mut state, block, stopped_pipelines)
    }

    fn apply_one(
        &self,
        ledger_id: &LedgerId,
        state: &mut StateTrie,
        block: &ChainBlock,
        stopped_pipelines: &mut Vec<TxPipeline>,
    ) -> Result<(), ServiceError> {
        self.execute_and_store(ledger_id, state, block)?;

        for result in block.payload.iter() {
            self.notifications
                .notify_tx(&result.transaction.hash(), result.accepted);
        }
        self.notifications.notify_block(*ledger_id);

        if block.index == BlockIndex::new(0) {
            if let Ok(values) = state.get_values(&InstanceId::zero()) {
                self.ledger_by_policy
                    .lock()
                    .unwrap()
                    .insert(values.policy_id, *ledger_id);
            }
        }

        if let Some(view) = view_change_in(&block.payload, ledger_id) {
            if let Some(controller) = self.view_changes.lock().unwrap().get(ledger_id) {
                controller.done(view.clone());
            }
            Event::CompleteViewChange(CompleteViewChangeEvent {
                timestamp: SystemTime::now(),
                ledger_id: *ledger_id,
                leader_index: view.leader_index,
            })
            .publish(&self.event_publisher);
        }

        Event::ApplyBlock(ApplyBlockEvent {
            timestamp: SystemTime::now(),
            ledger_id: *ledger_id,
            block_hash: block.hash(),
            index: block.index,
            tx_count: block.payload.len(),
        })
        .publish(&self.event_publisher);

        self.update_roles(ledger_id, state, stopped_pipelines);
        Ok(())
    }

    /// Reconcile this node's per-ledger machinery with the roster stored in the ledger's
    /// configuration: the leader runs the pipeline, followers run the heartbeat monitor, and
    /// everyone keeps a view-change controller.
    fn update_roles(
        &self,
        ledger_id: &LedgerId,
        state: &StateTrie,
        stopped_pipelines: &mut Vec<TxPipeline>,
    ) {
        let Ok(config) = config_contract::load_config(state) else {
            log::error!("ledger {} has no readable config after a block", ledger_id);
            return;
        };
        let me = self.keypair.public();
        let interval = config.block_interval();
        let window = interval * self.rotation_window;
        let is_leader = config.roster.leader() == Some(&me);

        if is_leader {
            if self.heartbeats.exists(ledger_id) {
                log::debug!("removing heartbeat monitor for ledger {}", ledger_id);
                let _ = self.heartbeats.stop(ledger_id);
            }
        } else {
            if let Some(pipeline) = self.pipelines.lock().unwrap().remove(ledger_id) {
                log::info!("no longer leading ledger {}, stopping its pipeline", ledger_id);
                // Handed to the caller: the pipeline's threads take the state lock the apply
                // path currently holds, so joining them here would deadlock.
                stopped_pipelines.push(pipeline);
            }
            if self.heartbeats.exists(ledger_id) {
                let _ = self.heartbeats.update_timeout(ledger_id, window);
            } else if config.roster.contains(&me) {
                let _ = self
                    .heartbeats
                    .start(*ledger_id, window, self.heartbeat_reports.clone());
            }
        }
        // Pipeline and controller creation need the Arc around the service's internals,
        // which these inner methods do not hold; `Service::ensure_leadership` finishes the
        // job right after apply.
    }

    fn check_proposal(&self, ledger_id: &LedgerId, block: &ChainBlock) -> Result<(), String> {
        // Genesis proposals execute on a fresh state; later blocks on our durable one.
        if block.index == BlockIndex::new(0) {
            let nonce = genesis_nonce(block).map_err(|err| err.to_string())?;
            let scratch = StateTrie::new(nonce);
            return self.compare_execution(ledger_id, &scratch, block);
        }

        let state_arc = self
            .state_of(ledger_id)
            .map_err(|_| format!("unknown ledger {}", ledger_id))?;
        let mut state = state_arc.lock().unwrap();

        // Verify from the block's predecessor: catch up if we are behind.
        let expected = match state.index() {
            None => BlockIndex::new(0),
            Some(index) => index + 1,
        };
        if expected < block.index {
            let mut stopped_pipelines = Vec::new();
            for missing in self.chain.get_update_chain(ledger_id, expected) {
                if missing.index >= block.index {
                    break;
                }
                self.apply_one(ledger_id, &mut state, &missing, &mut stopped_pipelines)
                    .map_err(|err| format!("catching up for verification: {}", err))?;
            }
            if !stopped_pipelines.is_empty() {
                drop(state);
                for pipeline in stopped_pipelines {
                    pipeline.shutdown();
                }
                state = state_arc.lock().unwrap();
            }
        }
        let expected = match state.index() {
            None => BlockIndex::new(0),
            Some(index) => index + 1,
        };
        if expected != block.index {
            return Err(format!(
                "refusing to verify block {}: our state is at {:?}",
                block.index,
                state.index()
            ));
        }

        // Timestamp must be within the acceptance window around our clock.
        let config = config_contract::load_config(&*state)
            .map_err(|err| format!("reading config: {}", err))?;
        let window = config.block_interval().saturating_mul(4).max(Duration::from_secs(10));
        let now = timestamp_ns();
        let skew = now.abs_diff(block.header.timestamp_ns);
        if skew > window.as_nanos() as u64 {
            return Err(format!(
                "block timestamp out of window: {}ns away from our clock",
                skew
            ));
        }

        self.compare_execution(ledger_id, &state, block)
    }

    fn compare_execution(
        &self,
        ledger_id: &LedgerId,
        state: &StateTrie,
        block: &ChainBlock,
    ) -> Result<(), String> {
        let result = self.executor.create_state_changes(
            &state.staging(),
            *ledger_id,
            block.payload.clone(),
            None,
            u64::MAX,
        );
        if result.tx_results.hash() != block.header.tx_results_hash {
            return Err("recomputed transaction outcomes differ from the header".to_string());
        }
        if result.root != block.header.trie_root {
            return Err("recomputed trie root differs from the header".to_string());
        }
        if hash_state_changes(&result.state_changes) != block.header.state_changes_hash {
            return Err("recomputed state changes differ from the header".to_string());
        }
        Ok(())
    }
}

/// Extract the view a view-change transaction in `payload` completed, if any.
fn view_change_in(payload: &TxResults, ledger_id: &LedgerId) -> Option<View> {
    for result in payload.iter() {
        if !result.accepted {
            continue;
        }
        for instruction in &result.transaction.instructions {
            let InstructionBody::Invoke(invoke) = &instruction.body else {
                continue;
            };
            if invoke.contract_kind != CONFIG_CONTRACT_KIND || invoke.command != "view_change" {
                continue;
            }
            let req_bytes = invoke.args.search("newview")?;
            let req = NewViewReq::try_from_slice(req_bytes).ok()?;
            let view = req.view()?;
            if view.ledger_id == *ledger_id {
                return Some(view.clone());
            }
        }
    }
    None
}

impl<C: ChainStore, N: Network> Service<C, N> {
    /// Finish per-ledger role reconciliation that needs the `Arc` around the service's
    /// internals: starting the leader pipeline and the view-change controller.
    fn ensure_leadership(&self, ledger_id: &LedgerId) {
        let Ok(config) = self.inner.load_config(ledger_id) else {
            return;
        };
        let me = self.inner.keypair.public();
        if !config.roster.contains(&me) {
            return;
        }

        {
            let mut view_changes = self.inner.view_changes.lock().unwrap();
            view_changes.entry(*ledger_id).or_insert_with(|| {
                make_controller(
                    Arc::downgrade(&self.inner),
                    *ledger_id,
                    config.block_interval() * self.inner.rotation_window,
                    config.roster.max_faulty(),
                    me,
                )
            });
        }

        if config.roster.leader() == Some(&me) {
            let mut pipelines = self.inner.pipelines.lock().unwrap();
            if !pipelines.contains_key(ledger_id) {
                log::info!("leading ledger {}, starting its pipeline", ledger_id);
                let processor = Arc::new(ServiceProcessor {
                    inner: Arc::clone(&self.inner),
                    ledger_id: *ledger_id,
                });
                let initial = processor.latest_good_state();
                pipelines.insert(*ledger_id, TxPipeline::start(processor, initial));
            }
        }
    }

    /// Apply a block and reconcile leadership. The convenience entry point chain
    /// collaborators call on every member after appending a block.
    pub fn deliver_block(
        &self,
        ledger_id: &LedgerId,
        block: &ChainBlock,
    ) -> Result<(), ServiceError> {
        self.block_applied(ledger_id, block)?;
        self.ensure_leadership(ledger_id);
        Ok(())
    }
}

fn make_controller<C: ChainStore, N: Network>(
    inner: Weak<ServiceInner<C, N>>,
    ledger_id: LedgerId,
    initial_duration: Duration,
    max_faulty: usize,
    me: VerifyingKey,
) -> Controller {
    let send_inner = inner.clone();
    let announce_inner = inner.clone();
    let leader_inner = inner;

    Controller::start(
        me.to_bytes(),
        ledger_id,
        initial_duration,
        max_faulty,
        Box::new(move |view: View| {
            let inner = send_inner.upgrade().ok_or("service stopped")?;
            let mut req = InitReq::new(view.clone(), &inner.keypair.public());
            req.sign(&inner.keypair);
            Event::StartViewChange(StartViewChangeEvent {
                timestamp: SystemTime::now(),
                ledger_id,
                leader_index: view.leader_index,
            })
            .publish(&inner.event_publisher);
            inner.network().broadcast(Message::ViewChangeInit(req));
            Ok(())
        }),
        Box::new(move |proof: Vec<InitReq>| {
            let Some(inner) = announce_inner.upgrade() else {
                return;
            };
            let Some(view) = proof.first().map(|req| req.view.clone()) else {
                return;
            };
            let Ok(config) = inner.load_config(&ledger_id) else {
                return;
            };
            let req = NewViewReq {
                roster: config.roster.rotated(view.leader_index.int()),
                proof,
            };
            inner.network().broadcast(Message::ViewChangeNewView(req));
        }),
        Box::new(move |view: &View| {
            let Some(inner) = leader_inner.upgrade() else {
                return false;
            };
            let Ok(config) = inner.load_config(&view.ledger_id) else {
                return false;
            };
            config.roster.leader_of(view.leader_index.int()) == Some(&inner.keypair.public())
        }),
    )
}

/// The [`TxProcessor`] the leader pipeline runs against: collection through the network,
/// execution through the [`Executor`], proposal through the chain collaborator.
struct ServiceProcessor<C: ChainStore, N: Network> {
    inner: Arc<ServiceInner<C, N>>,
    ledger_id: LedgerId,
}

impl<C: ChainStore, N: Network> ServiceProcessor<C, N> {
    fn block_size(&self) -> u64 {
        self.inner
            .load_config(&self.ledger_id)
            .map(|config| config.max_block_size)
            .unwrap_or(crate::types::config::MIN_BLOCK_SIZE)
    }
}

impl<C: ChainStore, N: Network> TxProcessor for ServiceProcessor<C, N> {
    fn collect_txs(&self) -> Result<Vec<ClientTransaction>, String> {
        let config = self
            .inner
            .load_config(&self.ledger_id)
            .map_err(|err| err.to_string())?;
        let latest = self
            .inner
            .chain
            .get_latest(&self.ledger_id)
            .ok_or_else(|| format!("no latest block for ledger {}", self.ledger_id))?;

        let local = self
            .inner
            .tx_buffer
            .take(&self.ledger_id, MAX_COLLECTED_TXS as usize);
        let responses = self.inner.collect_responses.lock().unwrap();
        let mut network = self.inner.network();
        Ok(collect_transactions(
            &mut network,
            &config.roster,
            &self.inner.keypair.public(),
            self.ledger_id,
            latest.hash(),
            MAX_COLLECTED_TXS,
            &responses,
            config.block_interval() / 2,
            local,
        ))
    }

    fn process_tx(
        &self,
        transaction: &ClientTransaction,
        state: &PipelineState,
    ) -> Result<Vec<PipelineState>, String> {
        let mut next = state.clone();
        match self
            .inner
            .executor
            .process_one_tx(&state.staging, transaction)
        {
            Ok((changes, staged)) => {
                next.staging = staged;
                next.push(
                    crate::types::transaction::TxResult {
                        transaction: transaction.clone(),
                        accepted: true,
                    },
                    changes,
                );
            }
            Err(err) => {
                log::info!("rejecting transaction {}: {}", transaction.hash(), err);
                self.inner.record_tx_errors(&[(
                    transaction.hash_with_signatures(),
                    err.to_string(),
                )]);
                next.push(
                    crate::types::transaction::TxResult {
                        transaction: transaction.clone(),
                        accepted: false,
                    },
                    Vec::new(),
                );
            }
        }

        // Within the block size: one state. Beyond it: keep the old batch as-is and start a
        // new one holding only this transaction, to be proposed after the old one.
        if next.size() <= self.block_size() {
            return Ok(vec![next]);
        }
        let last_result = next.tx_results.0.pop().unwrap();
        let split_changes = next
            .state_changes
            .split_off(state.state_changes.len());
        let mut overflow = PipelineState::new(next.staging.clone());
        overflow.push(last_result, split_changes);
        Ok(vec![state.clone(), overflow])
    }

    fn propose_block(&self, mut state: PipelineState) -> Result<(), String> {
        let config = self
            .inner
            .load_config(&self.ledger_id)
            .map_err(|err| err.to_string())?;
        let latest = self
            .inner
            .chain
            .get_latest(&self.ledger_id)
            .ok_or_else(|| format!("no latest block for ledger {}", self.ledger_id))?;

        Event::ProposeBlock(ProposeBlockEvent {
            timestamp: SystemTime::now(),
            ledger_id: self.ledger_id,
            tx_count: state.tx_results.len(),
        })
        .publish(&self.inner.event_publisher);
        log::debug!(
            "proposing block {} for ledger {} with {} transactions ({} bytes)",
            latest.index + 1,
            self.ledger_id,
            state.tx_results.len(),
            state.size(),
        );

        let block = ChainBlock {
            index: latest.index + 1,
            previous: latest.hash(),
            header: BlockHeader {
                trie_root: state.staging.root_hash(),
                tx_results_hash: state.tx_results.hash(),
                state_changes_hash: hash_state_changes(&state.state_changes),
                timestamp_ns: timestamp_ns(),
            },
            payload: state.tx_results,
            roster: config.roster,
            forward_links: Vec::new(),
        };
        self.inner
            .chain
            .store_block(&self.ledger_id, block)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    fn latest_good_state(&self) -> PipelineState {
        match self.inner.state_of(&self.ledger_id) {
            Ok(state) => PipelineState::new(state.lock().unwrap().staging()),
            Err(_) => {
                // A pipeline only runs for ledgers with a durable state; reaching this means
                // the ledger was dropped under us and the pipeline is about to stop.
                PipelineState::new(StateTrie::new([0u8; 32]).staging())
            }
        }
    }

    fn interval(&self) -> Duration {
        self.inner
            .load_config(&self.ledger_id)
            .map(|config| config.block_interval())
            .unwrap_or(DEFAULT_INTERVAL)
    }
}

fn message_loop<C: ChainStore, N: Network>(
    inner: Arc<ServiceInner<C, N>>,
    collect_requests: Receiver<(VerifyingKey, CollectTxRequest)>,
    view_change: Receiver<(VerifyingKey, ViewChangeMessage)>,
    shutdown: Receiver<()>,
) {
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => return,
            Err(mpsc::TryRecvError::Empty) => {}
        }
        let mut worked = false;
        while let Ok((origin, request)) = collect_requests.try_recv() {
            handle_collect_request(&inner, origin, request);
            worked = true;
        }
        while let Ok((origin, message)) = view_change.try_recv() {
            handle_view_change(&inner, origin, message);
            worked = true;
        }
        if !worked {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn handle_collect_request<C: ChainStore, N: Network>(
    inner: &Arc<ServiceInner<C, N>>,
    origin: VerifyingKey,
    request: CollectTxRequest,
) {
    let ledger_id = request.ledger_id;
    let empty_response = |inner: &Arc<ServiceInner<C, N>>| {
        inner.network().send(
            origin,
            Message::CollectTxResponse(CollectTxResponse {
                ledger_id,
                nonce: request.nonce,
                transactions: Vec::new(),
            }),
        );
    };

    // Catch up first if the requester has observed blocks we have not applied yet.
    if let (Ok(state_arc), Some(latest)) =
        (inner.state_of(&ledger_id), inner.chain.get_latest(&ledger_id))
    {
        let behind = {
            let state = state_arc.lock().unwrap();
            state.index().map(|index| index < latest.index).unwrap_or(true)
        };
        if behind {
            if let Err(err) = inner.apply_block(&ledger_id, &latest) {
                log::error!("catch-up before collection failed: {}", err);
                empty_response(inner);
                return;
            }
        }
    }

    // Only the current leader may collect. A requester that is not the leader gets nothing.
    match inner.load_config(&ledger_id) {
        Ok(config) => {
            if config.roster.leader() != Some(&origin) {
                log::info!(
                    "collect request for ledger {} from a non-leader, answering empty",
                    ledger_id
                );
                empty_response(inner);
                return;
            }
        }
        Err(_) => {
            empty_response(inner);
            return;
        }
    }

    // The leader polling us is the leader being alive.
    let _ = inner.heartbeats.beat(&ledger_id);

    let transactions = inner
        .tx_buffer
        .take(&ledger_id, request.max_count as usize);
    inner.network().send(
        origin,
        Message::CollectTxResponse(CollectTxResponse {
            ledger_id,
            nonce: request.nonce,
            transactions,
        }),
    );
}

fn handle_view_change<C: ChainStore, N: Network>(
    inner: &Arc<ServiceInner<C, N>>,
    origin: VerifyingKey,
    message: ViewChangeMessage,
) {
    match message {
        ViewChangeMessage::Init(req) => {
            let ledger_id = req.view.ledger_id;
            if !req.is_correctly_signed() {
                log::warn!("dropping a failure report with a bad signature");
                return;
            }
            let Ok(config) = inner.load_config(&ledger_id) else {
                return;
            };
            let Ok(signer) = VerifyingKey::from_bytes(&req.signer) else {
                return;
            };
            if signer != origin || !config.roster.contains(&signer) {
                log::warn!("dropping a failure report from outside the committee");
                return;
            }
            if let Some(controller) = inner.view_changes.lock().unwrap().get(&ledger_id) {
                controller.add_req(req);
            }
        }
        ViewChangeMessage::NewView(req) => {
            let Some(view) = req.view().cloned() else {
                return;
            };
            let ledger_id = view.ledger_id;
            let Ok(config) = inner.load_config(&ledger_id) else {
                return;
            };
            if let Err(err) = req.check_proof(&config.roster) {
                log::warn!("dropping a new-view announcement: {}", err);
                return;
            }
            // Only the announced leader proposes the roster-rotation block, and only when the
            // announcement is its own.
            let me = inner.keypair.public();
            if config.roster.leader_of(view.leader_index.int()) != Some(&me) || origin != me {
                return;
            }
            if let Err(err) = propose_view_change_block(inner, &ledger_id, &req) {
                log::error!("failed to propose the view-change block: {}", err);
            }
        }
    }
}

fn propose_view_change_block<C: ChainStore, N: Network>(
    inner: &Arc<ServiceInner<C, N>>,
    ledger_id: &LedgerId,
    req: &NewViewReq,
) -> Result<(), String> {
    let transaction = ClientTransaction::new(vec![Instruction::new(
        InstanceId::zero(),
        InstructionBody::Invoke(Invoke {
            contract_kind: CONFIG_CONTRACT_KIND.to_string(),
            command: "view_change".to_string(),
            args: Arguments::new(vec![Argument::new(
                "newview",
                req.try_to_vec().unwrap(),
            )]),
        }),
    )]);

    let state_arc = inner.state_of(ledger_id).map_err(|err| err.to_string())?;
    let (result, latest) = {
        let state = state_arc.lock().unwrap();
        let result = inner.executor.create_state_changes(
            &state.staging(),
            *ledger_id,
            TxResults::pending(vec![transaction]),
            None,
            u64::MAX,
        );
        let latest = inner
            .chain
            .get_latest(ledger_id)
            .ok_or_else(|| format!("no latest block for ledger {}", ledger_id))?;
        (result, latest)
    };
    if !result.tx_results.0.first().map(|r| r.accepted).unwrap_or(false) {
        return Err("the view-change transaction was refused locally".to_string());
    }

    let block = ChainBlock {
        index: latest.index + 1,
        previous: latest.hash(),
        header: BlockHeader {
            trie_root: result.root,
            tx_results_hash: result.tx_results.hash(),
            state_changes_hash: hash_state_changes(&result.state_changes),
            timestamp_ns: timestamp_ns(),
        },
        payload: result.tx_results,
        roster: req.roster.clone(),
        forward_links: Vec::new(),
    };
    inner
        .chain
        .store_block(ledger_id, block)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

fn failure_monitor<C: ChainStore, N: Network>(
    inner: Arc<ServiceInner<C, N>>,
    reports: Receiver<LedgerId>,
    shutdown: Receiver<()>,
) {
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => return,
            Err(mpsc::TryRecvError::Empty) => {}
        }
        let ledger_id = match reports.recv_timeout(Duration::from_millis(50)) {
            Ok(ledger_id) => ledger_id,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        };

        log::info!("missed heartbeat for ledger {}", ledger_id);
        Event::HeartbeatMissed(HeartbeatMissedEvent {
            timestamp: SystemTime::now(),
            ledger_id,
        })
        .publish(&inner.event_publisher);

        let Some(latest) = inner.chain.get_latest(&ledger_id) else {
            log::error!(
                "heartbeat fired for ledger {} with no latest block; stopping its monitor",
                ledger_id
            );
            let _ = inner.heartbeats.stop(&ledger_id);
            continue;
        };
        // Report only from a consistent position: behind the chain, our context would not
        // match the committee's anyway.
        let mut req = InitReq::new(
            View {
                block_id: latest.hash(),
                ledger_id,
                leader_index: LeaderIndex::new(1),
            },
            &inner.keypair.public(),
        );
        req.sign(&inner.keypair);
        if let Some(controller) = inner.view_changes.lock().unwrap().get(&ledger_id) {
            controller.add_req(req);
        }
    }
}
