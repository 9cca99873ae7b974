/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The leader's transaction pipeline.
//!
//! One pipeline runs per ledger the node leads. A collect thread polls the committee for
//! pending transactions every half block-interval; a process thread applies them one at a time
//! to an accumulating staged snapshot and, on every block-interval tick, hands the accumulated
//! batch to block proposal. Proposal may block for a whole consensus round, so it runs on its
//! own thread and reports back through a channel; collection and processing never stall behind
//! it. When a proposal is refused, the pipeline discards its speculative state and rebuilds
//! from the last durable snapshot.

pub mod buffer;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::state::StagingState;
use crate::types::basic::CryptoHash;
use crate::types::state_change::StateChange;
use crate::types::transaction::{ClientTransaction, TxResults};

/// How many transactions the collect thread may queue ahead of the process thread.
const PENDING_QUEUE_CAPACITY: usize = 200;

/// How many recent transaction hashes are remembered for duplicate suppression.
const MAX_SEEN_HASHES: usize = 1000;

/// The state a pipeline accumulates between block proposals.
#[derive(Clone)]
pub struct PipelineState {
    /// The staged snapshot all accepted transactions so far have been applied to.
    pub staging: StagingState,
    /// The state changes that led from the starting snapshot to `staging`.
    pub state_changes: Vec<StateChange>,
    /// The per-transaction outcomes accumulated so far.
    pub tx_results: TxResults,
    size: Option<u64>,
}

impl PipelineState {
    /// Create an empty pipeline state on top of `staging`.
    pub fn new(staging: StagingState) -> Self {
        Self {
            staging,
            state_changes: Vec::new(),
            tx_results: TxResults::default(),
            size: None,
        }
    }

    /// The serialized size of the accumulated transactions, cached after the first call.
    pub fn size(&mut self) -> u64 {
        if self.size.is_none() {
            self.size = Some(self.tx_results.size());
        }
        self.size.unwrap()
    }

    /// Record a processed transaction and its effects.
    pub fn push(&mut self, result: crate::types::transaction::TxResult, changes: Vec<StateChange>) {
        self.tx_results.0.push(result);
        self.state_changes.extend(changes);
        self.size = None;
    }

    /// Drop the accumulated outcomes, keeping the staged snapshot. Called after the
    /// accumulated batch is handed to proposal so the next batch builds on top of it.
    pub fn reset(&mut self) {
        self.state_changes.clear();
        self.tx_results = TxResults::default();
        self.size = None;
    }
}

/// What a pipeline needs from its surroundings. Implemented by the service; mocked in tests.
pub trait TxProcessor: Send + Sync + 'static {
    /// Collect pending transactions from the committee. Blocks up to roughly half a block
    /// interval. The transactions are not yet verified.
    fn collect_txs(&self) -> Result<Vec<ClientTransaction>, String>;

    /// Apply `transaction` to `state`, producing the successor state(s). When the accumulated
    /// batch outgrows the block size, the processor returns more than one state; earlier
    /// states must be proposed before later ones build on them. A refused transaction is
    /// recorded as rejected inside the returned state, not surfaced as an error; `Err` means a
    /// failure that makes continuing pointless.
    fn process_tx(
        &self,
        transaction: &ClientTransaction,
        state: &PipelineState,
    ) -> Result<Vec<PipelineState>, String>;

    /// Propose the accumulated batch as a block. Returns when the committee has decided;
    /// called from a dedicated thread.
    fn propose_block(&self, state: PipelineState) -> Result<(), String>;

    /// The latest state this processor trusts, used to rebuild after a refused proposal.
    fn latest_good_state(&self) -> PipelineState;

    /// The current block interval.
    fn interval(&self) -> Duration;
}

/// Handle to a running pipeline's threads.
pub struct TxPipeline {
    collect: Option<JoinHandle<()>>,
    process: Option<JoinHandle<()>>,
    stop_collect: Sender<()>,
}

impl TxPipeline {
    /// Start the collect and process threads over `processor`, beginning from `initial`.
    pub fn start(processor: Arc<dyn TxProcessor>, initial: PipelineState) -> TxPipeline {
        let (stop_collect, stop_collect_receiver) = mpsc::channel();
        let (tx_sender, tx_receiver) = mpsc::sync_channel(PENDING_QUEUE_CAPACITY);

        let collect = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || collect_loop(processor, tx_sender, stop_collect_receiver))
        };
        let process = thread::spawn(move || process_loop(processor, tx_receiver, initial));

        TxPipeline {
            collect: Some(collect),
            process: Some(process),
            stop_collect,
        }
    }

    /// Stop both threads, draining any in-flight proposal before returning. Safe to restart a
    /// new pipeline immediately afterwards.
    pub fn shutdown(mut self) {
        // Closing the collect loop drops the transaction sender, which in turn winds down the
        // process loop.
        let _ = self.stop_collect.send(());
        if let Some(handle) = self.collect.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.process.take() {
            let _ = handle.join();
        }
    }
}

fn collect_loop(
    processor: Arc<dyn TxProcessor>,
    tx_sender: SyncSender<ClientTransaction>,
    stop: Receiver<()>,
) {
    loop {
        let half_interval = processor.interval() / 2;
        match stop.recv_timeout(half_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::debug!("stopping tx collector");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        let transactions = match processor.collect_txs() {
            Ok(transactions) => transactions,
            Err(err) => {
                log::error!("failed to collect transactions: {}", err);
                continue;
            }
        };
        for transaction in transactions {
            match tx_sender.try_send(transaction) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("dropping transactions because there are too many");
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn process_loop(
    processor: Arc<dyn TxProcessor>,
    tx_receiver: Receiver<ClientTransaction>,
    initial: PipelineState,
) {
    // The newest state is always last; older entries are batches already split off and
    // waiting to be proposed first.
    let mut states: Vec<PipelineState> = vec![initial];
    let mut seen_hashes: Vec<CryptoHash> = Vec::new();
    let mut proposing = false;
    let (proposal_sender, proposal_receiver) = mpsc::sync_channel::<Result<(), String>>(1);
    let mut next_tick = Instant::now() + processor.interval();

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match tx_receiver.recv_timeout(timeout) {
            Ok(transaction) => {
                let tx_hash = transaction.hash_with_signatures();
                if seen_hashes.contains(&tx_hash) {
                    log::debug!("ignoring duplicate transaction {}", transaction.hash());
                    continue;
                }
                seen_hashes.push(tx_hash);
                if seen_hashes.len() > MAX_SEEN_HASHES {
                    let excess = seen_hashes.len() - MAX_SEEN_HASHES;
                    seen_hashes.drain(..excess);
                }

                // New transactions always apply to the newest state.
                let current = states.last().unwrap();
                match processor.process_tx(&transaction, current) {
                    Ok(new_states) => {
                        states.pop();
                        states.extend(new_states);
                    }
                    Err(err) => log::error!("processing transaction failed: {}", err),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                next_tick = Instant::now() + processor.interval();

                if proposing {
                    // Wait out the in-flight proposal so batches do not pile up behind a slow
                    // consensus round.
                    proposing = false;
                    match proposal_receiver.recv() {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log::error!(
                                "reverting to last known state because proposal refused: {}",
                                err
                            );
                            states = vec![processor.latest_good_state()];
                            continue;
                        }
                        Err(_) => return,
                    }
                }

                if states[0].tx_results.is_empty() {
                    continue;
                }

                proposing = true;
                let input = propose_input_state(&mut states);
                let processor = Arc::clone(&processor);
                let proposal_sender = proposal_sender.clone();
                thread::spawn(move || {
                    let result = processor.propose_block(input);
                    if let Err(err) = &result {
                        log::error!("failed to propose block: {}", err);
                    }
                    let _ = proposal_sender.send(result);
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("stopping tx processor");
                if proposing {
                    let _ = proposal_receiver.recv();
                }
                return;
            }
        }
    }
}

/// Pick the state to propose. With a single accumulated state, a copy is proposed and the
/// accumulator keeps its snapshot; with split states, the oldest goes out first.
fn propose_input_state(states: &mut Vec<PipelineState>) -> PipelineState {
    if states.len() == 1 {
        let input = states[0].clone();
        states[0].reset();
        input
    } else {
        states.remove(0)
    }
}
