/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view-change finite-state machine.
//!
//! One [`Controller`] runs per ledger, independent of any particular messaging layer: the
//! surrounding service injects callbacks for broadcasting failure reports, announcing a new
//! view, and deciding leadership. The controller accepts three kinds of input — a peer's
//! failure report, an own-detected anomaly (delivered as a report signed by ourselves), and the
//! completion notice of a view-change — and reacts per the PBFT view-change rules:
//!
//! - A report for a leader index above the current floor is a newly observed anomaly; if we
//!   have not yet reported that index ourselves, we broadcast our own report.
//! - Once a view has reports from more than `f` distinct signers *and* we have accepted it
//!   ourselves, plus more than `2f` reports in total, a timer starts with exponential backoff
//!   `min(2^ctr · initial, 5 min)`; if we are the view's prospective leader, the new-view
//!   announcement goes out. Backoff bounds message volume under partition while preserving
//!   eventual progress once enough honest peers agree, which is PBFT's liveness argument under
//!   partial synchrony.
//! - Timer expiry moves to the next candidate leader and prunes state below the new floor.
//! - Completion resets everything, even when a later view than ours completed: majority
//!   agreement wins.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::types::basic::{LeaderIndex, LedgerId};

use super::{InitReq, View};

/// Upper bound for the exponentially increasing view-change timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Callback broadcasting our own failure report for a view.
pub type SendInitReqFn = Box<dyn Fn(View) -> Result<(), String> + Send>;

/// Callback announcing ourselves as the new leader, carrying the collected reports as proof.
/// Must not block; completion is signaled back through [`Controller::done`].
pub type SendNewViewReqFn = Box<dyn Fn(Vec<InitReq>) + Send>;

/// Callback deciding whether this node is the prospective leader of a view.
pub type IsLeaderFn = Box<dyn Fn(&View) -> bool + Send>;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum FsmState {
    Initial,
    SentRequest,
    TimerStarted,
}

struct StateLog {
    current: View,
    received: HashMap<[u8; 32], InitReq>,
    state: FsmState,
    /// Set once we contributed a report for this view ourselves.
    accepted: bool,
}

impl StateLog {
    fn new(view: View) -> Self {
        Self {
            current: view,
            received: HashMap::new(),
            state: FsmState::Initial,
            accepted: false,
        }
    }

    fn add(&mut self, req: InitReq) {
        // Invariant: every report in one log shares the view. A mismatch means this node fell
        // behind and the sender's context is newer (or older) than ours; the single report is
        // dropped rather than corrupting the log.
        if req.view != self.current {
            log::info!(
                "ignoring a report whose view does not match previously received views (leader index {})",
                req.view.leader_index
            );
            return;
        }
        self.received.insert(req.signer, req);
    }
}

#[derive(Default)]
struct StateLogs {
    logs: HashMap<u32, StateLog>,
}

impl StateLogs {
    fn add(&mut self, req: InitReq) {
        let index = req.view.leader_index.int();
        match self.logs.get_mut(&index) {
            Some(log) => log.add(req),
            None => {
                let mut log = StateLog::new(req.view.clone());
                log.add(req);
                self.logs.insert(index, log);
            }
        }
    }

    fn highest(&self) -> Option<u32> {
        self.logs.keys().max().copied()
    }

    fn count_of(&self, index: u32) -> usize {
        self.logs.get(&index).map(|log| log.received.len()).unwrap_or(0)
    }

    fn state_of(&self, index: u32) -> FsmState {
        self.logs
            .get(&index)
            .map(|log| log.state)
            .unwrap_or(FsmState::Initial)
    }

    fn advance_state(&mut self, index: u32) {
        if let Some(log) = self.logs.get_mut(&index) {
            log.state = match log.state {
                FsmState::Initial => FsmState::SentRequest,
                FsmState::SentRequest => FsmState::TimerStarted,
                FsmState::TimerStarted => {
                    // There is no further state; reaching this is a logic error upstream.
                    log::error!("view-change log already in its final state");
                    FsmState::TimerStarted
                }
            };
        }
    }

    fn accept(&mut self, index: u32) {
        if let Some(log) = self.logs.get_mut(&index) {
            log.accepted = true;
        }
    }

    fn accepted(&self, index: u32) -> bool {
        self.logs.get(&index).map(|log| log.accepted).unwrap_or(false)
    }

    fn view_of(&self, index: u32) -> Option<View> {
        self.logs.get(&index).map(|log| log.current.clone())
    }

    fn proof_of(&self, index: u32) -> Vec<InitReq> {
        self.logs
            .get(&index)
            .map(|log| log.received.values().cloned().collect())
            .unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Prune logs for all leader indices below the new floor.
    fn clean(&mut self, floor: u32) {
        self.logs.retain(|index, _| *index >= floor);
    }
}

enum ControlMsg {
    Req(InitReq),
    Done(View),
    Waiting(SyncSender<bool>),
    Stop,
}

/// Handle to one ledger's running view-change FSM.
pub struct Controller {
    control: Sender<ControlMsg>,
    handle: Option<JoinHandle<()>>,
}

impl Controller {
    /// Start the FSM thread.
    ///
    /// `my_id` is this node's verifying-key bytes, `max_faulty` is `f`, and `initial_duration`
    /// seeds the exponential backoff.
    pub fn start(
        my_id: [u8; 32],
        ledger_id: LedgerId,
        initial_duration: Duration,
        max_faulty: usize,
        send_init_req: SendInitReqFn,
        send_new_view_req: SendNewViewReqFn,
        is_leader: IsLeaderFn,
    ) -> Controller {
        let (control, control_receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut fsm = Fsm {
                my_id,
                ledger_id,
                initial_duration,
                max_faulty,
                send_init_req,
                send_new_view_req,
                is_leader,
                logs: StateLogs::default(),
                ctr: 0,
                deadline: None,
            };
            loop {
                let timeout = match fsm.deadline {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                    None => MAX_TIMEOUT,
                };
                match control_receiver.recv_timeout(timeout) {
                    Ok(ControlMsg::Req(req)) => fsm.on_req(req),
                    Ok(ControlMsg::Done(view)) => fsm.on_done(view),
                    Ok(ControlMsg::Waiting(reply)) => {
                        let _ = reply.send(fsm.logs.state_of(fsm.ctr) == FsmState::TimerStarted);
                    }
                    Ok(ControlMsg::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        if fsm.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                            fsm.on_timer_expired();
                        }
                    }
                }
            }
        });
        Controller {
            control,
            handle: Some(handle),
        }
    }

    /// Feed a failure report into the FSM: a peer's, or our own (own-detected anomalies are
    /// reports signed by ourselves).
    pub fn add_req(&self, req: InitReq) {
        let _ = self.control.send(ControlMsg::Req(req));
    }

    /// Notify the FSM that a view-change completed.
    pub fn done(&self, view: View) {
        let _ = self.control.send(ControlMsg::Done(view));
    }

    /// Whether the FSM is currently waiting for a view-change to complete (timer running for
    /// the current floor).
    pub fn waiting(&self) -> bool {
        let (reply, reply_receiver) = mpsc::sync_channel(1);
        if self.control.send(ControlMsg::Waiting(reply)).is_err() {
            return false;
        }
        reply_receiver.recv().unwrap_or(false)
    }

    /// Stop the FSM, joining its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.control.send(ControlMsg::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Fsm {
    my_id: [u8; 32],
    ledger_id: LedgerId,
    initial_duration: Duration,
    max_faulty: usize,
    send_init_req: SendInitReqFn,
    send_new_view_req: SendNewViewReqFn,
    is_leader: IsLeaderFn,
    logs: StateLogs,
    ctr: u32,
    deadline: Option<Instant>,
}

impl Fsm {
    fn on_req(&mut self, req: InitReq) {
        let from_self = req.signer == self.my_id;
        self.logs.add(req.clone());
        if from_self {
            self.process_anomaly(&req);
        } else if let Some(highest) = self.logs.highest() {
            // Echo rule: once more than f peers report an anomaly we have not noticed
            // ourselves, at least one honest node saw it, so report it too rather than start
            // the view-change late.
            if highest > self.ctr && self.logs.count_of(highest) > self.max_faulty {
                self.deadline = None;
                let own = InitReq {
                    view: req.view.clone(),
                    signer: self.my_id,
                    signature: None,
                };
                self.process_anomaly(&own);
            }
        }

        if self.logs.count_of(self.ctr) > 2 * self.max_faulty
            && self.logs.state_of(self.ctr) < FsmState::TimerStarted
            && self.logs.accepted(self.ctr)
        {
            // 2f+1 reports: start the backoff timer. Saturate the shift so a runaway counter
            // cannot wrap the timeout.
            let factor = 2u64.saturating_pow(self.ctr.min(32));
            let timeout = self
                .initial_duration
                .saturating_mul(factor.min(u32::MAX as u64) as u32)
                .min(MAX_TIMEOUT);
            self.deadline = Some(Instant::now() + timeout);
            self.logs.advance_state(self.ctr);
            log::info!(
                "view-change timer started for ledger {} at leader index {}",
                self.ledger_id,
                self.ctr
            );
            if let Some(view) = self.logs.view_of(self.ctr) {
                if (self.is_leader)(&view) {
                    (self.send_new_view_req)(self.logs.proof_of(self.ctr));
                }
            }
        }
    }

    fn process_anomaly(&mut self, req: &InitReq) {
        let index = req.view.leader_index.int();
        if index <= self.ctr {
            // An anomaly for a view the controller has already moved past.
            log::debug!("not accepting anomalies for earlier views (leader index {})", index);
            return;
        }
        self.ctr = index;
        if self.logs.state_of(index) < FsmState::SentRequest {
            if let Some(view) = self.logs.view_of(index) {
                match (self.send_init_req)(view) {
                    Ok(()) => {
                        self.logs.advance_state(index);
                        self.logs.accept(index);
                    }
                    Err(err) => log::error!("failed to send failure report: {}", err),
                }
            }
        }
    }

    fn on_done(&mut self, view: View) {
        if self.logs.is_empty() {
            log::warn!(
                "ignoring view-change completion for ledger {}: controller state is empty",
                self.ledger_id
            );
            return;
        }
        match self.logs.view_of(self.ctr) {
            Some(current) if current == view => {
                log::info!(
                    "view-change completed for ledger {} at leader index {}",
                    self.ledger_id,
                    view.leader_index
                );
            }
            _ => {
                // A different view than ours completed. The majority agreed, so accept it.
                log::warn!(
                    "view-change completed a view other than the current one for ledger {}",
                    self.ledger_id
                );
            }
        }
        self.ctr = 0;
        self.deadline = None;
        self.logs = StateLogs::default();
    }

    fn on_timer_expired(&mut self) {
        self.deadline = None;
        let Some(current) = self.logs.view_of(self.ctr) else {
            return;
        };
        let view = View {
            block_id: current.block_id,
            ledger_id: self.ledger_id,
            leader_index: LeaderIndex::new(self.ctr + 1),
        };
        log::info!(
            "view-change timer expired for ledger {}, moving to leader index {}",
            self.ledger_id,
            view.leader_index
        );
        let req = InitReq {
            view,
            signer: self.my_id,
            signature: None,
        };
        self.logs.add(req.clone());
        self.process_anomaly(&req);
        self.logs.clean(self.ctr);
    }
}
