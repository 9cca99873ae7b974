/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events that can be emitted by a running [`Service`](crate::service::Service).
//!
//! Enabling `log_events` in the
//! [`ServiceConfiguration`](crate::service::ServiceConfiguration) registers the default
//! [logging](crate::logging) handlers; events are then dispatched to them on a dedicated bus
//! thread, off the paths that emit them.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::{BlockIndex, CryptoHash, LeaderIndex, LedgerId};

/// A block was applied to the durable state store.
#[derive(Clone)]
pub struct ApplyBlockEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub block_hash: CryptoHash,
    pub index: BlockIndex,
    pub tx_count: usize,
}

/// The leader handed an accumulated batch to block proposal.
#[derive(Clone)]
pub struct ProposeBlockEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub tx_count: usize,
}

/// A proposed block was refused by this node during verification.
#[derive(Clone)]
pub struct RejectProposalEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub reason: String,
}

/// The leader's heartbeat went silent for a full window.
#[derive(Clone)]
pub struct HeartbeatMissedEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
}

/// The view-change controller started its timer for a view.
#[derive(Clone)]
pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub leader_index: LeaderIndex,
}

/// A view-change completed and the roster rotated.
#[derive(Clone)]
pub struct CompleteViewChangeEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub leader_index: LeaderIndex,
}

/// Any event emitted by the service.
#[derive(Clone)]
pub enum Event {
    ApplyBlock(ApplyBlockEvent),
    ProposeBlock(ProposeBlockEvent),
    RejectProposal(RejectProposalEvent),
    HeartbeatMissed(HeartbeatMissedEvent),
    StartViewChange(StartViewChangeEvent),
    CompleteViewChange(CompleteViewChangeEvent),
}

impl Event {
    /// Send the event to the event bus, if one is running.
    pub(crate) fn publish(self, publisher: &Option<Sender<Event>>) {
        if let Some(publisher) = publisher {
            let _ = publisher.send(self);
        }
    }
}
