/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that dispatches [events](crate::events) to registered handlers.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) apply_block_handlers: Vec<HandlerPtr<ApplyBlockEvent>>,
    pub(crate) propose_block_handlers: Vec<HandlerPtr<ProposeBlockEvent>>,
    pub(crate) reject_proposal_handlers: Vec<HandlerPtr<RejectProposalEvent>>,
    pub(crate) heartbeat_missed_handlers: Vec<HandlerPtr<HeartbeatMissedEvent>>,
    pub(crate) start_view_change_handlers: Vec<HandlerPtr<StartViewChangeEvent>>,
    pub(crate) complete_view_change_handlers: Vec<HandlerPtr<CompleteViewChangeEvent>>,
}

impl EventHandlers {
    /// Add the default logging handler for every event type.
    pub(crate) fn add_logging_handlers(&mut self) {
        self.apply_block_handlers.push(ApplyBlockEvent::get_logger());
        self.propose_block_handlers
            .push(ProposeBlockEvent::get_logger());
        self.reject_proposal_handlers
            .push(RejectProposalEvent::get_logger());
        self.heartbeat_missed_handlers
            .push(HeartbeatMissedEvent::get_logger());
        self.start_view_change_handlers
            .push(StartViewChangeEvent::get_logger());
        self.complete_view_change_handlers
            .push(CompleteViewChangeEvent::get_logger());
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ApplyBlock(event) => {
                self.apply_block_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::ProposeBlock(event) => self
                .propose_block_handlers
                .iter()
                .for_each(|handler| handler(&event)),
            Event::RejectProposal(event) => self
                .reject_proposal_handlers
                .iter()
                .for_each(|handler| handler(&event)),
            Event::HeartbeatMissed(event) => self
                .heartbeat_missed_handlers
                .iter()
                .for_each(|handler| handler(&event)),
            Event::StartViewChange(event) => self
                .start_view_change_handlers
                .iter()
                .for_each(|handler| handler(&event)),
            Event::CompleteViewChange(event) => self
                .complete_view_change_handlers
                .iter()
                .for_each(|handler| handler(&event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }

        match event_subscriber.recv_timeout(Duration::from_millis(20)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }
    })
}
