/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! byzledger logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as
//!    constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The first seven characters of the Base64 encoding of the ledger id.
//!
//! The rest of the values differ depending on the kind of event.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;
use crate::event_bus::HandlerPtr;

// Names of each event in PascalCase for printing:
pub const APPLY_BLOCK: &str = "ApplyBlock";
pub const PROPOSE_BLOCK: &str = "ProposeBlock";
pub const REJECT_PROPOSAL: &str = "RejectProposal";
pub const HEARTBEAT_MISSED: &str = "HeartbeatMissed";
pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const COMPLETE_VIEW_CHANGE: &str = "CompleteViewChange";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> HandlerPtr<Self>
    where
        Self: Sized;
}

impl Logger for ApplyBlockEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &ApplyBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                APPLY_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.ledger_id.bytes()),
                first_seven_base64_chars(&event.block_hash.bytes()),
                event.index,
                event.tx_count,
            )
        })
    }
}

impl Logger for ProposeBlockEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &ProposeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PROPOSE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.ledger_id.bytes()),
                event.tx_count,
            )
        })
    }
}

impl Logger for RejectProposalEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &RejectProposalEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                REJECT_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.ledger_id.bytes()),
                event.reason,
            )
        })
    }
}

impl Logger for HeartbeatMissedEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &HeartbeatMissedEvent| {
            log::warn!(
                "{}, {}, {}",
                HEARTBEAT_MISSED,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.ledger_id.bytes()),
            )
        })
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.ledger_id.bytes()),
                event.leader_index,
            )
        })
    }
}

impl Logger for CompleteViewChangeEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &CompleteViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPLETE_VIEW_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.ledger_id.bytes()),
                event.leader_index,
            )
        })
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    encoded.chars().take(7).collect()
}
