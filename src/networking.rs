/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer networking.
//!
//! Message framing, connection management, and retry of individual sends are the network
//! provider's concern; this crate only defines the [`Network`] trait as the seam, the
//! committee-internal [`Message`] enum, and a background poller that routes inbound messages to
//! the subprotocol that consumes them.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::collect::{CollectTxRequest, CollectTxResponse};
use crate::types::crypto_primitives::VerifyingKey;
use crate::types::roster::Roster;
use crate::viewchange::{InitReq, NewViewReq};

/// A committee-internal message.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum Message {
    CollectTxRequest(CollectTxRequest),
    CollectTxResponse(CollectTxResponse),
    ViewChangeInit(InitReq),
    ViewChangeNewView(NewViewReq),
}

/// A view-change message routed to the view-change handler.
#[derive(Clone, Debug)]
pub enum ViewChangeMessage {
    Init(InitReq),
    NewView(NewViewReq),
}

/// The interface a network provider implements.
pub trait Network: Clone + Send + 'static {
    /// Inform the network provider of the committee on wake-up.
    fn init_roster(&mut self, roster: Roster);

    /// Inform the network provider that the committee changed, e.g. so it can open
    /// connections to new members.
    fn update_roster(&mut self, roster: Roster);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Send a message to all peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Receive a message from any peer. Returns immediately with `None` if no message is
    /// available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}

/// The receivers the poller routes inbound messages into.
pub struct InboundChannels {
    pub collect_requests: Receiver<(VerifyingKey, CollectTxRequest)>,
    pub collect_responses: Receiver<(VerifyingKey, CollectTxResponse)>,
    pub view_change: Receiver<(VerifyingKey, ViewChangeMessage)>,
}

/// Start the background thread that drains `network` and routes messages per kind. Returns the
/// thread's handle, a shutdown sender, and the routed receivers.
pub fn start_polling<N: Network>(
    mut network: N,
) -> (JoinHandle<()>, Sender<()>, InboundChannels) {
    let (shutdown, shutdown_receiver) = mpsc::channel();
    let (collect_req_sender, collect_requests) = mpsc::channel();
    let (collect_resp_sender, collect_responses) = mpsc::channel();
    let (view_change_sender, view_change) = mpsc::channel();

    let handle = thread::spawn(move || loop {
        match shutdown_receiver.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }
        match network.recv() {
            Some((origin, message)) => {
                // A receiver that was dropped just means the subprotocol is gone; the message
                // is stale by definition.
                match message {
                    Message::CollectTxRequest(request) => {
                        let _ = collect_req_sender.send((origin, request));
                    }
                    Message::CollectTxResponse(response) => {
                        let _ = collect_resp_sender.send((origin, response));
                    }
                    Message::ViewChangeInit(req) => {
                        let _ = view_change_sender.send((origin, ViewChangeMessage::Init(req)));
                    }
                    Message::ViewChangeNewView(req) => {
                        let _ =
                            view_change_sender.send((origin, ViewChangeMessage::NewView(req)));
                    }
                }
            }
            None => thread::sleep(Duration::from_millis(5)),
        }
    });

    (
        handle,
        shutdown,
        InboundChannels {
            collect_requests,
            collect_responses,
            view_change,
        },
    )
}
