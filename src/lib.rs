/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Byzantine fault tolerant replicated ledger with an authenticated key-value state store.
//!
//! A committee of nodes agrees on an ordered sequence of blocks, each carrying a batch of
//! client transactions that deterministically mutate a shared, cryptographically authenticated
//! key-value store. Clients submit transactions to any member; the leader collects them,
//! executes them speculatively, and proposes a block; followers re-execute the same
//! transactions and accept the block only if their independently computed state matches the
//! leader's claims. If the leader goes silent, a PBFT-style view-change elects a new one
//! without losing committed state.
//!
//! The building blocks, leaves first:
//! - [`trie`] and [`state`]: the authenticated state store, with point proofs of presence and
//!   absence, and disposable staging views for speculative execution.
//! - [`contracts`] and [`execution`]: pluggable contract logic, replay-counter enforcement,
//!   and the deterministic execution engine with its per-ledger result cache.
//! - [`pipeline`], [`collect`], and [`heartbeat`]: the leader's collection/processing/proposal
//!   loop and the liveness signal followers derive from being polled.
//! - [`viewchange`]: the leader-failure FSM.
//! - [`chain`] and [`proof`]: the interface to the underlying append-only block ledger, and
//!   the trie-plus-forward-link proofs that let any party trust a key's value without trusting
//!   the servers.
//! - [`service`]: the per-node assembly of all of the above, exposed as an RPC surface.
//!
//! Two seams are deliberately left to the library user: the block ledger itself
//! ([`chain::ChainStore`]) and the transport ([`networking::Network`]).

pub mod chain;

pub mod collect;

pub mod contracts;

pub(crate) mod event_bus;

pub mod events;

pub mod execution;

pub mod heartbeat;

pub(crate) mod logging;

pub mod networking;

pub mod pipeline;

pub mod proof;

pub mod service;

pub mod state;

pub mod trie;

pub mod types;

pub mod viewchange;
