/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert types used across the library.

pub mod basic;

pub mod block;

pub mod config;

pub mod crypto_primitives;

pub mod identity;

pub mod roster;

pub mod state_change;

pub mod transaction;
