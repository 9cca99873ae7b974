/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-ledger buffer of pending client transactions.
//!
//! Every node buffers the transactions its clients submit; the leader drains the buffers of the
//! whole committee through the collect-tx protocol. When a buffer is full, *new* transactions
//! are dropped: dropping old ones instead would let an attacker flush legit transactions out by
//! flooding.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::basic::LedgerId;
use crate::types::transaction::ClientTransaction;

const MAX_BUFFER_SIZE: usize = 1000;

/// Thread-safe store of buffered pending transactions, keyed by ledger.
#[derive(Default)]
pub struct TxBuffer {
    buffers: Mutex<HashMap<LedgerId, Vec<ClientTransaction>>>,
}

impl TxBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `transaction` for `ledger_id`. Silently dropped when the ledger's buffer is full.
    pub fn add(&self, ledger_id: LedgerId, transaction: ClientTransaction) {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.entry(ledger_id).or_default();
        if buffer.len() >= MAX_BUFFER_SIZE {
            log::warn!("transaction buffer for ledger {} is full, dropping", ledger_id);
            return;
        }
        buffer.push(transaction);
    }

    /// Take up to `max` buffered transactions for `ledger_id`, keeping any overflow for the
    /// next collection round.
    pub fn take(&self, ledger_id: &LedgerId, max: usize) -> Vec<ClientTransaction> {
        let mut buffers = self.buffers.lock().unwrap();
        let Some(buffer) = buffers.get_mut(ledger_id) else {
            return Vec::new();
        };
        if buffer.len() <= max {
            let taken = std::mem::take(buffer);
            buffers.remove(ledger_id);
            taken
        } else {
            let rest = buffer.split_off(max);
            std::mem::replace(buffer, rest)
        }
    }

    /// How many transactions are currently buffered for `ledger_id`.
    pub fn len(&self, ledger_id: &LedgerId) -> usize {
        self.buffers
            .lock()
            .unwrap()
            .get(ledger_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::CryptoHash;

    fn ledger() -> LedgerId {
        LedgerId::new(CryptoHash::new([1u8; 32]))
    }

    fn tx() -> ClientTransaction {
        ClientTransaction::new(Vec::new())
    }

    #[test]
    fn take_keeps_the_overflow() {
        let buffer = TxBuffer::new();
        for _ in 0..5 {
            buffer.add(ledger(), tx());
        }
        assert_eq!(buffer.take(&ledger(), 3).len(), 3);
        assert_eq!(buffer.len(&ledger()), 2);
        assert_eq!(buffer.take(&ledger(), 3).len(), 2);
        assert_eq!(buffer.take(&ledger(), 3).len(), 0);
    }

    #[test]
    fn full_buffer_drops_new_arrivals() {
        let buffer = TxBuffer::new();
        for _ in 0..(MAX_BUFFER_SIZE + 10) {
            buffer.add(ledger(), tx());
        }
        assert_eq!(buffer.len(&ledger()), MAX_BUFFER_SIZE);
    }
}
