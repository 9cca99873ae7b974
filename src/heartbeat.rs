/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-ledger heartbeat monitors for leader-failure detection.
//!
//! Followers expect the leader to poll them for transactions every half block-interval; each
//! poll counts as a heartbeat. A [`HeartbeatMonitor`] runs one timer thread per ledger: when no
//! beat arrives within the window, the ledger id is emitted on the report channel and the timer
//! restarts. The send never blocks — the consumer is a single always-listening monitor loop,
//! and a report that cannot be delivered right now would be stale by the time it could be.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::types::basic::LedgerId;

/// Error raised by heartbeat operations.
#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    AlreadyRunning { ledger_id: LedgerId },
    NotFound { ledger_id: LedgerId },
}

impl Display for HeartbeatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HeartbeatError::AlreadyRunning { ledger_id } => {
                write!(f, "heartbeat monitor for ledger {} already running", ledger_id)
            }
            HeartbeatError::NotFound { ledger_id } => {
                write!(f, "no heartbeat monitor for ledger {}", ledger_id)
            }
        }
    }
}

enum Control {
    Beat,
    UpdateTimeout(Duration),
    Stop,
}

struct Monitor {
    control: Sender<Control>,
    handle: JoinHandle<()>,
}

/// The set of running heartbeat timers, one per monitored ledger.
#[derive(Default)]
pub struct HeartbeatMonitor {
    monitors: Mutex<HashMap<LedgerId, Monitor>>,
}

impl HeartbeatMonitor {
    /// Create a monitor set with no timers running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer for `ledger_id` with the given `timeout` window, reporting expiries on
    /// `reports`. Fails if a timer for the ledger is already running.
    pub fn start(
        &self,
        ledger_id: LedgerId,
        timeout: Duration,
        reports: SyncSender<LedgerId>,
    ) -> Result<(), HeartbeatError> {
        let mut monitors = self.monitors.lock().unwrap();
        if monitors.contains_key(&ledger_id) {
            return Err(HeartbeatError::AlreadyRunning { ledger_id });
        }
        let (control, control_receiver) = mpsc::channel();
        let handle = thread::spawn(move || timer_loop(ledger_id, timeout, control_receiver, reports));
        monitors.insert(ledger_id, Monitor { control, handle });
        Ok(())
    }

    /// Whether a timer for `ledger_id` is running.
    pub fn exists(&self, ledger_id: &LedgerId) -> bool {
        self.monitors.lock().unwrap().contains_key(ledger_id)
    }

    /// Reset the timer for `ledger_id`.
    pub fn beat(&self, ledger_id: &LedgerId) -> Result<(), HeartbeatError> {
        self.send(ledger_id, Control::Beat)
    }

    /// Reconfigure the timeout window for `ledger_id`. Used when the block interval or the
    /// leader-rotation window changes.
    pub fn update_timeout(
        &self,
        ledger_id: &LedgerId,
        timeout: Duration,
    ) -> Result<(), HeartbeatError> {
        self.send(ledger_id, Control::UpdateTimeout(timeout))
    }

    fn send(&self, ledger_id: &LedgerId, control: Control) -> Result<(), HeartbeatError> {
        let monitors = self.monitors.lock().unwrap();
        let monitor = monitors.get(ledger_id).ok_or(HeartbeatError::NotFound {
            ledger_id: *ledger_id,
        })?;
        monitor
            .control
            .send(control)
            .map_err(|_| HeartbeatError::NotFound {
                ledger_id: *ledger_id,
            })
    }

    /// Stop the timer for `ledger_id`, joining its thread before returning.
    pub fn stop(&self, ledger_id: &LedgerId) -> Result<(), HeartbeatError> {
        let monitor = {
            let mut monitors = self.monitors.lock().unwrap();
            monitors.remove(ledger_id).ok_or(HeartbeatError::NotFound {
                ledger_id: *ledger_id,
            })?
        };
        let _ = monitor.control.send(Control::Stop);
        let _ = monitor.handle.join();
        Ok(())
    }

    /// Stop every timer, joining all threads before returning.
    pub fn stop_all(&self) {
        let drained: Vec<Monitor> = {
            let mut monitors = self.monitors.lock().unwrap();
            monitors.drain().map(|(_, monitor)| monitor).collect()
        };
        for monitor in drained {
            let _ = monitor.control.send(Control::Stop);
            let _ = monitor.handle.join();
        }
    }
}

fn timer_loop(
    ledger_id: LedgerId,
    mut window: Duration,
    control: Receiver<Control>,
    reports: SyncSender<LedgerId>,
) {
    loop {
        match control.recv_timeout(window) {
            Ok(Control::Beat) => {}
            Ok(Control::UpdateTimeout(timeout)) => window = timeout,
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("missed heartbeat for ledger {}", ledger_id);
                // Drop-if-full: a single always-listening consumer is expected, and an
                // undeliverable report would be stale anyway.
                let _ = reports.try_send(ledger_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::CryptoHash;
    use std::time::Instant;

    fn ledger(byte: u8) -> LedgerId {
        LedgerId::new(CryptoHash::new([byte; 32]))
    }

    #[test]
    fn timeout_emits_a_report_and_restarts() {
        let monitor = HeartbeatMonitor::new();
        let (reports, report_receiver) = mpsc::sync_channel(4);
        monitor
            .start(ledger(1), Duration::from_millis(30), reports)
            .unwrap();

        // Two consecutive expiries without any beat.
        assert_eq!(
            report_receiver.recv_timeout(Duration::from_secs(2)).unwrap(),
            ledger(1)
        );
        assert_eq!(
            report_receiver.recv_timeout(Duration::from_secs(2)).unwrap(),
            ledger(1)
        );
        monitor.stop_all();
    }

    #[test]
    fn beats_hold_the_timer_back() {
        let monitor = HeartbeatMonitor::new();
        let (reports, report_receiver) = mpsc::sync_channel(4);
        monitor
            .start(ledger(1), Duration::from_millis(120), reports)
            .unwrap();

        let end = Instant::now() + Duration::from_millis(300);
        while Instant::now() < end {
            monitor.beat(&ledger(1)).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(report_receiver.try_recv().is_err());
        monitor.stop_all();
    }

    #[test]
    fn double_start_and_missing_ledger_are_rejected() {
        let monitor = HeartbeatMonitor::new();
        let (reports, _keep) = mpsc::sync_channel(1);
        monitor
            .start(ledger(1), Duration::from_secs(10), reports.clone())
            .unwrap();
        assert_eq!(
            monitor.start(ledger(1), Duration::from_secs(10), reports),
            Err(HeartbeatError::AlreadyRunning { ledger_id: ledger(1) })
        );
        assert_eq!(
            monitor.beat(&ledger(2)),
            Err(HeartbeatError::NotFound { ledger_id: ledger(2) })
        );
        monitor.stop_all();
        assert!(!monitor.exists(&ledger(1)));
    }

    #[test]
    fn full_report_channel_does_not_block_the_timer() {
        let monitor = HeartbeatMonitor::new();
        // Capacity 1 and nobody consuming: expiries beyond the first are dropped, and stop
        // still returns promptly.
        let (reports, _report_receiver) = mpsc::sync_channel(1);
        monitor
            .start(ledger(1), Duration::from_millis(10), reports)
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        monitor.stop(&ledger(1)).unwrap();
    }
}
