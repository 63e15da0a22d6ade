//! Wake Delivery
//!
//! Closing a gate sends a wake signal to each waiter. Delivery is
//! at-least-once and may race a waiter that is not listening, so a signal is
//! only a hint to go and re-read the gate; the gate's persisted status is
//! what counts.

use log::{info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// One wake notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeSignal {
    pub gate_id: String,
    pub waiter: String,
}

/// Receives wake notifications for closed gates.
pub trait WakeSink: Send + Sync {
    fn wake(&self, gate_id: &str, waiter: &str);
}

/// Logs each wake; useful where waiters poll the ledger anyway.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWake;

impl WakeSink for LogWake {
    fn wake(&self, gate_id: &str, waiter: &str) {
        info!("Wake {} (gate {} closed)", waiter, gate_id);
    }
}

/// Forwards wakes over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelWake {
    tx: UnboundedSender<WakeSignal>,
}

impl ChannelWake {
    pub fn new() -> (Self, UnboundedReceiver<WakeSignal>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl WakeSink for ChannelWake {
    fn wake(&self, gate_id: &str, waiter: &str) {
        let signal = WakeSignal {
            gate_id: gate_id.to_string(),
            waiter: waiter.to_string(),
        };
        if self.tx.send(signal).is_err() {
            // Receiver gone: the waiter will see the closed gate on its next read
            warn!("No listener for wake of {} on gate {}", waiter, gate_id);
        }
    }
}
