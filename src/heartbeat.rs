//! Liveness probe bookkeeping for one connection.
//!
//! Each probe is a WebSocket ping carrying a monotonically increasing
//! sequence number (decimal text) as its payload. The matching pong cancels
//! that probe's grace timer; a probe left unanswered past the grace period
//! marks the connection dead. Probes are tracked independently, so a slow
//! but eventually responsive server can have several outstanding at once.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Per-connection probe state. Created with the connection, torn down with
/// it; never reused across reconnects.
pub(crate) struct HeartbeatMonitor {
    next_seq: u64,
    outstanding: HashMap<u64, Instant>,
    grace: Duration,
}

impl HeartbeatMonitor {
    pub(crate) fn new(grace: Duration) -> Self {
        Self {
            next_seq: 0,
            outstanding: HashMap::new(),
            grace,
        }
    }

    /// Start a probe: returns its sequence number and records its deadline.
    pub(crate) fn begin_probe(&mut self, now: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.outstanding.insert(seq, now + self.grace);
        seq
    }

    /// Ping payload for a probe sequence number.
    pub(crate) fn probe_payload(seq: u64) -> Vec<u8> {
        seq.to_string().into_bytes()
    }

    /// Handle a pong payload. Returns `true` when it matched an outstanding
    /// probe and cancelled its timer.
    pub(crate) fn ack(&mut self, payload: &[u8]) -> bool {
        std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .is_some_and(|seq| self.outstanding.remove(&seq).is_some())
    }

    /// Earliest outstanding-probe deadline, if any probe is in flight.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().min().copied()
    }

    /// Remove and return a probe whose deadline has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Option<u64> {
        let seq = self
            .outstanding
            .iter()
            .find(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)?;
        let _ = self.outstanding.remove(&seq);
        Some(seq)
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
