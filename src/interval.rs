//! Named periodic frames. A client registers a frame body under a string id
//! and the gateway replays it on its period until stopped. Missed windows
//! are not compensated: a frame that should have gone out three times during
//! a stall goes out once.

use std::time::Duration;

use crate::bus::{CanBus, TxStatus};
use crate::Frame;

struct IntervalFrame {
    id: String,
    frame: Frame,
    period_ms: u64,
    last_send_ms: u64,
}

#[derive(Default)]
pub struct IntervalManager {
    entries: Vec<IntervalFrame>,
}

impl IntervalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id: restarting an interval swaps the body and
    /// resets its phase, leaving exactly one entry.
    pub fn start(&mut self, id: &str, frame: Frame, period_ms: u64) {
        self.entries.retain(|e| e.id != id);
        self.entries.push(IntervalFrame {
            id: id.to_owned(),
            frame,
            period_ms: period_ms.max(1),
            last_send_ms: 0,
        });
    }

    /// Remove all entries with this id. Idempotent.
    pub fn stop(&mut self, id: &str) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Transmit every due entry. `last_send` moves to `now` even when the
    /// window was missed by a lot - no catch-up bursts.
    pub fn send_due(&mut self, bus: &mut dyn CanBus, now_ms: u64) {
        for entry in &mut self.entries {
            if entry.last_send_ms != 0
                && now_ms.saturating_sub(entry.last_send_ms) < entry.period_ms
            {
                continue;
            }
            match bus.transmit(&entry.frame, Duration::ZERO) {
                TxStatus::Sent => entry.last_send_ms = now_ms,
                TxStatus::Busy | TxStatus::Timeout => {
                    log::warn!("interval {} delayed, TX queue full", entry.id);
                    // do not move last_send: retry next tick
                }
            }
        }
    }
}
