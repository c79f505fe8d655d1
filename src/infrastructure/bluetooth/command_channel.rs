//! One-slot command channel
//!
//! Holds at most one outbound payload. A newer payload replaces an unsent one;
//! the heartbeat loop takes it on its next tick. Payloads older than their
//! grace window are dropped unsent.

use crate::infrastructure::bluetooth::protocol::MachineCharacteristic;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// A payload waiting for the heartbeat loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub payload: Vec<u8>,
    pub characteristic: MachineCharacteristic,
    pub expires_at: Instant,
    /// Identifies this latch so completing it cannot clear a newer one
    pub sequence: u64,
}

#[derive(Default)]
struct Slot {
    pending: Option<PendingCommand>,
    next_sequence: u64,
}

/// Latest-value-wins slot
#[derive(Default)]
pub struct CommandSlot {
    slot: Mutex<Slot>,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latch `payload`, replacing anything unsent
    pub fn latch(
        &self,
        payload: Vec<u8>,
        characteristic: MachineCharacteristic,
        grace: Duration,
    ) -> u64 {
        let mut slot = self.slot();
        let sequence = slot.next_sequence;
        slot.next_sequence += 1;
        slot.pending = Some(PendingCommand {
            payload,
            characteristic,
            expires_at: Instant::now() + grace,
            sequence,
        });
        sequence
    }

    /// The pending command if it is still within its grace window.
    /// A stale command is discarded.
    pub fn peek_fresh(&self) -> Option<PendingCommand> {
        let mut slot = self.slot();
        match slot.pending.as_ref() {
            Some(pending) if Instant::now() < pending.expires_at => Some(pending.clone()),
            Some(pending) => {
                tracing::debug!(
                    "Dropping stale command for {:?}",
                    pending.characteristic
                );
                slot.pending = None;
                None
            }
            None => None,
        }
    }

    /// Clear the slot after a successful write, unless it was overwritten meanwhile
    pub fn complete(&self, sequence: u64) {
        let mut slot = self.slot();
        if slot.pending.as_ref().map(|p| p.sequence) == Some(sequence) {
            slot.pending = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot().pending.is_none()
    }
}
