//! Scripted in-memory link
//!
//! Stands in for a machine in tests and offline runs. Reads replay queued
//! responses per characteristic, falling back to a sticky value; writes are
//! recorded with the (tokio) time they happened.

use crate::error::LinkError;
use crate::infrastructure::bluetooth::link::GattLink;
use crate::infrastructure::bluetooth::protocol::MachineCharacteristic;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// A write observed by the fake
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub characteristic: MachineCharacteristic,
    /// Bytes as sent on the wire (encrypted)
    pub data: Vec<u8>,
    pub at: Instant,
}

#[derive(Default)]
struct FakeState {
    connected: bool,
    connects: usize,
    disconnects: usize,
    failing_connects: usize,
    failing_writes: HashSet<MachineCharacteristic>,
    queued: HashMap<MachineCharacteristic, VecDeque<Option<Vec<u8>>>>,
    sticky: HashMap<MachineCharacteristic, Vec<u8>>,
    writes: Vec<RecordedWrite>,
    reads: usize,
}

#[derive(Default)]
pub struct FakeLink {
    address: String,
    state: Mutex<FakeState>,
}

impl FakeLink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue one read response (raw wire bytes)
    pub fn push_read(&self, characteristic: MachineCharacteristic, data: Vec<u8>) {
        self.state()
            .queued
            .entry(characteristic)
            .or_default()
            .push_back(Some(data));
    }

    /// Queue one failing read
    pub fn push_read_error(&self, characteristic: MachineCharacteristic) {
        self.state()
            .queued
            .entry(characteristic)
            .or_default()
            .push_back(None);
    }

    /// Response returned once the queue is drained
    pub fn set_read(&self, characteristic: MachineCharacteristic, data: Vec<u8>) {
        self.state().sticky.insert(characteristic, data);
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_connects(&self, count: usize) {
        self.state().failing_connects = count;
    }

    pub fn fail_writes(&self, characteristic: MachineCharacteristic, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_writes.insert(characteristic);
        } else {
            state.failing_writes.remove(&characteristic);
        }
    }

    /// Drop the link as if the machine went out of range
    pub fn drop_link(&self) {
        self.state().connected = false;
    }

    pub fn writes_to(&self, characteristic: MachineCharacteristic) -> Vec<RecordedWrite> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.characteristic == characteristic)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[async_trait]
impl GattLink for FakeLink {
    async fn connect(&self) -> Result<(), LinkError> {
        let mut state = self.state();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(LinkError::Disconnected);
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut state = self.state();
        state.disconnects += 1;
        state.connected = false;
        Ok(())
    }

    async fn read(&self, characteristic: MachineCharacteristic) -> Result<Vec<u8>, LinkError> {
        let mut state = self.state();
        state.reads += 1;
        if !state.connected {
            return Err(LinkError::NotConnected);
        }

        let queued = state
            .queued
            .get_mut(&characteristic)
            .and_then(|queue| queue.pop_front());
        match queued {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(LinkError::Disconnected),
            None => state
                .sticky
                .get(&characteristic)
                .cloned()
                .ok_or(LinkError::CharacteristicNotFound(characteristic.uuid())),
        }
    }

    async fn write(
        &self,
        characteristic: MachineCharacteristic,
        data: &[u8],
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if state.failing_writes.contains(&characteristic) {
            return Err(LinkError::Disconnected);
        }
        state.writes.push(RecordedWrite {
            characteristic,
            data: data.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}
