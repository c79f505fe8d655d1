//! GATT Link
//!
//! The physical link to one machine. [`BtleplugLink`] drives a real
//! peripheral; tests use [`super::fake::FakeLink`].

use crate::error::LinkError;
use crate::infrastructure::bluetooth::protocol::MachineCharacteristic;
use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Raw (unencrypted) access to the machine's characteristics
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Establish the connection and discover characteristics
    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    async fn read(&self, characteristic: MachineCharacteristic) -> Result<Vec<u8>, LinkError>;

    /// Write with response
    async fn write(
        &self,
        characteristic: MachineCharacteristic,
        data: &[u8],
    ) -> Result<(), LinkError>;

    /// Device address for connection metadata
    fn address(&self) -> String;
}

/// `btleplug` backed link
pub struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
}

impl BtleplugLink {
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Mutex::new(HashMap::new()),
        }
    }

    fn characteristic(&self, target: MachineCharacteristic) -> Result<Characteristic, LinkError> {
        let uuid = target.uuid();
        let cache = self
            .characteristics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .get(&uuid)
            .cloned()
            .ok_or(LinkError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn connect(&self) -> Result<(), LinkError> {
        if !self.peripheral.is_connected().await? {
            info!("Connecting to machine {}", self.peripheral.address());
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;

        let discovered: HashMap<Uuid, Characteristic> = self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!("Discovered {} characteristics", discovered.len());

        *self
            .characteristics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = discovered;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn read(&self, characteristic: MachineCharacteristic) -> Result<Vec<u8>, LinkError> {
        let c = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(
        &self,
        characteristic: MachineCharacteristic,
        data: &[u8],
    ) -> Result<(), LinkError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .write(&c, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }
}
