//! Jura BLE Protocol
//!
//! Characteristic UUIDs, fixed request frames and advertisement parsing.
//! See <https://github.com/Jutta-Proto/protocol-bt-cpp> for the reverse
//! engineered protocol notes.

use crate::error::CatalogError;
use crate::infrastructure::bluetooth::encryption::EncryptionKey;
use uuid::Uuid;

/// Bluetooth SIG company identifier the machines advertise under.
pub const MANUFACTURER_ID: u16 = 0x00AB;

/// Start product command
pub const START_PRODUCT_UUID: Uuid = Uuid::from_u128(0x5a401525_ab2e_2548_c435_08c300000710);
/// Heartbeat / p-mode
pub const P_MODE_UUID: Uuid = Uuid::from_u128(0x5a401529_ab2e_2548_c435_08c300000710);
/// Statistics request and readiness flag
pub const STATS_COMMAND_UUID: Uuid = Uuid::from_u128(0x5a401533_ab2e_2548_c435_08c300000710);
/// Statistics result page
pub const STATS_DATA_UUID: Uuid = Uuid::from_u128(0x5a401534_ab2e_2548_c435_08c300000710);
/// Machine status bitfield
pub const MACHINE_STATUS_UUID: Uuid = Uuid::from_u128(0x5a401524_ab2e_2548_c435_08c300000710);

/// GATT characteristics used by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineCharacteristic {
    StartProduct,
    Heartbeat,
    StatisticsCommand,
    StatisticsData,
    MachineStatus,
}

impl MachineCharacteristic {
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::StartProduct => START_PRODUCT_UUID,
            Self::Heartbeat => P_MODE_UUID,
            Self::StatisticsCommand => STATS_COMMAND_UUID,
            Self::StatisticsData => STATS_DATA_UUID,
            Self::MachineStatus => MACHINE_STATUS_UUID,
        }
    }
}

/// Dummy write that keeps the link from idling out. Byte 0 becomes the key.
pub const HEARTBEAT_FRAME: [u8; 3] = [0x00, 0x7F, 0x80];

/// Length of the start product command
pub const COMMAND_LEN: usize = 18;

/// Decrypted statistics command byte 1 reads this while the page is being prepared
pub const STATS_NOT_READY: u8 = 0xE1;
/// Offset of the readiness byte in the statistics command characteristic
pub const STATS_READY_OFFSET: usize = 1;

/// Statistics pages the machine can return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsPage {
    ProductCounters,
    MaintenanceCounters,
    MaintenancePercents,
}

impl StatisticsPage {
    /// Request frame written to the statistics command characteristic
    pub fn request(&self) -> [u8; 5] {
        let selector = match self {
            Self::ProductCounters => 0x01,
            Self::MaintenanceCounters => 0x04,
            Self::MaintenancePercents => 0x08,
        };
        [0x00, 0x00, selector, 0xFF, 0xFF]
    }
}

/// Fields of interest from the manufacturer data payload.
///
/// ```text
/// [0]   : Encryption key
/// [1-3] : Unmodeled
/// [4-5] : Model id (u16 little-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub key: EncryptionKey,
    pub model_id: u16,
}

impl Advertisement {
    pub fn parse(data: &[u8]) -> Result<Self, CatalogError> {
        if data.len() < 6 {
            return Err(CatalogError::AdvertisementTooShort { len: data.len() });
        }

        Ok(Self {
            key: EncryptionKey(data[0]),
            model_id: u16::from_le_bytes([data[4], data[5]]),
        })
    }
}
