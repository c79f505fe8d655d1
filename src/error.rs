//! Error types shared across the driver.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from resolving an advertisement to a machine catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The machine advertises model id 0 (no profile selected yet).
    #[error("advertisement carries no model id")]
    EmptyModel,

    #[error("unsupported model id {0}")]
    UnsupportedModel(u16),

    #[error("advertisement too short ({len} bytes, minimum 6)")]
    AdvertisementTooShort { len: usize },

    #[error("no catalog document for category {category}")]
    MissingDocument { category: String },

    #[error("malformed machine index line: {line}")]
    MalformedIndex { line: String },

    #[error("catalog document has no products")]
    NoProducts,

    #[error("catalog archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog XML error: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// Transport failures on the GATT link.
///
/// These never escape the connection manager except as a connectivity change.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("link operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("link closed by device")]
    Disconnected,
}

/// Statistics that failed a sanity check.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImplausibleData {
    #[error("statistics page is empty")]
    Empty,

    #[error("total product count {0} out of range")]
    TotalOutOfRange(u32),

    #[error("maintenance counter sum {sum} exceeds 5x total {total}")]
    MaintenanceExceedsTotal { sum: u64, total: u32 },

    #[error("maintenance percent {raw} at index {index} out of range")]
    PercentOutOfRange { index: usize, raw: u8 },
}

/// Reasons a periodic read produced no new data.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no link within {0:?}")]
    NoLink(Duration),

    #[error("device not ready after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("status frame too short ({len} bytes)")]
    ShortFrame { len: usize },

    #[error(transparent)]
    Implausible(#[from] ImplausibleData),
}
