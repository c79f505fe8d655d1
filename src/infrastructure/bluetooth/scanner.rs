//! BLE Scanner Module
//!
//! Finds a Jura machine by its manufacturer data. The payload under
//! [`MANUFACTURER_ID`] is the advertisement the catalog resolver works on.

use crate::infrastructure::bluetooth::protocol::MANUFACTURER_ID;
use anyhow::Result;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A machine seen during the scan
#[derive(Debug, Clone)]
pub struct ScannedMachine {
    pub peripheral: Peripheral,
    pub name: String,
    pub address: String,
    /// Raw manufacturer payload (key, model id, ...)
    pub advertisement: Vec<u8>,
    pub rssi: Option<i16>,
}

/// The Jura payload among a peripheral's manufacturer data, if any
pub fn jura_payload(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<&[u8]> {
    manufacturer_data.get(&MANUFACTURER_ID).map(Vec::as_slice)
}

/// Whether `address` is the configured target (case-insensitive), or any
/// address when no target is configured
pub fn matches_target(address: &str, target: Option<&str>) -> bool {
    target.map_or(true, |t| address.eq_ignore_ascii_case(t.trim()))
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))
}

/// Scan until a Jura machine (optionally at `target`) shows up or `timeout`
/// passes
pub async fn find_machine(
    adapter: &Adapter,
    target: Option<&str>,
    timeout: Duration,
) -> Result<ScannedMachine> {
    info!("Scanning for Jura machines ({:?})", target);
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = Instant::now() + timeout;
    let found = loop {
        if let Some(machine) = scan_once(adapter, target).await? {
            break Some(machine);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    };

    adapter.stop_scan().await?;
    found.ok_or_else(|| anyhow::anyhow!("No Jura machine found within {:?}", timeout))
}

async fn scan_once(adapter: &Adapter, target: Option<&str>) -> Result<Option<ScannedMachine>> {
    for peripheral in adapter.peripherals().await? {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        let address = peripheral.address().to_string();
        if !matches_target(&address, target) {
            continue;
        }
        let Some(payload) = jura_payload(&props.manufacturer_data) else {
            continue;
        };

        let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
        debug!("Found {} at {} (rssi {:?})", name, address, props.rssi);
        return Ok(Some(ScannedMachine {
            advertisement: payload.to_vec(),
            peripheral,
            name,
            address,
            rssi: props.rssi,
        }));
    }
    Ok(None)
}

/// Latest advertisement and signal strength of an already found machine
pub async fn refresh_advertisement(peripheral: &Peripheral) -> Result<Option<(Vec<u8>, Option<i16>)>> {
    let Some(props) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(jura_payload(&props.manufacturer_data).map(|payload| (payload.to_vec(), props.rssi)))
}
