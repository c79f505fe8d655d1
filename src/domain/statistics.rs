//! Statistics pages
//!
//! ```text
//! Product counters      : 3-byte big-endian chunks; [0] total, [i] product with code i
//! Maintenance counters  : 3-byte big-endian chunks, one per counter label
//! Maintenance percents  : 1 byte per label; 0xFF = 100% left, n <= 100 = (100 - n)% left
//! ```
//!
//! Every page is sanity checked; a page that fails aborts the whole update.

use crate::domain::catalog::MachineCatalog;
use crate::error::ImplausibleData;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Totals above this are treated as garbage
pub const MAX_PLAUSIBLE_TOTAL: u32 = 1_000_000;
/// Maintenance counters may not sum to more than this multiple of the total
pub const MAINTENANCE_TOTAL_FACTOR: u64 = 5;

/// Counter value the machine reports for "never"
const EMPTY_COUNTER: u32 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Statistics {
    pub total_products: Option<u32>,
    pub product_counts: BTreeMap<String, u32>,
    pub maintenance_counters: BTreeMap<String, u32>,
    /// Percent remaining until the maintenance is due
    pub maintenance_percents: BTreeMap<String, u8>,
}

/// Split a page into 3-byte big-endian counters. A trailing partial chunk is ignored.
pub fn decode_counters(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(3)
        .map(|chunk| {
            let count = u32::from_be_bytes([0, chunk[0], chunk[1], chunk[2]]);
            if count == EMPTY_COUNTER {
                0
            } else {
                count
            }
        })
        .collect()
}

/// Raw percent byte to percent remaining; `None` when out of range
pub fn decode_percent(raw: u8) -> Option<u8> {
    match raw {
        0xFF => Some(100),
        0..=100 => Some(100 - raw),
        _ => None,
    }
}

/// Total and per-product counts from the product counter page
pub fn decode_product_counters(
    catalog: &MachineCatalog,
    data: &[u8],
) -> Result<(u32, BTreeMap<String, u32>), ImplausibleData> {
    let counters = decode_counters(data);
    let Some(&total) = counters.first() else {
        return Err(ImplausibleData::Empty);
    };
    if total == 0 || total > MAX_PLAUSIBLE_TOTAL {
        return Err(ImplausibleData::TotalOutOfRange(total));
    }

    let mut counts = BTreeMap::new();
    for (position, count) in counters.iter().enumerate().skip(1) {
        let product = u8::try_from(position)
            .ok()
            .and_then(|code| catalog.product_by_code(code));
        match product {
            Some(product) => {
                debug!("Stat entry: position {} = {} -> {}", position, count, product.name);
                counts.insert(product.name.clone(), *count);
            }
            None => debug!("No product for code {} with count {}", position, count),
        }
    }

    Ok((total, counts))
}

/// Maintenance counters keyed by label; their sum is checked against `total`
pub fn decode_maintenance_counters(
    labels: &[String],
    data: &[u8],
    total: u32,
) -> Result<BTreeMap<String, u32>, ImplausibleData> {
    let counters = decode_counters(data);
    let counts: BTreeMap<String, u32> = labels
        .iter()
        .cloned()
        .zip(counters.iter().copied())
        .collect();

    let sum: u64 = counts.values().map(|c| u64::from(*c)).sum();
    if sum > MAINTENANCE_TOTAL_FACTOR * u64::from(total) {
        return Err(ImplausibleData::MaintenanceExceedsTotal { sum, total });
    }

    Ok(counts)
}

pub fn decode_maintenance_percents(
    labels: &[String],
    data: &[u8],
) -> Result<BTreeMap<String, u8>, ImplausibleData> {
    labels
        .iter()
        .zip(data.iter())
        .enumerate()
        .map(|(index, (label, raw))| {
            decode_percent(*raw)
                .map(|percent| (label.clone(), percent))
                .ok_or(ImplausibleData::PercentOutOfRange { index, raw: *raw })
        })
        .collect()
}
