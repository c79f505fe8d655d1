//! Machine status bits
//!
//! Byte 0 of the status frame is not part of the bit field. Bit `i` lives in
//! byte `(i / 8) + 1`, most significant bit first.

use crate::domain::catalog::MachineCatalog;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Active alerts keyed by bit position
pub type ActiveAlerts = BTreeMap<u16, String>;

/// Bits that are informational on every known model
pub const DEFAULT_IGNORED_BITS: [u16; 8] = [12, 13, 36, 37, 148, 149, 150, 151];

pub fn is_bit_set(data: &[u8], bit: u16) -> bool {
    let index = usize::from(bit >> 3) + 1;
    data.get(index)
        .map(|byte| (byte >> (7 - (bit & 7))) & 1 == 1)
        .unwrap_or(false)
}

/// Every set bit of the status frame, named through the catalog
pub fn decode_alerts(data: &[u8], catalog: &MachineCatalog) -> ActiveAlerts {
    let bit_count = data.len().saturating_sub(1).saturating_mul(8);
    let bit_count = u16::try_from(bit_count).unwrap_or(u16::MAX);

    (0..bit_count)
        .filter(|bit| is_bit_set(data, *bit))
        .map(|bit| (bit, catalog.alert_name(bit)))
        .collect()
}

/// Which alerts count as problems worth surfacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub ignored_bits: BTreeSet<u16>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            ignored_bits: DEFAULT_IGNORED_BITS.into_iter().collect(),
        }
    }
}

impl AlertPolicy {
    pub fn is_problem(&self, bit: u16) -> bool {
        !self.ignored_bits.contains(&bit)
    }

    pub fn problems(&self, alerts: &ActiveAlerts) -> ActiveAlerts {
        alerts
            .iter()
            .filter(|(bit, _)| self.is_problem(**bit))
            .map(|(bit, name)| (*bit, name.clone()))
            .collect()
    }
}
