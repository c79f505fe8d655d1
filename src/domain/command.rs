//! Start-product command
//!
//! ```text
//! [0]     : Overwritten with the key on encryption
//! [1]     : Product code
//! [2-16]  : Attribute bytes at each attribute's `Argument` offset
//!           (unlisted offsets are unmodeled protocol fields, left zero)
//! [17]    : Key again; without it the machine ends up half-configured
//! ```

use crate::domain::catalog::{AttributeKind, Product};
use crate::infrastructure::bluetooth::encryption::EncryptionKey;
use crate::infrastructure::bluetooth::protocol::COMMAND_LEN;
use std::collections::HashMap;
use tracing::warn;

/// Attribute values the user changed for the current product
pub type Overrides = HashMap<AttributeKind, u32>;

pub fn build_command(
    product: &Product,
    overrides: &Overrides,
    key: EncryptionKey,
) -> [u8; COMMAND_LEN] {
    let mut data = [0u8; COMMAND_LEN];
    data[1] = product.code;

    for attribute in product.attributes.values() {
        if !attribute.kind.is_encoded() {
            continue;
        }
        // byte 1 and the trailing key byte are reserved
        if attribute.argument < 2 || attribute.argument >= COMMAND_LEN - 1 {
            warn!(
                "{} of {} has unusable offset {}",
                attribute.kind.key(),
                product.name,
                attribute.argument
            );
            continue;
        }

        let value = overrides
            .get(&attribute.kind)
            .copied()
            .unwrap_or_else(|| attribute.default_value());
        match attribute.encode(value) {
            Some(byte) => data[attribute.argument] = byte,
            None => warn!(
                "{} value {} does not fit the command",
                attribute.kind.key(),
                value
            ),
        }
    }

    data[COMMAND_LEN - 1] = key.byte();
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::{Attribute, AttributeOption, AttributeShape};
    use std::collections::BTreeMap;

    fn latte() -> Product {
        let attributes = vec![
            Attribute {
                kind: AttributeKind::CoffeeStrength,
                argument: 3,
                shape: AttributeShape::Options {
                    default: 0x04,
                    items: vec![
                        AttributeOption { name: "mild".into(), value: 0x03 },
                        AttributeOption { name: "strong".into(), value: 0x04 },
                    ],
                },
            },
            Attribute {
                kind: AttributeKind::WaterAmount,
                argument: 4,
                shape: AttributeShape::Numeric { min: 25, max: 240, step: 5, default: 45 },
            },
            Attribute {
                kind: AttributeKind::MilkAmount,
                argument: 5,
                shape: AttributeShape::Numeric { min: 0, max: 120, step: 0, default: 14 },
            },
            Attribute {
                kind: AttributeKind::Other("STROKE".into()),
                argument: 9,
                shape: AttributeShape::Numeric { min: 0, max: 3, step: 1, default: 2 },
            },
        ];

        Product {
            name: "Latte".into(),
            code: 0x0B,
            active: true,
            attributes: attributes
                .into_iter()
                .map(|a| (a.kind.clone(), a))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_defaults() {
        let command = build_command(&latte(), &Overrides::new(), EncryptionKey(0x2A));

        let mut expected = [0u8; COMMAND_LEN];
        expected[1] = 0x0B;
        expected[3] = 0x04;
        expected[4] = 9;
        expected[5] = 14;
        expected[17] = 0x2A;
        assert_eq!(command, expected);
    }

    #[test]
    fn test_override_changes_only_its_byte() {
        let key = EncryptionKey(0x2A);
        let defaults = build_command(&latte(), &Overrides::new(), key);

        let mut overrides = Overrides::new();
        overrides.insert(AttributeKind::WaterAmount, 100);
        let command = build_command(&latte(), &overrides, key);

        for i in 0..COMMAND_LEN {
            if i == 4 {
                assert_eq!(command[i], 20);
            } else {
                assert_eq!(command[i], defaults[i], "byte {}", i);
            }
        }
    }

    #[test]
    fn test_reserved_offsets_are_protected() {
        let mut product = latte();
        product.attributes.insert(
            AttributeKind::Bypass,
            Attribute {
                kind: AttributeKind::Bypass,
                argument: 17,
                shape: AttributeShape::Numeric { min: 0, max: 255, step: 0, default: 99 },
            },
        );

        let command = build_command(&product, &Overrides::new(), EncryptionKey(0x2A));
        assert_eq!(command[17], 0x2A);
    }
}
