//! Machine catalog: products, their configurable attributes, alert bits and
//! maintenance labels for one machine model.

use std::collections::BTreeMap;

/// Attributes the start-product command knows how to encode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeKind {
    GrinderRatio,
    CoffeeStrength,
    Temperature,
    WaterAmount,
    MilkAmount,
    MilkFoamAmount,
    Bypass,
    MilkBreak,
    /// Any other element carrying an `Argument`; kept for display only
    Other(String),
}

impl AttributeKind {
    /// Map an XML element name (e.g. `COFFEE_STRENGTH`)
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_uppercase().as_str() {
            "GRINDER_RATIO" => Self::GrinderRatio,
            "COFFEE_STRENGTH" => Self::CoffeeStrength,
            "TEMPERATURE" => Self::Temperature,
            "WATER_AMOUNT" => Self::WaterAmount,
            "MILK_AMOUNT" => Self::MilkAmount,
            "MILK_FOAM_AMOUNT" => Self::MilkFoamAmount,
            "BYPASS" => Self::Bypass,
            "MILK_BREAK" => Self::MilkBreak,
            _ => Self::Other(tag.to_string()),
        }
    }

    /// Lowercase identifier, e.g. `water_amount`
    pub fn key(&self) -> String {
        match self {
            Self::GrinderRatio => "grinder_ratio".to_string(),
            Self::CoffeeStrength => "coffee_strength".to_string(),
            Self::Temperature => "temperature".to_string(),
            Self::WaterAmount => "water_amount".to_string(),
            Self::MilkAmount => "milk_amount".to_string(),
            Self::MilkFoamAmount => "milk_foam_amount".to_string(),
            Self::Bypass => "bypass".to_string(),
            Self::MilkBreak => "milk_break".to_string(),
            Self::Other(tag) => tag.to_ascii_lowercase(),
        }
    }

    /// Whether the start-product command encodes this attribute
    pub fn is_encoded(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// One choice of an enumerated attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeOption {
    pub name: String,
    pub value: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeShape {
    Numeric {
        min: u32,
        max: u32,
        /// Command byte is `value / step`; zero means unscaled
        step: u32,
        default: u32,
    },
    Options {
        default: u8,
        items: Vec<AttributeOption>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: AttributeKind,
    /// Byte offset in the start-product command
    pub argument: usize,
    pub shape: AttributeShape,
}

impl Attribute {
    pub fn option_by_name(&self, name: &str) -> Option<&AttributeOption> {
        match &self.shape {
            AttributeShape::Options { items, .. } => items.iter().find(|i| i.name == name),
            AttributeShape::Numeric { .. } => None,
        }
    }

    pub fn option_by_value(&self, value: u8) -> Option<&AttributeOption> {
        match &self.shape {
            AttributeShape::Options { items, .. } => items.iter().find(|i| i.value == value),
            AttributeShape::Numeric { .. } => None,
        }
    }

    /// Raw value used when the user has not overridden it
    pub fn default_value(&self) -> u32 {
        match &self.shape {
            AttributeShape::Numeric { default, .. } => *default,
            AttributeShape::Options { default, .. } => u32::from(*default),
        }
    }

    /// Command byte for `value`, scaled by the step of numeric attributes
    pub fn encode(&self, value: u32) -> Option<u8> {
        let scaled = match &self.shape {
            AttributeShape::Numeric { step, .. } if *step != 0 => value / step,
            _ => value,
        };
        u8::try_from(scaled).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub name: String,
    pub code: u8,
    pub active: bool,
    pub attributes: BTreeMap<AttributeKind, Attribute>,
}

impl Product {
    pub fn attribute(&self, kind: &AttributeKind) -> Option<&Attribute> {
        self.attributes.get(kind)
    }
}

/// Static metadata for one machine model
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineCatalog {
    pub model: String,
    pub products: Vec<Product>,
    pub alerts: BTreeMap<u16, String>,
    pub maintenance_counters: Vec<String>,
    pub maintenance_percents: Vec<String>,
}

impl MachineCatalog {
    pub fn product(&self, name: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.name == name)
    }

    pub fn product_by_code(&self, code: u8) -> Option<&Product> {
        self.products.iter().find(|p| p.code == code)
    }

    pub fn active_products(&self) -> impl Iterator<Item = &Product> {
        self.products.iter().filter(|p| p.active)
    }

    pub fn alert_name(&self, bit: u16) -> String {
        self.alerts
            .get(&bit)
            .cloned()
            .unwrap_or_else(|| format!("unknown alert {}", bit))
    }

    /// Attribute kinds used by any product, first-seen order
    fn kinds(&self, enumerated: bool) -> Vec<AttributeKind> {
        let mut kinds: Vec<AttributeKind> = Vec::new();
        for attribute in self.products.iter().flat_map(|p| p.attributes.values()) {
            let is_options = matches!(attribute.shape, AttributeShape::Options { .. });
            if is_options == enumerated && !kinds.contains(&attribute.kind) {
                kinds.push(attribute.kind.clone());
            }
        }
        kinds
    }

    /// Enumerated attribute kinds present in the catalog
    pub fn select_kinds(&self) -> Vec<AttributeKind> {
        self.kinds(true)
    }

    /// Numeric attribute kinds present in the catalog
    pub fn number_kinds(&self) -> Vec<AttributeKind> {
        self.kinds(false)
    }

    /// Unique option names for `kind` across all products, first-seen order
    pub fn options_for(&self, kind: &AttributeKind) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for attribute in self.products.iter().filter_map(|p| p.attribute(kind)) {
            if let AttributeShape::Options { items, .. } = &attribute.shape {
                for item in items {
                    if !names.contains(&item.name) {
                        names.push(item.name.clone());
                    }
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strength() -> Attribute {
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
        }
    }

    fn water() -> Attribute {
        Attribute {
            kind: AttributeKind::WaterAmount,
            argument: 4,
            shape: AttributeShape::Numeric { min: 25, max: 240, step: 5, default: 45 },
        }
    }

    #[test]
    fn test_attribute_kind_from_tag() {
        assert_eq!(AttributeKind::from_tag("MILK_FOAM_AMOUNT"), AttributeKind::MilkFoamAmount);
        assert_eq!(
            AttributeKind::from_tag("STROKE"),
            AttributeKind::Other("STROKE".to_string())
        );
        assert_eq!(AttributeKind::Other("STROKE".into()).key(), "stroke");
    }

    #[test]
    fn test_encode_scales_by_step() {
        assert_eq!(water().encode(45), Some(9));
        assert_eq!(water().encode(240), Some(48));
        assert_eq!(strength().encode(0x03), Some(0x03));
        assert_eq!(strength().encode(300), None);
    }

    #[test]
    fn test_catalog_views() {
        let product = |name: &str, code: u8, active: bool| Product {
            name: name.to_string(),
            code,
            active,
            attributes: [strength(), water()]
                .into_iter()
                .map(|a| (a.kind.clone(), a))
                .collect(),
        };
        let catalog = MachineCatalog {
            model: "E8".into(),
            products: vec![product("Espresso", 2, true), product("Hidden", 9, false)],
            ..Default::default()
        };

        let active: Vec<_> = catalog.active_products().map(|p| p.name.as_str()).collect();
        assert_eq!(active, vec!["Espresso"]);
        assert_eq!(catalog.select_kinds(), vec![AttributeKind::CoffeeStrength]);
        assert_eq!(catalog.number_kinds(), vec![AttributeKind::WaterAmount]);
        assert_eq!(
            catalog.options_for(&AttributeKind::CoffeeStrength),
            vec!["mild".to_string(), "strong".to_string()]
        );
        assert_eq!(catalog.product_by_code(9).unwrap().name, "Hidden");
        assert_eq!(catalog.alert_name(7), "unknown alert 7");
    }
}
