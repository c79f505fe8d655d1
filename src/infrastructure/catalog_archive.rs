//! Catalog archive
//!
//! Resolves an advertisement to the machine catalog of its model.
//!
//! ```text
//! JOE_MACHINES.TXT                   model_id;model_name;category
//! documents/xml/<CATEGORY>/*.xml     JOE document for every model in the category
//! ```
//!
//! Products are required. Alerts and maintenance sections are best effort and
//! come back empty when missing or malformed.

use crate::domain::catalog::{
    Attribute, AttributeKind, AttributeOption, AttributeShape, MachineCatalog, Product,
};
use crate::error::CatalogError;
use crate::infrastructure::bluetooth::encryption::EncryptionKey;
use crate::infrastructure::bluetooth::protocol::Advertisement;
use roxmltree::{Document, Node};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zip::ZipArchive;

pub const MACHINE_INDEX: &str = "JOE_MACHINES.TXT";
const DOCUMENT_ROOT: &str = "documents/xml";

/// Maintenance page command listing the maintenance counters
const MAINTENANCE_COUNTERS_COMMAND: &str = "@TG:43";
/// Maintenance page command listing the maintenance percentages
const MAINTENANCE_PERCENTS_COMMAND: &str = "@TG:C0";

/// Read access to the raw catalog files
pub trait CatalogSource: Send {
    fn machine_index(&mut self) -> Result<String, CatalogError>;

    /// The document describing every machine of `category`
    fn category_document(&mut self, category: &str) -> Result<String, CatalogError>;
}

/// Catalog files inside a zip archive
pub struct ZipCatalog<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl ZipCatalog<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let file = File::open(path.as_ref())?;
        Self::new(file)
    }
}

impl<R: Read + Seek> ZipCatalog<R> {
    pub fn new(reader: R) -> Result<Self, CatalogError> {
        Ok(Self {
            archive: ZipArchive::new(reader)?,
        })
    }

    fn read_entry(&mut self, name: &str) -> Result<String, CatalogError> {
        let mut entry = self.archive.by_name(name)?;
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl<R: Read + Seek + Send> CatalogSource for ZipCatalog<R> {
    fn machine_index(&mut self) -> Result<String, CatalogError> {
        self.read_entry(MACHINE_INDEX)
    }

    fn category_document(&mut self, category: &str) -> Result<String, CatalogError> {
        let directory = format!("{}/{}/", DOCUMENT_ROOT, category.to_uppercase());
        let name = self
            .archive
            .file_names()
            .find(|name| name.starts_with(&directory) && name.ends_with(".xml"))
            .map(str::to_string)
            .ok_or_else(|| CatalogError::MissingDocument {
                category: category.to_string(),
            })?;

        debug!("Using catalog document {}", name);
        self.read_entry(&name)
    }
}

/// Catalog files held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    index: String,
    documents: HashMap<String, String>,
}

impl MemoryCatalog {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            documents: HashMap::new(),
        }
    }

    pub fn with_document(mut self, category: &str, xml: impl Into<String>) -> Self {
        self.documents.insert(category.to_uppercase(), xml.into());
        self
    }
}

impl CatalogSource for MemoryCatalog {
    fn machine_index(&mut self) -> Result<String, CatalogError> {
        Ok(self.index.clone())
    }

    fn category_document(&mut self, category: &str) -> Result<String, CatalogError> {
        self.documents
            .get(&category.to_uppercase())
            .cloned()
            .ok_or_else(|| CatalogError::MissingDocument {
                category: category.to_string(),
            })
    }
}

/// One line of the machine index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub model_id: u16,
    pub model: String,
    pub category: String,
}

/// Find `model_id` in the index. The id field must match exactly.
pub fn find_index_entry(index: &str, model_id: u16) -> Result<IndexEntry, CatalogError> {
    let wanted = model_id.to_string();
    let line = index
        .lines()
        .find(|line| line.split(';').next().map(str::trim) == Some(wanted.as_str()))
        .ok_or(CatalogError::UnsupportedModel(model_id))?;

    let fields: Vec<&str> = line.split(';').map(str::trim).collect();
    if fields.len() < 3 || fields[2].is_empty() {
        return Err(CatalogError::MalformedIndex {
            line: line.to_string(),
        });
    }

    Ok(IndexEntry {
        model_id,
        model: fields[1].to_string(),
        category: fields[2].to_string(),
    })
}

fn hex_u8(value: &str) -> Option<u8> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u8::from_str_radix(digits, 16).ok()
}

fn decimal<T: std::str::FromStr>(node: Node, name: &str) -> Option<T> {
    node.attribute(name).and_then(|v| v.trim().parse().ok())
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
}

/// `Argument="F4"` is byte offset 4
fn parse_argument(value: &str) -> Option<usize> {
    value
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

fn parse_attribute(node: Node) -> Option<Attribute> {
    let argument = parse_argument(node.attribute("Argument")?)?;
    let kind = AttributeKind::from_tag(node.tag_name().name());

    let shape = if node.has_attribute("Value") {
        AttributeShape::Numeric {
            min: decimal(node, "Min").unwrap_or(0),
            max: decimal(node, "Max").unwrap_or(0),
            step: decimal(node, "Step").unwrap_or(0),
            default: decimal(node, "Value")?,
        }
    } else {
        let items = node
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "ITEM")
            .filter_map(|item| {
                Some(AttributeOption {
                    name: item.attribute("Name")?.to_string(),
                    value: hex_u8(item.attribute("Value")?)?,
                })
            })
            .collect();
        AttributeShape::Options {
            default: hex_u8(node.attribute("Default")?)?,
            items,
        }
    };

    Some(Attribute {
        kind,
        argument,
        shape,
    })
}

fn parse_product(node: Node) -> Option<Product> {
    let name = node.attribute("Name")?.to_string();
    let Some(code) = node.attribute("Code").and_then(hex_u8) else {
        warn!("Product {} has no usable code", name);
        return None;
    };

    let mut attributes = BTreeMap::new();
    for element in node.children().filter(|n| n.is_element()) {
        if !element.has_attribute("Argument") {
            continue;
        }
        match parse_attribute(element) {
            Some(attribute) => {
                attributes.insert(attribute.kind.clone(), attribute);
            }
            None => debug!(
                "Skipping malformed {} of {}",
                element.tag_name().name(),
                name
            ),
        }
    }

    Some(Product {
        name,
        code,
        active: node.attribute("Active") != Some("false"),
        attributes,
    })
}

fn parse_alerts(root: Node) -> BTreeMap<u16, String> {
    let Some(alerts) = child(root, "ALERTS") else {
        debug!("Catalog has no alert table");
        return BTreeMap::new();
    };

    alerts
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "ALERT")
        .filter_map(|alert| Some((decimal(alert, "Bit")?, alert.attribute("Name")?.to_string())))
        .collect()
}

fn parse_maintenance(root: Node, command: &str) -> Vec<String> {
    let Some(page) = child(root, "MAINTENANCEPAGE") else {
        return Vec::new();
    };

    page.children()
        .filter(|n| n.is_element() && n.attribute("Command") == Some(command))
        .flat_map(|section| section.children().filter(|n| n.is_element()))
        .map(|label| {
            label
                .attribute("Name")
                .map(str::to_string)
                .unwrap_or_else(|| label.tag_name().name().to_ascii_lowercase())
        })
        .collect()
}

/// Parse a category document into the catalog of `model`
pub fn parse_document(xml: &str, model: &str) -> Result<MachineCatalog, CatalogError> {
    let document = Document::parse(xml)?;
    let root = document.root_element();

    let products: Vec<Product> = child(root, "PRODUCTS")
        .map(|products| {
            products
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == "PRODUCT")
                .filter_map(parse_product)
                .collect()
        })
        .unwrap_or_default();
    if products.is_empty() {
        return Err(CatalogError::NoProducts);
    }

    Ok(MachineCatalog {
        model: model.to_string(),
        products,
        alerts: parse_alerts(root),
        maintenance_counters: parse_maintenance(root, MAINTENANCE_COUNTERS_COMMAND),
        maintenance_percents: parse_maintenance(root, MAINTENANCE_PERCENTS_COMMAND),
    })
}

/// A resolved machine: its catalog and the key from its advertisement
#[derive(Debug, Clone)]
pub struct ResolvedMachine {
    pub catalog: Arc<MachineCatalog>,
    pub key: EncryptionKey,
}

/// Resolves advertisements to catalogs, parsing each model once
pub struct CatalogResolver {
    source: Mutex<Box<dyn CatalogSource>>,
    cache: Mutex<HashMap<u16, Arc<MachineCatalog>>>,
}

impl CatalogResolver {
    pub fn new(source: impl CatalogSource + 'static) -> Self {
        Self {
            source: Mutex::new(Box::new(source)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn source(&self) -> MutexGuard<'_, Box<dyn CatalogSource>> {
        self.source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<u16, Arc<MachineCatalog>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn resolve(&self, advertisement: &[u8]) -> Result<ResolvedMachine, CatalogError> {
        let adv = Advertisement::parse(advertisement)?;
        if adv.model_id == 0 {
            return Err(CatalogError::EmptyModel);
        }

        let catalog = self.catalog(adv.model_id)?;
        Ok(ResolvedMachine {
            catalog,
            key: adv.key,
        })
    }

    pub fn catalog(&self, model_id: u16) -> Result<Arc<MachineCatalog>, CatalogError> {
        if let Some(catalog) = self.cache().get(&model_id) {
            return Ok(catalog.clone());
        }

        let catalog = {
            let mut source = self.source();
            let entry = find_index_entry(&source.machine_index()?, model_id)?;
            let xml = source.category_document(&entry.category)?;
            Arc::new(parse_document(&xml, &entry.model)?)
        };

        info!(
            "Loaded catalog for {} (model {}): {} products, {} alerts",
            catalog.model,
            model_id,
            catalog.products.len(),
            catalog.alerts.len()
        );
        self.cache().insert(model_id, catalog.clone());
        Ok(catalog)
    }

    pub fn cached_models(&self) -> usize {
        self.cache().len()
    }
}
