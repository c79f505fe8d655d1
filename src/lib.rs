//! Driver for Jura coffee machines over Bluetooth LE.
//!
//! Resolve the machine's advertisement to its catalog with
//! [`CatalogResolver`], then drive it through a [`Machine`].

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::machine::{Machine, MachineOptions};
pub use error::{CatalogError, ImplausibleData, LinkError, ReadError};
pub use infrastructure::catalog_archive::{CatalogResolver, MemoryCatalog, ZipCatalog};
