pub mod bluetooth;
pub mod catalog_archive;
pub mod logging;
