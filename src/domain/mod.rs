pub mod alerts;
pub mod catalog;
pub mod command;
pub mod events;
pub mod machine;
pub mod settings;
pub mod statistics;
