//! Configuration management
//!
//! Node identity, data locations and network settings, read from the
//! environment and an optional TOML file.

pub mod settings;

pub use settings::{Config, Settings};
