//! Service configuration (`cardvault.toml`).

pub mod settings;

pub use settings::{DekSettings, KeyKeeperSettings, Settings};
