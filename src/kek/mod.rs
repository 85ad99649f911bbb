//! Master keys (KEKs): assembly from shares, versioning and provisioning.
//!
//! This module provides:
//! - Sources for KEK share #1 (`share`)
//! - The shared, periodically refreshed `TokenizerConfig` (`config`)
//! - Operator building blocks for new versions and HMAC keys (`provision`)

pub mod config;
pub mod provision;
pub mod share;

pub use config::TokenizerConfig;
pub use provision::KekShares;
pub use share::{KeyKeeperClient, KeyShareSource, StaticKeyShares};
